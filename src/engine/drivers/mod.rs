// SPDX-License-Identifier: Apache-2.0

// Source drivers module

pub mod duckdb;
pub mod mysql;
pub mod postgres;
pub mod sqlite;
