// SPDX-License-Identifier: Apache-2.0

//! Federation pipeline errors
//!
//! Every stage maps its failures into one of these variants; the orchestrator
//! turns whichever one aborted the run into the failure envelope's message.

use serde::Serialize;
use thiserror::Error;

use crate::engine::types::SourceId;

use super::types::Stage;

#[derive(Debug, Clone, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FederationError {
    /// Malformed query description; the caller must fix the input.
    #[error("Parse error: {message}")]
    Parse { message: String },

    #[error("Partition error: {message}")]
    Partition { message: String },

    /// No driver registered for a dialect, or no connection details for a source.
    #[error("Driver unavailable: {message}")]
    DriverUnavailable { message: String },

    #[error("Source {source_id} failed: {message}")]
    SourceExecution { source_id: SourceId, message: String },

    #[error("Staging error: {message}")]
    Staging { message: String },

    #[error("Final join error: {message}")]
    Join { message: String },

    /// The pipeline task itself panicked or was cancelled.
    #[error("Internal error during {stage}: {message}")]
    Internal { stage: Stage, message: String },
}

impl FederationError {
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse { message: msg.into() }
    }

    pub fn partition(msg: impl Into<String>) -> Self {
        Self::Partition { message: msg.into() }
    }

    pub fn driver_unavailable(msg: impl Into<String>) -> Self {
        Self::DriverUnavailable { message: msg.into() }
    }

    pub fn source(source_id: SourceId, msg: impl Into<String>) -> Self {
        Self::SourceExecution {
            source_id,
            message: msg.into(),
        }
    }

    pub fn staging(msg: impl Into<String>) -> Self {
        Self::Staging { message: msg.into() }
    }

    pub fn join(msg: impl Into<String>) -> Self {
        Self::Join { message: msg.into() }
    }

    pub fn internal(stage: Stage, msg: impl Into<String>) -> Self {
        Self::Internal {
            stage,
            message: msg.into(),
        }
    }

    /// Short tag used in logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "parse",
            Self::Partition { .. } => "partition",
            Self::DriverUnavailable { .. } => "driver_unavailable",
            Self::SourceExecution { .. } => "source_execution",
            Self::Staging { .. } => "staging",
            Self::Join { .. } => "join",
            Self::Internal { .. } => "internal",
        }
    }
}

pub type FederationResult<T> = Result<T, FederationError>;
