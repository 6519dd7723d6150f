// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SDK-specific error types.

use serde_json::{Value, json};
use temporal_rr_protocol::{CodecError, ErrorCode, ErrorInfo, FrameError};
use thiserror::Error;

use crate::payload::Payloads;

/// Errors observed by workflow code.
///
/// Settled promise outcomes carry this type, so it is `Clone`: several
/// coroutines may await the same promise and each receives a copy.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorkflowError {
    /// The awaited operation or its scope was cancelled
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// An activity returned a failure
    #[error("activity {activity_type} failed: {message}")]
    ActivityFailure {
        activity_type: String,
        message: String,
        error_type: Option<String>,
        retry_state: Option<String>,
        data: Value,
    },

    /// A child workflow returned a failure
    #[error("child workflow {workflow_type} failed: {message}")]
    ChildWorkflowFailure {
        workflow_type: String,
        message: String,
        data: Value,
    },

    /// Replayed execution diverged from recorded history
    #[error("non-deterministic workflow: {0}")]
    NonDeterministic(String),

    /// Malformed or unexpected protocol traffic
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// Terminal outcome that restarts the workflow with fresh history
    #[error("continued as new as {workflow_type}")]
    ContinuedAsNew {
        workflow_type: String,
        args: Payloads,
    },

    /// Application failure raised by workflow code
    #[error("{message}")]
    Failure { message: String, data: Value },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl WorkflowError {
    /// Application failure with no extra details.
    pub fn failure(message: impl Into<String>) -> Self {
        WorkflowError::Failure {
            message: message.into(),
            data: Value::Null,
        }
    }

    pub fn cancelled() -> Self {
        WorkflowError::Cancelled("canceled".to_string())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, WorkflowError::Cancelled(_))
    }

    /// Get the wire error code for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            WorkflowError::Cancelled(_) => ErrorCode::Cancelled,
            WorkflowError::ActivityFailure { .. } => ErrorCode::ActivityFailure,
            WorkflowError::ChildWorkflowFailure { .. } => ErrorCode::ChildWorkflowFailure,
            WorkflowError::NonDeterministic(_) => ErrorCode::NonDeterministic,
            WorkflowError::Protocol(_) | WorkflowError::InvalidArgument(_) => {
                ErrorCode::ProtocolViolation
            }
            WorkflowError::Timeout(_) => ErrorCode::Timeout,
            WorkflowError::ContinuedAsNew { .. }
            | WorkflowError::Failure { .. }
            | WorkflowError::Serialization(_) => ErrorCode::Failure,
        }
    }

    /// Convert to the error body of a failure response.
    pub fn to_error_info(&self) -> ErrorInfo {
        let data = match self {
            WorkflowError::ActivityFailure {
                error_type,
                retry_state,
                data,
                ..
            } => match data {
                Value::Null => json!({ "type": error_type, "retryState": retry_state }),
                other => other.clone(),
            },
            WorkflowError::ChildWorkflowFailure { data, .. }
            | WorkflowError::Failure { data, .. } => data.clone(),
            _ => Value::Null,
        };
        ErrorInfo::new(self.error_code(), self.to_string()).with_data(data)
    }

    /// Map an error body back into a workflow error.
    ///
    /// Activity and child workflow failures need the originating command to
    /// be reconstructed; see `RunningWorkflows::deliver`.
    pub fn from_error_info(info: &ErrorInfo) -> Self {
        let message = info.message.clone();
        match info.error_code() {
            Some(ErrorCode::Cancelled) => WorkflowError::Cancelled(message),
            Some(ErrorCode::NonDeterministic) => WorkflowError::NonDeterministic(message),
            Some(ErrorCode::ProtocolViolation) => WorkflowError::Protocol(message),
            Some(ErrorCode::Timeout) => WorkflowError::Timeout(message),
            _ => WorkflowError::Failure {
                message,
                data: info.data.clone(),
            },
        }
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        WorkflowError::Serialization(err.to_string())
    }
}

/// Errors returned by activity code.
#[derive(Debug, Clone, Error)]
pub enum ActivityError {
    #[error("activity cancelled")]
    Cancelled,

    #[error("{message}")]
    Failed {
        message: String,
        error_type: Option<String>,
        non_retryable: bool,
        data: Value,
    },
}

impl ActivityError {
    pub fn failed(message: impl Into<String>) -> Self {
        ActivityError::Failed {
            message: message.into(),
            error_type: None,
            non_retryable: false,
            data: Value::Null,
        }
    }

    /// A failure the server must not retry.
    pub fn non_retryable(message: impl Into<String>, error_type: impl Into<String>) -> Self {
        ActivityError::Failed {
            message: message.into(),
            error_type: Some(error_type.into()),
            non_retryable: true,
            data: Value::Null,
        }
    }

    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            ActivityError::Cancelled => ErrorInfo::new(ErrorCode::Cancelled, self.to_string()),
            ActivityError::Failed {
                message,
                error_type,
                non_retryable,
                data,
            } => ErrorInfo::new(ErrorCode::Failure, message.clone()).with_data(json!({
                "type": error_type,
                "nonRetryable": non_retryable,
                "details": data,
            })),
        }
    }
}

impl From<serde_json::Error> for ActivityError {
    fn from(err: serde_json::Error) -> Self {
        ActivityError::non_retryable(err.to_string(), "SerializationError")
    }
}

impl From<WorkflowError> for ActivityError {
    fn from(err: WorkflowError) -> Self {
        match err {
            WorkflowError::Cancelled(_) => ActivityError::Cancelled,
            WorkflowError::Serialization(message) => {
                ActivityError::non_retryable(message, "SerializationError")
            }
            other => ActivityError::failed(other.to_string()),
        }
    }
}

impl From<SdkError> for ActivityError {
    fn from(err: SdkError) -> Self {
        ActivityError::failed(err.to_string())
    }
}

/// Errors that can occur in the worker.
#[derive(Debug, Error)]
pub enum SdkError {
    /// Configuration error (missing or invalid environment variable)
    #[error("configuration error: {0}")]
    Config(String),

    /// Framing or IO failure on the host pipe or RPC socket
    #[error("transport error: {0}")]
    Transport(#[from] FrameError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// RPC call failed or timed out
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    /// Internal SDK error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for worker operations.
pub type Result<T> = std::result::Result<T, SdkError>;
