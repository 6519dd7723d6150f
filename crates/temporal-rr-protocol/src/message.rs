// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Batch and message types exchanged with the host worker.
//!
//! A tick is one [`Batch`]: optional tick context plus an ordered list of
//! messages. A message is either a request (a command issued by the workflow
//! side, or a server request such as `StartWorkflow`) or a response to an
//! earlier request, matched by identifier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Correlation identifier of a request and its response.
pub type CommandId = u64;

/// Command names understood by the host.
pub mod commands {
    // Issued by workflows.
    pub const EXECUTE_ACTIVITY: &str = "ExecuteActivity";
    pub const NEW_TIMER: &str = "NewTimer";
    pub const SIDE_EFFECT: &str = "SideEffect";
    pub const GET_VERSION: &str = "GetVersion";
    pub const EXECUTE_CHILD_WORKFLOW: &str = "ExecuteChildWorkflow";
    pub const SIGNAL_EXTERNAL_WORKFLOW: &str = "SignalExternalWorkflow";
    pub const COMPLETE_WORKFLOW: &str = "CompleteWorkflow";
    pub const CONTINUE_AS_NEW: &str = "ContinueAsNew";
    pub const CANCEL: &str = "Cancel";
    pub const PANIC: &str = "Panic";

    // Issued by the host.
    pub const START_WORKFLOW: &str = "StartWorkflow";
    pub const INVOKE_SIGNAL: &str = "InvokeSignal";
    pub const INVOKE_QUERY: &str = "InvokeQuery";
    pub const INVOKE_ACTIVITY: &str = "InvokeActivity";
    pub const CANCEL_WORKFLOW: &str = "CancelWorkflow";
    pub const DESTROY_WORKFLOW: &str = "DestroyWorkflow";
    pub const GET_WORKER_INFO: &str = "GetWorkerInfo";
}

/// Error codes carried in error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Failure = 1,
    Cancelled = 2,
    ActivityFailure = 3,
    ProtocolViolation = 4,
    NonDeterministic = 5,
    Timeout = 6,
    ChildWorkflowFailure = 7,
}

impl ErrorCode {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Failure),
            2 => Some(Self::Cancelled),
            3 => Some(Self::ActivityFailure),
            4 => Some(Self::ProtocolViolation),
            5 => Some(Self::NonDeterministic),
            6 => Some(Self::Timeout),
            7 => Some(Self::ChildWorkflowFailure),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Per-tick context supplied by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickContext {
    pub tick_time: DateTime<Utc>,
    #[serde(default)]
    pub replay: bool,
    #[serde(default)]
    pub history_length: u64,
    #[serde(default)]
    pub history_size: u64,
}

/// A request: either a workflow command or a server request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: CommandId,
    pub command: String,
    #[serde(default, alias = "options", skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payloads: Vec<Value>,
    #[serde(default, rename = "runId", skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl Request {
    pub fn new(id: CommandId, command: impl Into<String>) -> Self {
        Self {
            id,
            command: command.into(),
            params: Map::new(),
            payloads: Vec::new(),
            run_id: None,
        }
    }

    /// Look up a string parameter.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// Successful response to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub id: CommandId,
    #[serde(default)]
    pub result: Vec<Value>,
}

/// Error details of a failed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: Value::Null,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(self.code)
    }
}

/// Failed response to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub id: CommandId,
    pub error: ErrorInfo,
}

/// One entry of a batch.
///
/// Variant order matters for untagged decoding: a request is recognised by
/// `command`, a failure by `error`, everything else is a success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Failure(ErrorResponse),
    Success(SuccessResponse),
}

impl Message {
    pub fn success(id: CommandId, result: Vec<Value>) -> Self {
        Message::Success(SuccessResponse { id, result })
    }

    pub fn failure(id: CommandId, error: ErrorInfo) -> Self {
        Message::Failure(ErrorResponse { id, error })
    }

    pub fn id(&self) -> CommandId {
        match self {
            Message::Request(r) => r.id,
            Message::Failure(f) => f.id,
            Message::Success(s) => s.id,
        }
    }

    pub fn is_response(&self) -> bool {
        !matches!(self, Message::Request(_))
    }

    /// Copy of this message carrying a different identifier.
    pub fn with_id(&self, id: CommandId) -> Self {
        let mut message = self.clone();
        match &mut message {
            Message::Request(r) => r.id = id,
            Message::Failure(f) => f.id = id,
            Message::Success(s) => s.id = id,
        }
        message
    }
}

/// All messages of one tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<TickContext>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Batch {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            context: None,
            messages,
        }
    }

    pub fn with_context(mut self, context: TickContext) -> Self {
        self.context = Some(context);
        self
    }
}
