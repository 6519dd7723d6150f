// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common types used across the SDK.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use temporal_rr_protocol::TickContext;

/// Per-tick information shared by every run.
#[derive(Debug, Clone, PartialEq)]
pub struct TickInfo {
    /// Logical time of the tick; the only clock workflow code may read
    pub time: DateTime<Utc>,
    pub is_replaying: bool,
    pub history_length: u64,
    pub history_size: u64,
}

impl Default for TickInfo {
    fn default() -> Self {
        Self {
            time: DateTime::default(),
            is_replaying: false,
            history_length: 0,
            history_size: 0,
        }
    }
}

impl From<&TickContext> for TickInfo {
    fn from(context: &TickContext) -> Self {
        Self {
            time: context.tick_time,
            is_replaying: context.replay,
            history_length: context.history_length,
            history_size: context.history_size,
        }
    }
}

fn default_task_queue() -> String {
    "default".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_attempt() -> u32 {
    1
}

/// Identity of a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInfo {
    pub workflow_type: String,
    pub workflow_id: String,
    pub run_id: String,
    #[serde(default = "default_task_queue")]
    pub task_queue: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_attempt")]
    pub attempt: u32,
}

impl WorkflowInfo {
    pub fn new(
        workflow_type: impl Into<String>,
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
            task_queue: default_task_queue(),
            namespace: default_namespace(),
            attempt: default_attempt(),
        }
    }
}

/// Identity of an activity invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityInfo {
    pub activity_id: String,
    pub activity_type: String,
    /// Opaque token identifying the task to the server (base64 on the wire)
    #[serde(default, with = "task_token")]
    pub task_token: Vec<u8>,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub workflow_run_id: Option<String>,
    #[serde(default = "default_task_queue")]
    pub task_queue: String,
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    #[serde(default)]
    pub heartbeat_timeout_ms: u64,
}

mod task_token {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(token: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(token))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Retry policy passed through to the server untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_coefficient: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub non_retryable_error_types: Vec<String>,
}

impl RetryOptions {
    pub fn with_maximum_attempts(mut self, attempts: u32) -> Self {
        self.maximum_attempts = Some(attempts);
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn with_non_retryable(mut self, error_type: impl Into<String>) -> Self {
        self.non_retryable_error_types.push(error_type.into());
        self
    }
}

/// Options of an `ExecuteActivity` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActivityOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_queue: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_to_close_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_to_start_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_to_close_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryOptions>,
}

impl ActivityOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = Some(task_queue.into());
        self
    }

    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_schedule_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.schedule_to_close_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryOptions) -> Self {
        self.retry_policy = Some(retry);
        self
    }
}

/// Options of an `ExecuteChildWorkflow` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChildWorkflowOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_queue: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryOptions>,
}

impl ChildWorkflowOptions {
    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = Some(task_queue.into());
        self
    }
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Running,
    Completed,
    Failed,
    ContinuedAsNew,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::ContinuedAsNew
        )
    }
}

/// Timer interval, normalised to milliseconds.
///
/// Integers are seconds, floats are fractional seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    millis: i64,
}

impl Interval {
    pub fn from_millis(millis: i64) -> Self {
        Self { millis }
    }

    pub fn millis(self) -> i64 {
        self.millis
    }

    pub fn is_negative(self) -> bool {
        self.millis < 0
    }
}

impl From<i32> for Interval {
    fn from(seconds: i32) -> Self {
        Self::from(i64::from(seconds))
    }
}

impl From<i64> for Interval {
    fn from(seconds: i64) -> Self {
        Self::from_millis(seconds.saturating_mul(1000))
    }
}

impl From<u32> for Interval {
    fn from(seconds: u32) -> Self {
        Self::from(i64::from(seconds))
    }
}

impl From<u64> for Interval {
    fn from(seconds: u64) -> Self {
        Self::from(i64::try_from(seconds).unwrap_or(i64::MAX))
    }
}

impl From<f64> for Interval {
    fn from(seconds: f64) -> Self {
        Self::from_millis((seconds * 1000.0).round() as i64)
    }
}

impl From<Duration> for Interval {
    fn from(duration: Duration) -> Self {
        Self::from_millis(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
    }
}

impl From<chrono::Duration> for Interval {
    fn from(duration: chrono::Duration) -> Self {
        Self::from_millis(duration.num_milliseconds())
    }
}
