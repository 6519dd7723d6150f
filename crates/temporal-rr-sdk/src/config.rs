// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker configuration.

use std::env;
use std::time::Duration;

use temporal_rr_protocol::CommandId;

use crate::error::{Result, SdkError};
use crate::queue::DEFAULT_MAX_COMMAND_ID;
use crate::running::DEFAULT_HISTORY_LIMIT;

/// Worker configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Task queue reported to the host (default: "default")
    pub task_queue: String,
    /// Host RPC endpoint used for activity heartbeats (default: "tcp://127.0.0.1:6001")
    pub rpc_address: String,
    /// Ceiling after which command identifiers wrap back to 1 (default: u32::MAX)
    pub max_command_id: CommandId,
    /// Connect and call timeout of the RPC endpoint in milliseconds (default: 10_000)
    pub rpc_timeout_ms: u64,
    /// Keep a replayable history of every run (default: false)
    pub record_history: bool,
    /// Histories of finished runs kept in memory (default: 32)
    pub history_limit: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            task_queue: "default".to_string(),
            rpc_address: "tcp://127.0.0.1:6001".to_string(),
            max_command_id: DEFAULT_MAX_COMMAND_ID,
            rpc_timeout_ms: 10_000,
            record_history: false,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl WorkerConfig {
    /// Configuration with defaults for the given task queue.
    pub fn new(task_queue: impl Into<String>) -> Self {
        Self {
            task_queue: task_queue.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// # Optional Environment Variables
    /// - `TEMPORAL_TASK_QUEUE` - Task queue name (default: "default")
    /// - `RR_RPC` - Host RPC address (default: "tcp://127.0.0.1:6001")
    /// - `TEMPORAL_MAX_COMMAND_ID` - Command id ceiling (default: 4294967295)
    /// - `TEMPORAL_RPC_TIMEOUT_MS` - RPC timeout (default: 10000)
    /// - `TEMPORAL_RECORD_HISTORY` - Record run histories (default: false)
    /// - `TEMPORAL_HISTORY_LIMIT` - Finished histories kept (default: 32)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let task_queue = lookup("TEMPORAL_TASK_QUEUE").unwrap_or(defaults.task_queue);
        if task_queue.is_empty() {
            return Err(SdkError::Config(
                "TEMPORAL_TASK_QUEUE must not be empty".to_string(),
            ));
        }

        let rpc_address = lookup("RR_RPC").unwrap_or(defaults.rpc_address);

        let max_command_id = match lookup("TEMPORAL_MAX_COMMAND_ID") {
            Some(value) => match value.parse::<CommandId>() {
                Ok(0) | Err(_) => {
                    return Err(SdkError::Config(format!(
                        "invalid TEMPORAL_MAX_COMMAND_ID: {value}"
                    )));
                }
                Ok(max) => max,
            },
            None => defaults.max_command_id,
        };

        let rpc_timeout_ms = lookup("TEMPORAL_RPC_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.rpc_timeout_ms);

        let record_history = lookup("TEMPORAL_RECORD_HISTORY")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(defaults.record_history);

        let history_limit = match lookup("TEMPORAL_HISTORY_LIMIT") {
            Some(value) => value.parse::<usize>().map_err(|_| {
                SdkError::Config(format!("invalid TEMPORAL_HISTORY_LIMIT: {value}"))
            })?,
            None => defaults.history_limit,
        };

        Ok(Self {
            task_queue,
            rpc_address,
            max_command_id,
            rpc_timeout_ms,
            record_history,
            history_limit,
        })
    }

    pub fn with_rpc_address(mut self, address: impl Into<String>) -> Self {
        self.rpc_address = address.into();
        self
    }

    pub fn with_max_command_id(mut self, max: CommandId) -> Self {
        self.max_command_id = max;
        self
    }

    pub fn with_rpc_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.rpc_timeout_ms = timeout_ms;
        self
    }

    pub fn with_record_history(mut self, record: bool) -> Self {
        self.record_history = record;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, WorkerConfig::default());
        assert_eq!(config.max_command_id, u32::MAX as u64);
        assert_eq!(config.rpc_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_from_vars() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("TEMPORAL_TASK_QUEUE", "orders"),
            ("RR_RPC", "tcp://10.0.0.1:7000"),
            ("TEMPORAL_MAX_COMMAND_ID", "1000"),
            ("TEMPORAL_RPC_TIMEOUT_MS", "250"),
            ("TEMPORAL_RECORD_HISTORY", "1"),
            ("TEMPORAL_HISTORY_LIMIT", "5"),
        ]))
        .unwrap();
        assert_eq!(config.task_queue, "orders");
        assert_eq!(config.rpc_address, "tcp://10.0.0.1:7000");
        assert_eq!(config.max_command_id, 1000);
        assert_eq!(config.rpc_timeout_ms, 250);
        assert!(config.record_history);
        assert_eq!(config.history_limit, 5);
    }

    /// Zero, negative and non-numeric ceilings are configuration errors.
    #[test]
    fn test_invalid_max_command_id() {
        for bad in ["0", "-3", "many"] {
            let result = WorkerConfig::from_lookup(lookup(&[("TEMPORAL_MAX_COMMAND_ID", bad)]));
            assert!(matches!(result, Err(SdkError::Config(_))));
        }
    }

    #[test]
    fn test_invalid_history_limit() {
        let result = WorkerConfig::from_lookup(lookup(&[("TEMPORAL_HISTORY_LIMIT", "lots")]));
        assert!(matches!(result, Err(SdkError::Config(_))));
    }

    #[test]
    fn test_builder_pattern() {
        let config = WorkerConfig::new("billing")
            .with_rpc_address("tcp://localhost:9000")
            .with_max_command_id(10)
            .with_record_history(true);
        assert_eq!(config.task_queue, "billing");
        assert_eq!(config.max_command_id, 10);
        assert!(config.record_history);
        assert_eq!(config.rpc_timeout_ms, 10_000);
    }
}
