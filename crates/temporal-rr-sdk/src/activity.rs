// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Activity execution context and the host RPC connection.
//!
//! Activities are ordinary async functions. They are never replayed, may do
//! I/O, and may run concurrently with each other. The only channel back to
//! the server is [`ActivityContext::heartbeat`], which goes over the host's
//! RPC endpoint rather than the tick pipe.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use serde_json::{Value, json};
use temporal_rr_protocol::{FrameError, FramedStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::{ActivityError, Result, SdkError};
use crate::payload::Payloads;
use crate::types::ActivityInfo;

/// RPC method used to report activity progress.
pub const HEARTBEAT_METHOD: &str = "activities.RecordActivityHeartbeat";

/// Request/response channel to the host's RPC endpoint.
#[async_trait]
pub trait RpcConnection: Send + Sync {
    /// Call `method` with `params` and return the result body.
    async fn call(&self, method: &str, params: Value) -> Result<Value>;
}

/// [`RpcConnection`] over a framed TCP socket.
///
/// Connects on first use and reconnects after a transport failure.
pub struct TcpRpcConnection {
    addr: String,
    timeout: Duration,
    stream: Mutex<Option<FramedStream<TcpStream>>>,
}

impl TcpRpcConnection {
    /// `address` is `tcp://host:port` or a bare `host:port`.
    pub fn new(address: &str, timeout: Duration) -> Self {
        let addr = address
            .strip_prefix("tcp://")
            .unwrap_or(address)
            .to_string();
        Self {
            addr,
            timeout,
            stream: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn connect(&self) -> Result<FramedStream<TcpStream>> {
        debug!(addr = %self.addr, "Connecting to RPC endpoint");
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| SdkError::Rpc(format!("connect to {} timed out", self.addr)))?
            .map_err(FrameError::from)?;
        stream.set_nodelay(true).map_err(FrameError::from)?;
        Ok(FramedStream::new(stream))
    }
}

#[async_trait]
impl RpcConnection for TcpRpcConnection {
    #[instrument(skip(self, params), fields(addr = %self.addr))]
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let mut guard = self.stream.lock().await;
        let mut stream = match guard.take() {
            Some(stream) => stream,
            None => self.connect().await?,
        };

        let request = json!({ "method": method, "params": params });
        let response = tokio::time::timeout(self.timeout, stream.request::<_, Value>(&request))
            .await
            .map_err(|_| SdkError::Rpc(format!("{method} timed out")))?;

        match response {
            Ok(result) => {
                *guard = Some(stream);
                Ok(result)
            }
            Err(FrameError::Remote(message)) => {
                *guard = Some(stream);
                Err(SdkError::Rpc(message))
            }
            Err(err) => {
                warn!(error = %err, "RPC transport failed, dropping connection");
                Err(err.into())
            }
        }
    }
}

/// Everything an activity invocation gets to see.
#[derive(Clone)]
pub struct ActivityContext {
    info: Arc<ActivityInfo>,
    input: Payloads,
    rpc: Option<Arc<dyn RpcConnection>>,
    cancellation: CancellationToken,
}

impl ActivityContext {
    pub fn new(info: ActivityInfo, input: Payloads) -> Self {
        Self {
            info: Arc::new(info),
            input,
            rpc: None,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_rpc(mut self, rpc: Arc<dyn RpcConnection>) -> Self {
        self.rpc = Some(rpc);
        self
    }

    pub fn info(&self) -> &ActivityInfo {
        &self.info
    }

    pub fn input(&self) -> &Payloads {
        &self.input
    }

    /// Tripped when a heartbeat learns the server cancelled the activity.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Report progress. Returns `ActivityError::Cancelled` once the server
    /// has requested cancellation.
    pub async fn heartbeat<T: Serialize>(&self, details: &T) -> std::result::Result<(), ActivityError> {
        if self.is_cancelled() {
            return Err(ActivityError::Cancelled);
        }
        let Some(rpc) = &self.rpc else {
            debug!(activity_id = %self.info.activity_id, "no RPC connection, heartbeat skipped");
            return Ok(());
        };

        let params = json!({
            "taskToken": STANDARD.encode(&self.info.task_token),
            "details": [serde_json::to_value(details)?],
        });
        let reply = rpc.call(HEARTBEAT_METHOD, params).await?;

        if reply.get("canceled").and_then(Value::as_bool) == Some(true) {
            debug!(activity_id = %self.info.activity_id, "activity cancelled by server");
            self.cancellation.cancel();
            return Err(ActivityError::Cancelled);
        }
        Ok(())
    }
}
