// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Temporal RoadRunner SDK - deterministic workflow engine and worker.
//!
//! This crate runs Temporal workflows and activities behind a RoadRunner
//! host. The host owns history, timers and retries; the worker receives one
//! batch per tick, advances every workflow as far as it can, and answers
//! with the commands the workflows issued.
//!
//! # Features
//!
//! - **Deterministic execution**: workflows are `async` blocks driven by a
//!   single-threaded scheduler, never by the async runtime
//! - **Promises**: activities, timers, side effects, versions and child
//!   workflows are awaitable promises with `then`/`all`/`any`/`race`
//! - **Cancellation scopes**: nested, detachable, idempotent
//! - **Signals and queries**: buffered until a handler is registered
//! - **Replay**: recorded histories are re-executed in-process to catch
//!   non-deterministic changes before they ship
//!
//! # Quick Start
//!
//! ```ignore
//! use temporal_rr_sdk::{
//!     ActivityContext, ActivityError, ActivityOptions, ActivityRegistry, Outcome, Payloads,
//!     Worker, WorkerConfig, WorkflowContext, WorkflowRegistry, init_tracing,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! async fn greeting(ctx: WorkflowContext) -> Outcome {
//!     let name: String = ctx.input().decode(0)?;
//!     let text: String = ctx
//!         .execute_activity("Greet", Payloads::encode(&name)?, ActivityOptions::new())
//!         .value()
//!         .await?;
//!     Payloads::encode(&text)
//! }
//!
//! async fn greet(ctx: ActivityContext) -> Result<Payloads, ActivityError> {
//!     let name: String = ctx.input().decode(0)?;
//!     Ok(Payloads::encode(&format!("Hello, {name}!"))?)
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> temporal_rr_sdk::Result<()> {
//!     init_tracing();
//!     let config = WorkerConfig::from_env()?;
//!     let workflows = WorkflowRegistry::builder().register("Greeting", greeting).build();
//!     let activities = ActivityRegistry::builder().register("Greet", greet).build();
//!     Worker::stdio(&config, workflows, activities)
//!         .run(CancellationToken::new())
//!         .await
//! }
//! ```
//!
//! # Determinism
//!
//! Workflow code must not read clocks, random sources or the network
//! directly. Use [`WorkflowContext::now`], [`WorkflowContext::side_effect`]
//! and activities instead. [`Replayer`] checks a changed workflow against
//! recorded histories.

mod activity;
mod config;
mod context;
mod coroutine;
mod error;
mod logging;
mod payload;
mod promise;
mod queue;
mod registry;
mod replay;
mod router;
mod running;
mod scope;
mod signals;
mod transport;
mod types;
mod worker;

pub use activity::{ActivityContext, HEARTBEAT_METHOD, RpcConnection, TcpRpcConnection};
pub use config::WorkerConfig;
pub use context::WorkflowContext;
pub use coroutine::{Coroutine, ProcessState};
pub use error::{ActivityError, Result, SdkError, WorkflowError};
pub use logging::{DEFAULT_FILTER, init_tracing, init_tracing_with};
pub use payload::{DataConverter, JsonConverter, Payloads};
pub use promise::{Outcome, Promise};
pub use queue::{Command, CorrelationQueue, DEFAULT_MAX_COMMAND_ID, PendingEntry, SharedQueue};
pub use registry::{
    ActivityHandler, ActivityRegistry, ActivityRegistryBuilder, WorkflowHandler,
    WorkflowRegistry, WorkflowRegistryBuilder,
};
pub use replay::{EventKind, History, HistoryEvent, ReplayReport, Replayer};
pub use router::Router;
pub use running::{DEFAULT_HISTORY_LIMIT, FinishedRun, RunningWorkflows};
pub use scope::{Scope, ScopeHandle};
pub use signals::SignalQueue;
pub use transport::{ChannelTransport, PipeTransport, Transport};
pub use types::{
    ActivityInfo, ActivityOptions, ChildWorkflowOptions, Interval, RetryOptions, RunState,
    TickInfo, WorkflowInfo,
};
pub use worker::Worker;

// Re-export the wire layer for hosts and tests
pub use temporal_rr_protocol as protocol;
