// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-tick dispatch of host batches.
//!
//! [`Router::dispatch`] consumes one batch and produces the reply batch:
//! responses to the host's requests in request order, followed by the
//! commands issued by workflows during the tick in issue order.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::join_all;
use serde_json::{Value, json};
use temporal_rr_protocol::{Batch, CommandId, ErrorCode, ErrorInfo, Message, Request, commands};
use tracing::{debug, instrument, warn};

use crate::activity::{ActivityContext, RpcConnection, TcpRpcConnection};
use crate::config::WorkerConfig;
use crate::coroutine::panic_message;
use crate::error::{ActivityError, WorkflowError};
use crate::payload::Payloads;
use crate::queue::{CorrelationQueue, SharedQueue};
use crate::registry::{ActivityHandler, ActivityRegistry, WorkflowRegistry};
use crate::running::RunningWorkflows;
use crate::types::{ActivityInfo, TickInfo, WorkflowInfo};

/// What handling a request produced.
enum Handled {
    Reply(Message),
    Activity(ActivityInvocation),
    Query(QueryInvocation),
}

struct ActivityInvocation {
    id: CommandId,
    handler: ActivityHandler,
    context: ActivityContext,
}

struct QueryInvocation {
    id: CommandId,
    run_id: String,
    name: String,
    args: Payloads,
}

impl ActivityInvocation {
    async fn run(self) -> Message {
        let activity_type = self.context.info().activity_type.clone();
        debug!(id = self.id, %activity_type, "Running activity");
        let outcome = AssertUnwindSafe((self.handler)(self.context))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(result)) => Message::success(self.id, result.into_values()),
            Ok(Err(err)) => {
                warn!(id = self.id, %activity_type, error = %err, "Activity failed");
                Message::failure(self.id, err.to_error_info())
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(id = self.id, %activity_type, %message, "Activity panicked");
                let err = ActivityError::failed(format!("activity {activity_type} panicked: {message}"));
                Message::failure(self.id, err.to_error_info())
            }
        }
    }
}

fn protocol_failure(id: CommandId, message: impl Into<String>) -> Message {
    Message::failure(id, ErrorInfo::new(ErrorCode::ProtocolViolation, message))
}

fn reply(id: CommandId, result: Result<Vec<Value>, WorkflowError>) -> Message {
    match result {
        Ok(values) => Message::success(id, values),
        Err(err) => Message::failure(id, err.to_error_info()),
    }
}

/// Routes host requests to workflows and activities.
pub struct Router {
    workflows: WorkflowRegistry,
    activities: ActivityRegistry,
    running: RunningWorkflows,
    rpc: Option<Arc<dyn RpcConnection>>,
    task_queue: String,
}

impl Router {
    pub fn new(workflows: WorkflowRegistry, activities: ActivityRegistry) -> Self {
        Self {
            workflows,
            activities,
            running: RunningWorkflows::new(SharedQueue::default()),
            rpc: None,
            task_queue: "default".to_string(),
        }
    }

    /// Router wired according to `config`, with heartbeats going to the
    /// configured RPC endpoint.
    pub fn from_config(
        config: &WorkerConfig,
        workflows: WorkflowRegistry,
        activities: ActivityRegistry,
    ) -> Self {
        let queue = SharedQueue::new(CorrelationQueue::new(config.max_command_id));
        let rpc = TcpRpcConnection::new(&config.rpc_address, config.rpc_timeout());
        Self {
            workflows,
            activities,
            running: RunningWorkflows::new(queue)
                .with_recording(config.record_history)
                .with_history_limit(config.history_limit),
            rpc: Some(Arc::new(rpc)),
            task_queue: config.task_queue.clone(),
        }
    }

    pub fn with_rpc(mut self, rpc: Arc<dyn RpcConnection>) -> Self {
        self.rpc = Some(rpc);
        self
    }

    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = task_queue.into();
        self
    }

    pub fn with_recording(mut self, recording: bool) -> Self {
        self.running = self.running.with_recording(recording);
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.running = self.running.with_history_limit(limit);
        self
    }

    pub fn running(&self) -> &RunningWorkflows {
        &self.running
    }

    pub fn running_mut(&mut self) -> &mut RunningWorkflows {
        &mut self.running
    }

    /// Process one tick.
    #[instrument(skip_all, fields(messages = batch.messages.len()))]
    pub async fn dispatch(&mut self, batch: Batch) -> Batch {
        self.running.begin_tick();
        if let Some(context) = &batch.context {
            self.running.apply_tick(TickInfo::from(context));
        }

        let mut responses: Vec<Option<Message>> = Vec::new();
        let mut activities = Vec::new();
        let mut queries = Vec::new();

        for message in batch.messages {
            match message {
                Message::Request(request) => {
                    let slot = responses.len();
                    responses.push(None);
                    match self.handle_request(request) {
                        Handled::Reply(message) => responses[slot] = Some(message),
                        Handled::Activity(invocation) => activities.push((slot, invocation)),
                        Handled::Query(invocation) => queries.push((slot, invocation)),
                    }
                }
                response => {
                    self.running.deliver(&response);
                }
            }
        }

        let finished = join_all(
            activities
                .into_iter()
                .map(|(slot, invocation)| async move { (slot, invocation.run().await) }),
        )
        .await;
        for (slot, message) in finished {
            responses[slot] = Some(message);
        }

        self.running.drive();

        for (slot, query) in queries {
            let answer = self
                .running
                .query(&query.run_id, &query.name, query.args)
                .map(Payloads::into_values);
            responses[slot] = Some(reply(query.id, answer));
        }

        let mut messages: Vec<Message> = responses.into_iter().flatten().collect();
        let issued = self.running.drain_commands();
        debug!(
            responses = messages.len(),
            commands = issued.len(),
            "Tick dispatched"
        );
        messages.extend(
            issued
                .iter()
                .map(|command| Message::Request(command.to_request())),
        );
        Batch::new(messages)
    }

    fn handle_request(&mut self, request: Request) -> Handled {
        let id = request.id;
        let command = request.command.clone();
        match command.as_str() {
            commands::START_WORKFLOW => Handled::Reply(self.start_workflow(request)),
            commands::INVOKE_SIGNAL => {
                let result = run_id_of(&request).and_then(|run_id| {
                    let name = request.param_str("name").unwrap_or_default();
                    self.running
                        .signal(&run_id, name, Payloads::from(request.payloads.clone()))
                        .map(|()| Vec::new())
                });
                Handled::Reply(reply(id, result))
            }
            commands::INVOKE_QUERY => match run_id_of(&request) {
                Ok(run_id) => Handled::Query(QueryInvocation {
                    id,
                    run_id,
                    name: request.param_str("name").unwrap_or_default().to_string(),
                    args: Payloads::from(request.payloads),
                }),
                Err(err) => Handled::Reply(reply(id, Err(err))),
            },
            commands::CANCEL_WORKFLOW => {
                let result = run_id_of(&request)
                    .and_then(|run_id| self.running.cancel(&run_id).map(|()| Vec::new()));
                Handled::Reply(reply(id, result))
            }
            commands::DESTROY_WORKFLOW => {
                let result = run_id_of(&request).map(|run_id| {
                    if !self.running.destroy(&run_id) {
                        debug!(%run_id, "destroy for a run that is not running");
                    }
                    Vec::new()
                });
                Handled::Reply(reply(id, result))
            }
            commands::INVOKE_ACTIVITY => self.invoke_activity(request),
            commands::GET_WORKER_INFO => Handled::Reply(Message::success(
                id,
                vec![json!({
                    "taskQueue": self.task_queue,
                    "workflows": self.workflows.names(),
                    "activities": self.activities.names(),
                })],
            )),
            other => {
                warn!(id, command = other, "unknown request");
                Handled::Reply(protocol_failure(id, format!("unknown command {other}")))
            }
        }
    }

    fn start_workflow(&mut self, request: Request) -> Message {
        let id = request.id;
        let info: WorkflowInfo = match request
            .params
            .get("info")
            .cloned()
            .map(serde_json::from_value)
        {
            Some(Ok(info)) => info,
            Some(Err(err)) => return protocol_failure(id, format!("invalid workflow info: {err}")),
            None => return protocol_failure(id, "StartWorkflow without workflow info"),
        };

        let Some(handler) = self.workflows.get(&info.workflow_type) else {
            warn!(workflow_type = %info.workflow_type, "workflow type is not registered");
            return protocol_failure(
                id,
                format!("workflow type {} is not registered", info.workflow_type),
            );
        };

        let result = json!({ "workflowId": info.workflow_id, "runId": info.run_id });
        let started = self
            .running
            .start(info, Payloads::from(request.payloads), &handler)
            .map(|()| vec![result]);
        reply(id, started)
    }

    fn invoke_activity(&mut self, request: Request) -> Handled {
        let id = request.id;
        let info: ActivityInfo = match request
            .params
            .get("info")
            .cloned()
            .map(serde_json::from_value)
        {
            Some(Ok(info)) => info,
            Some(Err(err)) => {
                return Handled::Reply(protocol_failure(id, format!("invalid activity info: {err}")));
            }
            None => return Handled::Reply(protocol_failure(id, "InvokeActivity without activity info")),
        };

        let Some(handler) = self.activities.get(&info.activity_type) else {
            warn!(activity_type = %info.activity_type, "activity type is not registered");
            return Handled::Reply(protocol_failure(
                id,
                format!("activity type {} is not registered", info.activity_type),
            ));
        };

        let mut context = ActivityContext::new(info, Payloads::from(request.payloads));
        if let Some(rpc) = &self.rpc {
            context = context.with_rpc(rpc.clone());
        }
        Handled::Activity(ActivityInvocation {
            id,
            handler,
            context,
        })
    }
}

fn run_id_of(request: &Request) -> Result<String, WorkflowError> {
    request
        .run_id
        .clone()
        .or_else(|| request.param_str("runId").map(str::to_string))
        .ok_or_else(|| {
            WorkflowError::Protocol(format!("{} without a run id", request.command))
        })
}
