// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registry of runs alive in this worker.
//!
//! Every run shares one correlation queue and one tick. The registry owns the
//! run lifecycle: it starts the main coroutine, routes responses, signals,
//! queries and cancellations to the right run, drives all runs to
//! quiescence once per tick and turns a finished main coroutine into the
//! run's terminal command.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use serde_json::Value;
use temporal_rr_protocol::{CommandId, ErrorCode, ErrorInfo, Message, commands};
use tracing::{debug, error, info, warn};

use crate::context::{WorkflowContext, failure_param};
use crate::coroutine::Coroutine;
use crate::error::WorkflowError;
use crate::payload::Payloads;
use crate::promise::Outcome;
use crate::queue::{Command, SharedQueue};
use crate::registry::WorkflowHandler;
use crate::replay::{EventKind, History};
use crate::types::{RunState, TickInfo, WorkflowInfo};

struct Run {
    context: WorkflowContext,
    main: Rc<RefCell<Coroutine>>,
    state: RunState,
}

/// A run that reached a terminal state during [`RunningWorkflows::drive`].
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedRun {
    pub run_id: String,
    pub state: RunState,
    pub outcome: Outcome,
}

struct Recording {
    history: History,
    index_by_id: BTreeMap<CommandId, usize>,
    commands: usize,
}

/// Finished histories kept by default once their run is gone.
pub const DEFAULT_HISTORY_LIMIT: usize = 32;

pub struct RunningWorkflows {
    runs: BTreeMap<String, Run>,
    queue: SharedQueue,
    tick: Rc<RefCell<TickInfo>>,
    tick_count: u64,
    recording: bool,
    recordings: BTreeMap<String, Recording>,
    /// Runs whose recording outlived the run, oldest first
    finished: VecDeque<String>,
    history_limit: usize,
}

impl RunningWorkflows {
    pub fn new(queue: SharedQueue) -> Self {
        Self {
            runs: BTreeMap::new(),
            queue,
            tick: Rc::new(RefCell::new(TickInfo::default())),
            tick_count: 0,
            recording: false,
            recordings: BTreeMap::new(),
            finished: VecDeque::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    /// Record every command, response and signal of each run.
    pub fn with_recording(mut self, recording: bool) -> Self {
        self.recording = recording;
        self
    }

    /// How many histories of finished runs to keep. Older ones are dropped
    /// once the terminal command has been recorded.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn queue(&self) -> &SharedQueue {
        &self.queue
    }

    /// Open a new host tick. Events recorded from here on carry the next
    /// tick number, whether or not the host sent tick info with it.
    pub fn begin_tick(&mut self) {
        self.tick_count += 1;
    }

    /// Publish the tick info to every context.
    pub fn apply_tick(&mut self, tick: TickInfo) {
        *self.tick.borrow_mut() = tick;
    }

    pub fn tick(&self) -> TickInfo {
        self.tick.borrow().clone()
    }

    /// Create a run and execute its main coroutine up to the first
    /// suspension point.
    pub fn start(
        &mut self,
        info: WorkflowInfo,
        input: Payloads,
        handler: &WorkflowHandler,
    ) -> Result<(), WorkflowError> {
        if self.runs.contains_key(&info.run_id) {
            return Err(WorkflowError::Protocol(format!(
                "run {} is already running",
                info.run_id
            )));
        }

        info!(
            run_id = %info.run_id,
            workflow_id = %info.workflow_id,
            workflow_type = %info.workflow_type,
            "Starting workflow"
        );

        if self.recording {
            self.recordings.insert(
                info.run_id.clone(),
                Recording {
                    history: History::new(info.clone(), input.clone()),
                    index_by_id: BTreeMap::new(),
                    commands: 0,
                },
            );
        }

        let run_id = info.run_id.clone();
        let context = WorkflowContext::new(info, input, self.queue.clone(), self.tick.clone());
        let main = context.start_main(handler(context.clone()));
        self.runs.insert(
            run_id,
            Run {
                context,
                main,
                state: RunState::Running,
            },
        );
        Ok(())
    }

    /// Settle the promise waiting on a response. Unknown identifiers are
    /// logged and dropped.
    pub fn deliver(&mut self, message: &Message) -> bool {
        let id = message.id();
        if !message.is_response() {
            warn!(id, "request delivered as a response");
            return false;
        }
        let Some(entry) = self.queue.pull(id) else {
            warn!(id, "response for unknown command");
            return false;
        };

        let outcome = match message {
            Message::Failure(failure) => Err(failure_for(&entry.command, &failure.error)),
            Message::Success(success) => Ok(Payloads::from(success.result.clone())),
            Message::Request(_) => return false,
        };
        debug!(id, command = %entry.command.name, ok = outcome.is_ok(), "response delivered");

        if let Some(recording) = entry
            .command
            .run_id
            .as_deref()
            .and_then(|run_id| self.recordings.get_mut(run_id))
            && let Some(index) = recording.index_by_id.remove(&id)
        {
            recording.history.push(
                self.tick_count,
                self.tick.borrow().time,
                EventKind::Response {
                    command: index,
                    message: message.clone(),
                },
            );
        }

        entry.promise.settle(outcome);
        true
    }

    pub fn signal(&mut self, run_id: &str, name: &str, args: Payloads) -> Result<(), WorkflowError> {
        let run = self.run(run_id)?;
        let context = run.context.clone();
        self.record(
            run_id,
            EventKind::Signal {
                name: name.to_string(),
                payloads: args.clone(),
            },
        );
        context.deliver_signal(name, args);
        Ok(())
    }

    pub fn query(&self, run_id: &str, name: &str, args: Payloads) -> Outcome {
        self.run(run_id)?.context.answer_query(name, args)
    }

    /// Cancel the root scope of a run.
    pub fn cancel(&mut self, run_id: &str) -> Result<(), WorkflowError> {
        let context = self.run(run_id)?.context.clone();
        info!(run_id, "Cancel requested");
        self.record(run_id, EventKind::CancelRequested);
        context.request_cancel();
        Ok(())
    }

    /// Drop a run without a terminal command.
    pub fn destroy(&mut self, run_id: &str) -> bool {
        match self.runs.remove(run_id) {
            Some(run) => {
                info!(run_id, "Destroying workflow");
                run.context.shutdown();
                self.queue.forget_run(run_id);
                self.recordings.remove(run_id);
                true
            }
            None => false,
        }
    }

    /// Drive every run to quiescence and finalise the ones that finished.
    pub fn drive(&mut self) -> Vec<FinishedRun> {
        let mut terminal = Vec::new();
        for (run_id, run) in &self.runs {
            run.context.drive();
            let outcome = match run.context.fatal_error() {
                Some(err) => Err(err),
                None => match run.main.borrow().result() {
                    Some(outcome) => outcome.clone(),
                    None => continue,
                },
            };
            terminal.push((run_id.clone(), outcome));
        }

        terminal
            .into_iter()
            .filter_map(|(run_id, outcome)| self.finish(&run_id, outcome))
            .collect()
    }

    fn finish(&mut self, run_id: &str, outcome: Outcome) -> Option<FinishedRun> {
        let mut run = self.runs.remove(run_id)?;
        let (state, command) = terminal_command(&outcome);
        run.state = state;

        match &outcome {
            Ok(_) => info!(run_id, "Workflow completed"),
            Err(WorkflowError::ContinuedAsNew { workflow_type, .. }) => {
                info!(run_id, %workflow_type, "Workflow continued as new")
            }
            Err(err) if err.is_cancelled() => info!(run_id, "Workflow cancelled"),
            Err(err) => error!(run_id, error = %err, "Workflow failed"),
        }

        if let Err(err) = self.queue.push(command.with_run_id(run_id)) {
            error!(run_id, error = %err, "could not emit terminal command");
        }
        run.context.shutdown();
        self.queue.forget_run(run_id);
        if self.recordings.contains_key(run_id) {
            self.finished.push_back(run_id.to_string());
        }

        Some(FinishedRun {
            run_id: run_id.to_string(),
            state: run.state,
            outcome,
        })
    }

    /// Outgoing commands of every run in issue order.
    pub fn drain_commands(&mut self) -> Vec<Command> {
        let commands = self.queue.drain();
        if !self.recordings.is_empty() {
            for command in &commands {
                self.record_command(command);
            }
        }
        while self.finished.len() > self.history_limit {
            if let Some(run_id) = self.finished.pop_front() {
                debug!(run_id = %run_id, "Dropping recorded history");
                self.recordings.remove(&run_id);
            }
        }
        commands
    }

    fn record_command(&mut self, command: &Command) {
        let Some(recording) = command
            .run_id
            .as_deref()
            .and_then(|run_id| self.recordings.get_mut(run_id))
        else {
            return;
        };
        let index = recording.commands;
        recording.commands += 1;
        if let Some(id) = command.id
            && self.queue.is_pending(id)
        {
            recording.index_by_id.insert(id, index);
        }
        recording.history.push(
            self.tick_count,
            self.tick.borrow().time,
            EventKind::Command(command.clone()),
        );
    }

    fn record(&mut self, run_id: &str, event: EventKind) {
        if let Some(recording) = self.recordings.get_mut(run_id) {
            recording
                .history
                .push(self.tick_count, self.tick.borrow().time, event);
        }
    }

    fn run(&self, run_id: &str) -> Result<&Run, WorkflowError> {
        self.runs
            .get(run_id)
            .ok_or_else(|| WorkflowError::Protocol(format!("run {run_id} is not running")))
    }

    pub fn is_running(&self, run_id: &str) -> bool {
        self.runs.contains_key(run_id)
    }

    pub fn state(&self, run_id: &str) -> Option<RunState> {
        self.runs.get(run_id).map(|run| run.state)
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Recorded history of a run, if recording is enabled.
    pub fn history(&self, run_id: &str) -> Option<&History> {
        self.recordings.get(run_id).map(|r| &r.history)
    }

    /// Hand over a recorded history. A history taken while its run is still
    /// alive stops growing.
    pub fn take_history(&mut self, run_id: &str) -> Option<History> {
        self.finished.retain(|finished| finished != run_id);
        self.recordings.remove(run_id).map(|r| r.history)
    }
}

/// Rebuild the workflow error carried by a failure response.
fn failure_for(command: &Command, error: &ErrorInfo) -> WorkflowError {
    if error.error_code() == Some(ErrorCode::Cancelled) {
        return WorkflowError::Cancelled(error.message.clone());
    }
    let data_str = |key: &str| {
        error
            .data
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    match command.name.as_str() {
        commands::EXECUTE_ACTIVITY => WorkflowError::ActivityFailure {
            activity_type: command.param_str("name").unwrap_or_default().to_string(),
            message: error.message.clone(),
            error_type: data_str("type"),
            retry_state: data_str("retryState"),
            data: error.data.clone(),
        },
        commands::EXECUTE_CHILD_WORKFLOW => WorkflowError::ChildWorkflowFailure {
            workflow_type: command.param_str("name").unwrap_or_default().to_string(),
            message: error.message.clone(),
            data: error.data.clone(),
        },
        _ => WorkflowError::from_error_info(error),
    }
}

fn terminal_command(outcome: &Outcome) -> (RunState, Command) {
    match outcome {
        Ok(result) => (
            RunState::Completed,
            Command::new(commands::COMPLETE_WORKFLOW).with_payloads(result.clone()),
        ),
        Err(WorkflowError::ContinuedAsNew {
            workflow_type,
            args,
        }) => (
            RunState::ContinuedAsNew,
            Command::new(commands::CONTINUE_AS_NEW)
                .with_param("name", workflow_type.as_str())
                .with_payloads(args.clone()),
        ),
        Err(err @ (WorkflowError::NonDeterministic(_) | WorkflowError::Protocol(_))) => (
            RunState::Failed,
            Command::new(commands::PANIC).with_param("failure", failure_param(err)),
        ),
        Err(err) => (
            RunState::Failed,
            Command::new(commands::COMPLETE_WORKFLOW).with_param("failure", failure_param(err)),
        ),
    }
}
