// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process history replay.
//!
//! A [`History`] is what a run observed, tick by tick: the commands it
//! issued, the responses to them, the signals it received and cancellation
//! requests. [`Replayer`] re-executes the workflow against it with
//! `is_replaying` set, feeding each recorded response to the command that
//! replaced the original, and checks that the workflow issues the same
//! commands in the same order. Nothing is sent anywhere.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use temporal_rr_protocol::{CommandId, Message, commands};
use tracing::{debug, instrument};

use crate::error::WorkflowError;
use crate::payload::Payloads;
use crate::promise::Outcome;
use crate::queue::{Command, SharedQueue};
use crate::registry::WorkflowRegistry;
use crate::running::RunningWorkflows;
use crate::types::{RunState, TickInfo, WorkflowInfo};

/// What happened to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    /// A command the run issued
    Command(Command),
    /// Response to the `command`-th command of the history
    Response { command: usize, message: Message },
    Signal { name: String, payloads: Payloads },
    CancelRequested,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub tick: u64,
    pub time: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Recorded history of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub info: WorkflowInfo,
    #[serde(default)]
    pub input: Payloads,
    #[serde(default)]
    pub events: Vec<HistoryEvent>,
}

impl History {
    pub fn new(info: WorkflowInfo, input: Payloads) -> Self {
        Self {
            info,
            input,
            events: Vec::new(),
        }
    }

    pub fn push(&mut self, tick: u64, time: DateTime<Utc>, kind: EventKind) {
        self.events.push(HistoryEvent { tick, time, kind });
    }

    /// Recorded commands in issue order.
    pub fn commands(&self) -> impl Iterator<Item = &Command> {
        self.events.iter().filter_map(|event| match &event.kind {
            EventKind::Command(command) => Some(command),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Result of a successful replay.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayReport {
    /// Commands that matched the history
    pub commands: Vec<Command>,
    /// Commands issued after the recorded history ran out
    pub new_commands: Vec<Command>,
    pub state: RunState,
    /// Terminal outcome, if the run finished within the history
    pub outcome: Option<Outcome>,
}

/// Two commands are the same decision when name, parameters and payloads
/// agree. Side-effect payloads are produced only outside replay and cancel
/// commands refer to identifiers that differ between runs.
fn same_decision(recorded: &Command, replayed: &Command) -> bool {
    if recorded.name != replayed.name {
        return false;
    }
    match recorded.name.as_str() {
        commands::CANCEL => true,
        commands::SIDE_EFFECT => recorded.params == replayed.params,
        _ => recorded.params == replayed.params && recorded.payloads == replayed.payloads,
    }
}

pub struct Replayer {
    workflows: WorkflowRegistry,
}

impl Replayer {
    pub fn new(workflows: WorkflowRegistry) -> Self {
        Self { workflows }
    }

    /// Re-execute the run recorded in `history`.
    ///
    /// Fails with `NonDeterministic` on the first command that disagrees
    /// with the history.
    #[instrument(skip_all, fields(run_id = %history.info.run_id, workflow_type = %history.info.workflow_type))]
    pub fn replay(&self, history: &History) -> Result<ReplayReport, WorkflowError> {
        let handler = self.workflows.get(&history.info.workflow_type).ok_or_else(|| {
            WorkflowError::Protocol(format!(
                "workflow type {} is not registered",
                history.info.workflow_type
            ))
        })?;

        let recorded: Vec<&Command> = history.commands().collect();
        let mut replayed_ids: Vec<Option<CommandId>> = vec![None; recorded.len()];
        let mut report = ReplayReport {
            commands: Vec::new(),
            new_commands: Vec::new(),
            state: RunState::NotStarted,
            outcome: None,
        };

        let mut ticks: BTreeMap<u64, Vec<&HistoryEvent>> = BTreeMap::new();
        for event in &history.events {
            ticks.entry(event.tick).or_default().push(event);
        }
        if ticks.is_empty() {
            ticks.insert(0, Vec::new());
        }

        let mut running = RunningWorkflows::new(SharedQueue::default());
        let run_id = history.info.run_id.clone();
        let mut started = false;

        for events in ticks.values() {
            let time = events.first().map(|e| e.time).unwrap_or_default();
            running.begin_tick();
            running.apply_tick(TickInfo {
                time,
                is_replaying: true,
                history_length: history.len() as u64,
                history_size: 0,
            });

            if !started {
                running.start(history.info.clone(), history.input.clone(), &handler)?;
                report.state = RunState::Running;
                started = true;
            }

            for event in events {
                match &event.kind {
                    EventKind::Command(_) => {}
                    EventKind::Response { command, message } => {
                        match replayed_ids.get(*command).copied().flatten() {
                            Some(id) => {
                                running.deliver(&message.with_id(id));
                            }
                            None => {
                                return Err(WorkflowError::NonDeterministic(format!(
                                    "response recorded for command #{command}, which was never issued"
                                )));
                            }
                        }
                    }
                    EventKind::Signal { name, payloads } => {
                        if running.is_running(&run_id) {
                            running.signal(&run_id, name, payloads.clone())?;
                        }
                    }
                    EventKind::CancelRequested => {
                        if running.is_running(&run_id) {
                            running.cancel(&run_id)?;
                        }
                    }
                }
            }

            self.advance(&mut running, &recorded, &mut replayed_ids, &mut report)?;
        }

        debug!(
            matched = report.commands.len(),
            new = report.new_commands.len(),
            "Replay finished"
        );
        Ok(report)
    }

    fn advance(
        &self,
        running: &mut RunningWorkflows,
        recorded: &[&Command],
        replayed_ids: &mut [Option<CommandId>],
        report: &mut ReplayReport,
    ) -> Result<(), WorkflowError> {
        for finished in running.drive() {
            report.state = finished.state;
            report.outcome = Some(finished.outcome);
        }

        for command in running.drain_commands() {
            let index = report.commands.len();
            match recorded.get(index) {
                Some(expected) if report.new_commands.is_empty() => {
                    if !same_decision(expected, &command) {
                        return Err(WorkflowError::NonDeterministic(format!(
                            "command #{index}: history has {} {}, workflow issued {} {}",
                            expected.name,
                            serde_json::Value::Object(expected.params.clone()),
                            command.name,
                            serde_json::Value::Object(command.params.clone()),
                        )));
                    }
                    replayed_ids[index] = command.id;
                    report.commands.push(command);
                }
                _ => report.new_commands.push(command),
            }
        }
        Ok(())
    }
}
