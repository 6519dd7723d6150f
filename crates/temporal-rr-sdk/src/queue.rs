// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request/response correlation.
//!
//! Every command gets an identifier when it enters the queue. Commands that
//! expect a response stay in the pending map together with the promise they
//! settle; responses are matched strictly by identifier, never by arrival
//! order. Identifiers grow monotonically and wrap back to 1 after the
//! configured ceiling, skipping any identifier that is still pending.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use temporal_rr_protocol::{CommandId, Request, commands};
use tracing::debug;

use crate::error::WorkflowError;
use crate::payload::Payloads;
use crate::promise::{Outcome, Promise};

/// Default identifier ceiling.
pub const DEFAULT_MAX_COMMAND_ID: CommandId = u32::MAX as CommandId;

/// An outgoing command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CommandId>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Payloads::is_empty")]
    pub payloads: Payloads,
    #[serde(default, rename = "runId", skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            params: Map::new(),
            payloads: Payloads::new(),
            run_id: None,
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn with_payloads(mut self, payloads: Payloads) -> Self {
        self.payloads = payloads;
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn to_request(&self) -> Request {
        Request {
            id: self.id.unwrap_or_default(),
            command: self.name.clone(),
            params: self.params.clone(),
            payloads: self.payloads.values().to_vec(),
            run_id: self.run_id.clone(),
        }
    }
}

/// A command waiting for its response.
#[derive(Debug)]
pub struct PendingEntry {
    pub command: Command,
    pub promise: Promise,
}

/// Identifier allocation, pending entries and the outgoing buffer.
#[derive(Debug)]
pub struct CorrelationQueue {
    next_id: CommandId,
    max_id: CommandId,
    pending: BTreeMap<CommandId, PendingEntry>,
    outgoing: Vec<Command>,
}

impl Default for CorrelationQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_COMMAND_ID)
    }
}

impl CorrelationQueue {
    pub fn new(max_id: CommandId) -> Self {
        Self {
            next_id: 1,
            max_id: max_id.max(1),
            pending: BTreeMap::new(),
            outgoing: Vec::new(),
        }
    }

    fn allocate(&mut self) -> Result<CommandId, WorkflowError> {
        if self.pending.len() as u64 >= self.max_id {
            return Err(WorkflowError::Protocol(format!(
                "all {} command identifiers are pending",
                self.max_id
            )));
        }
        loop {
            let id = self.next_id;
            self.next_id = if id >= self.max_id { 1 } else { id + 1 };
            if !self.pending.contains_key(&id) {
                return Ok(id);
            }
        }
    }

    fn assign(&mut self, command: &mut Command) -> Result<CommandId, WorkflowError> {
        match command.id {
            Some(id) if self.pending.contains_key(&id) => Err(WorkflowError::Protocol(format!(
                "command identifier {id} is already pending"
            ))),
            Some(id) => Ok(id),
            None => {
                let id = self.allocate()?;
                command.id = Some(id);
                Ok(id)
            }
        }
    }

    /// Add a command that expects a response.
    pub fn add(&mut self, mut command: Command) -> Result<(CommandId, Promise), WorkflowError> {
        let id = self.assign(&mut command)?;
        let promise = Promise::new();
        self.outgoing.push(command.clone());
        self.pending.insert(
            id,
            PendingEntry {
                command,
                promise: promise.clone(),
            },
        );
        Ok((id, promise))
    }

    /// Add a fire-and-forget command.
    pub fn push(&mut self, mut command: Command) -> Result<CommandId, WorkflowError> {
        let id = self.assign(&mut command)?;
        self.outgoing.push(command);
        Ok(id)
    }

    /// Remove the pending entry for `id`. `None` means the response is for
    /// an unknown or already consumed command.
    pub fn pull(&mut self, id: CommandId) -> Option<PendingEntry> {
        self.pending.remove(&id)
    }

    /// Remove the pending entry and emit a `Cancel` command for it. The
    /// caller rejects the returned promise.
    pub fn cancel(&mut self, id: CommandId) -> Option<PendingEntry> {
        let entry = self.pending.remove(&id)?;
        let mut cancel = Command::new(commands::CANCEL).with_param("ids", json!([id]));
        cancel.run_id = entry.command.run_id.clone();
        if let Err(err) = self.push(cancel) {
            debug!(id, error = %err, "could not emit cancel command");
        }
        Some(entry)
    }

    /// Drop pending entries of a run that no longer exists.
    pub fn forget_run(&mut self, run_id: &str) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, entry| entry.command.run_id.as_deref() != Some(run_id));
        before - self.pending.len()
    }

    /// Outgoing commands in issue order.
    pub fn drain(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.outgoing)
    }

    pub fn is_pending(&self, id: CommandId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Queue shared by every run of a worker.
///
/// Promises are always settled after the queue borrow is released, so
/// settle callbacks may issue or cancel further commands.
#[derive(Clone, Default)]
pub struct SharedQueue {
    inner: Rc<RefCell<CorrelationQueue>>,
}

impl SharedQueue {
    pub fn new(queue: CorrelationQueue) -> Self {
        Self {
            inner: Rc::new(RefCell::new(queue)),
        }
    }

    pub fn add(&self, command: Command) -> Result<(CommandId, Promise), WorkflowError> {
        self.inner.borrow_mut().add(command)
    }

    pub fn push(&self, command: Command) -> Result<CommandId, WorkflowError> {
        self.inner.borrow_mut().push(command)
    }

    pub fn pull(&self, id: CommandId) -> Option<PendingEntry> {
        self.inner.borrow_mut().pull(id)
    }

    /// Pull and settle. Returns whether `id` matched a pending command.
    pub fn resolve(&self, id: CommandId, outcome: Outcome) -> bool {
        match self.pull(id) {
            Some(entry) => {
                entry.promise.settle(outcome);
                true
            }
            None => false,
        }
    }

    /// Cancel a pending command and reject its promise.
    pub fn cancel(&self, id: CommandId) -> bool {
        let entry = self.inner.borrow_mut().cancel(id);
        match entry {
            Some(entry) => {
                entry.promise.reject(WorkflowError::cancelled());
                true
            }
            None => false,
        }
    }

    pub fn forget_run(&self, run_id: &str) -> usize {
        self.inner.borrow_mut().forget_run(run_id)
    }

    pub fn drain(&self) -> Vec<Command> {
        self.inner.borrow_mut().drain()
    }

    pub fn is_pending(&self, id: CommandId) -> bool {
        self.inner.borrow().is_pending(id)
    }

    pub fn pending_len(&self) -> usize {
        self.inner.borrow().pending_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic_and_outgoing_keeps_order() {
        let mut queue = CorrelationQueue::default();
        let (a, _) = queue.add(Command::new("ExecuteActivity")).unwrap();
        let b = queue.push(Command::new("CompleteWorkflow")).unwrap();
        let (c, _) = queue.add(Command::new("NewTimer")).unwrap();
        assert_eq!((a, b, c), (1, 2, 3));

        let drained = queue.drain();
        let names: Vec<_> = drained.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["ExecuteActivity", "CompleteWorkflow", "NewTimer"]);
        assert!(queue.drain().is_empty());
        assert_eq!(queue.pending_len(), 2);
    }

    /// After the ceiling ids restart at 1, skipping ids still awaiting a response.
    #[test]
    fn test_ids_wrap_and_skip_pending() {
        let mut queue = CorrelationQueue::new(3);
        let (one, _) = queue.add(Command::new("A")).unwrap();
        let two = queue.push(Command::new("B")).unwrap();
        let three = queue.push(Command::new("C")).unwrap();
        assert_eq!((one, two, three), (1, 2, 3));

        // 1 is still pending, so the wrap lands on 2.
        assert_eq!(queue.push(Command::new("D")).unwrap(), 2);
    }

    /// Every id pending means no id can be allocated.
    #[test]
    fn test_exhausted_ids_rejected() {
        let mut queue = CorrelationQueue::new(2);
        queue.add(Command::new("A")).unwrap();
        queue.add(Command::new("B")).unwrap();
        assert!(matches!(
            queue.add(Command::new("C")),
            Err(WorkflowError::Protocol(_))
        ));
    }

    #[test]
    fn test_preassigned_id_is_kept() {
        let mut queue = CorrelationQueue::default();
        let mut command = Command::new("A");
        command.id = Some(40);
        let (id, _) = queue.add(command.clone()).unwrap();
        assert_eq!(id, 40);
        assert!(queue.add(command).is_err());
    }

    #[test]
    fn test_pull_unknown_is_none() {
        let mut queue = CorrelationQueue::default();
        assert!(queue.pull(99).is_none());
        let (id, _) = queue.add(Command::new("A")).unwrap();
        assert!(queue.pull(id).is_some());
        assert!(queue.pull(id).is_none());
    }

    #[test]
    fn test_cancel_emits_cancel_command() {
        let queue = SharedQueue::default();
        let (id, promise) = queue
            .add(Command::new("NewTimer").with_run_id("run-1"))
            .unwrap();
        queue.drain();

        assert!(queue.cancel(id));
        assert!(!queue.cancel(id));
        assert_eq!(promise.outcome(), Some(Err(WorkflowError::cancelled())));

        let drained = queue.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].name, "Cancel");
        assert_eq!(drained[0].params["ids"], json!([id]));
        assert_eq!(drained[0].run_id.as_deref(), Some("run-1"));
    }

    /// The entry is out of the queue before its promise callbacks run.
    #[test]
    fn test_resolve_settles_after_release() {
        let queue = SharedQueue::default();
        let (first, promise) = queue.add(Command::new("A")).unwrap();
        let (second, other) = queue.add(Command::new("B")).unwrap();

        let inner = queue.clone();
        promise.on_settle(move |_| {
            inner.cancel(second);
        });

        assert!(queue.resolve(first, Ok(Payloads::new())));
        assert_eq!(other.outcome(), Some(Err(WorkflowError::cancelled())));
        assert!(!queue.resolve(first, Ok(Payloads::new())));
    }

    /// Only the destroyed run's pending entries are dropped.
    #[test]
    fn test_forget_run() {
        let queue = SharedQueue::default();
        queue.add(Command::new("A").with_run_id("r1")).unwrap();
        queue.add(Command::new("B").with_run_id("r2")).unwrap();
        assert_eq!(queue.forget_run("r1"), 1);
        assert_eq!(queue.pending_len(), 1);
    }
}
