// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The workflow context.
//!
//! [`WorkflowContext`] is the only way workflow code talks to the outside
//! world. Every primitive turns into a command in the shared correlation
//! queue and hands back a [`Promise`] that the matching response settles.
//! Nothing here reads a real clock or random source: time comes from the
//! tick, randomness goes through `side_effect`.
//!
//! # Example
//!
//! ```ignore
//! async fn greeting(ctx: WorkflowContext) -> Outcome {
//!     let name: String = ctx.input().decode(0)?;
//!     let greeting = ctx
//!         .execute_activity("ComposeGreeting", Payloads::encode(&name)?, ActivityOptions::new())
//!         .value::<String>()
//!         .await?;
//!     ctx.timer(Duration::from_secs(5)).await?;
//!     Payloads::encode(&greeting)
//! }
//! ```

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::Future;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use futures::future::LocalBoxFuture;
use serde::Serialize;
use serde_json::json;
use temporal_rr_protocol::{CommandId, commands};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::coroutine::{self, Coroutine, Scheduler};
use crate::error::WorkflowError;
use crate::payload::Payloads;
use crate::promise::{Outcome, Promise};
use crate::queue::{Command, SharedQueue};
use crate::scope::{Scope, ScopeHandle};
use crate::signals::SignalQueue;
use crate::types::{ActivityOptions, ChildWorkflowOptions, Interval, TickInfo, WorkflowInfo};

type SignalHandler =
    Rc<dyn Fn(WorkflowContext, Payloads) -> LocalBoxFuture<'static, Result<(), WorkflowError>>>;
type QueryHandler = Rc<dyn Fn(Payloads) -> Outcome>;

struct Condition {
    predicate: Box<dyn Fn() -> bool>,
    promise: Promise,
}

struct RunShared {
    info: WorkflowInfo,
    input: Payloads,
    queue: SharedQueue,
    tick: Rc<RefCell<TickInfo>>,
    root: Scope,
    scheduler: Scheduler,
    signals: RefCell<SignalQueue<SignalHandler, Payloads>>,
    queries: RefCell<BTreeMap<String, QueryHandler>>,
    conditions: RefCell<Vec<Condition>>,
    fatal: Rc<RefCell<Option<WorkflowError>>>,
}

/// Handle given to workflow code. Cheap to clone.
#[derive(Clone)]
pub struct WorkflowContext {
    shared: Rc<RunShared>,
}

impl WorkflowContext {
    pub(crate) fn new(
        info: WorkflowInfo,
        input: Payloads,
        queue: SharedQueue,
        tick: Rc<RefCell<TickInfo>>,
    ) -> Self {
        Self {
            shared: Rc::new(RunShared {
                info,
                input,
                queue,
                tick,
                root: Scope::root(),
                scheduler: Scheduler::default(),
                signals: RefCell::new(SignalQueue::new()),
                queries: RefCell::new(BTreeMap::new()),
                conditions: RefCell::new(Vec::new()),
                fatal: Rc::new(RefCell::new(None)),
            }),
        }
    }

    pub fn info(&self) -> &WorkflowInfo {
        &self.shared.info
    }

    /// Start payloads of the run.
    pub fn input(&self) -> &Payloads {
        &self.shared.input
    }

    /// Logical time of the current tick.
    pub fn now(&self) -> DateTime<Utc> {
        self.shared.tick.borrow().time
    }

    pub fn is_replaying(&self) -> bool {
        self.shared.tick.borrow().is_replaying
    }

    pub fn history_length(&self) -> u64 {
        self.shared.tick.borrow().history_length
    }

    /// Whether the host asked to cancel this workflow.
    pub fn is_cancel_requested(&self) -> bool {
        self.shared.root.is_cancelled()
    }

    fn current_scope(&self) -> Scope {
        coroutine::current_scope().unwrap_or_else(|| self.shared.root.clone())
    }

    fn issue_command(&self, command: Command, cancellable: bool) -> (Option<CommandId>, Promise) {
        let scope = self.current_scope();
        if scope.is_cancelled() {
            return (None, Promise::rejected(WorkflowError::cancelled()));
        }

        let command = command.with_run_id(self.shared.info.run_id.clone());
        let name = command.name.clone();
        match self.shared.queue.add(command) {
            Ok((id, promise)) => {
                debug!(run_id = %self.shared.info.run_id, command = %name, id, "command issued");
                let on_cancel: Option<Box<dyn FnOnce()>> = if cancellable {
                    let queue = self.shared.queue.clone();
                    Some(Box::new(move || {
                        queue.cancel(id);
                    }))
                } else {
                    None
                };
                scope.register(promise.clone(), on_cancel);
                (Some(id), promise)
            }
            Err(err) => {
                warn!(run_id = %self.shared.info.run_id, command = %name, error = %err, "command rejected");
                (None, Promise::rejected(err))
            }
        }
    }

    fn issue(&self, command: Command, cancellable: bool) -> Promise {
        self.issue_command(command, cancellable).1
    }

    /// Schedule an activity. Resolves with the activity result; rejects with
    /// `ActivityFailure`, or `Cancelled` when the enclosing scope is cancelled.
    pub fn execute_activity(&self, name: &str, args: Payloads, options: ActivityOptions) -> Promise {
        if name.is_empty() {
            return Promise::rejected(WorkflowError::Protocol(
                "activity name must not be empty".to_string(),
            ));
        }
        let options = match serde_json::to_value(&options) {
            Ok(options) => options,
            Err(err) => return Promise::rejected(err.into()),
        };
        let command = Command::new(commands::EXECUTE_ACTIVITY)
            .with_param("name", name)
            .with_param("options", options)
            .with_payloads(args);
        self.issue(command, true)
    }

    /// Start a child workflow and wait for its result.
    pub fn execute_child_workflow(
        &self,
        workflow_type: &str,
        args: Payloads,
        options: ChildWorkflowOptions,
    ) -> Promise {
        if workflow_type.is_empty() {
            return Promise::rejected(WorkflowError::Protocol(
                "child workflow type must not be empty".to_string(),
            ));
        }
        let options = match serde_json::to_value(&options) {
            Ok(options) => options,
            Err(err) => return Promise::rejected(err.into()),
        };
        let command = Command::new(commands::EXECUTE_CHILD_WORKFLOW)
            .with_param("name", workflow_type)
            .with_param("options", options)
            .with_payloads(args);
        self.issue(command, true)
    }

    /// Send a signal to another workflow execution.
    pub fn signal_external_workflow(
        &self,
        workflow_id: &str,
        run_id: Option<&str>,
        signal: &str,
        args: Payloads,
    ) -> Promise {
        let command = Command::new(commands::SIGNAL_EXTERNAL_WORKFLOW)
            .with_param("workflowId", workflow_id)
            .with_param("runId", run_id.unwrap_or_default())
            .with_param("signal", signal)
            .with_payloads(args);
        self.issue(command, false)
    }

    /// Durable timer. Negative intervals are rejected.
    pub fn timer(&self, interval: impl Into<Interval>) -> Promise {
        self.timer_command(interval.into()).1
    }

    fn timer_command(&self, interval: Interval) -> (Option<CommandId>, Promise) {
        if interval.is_negative() {
            return (
                None,
                Promise::rejected(WorkflowError::InvalidArgument(format!(
                    "timer interval must not be negative, got {}ms",
                    interval.millis()
                ))),
            );
        }
        let command = Command::new(commands::NEW_TIMER).with_param("ms", interval.millis());
        self.issue_command(command, true)
    }

    /// Record a non-deterministic value. `f` runs only outside replay; on
    /// replay the value recorded in history is returned instead.
    pub fn side_effect<T, F>(&self, f: F) -> Promise
    where
        T: Serialize,
        F: FnOnce() -> T,
    {
        let mut command = Command::new(commands::SIDE_EFFECT);
        if !self.is_replaying() {
            match Payloads::encode(&f()) {
                Ok(payloads) => command = command.with_payloads(payloads),
                Err(err) => return Promise::rejected(err),
            }
        }
        self.issue(command, false)
    }

    /// Version marker for code changes. Resolves with the recorded version;
    /// a version outside `[min_supported, max_supported]` is non-deterministic.
    pub fn get_version(&self, change_id: &str, min_supported: i32, max_supported: i32) -> Promise {
        if min_supported > max_supported {
            return Promise::rejected(WorkflowError::InvalidArgument(format!(
                "min supported version {min_supported} exceeds max {max_supported}"
            )));
        }
        let command = Command::new(commands::GET_VERSION)
            .with_param("changeId", change_id)
            .with_param("minSupported", min_supported)
            .with_param("maxSupported", max_supported);
        let change_id = change_id.to_string();
        self.issue(command, false).then(move |payloads| {
            let version: i32 = payloads.decode(0)?;
            if version < min_supported || version > max_supported {
                return Err(WorkflowError::NonDeterministic(format!(
                    "version {version} of change {change_id} is outside [{min_supported}, {max_supported}]"
                )));
            }
            Ok(payloads)
        })
    }

    /// Random UUID recorded as a side effect.
    pub async fn uuid(&self) -> Result<Uuid, WorkflowError> {
        self.side_effect(Uuid::new_v4).value::<Uuid>().await
    }

    /// Resolves once `predicate` holds. Re-evaluated after every scheduler pass.
    pub fn await_condition(&self, predicate: impl Fn() -> bool + 'static) -> Promise {
        if predicate() {
            return Promise::resolved(Payloads::new());
        }
        let promise = Promise::new();
        self.current_scope().register(promise.clone(), None);
        self.shared.conditions.borrow_mut().push(Condition {
            predicate: Box::new(predicate),
            promise: promise.clone(),
        });
        promise
    }

    fn check_conditions(&self) -> bool {
        let conditions = std::mem::take(&mut *self.shared.conditions.borrow_mut());
        let mut fired = false;
        let mut kept = Vec::with_capacity(conditions.len());
        for condition in conditions {
            if !condition.promise.is_pending() {
                continue;
            }
            if (condition.predicate)() {
                condition.promise.resolve(Payloads::new());
                fired = true;
            } else {
                kept.push(condition);
            }
        }
        let mut conditions = self.shared.conditions.borrow_mut();
        kept.append(&mut conditions);
        *conditions = kept;
        fired
    }

    /// Race `promise` against a timer. Rejects with `Timeout` if the timer
    /// fires first; the timer is cancelled otherwise.
    pub fn with_timeout(&self, interval: impl Into<Interval>, promise: Promise) -> Promise {
        if !promise.is_pending() {
            return promise;
        }
        let interval = interval.into();
        let (timer_id, timer) = self.timer_command(interval);
        let raced = Promise::new();

        let target = raced.clone();
        let queue = self.shared.queue.clone();
        promise.on_settle(move |outcome| {
            if target.settle(outcome.clone())
                && let Some(id) = timer_id
            {
                queue.cancel(id);
            }
        });

        let target = raced.clone();
        timer.on_settle(move |outcome| {
            let error = match outcome {
                Ok(_) => WorkflowError::Timeout(format!("no result within {}ms", interval.millis())),
                Err(err) => err.clone(),
            };
            target.reject(error);
        });
        raced
    }

    /// Run `body` in a child of the ambient scope. Starts immediately.
    pub fn new_scope<F, Fut>(&self, body: F) -> ScopeHandle
    where
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: Future<Output = Outcome> + 'static,
    {
        let scope = self.current_scope().child();
        self.start_scope(scope, body)
    }

    /// Run `body` in a scope unaffected by cancellation of the ambient scope.
    pub fn new_detached_scope<F, Fut>(&self, body: F) -> ScopeHandle
    where
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: Future<Output = Outcome> + 'static,
    {
        self.start_scope(Scope::detached(), body)
    }

    fn start_scope<F, Fut>(&self, scope: Scope, body: F) -> ScopeHandle
    where
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: Future<Output = Outcome> + 'static,
    {
        let coroutine = Coroutine::for_scope(body(self.clone()), scope.clone());
        let completion = coroutine.completion();
        self.shared.scheduler.spawn(coroutine);
        ScopeHandle::new(scope, completion)
    }

    /// Attach a signal handler and replay buffered signals to it in arrival
    /// order. Each invocation runs as its own coroutine in the root scope; an
    /// error other than cancellation fails the workflow.
    pub fn register_signal_handler<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(WorkflowContext, Payloads) -> Fut + 'static,
        Fut: Future<Output = Result<(), WorkflowError>> + 'static,
    {
        let handler: SignalHandler = Rc::new(
            move |ctx: WorkflowContext, args: Payloads| -> LocalBoxFuture<'static, Result<(), WorkflowError>> {
                Box::pin(handler(ctx, args))
            },
        );
        let buffered = self
            .shared
            .signals
            .borrow_mut()
            .attach(name, handler.clone());
        for args in buffered {
            self.run_signal(name, handler.clone(), args);
        }
    }

    /// Attach a synchronous query handler.
    pub fn register_query_handler<F>(&self, name: &str, handler: F)
    where
        F: Fn(Payloads) -> Outcome + 'static,
    {
        self.shared
            .queries
            .borrow_mut()
            .insert(name.to_string(), Rc::new(handler));
    }

    /// Terminal outcome that restarts the workflow under a fresh run.
    pub fn continue_as_new(&self, workflow_type: impl Into<String>, args: Payloads) -> Outcome {
        Err(WorkflowError::ContinuedAsNew {
            workflow_type: workflow_type.into(),
            args,
        })
    }

    fn run_signal(&self, name: &str, handler: SignalHandler, args: Payloads) {
        debug!(run_id = %self.shared.info.run_id, signal = name, "running signal handler");
        let future = handler(self.clone(), args);
        let coroutine = Coroutine::new(
            async move { future.await.map(|()| Payloads::new()) },
            self.shared.root.clone(),
        );
        let fatal = self.shared.fatal.clone();
        let signal = name.to_string();
        coroutine.on_complete(move |outcome| {
            if let Err(err) = outcome
                && !err.is_cancelled()
            {
                warn!(%signal, error = %err, "signal handler failed");
                fatal.borrow_mut().get_or_insert_with(|| err.clone());
            }
        });
        self.shared.scheduler.spawn(coroutine);
    }

    pub(crate) fn start_main(
        &self,
        future: LocalBoxFuture<'static, Outcome>,
    ) -> Rc<RefCell<Coroutine>> {
        let coroutine = Coroutine::for_scope(future, self.shared.root.clone());
        self.shared.scheduler.spawn(coroutine)
    }

    pub(crate) fn deliver_signal(&self, name: &str, args: Payloads) {
        let ready = self.shared.signals.borrow_mut().push(name, args);
        match ready {
            Some((handler, args)) => self.run_signal(name, handler, args),
            None => debug!(run_id = %self.shared.info.run_id, signal = name, "signal buffered"),
        }
    }

    pub(crate) fn answer_query(&self, name: &str, args: Payloads) -> Outcome {
        let handler = self.shared.queries.borrow().get(name).cloned();
        match handler {
            Some(handler) => handler(args),
            None => Err(WorkflowError::Protocol(format!(
                "no query handler registered for {name}"
            ))),
        }
    }

    pub(crate) fn request_cancel(&self) {
        self.shared.root.cancel();
    }

    /// Advance every coroutine of the run until nothing can move.
    pub(crate) fn drive(&self) {
        self.shared
            .scheduler
            .run_until_stalled(|| self.check_conditions());
    }

    pub(crate) fn fatal_error(&self) -> Option<WorkflowError> {
        self.shared.fatal.borrow().clone()
    }

    /// Drop suspended coroutines and handlers; they hold clones of the
    /// context and would otherwise keep the run alive.
    pub(crate) fn shutdown(&self) {
        self.shared.scheduler.clear();
        self.shared.signals.borrow_mut().clear();
        self.shared.queries.borrow_mut().clear();
        self.shared.conditions.borrow_mut().clear();
    }

    #[cfg(test)]
    pub(crate) fn coroutine_count(&self) -> usize {
        self.shared.scheduler.len()
    }
}

impl std::fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("info", &self.shared.info)
            .finish_non_exhaustive()
    }
}

/// Build the failure parameter of a terminal command.
pub(crate) fn failure_param(err: &WorkflowError) -> serde_json::Value {
    let info = err.to_error_info();
    json!({ "code": info.code, "message": info.message, "data": info.data })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::CorrelationQueue;
    use serde_json::json;
    use std::cell::Cell;
    use std::time::Duration;

    struct Harness {
        ctx: WorkflowContext,
        queue: SharedQueue,
        tick: Rc<RefCell<TickInfo>>,
    }

    fn harness() -> Harness {
        let queue = SharedQueue::new(CorrelationQueue::default());
        let tick = Rc::new(RefCell::new(TickInfo::default()));
        let ctx = WorkflowContext::new(
            WorkflowInfo::new("Test", "wf-1", "run-1"),
            Payloads::new(),
            queue.clone(),
            tick.clone(),
        );
        Harness { ctx, queue, tick }
    }

    fn names(commands: &[Command]) -> Vec<&str> {
        commands.iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn test_execute_activity_command_shape() {
        let h = harness();
        let promise = h.ctx.execute_activity(
            "Greet",
            Payloads::encode(&"Ada").unwrap(),
            ActivityOptions::new().with_start_to_close_timeout(Duration::from_secs(3)),
        );
        assert!(promise.is_pending());

        let commands = h.queue.drain();
        assert_eq!(commands.len(), 1);
        let command = &commands[0];
        assert_eq!(command.name, "ExecuteActivity");
        assert_eq!(command.param_str("name"), Some("Greet"));
        assert_eq!(command.params["options"]["startToCloseTimeoutMs"], 3000);
        assert_eq!(command.payloads, Payloads::encode(&"Ada").unwrap());
        assert_eq!(command.run_id.as_deref(), Some("run-1"));
    }

    #[test]
    fn test_empty_activity_name_rejected() {
        let h = harness();
        let promise = h
            .ctx
            .execute_activity("", Payloads::new(), ActivityOptions::new());
        assert!(matches!(promise.outcome(), Some(Err(WorkflowError::Protocol(_)))));
        assert!(h.queue.drain().is_empty());
    }

    /// Every interval form reaches the host as whole milliseconds.
    #[test]
    fn test_timer_normalises_interval() {
        let h = harness();
        h.ctx.timer(2);
        h.ctx.timer(0.25);
        h.ctx.timer(chrono::Duration::minutes(1));
        let millis: Vec<_> = h.queue.drain().iter().map(|c| c.params["ms"].clone()).collect();
        assert_eq!(millis, vec![json!(2000), json!(250), json!(60000)]);

        let negative = h.ctx.timer(-1);
        assert!(matches!(
            negative.outcome(),
            Some(Err(WorkflowError::InvalidArgument(_)))
        ));
    }

    /// The closure is skipped while replaying; the recorded value is used instead.
    #[test]
    fn test_side_effect_runs_only_when_live() {
        let h = harness();
        let calls = Rc::new(Cell::new(0));

        let counter = calls.clone();
        h.ctx.side_effect(move || {
            counter.set(counter.get() + 1);
            7
        });
        h.tick.borrow_mut().is_replaying = true;
        let counter = calls.clone();
        h.ctx.side_effect(move || {
            counter.set(counter.get() + 1);
            8
        });

        assert_eq!(calls.get(), 1);
        let commands = h.queue.drain();
        assert_eq!(commands[0].payloads, Payloads::encode(&7).unwrap());
        assert!(commands[1].payloads.is_empty());
    }

    /// A recorded version outside the supported range is non-deterministic.
    #[test]
    fn test_get_version_range_check() {
        let h = harness();
        let ok = h.ctx.get_version("change", 1, 2);
        let bad = h.ctx.get_version("change", 1, 2);
        let ids: Vec<_> = h.queue.drain().iter().filter_map(|c| c.id).collect();

        h.queue.resolve(ids[0], Ok(Payloads::encode(&2).unwrap()));
        h.queue.resolve(ids[1], Ok(Payloads::encode(&3).unwrap()));
        assert_eq!(ok.outcome(), Some(Ok(Payloads::encode(&2).unwrap())));
        assert!(matches!(
            bad.outcome(),
            Some(Err(WorkflowError::NonDeterministic(_)))
        ));

        assert!(matches!(
            h.ctx.get_version("change", 3, 1).outcome(),
            Some(Err(WorkflowError::InvalidArgument(_)))
        ));
    }

    /// The losing timer is cancelled with the host.
    #[test]
    fn test_with_timeout_cancels_timer_when_promise_wins() {
        let h = harness();
        let work = h
            .ctx
            .execute_activity("Slow", Payloads::new(), ActivityOptions::new());
        let raced = h.ctx.with_timeout(10, work);
        let issued = h.queue.drain();
        assert_eq!(names(&issued), vec!["ExecuteActivity", "NewTimer"]);

        let activity_id = issued[0].id.unwrap();
        h.queue.resolve(activity_id, Ok(Payloads::encode(&"done").unwrap()));
        assert_eq!(raced.outcome(), Some(Ok(Payloads::encode(&"done").unwrap())));
        assert_eq!(names(&h.queue.drain()), vec!["Cancel"]);
    }

    #[test]
    fn test_with_timeout_rejects_when_timer_fires() {
        let h = harness();
        let work = h
            .ctx
            .execute_activity("Slow", Payloads::new(), ActivityOptions::new());
        let raced = h.ctx.with_timeout(Duration::from_secs(1), work.clone());
        let issued = h.queue.drain();

        h.queue.resolve(issued[1].id.unwrap(), Ok(Payloads::new()));
        assert!(matches!(raced.outcome(), Some(Err(WorkflowError::Timeout(_)))));
        assert!(work.is_pending());
    }

    /// Conditions are re-checked after every scheduler pass.
    #[test]
    fn test_await_condition_resolves_after_state_change() {
        let h = harness();
        let flag = Rc::new(Cell::new(false));
        let observed = flag.clone();
        let promise = h.ctx.await_condition(move || observed.get());
        assert!(promise.is_pending());
        assert!(!h.ctx.check_conditions());

        flag.set(true);
        assert!(h.ctx.check_conditions());
        assert!(!promise.is_pending());
        assert!(h.ctx.await_condition(|| true).outcome().is_some());
    }

    #[test]
    fn test_request_cancel_rejects_pending_commands() {
        let h = harness();
        let timer = h.ctx.timer(60);
        h.queue.drain();

        h.ctx.request_cancel();
        assert!(h.ctx.is_cancel_requested());
        assert_eq!(timer.outcome(), Some(Err(WorkflowError::cancelled())));
        assert_eq!(names(&h.queue.drain()), vec!["Cancel"]);

        let late = h.ctx.timer(1);
        assert_eq!(late.outcome(), Some(Err(WorkflowError::cancelled())));
        assert!(h.queue.drain().is_empty());
    }

    #[test]
    fn test_query_without_handler_is_error() {
        let h = harness();
        assert!(h.ctx.answer_query("status", Payloads::new()).is_err());
        h.ctx
            .register_query_handler("status", |_| Payloads::encode(&"running"));
        assert_eq!(
            h.ctx.answer_query("status", Payloads::new()),
            Payloads::encode(&"running")
        );
    }

    /// Shutdown releases every coroutine without running it further.
    #[test]
    fn test_shutdown_drops_coroutines() {
        let h = harness();
        let ctx = h.ctx.clone();
        h.ctx
            .start_main(Box::pin(async move { ctx.timer(5).await }));
        assert_eq!(h.ctx.coroutine_count(), 1);
        h.ctx.shutdown();
        assert_eq!(h.ctx.coroutine_count(), 0);
    }
}
