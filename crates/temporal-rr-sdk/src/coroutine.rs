// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Coroutine processes and the per-run scheduler.
//!
//! A workflow handler is an `async` block; the compiler turns it into a
//! resumable state machine, which is exactly what a coroutine needs. The
//! [`Coroutine`] wrapper polls it with a no-op waker: nothing is ever woken
//! by the runtime, instead the [`Scheduler`] re-polls a coroutine when one of
//! the promises it suspended on has settled.
//!
//! While a coroutine is being polled it is the *active frame* of the thread.
//! Promises that return `Pending` record themselves in the active frame,
//! which becomes the coroutine's suspension set. The frame also carries the
//! coroutine's cancellation scope (the ambient scope for new commands) and
//! its interrupt slot, through which errors are injected at the next
//! suspension point.

use std::cell::RefCell;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::future::LocalBoxFuture;
use futures::task::noop_waker_ref;
use tracing::debug;

use crate::error::WorkflowError;
use crate::promise::{Outcome, Promise};
use crate::scope::Scope;

/// Lifecycle of a coroutine. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Pending,
    Running,
    Suspended,
    Completed,
    Failed,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessState::Completed | ProcessState::Failed)
    }
}

#[derive(Default)]
struct InterruptState {
    pending: Option<WorkflowError>,
    waiting: Vec<Promise>,
    running: bool,
    finished: bool,
}

/// Error injection slot shared between a coroutine and the scope it owns.
#[derive(Clone, Default)]
pub(crate) struct Interrupt {
    state: Rc<RefCell<InterruptState>>,
}

impl Interrupt {
    /// Schedule `error` if the coroutine is running or blocked on a promise
    /// that is still pending. Returns whether the error was scheduled.
    pub(crate) fn schedule(&self, error: WorkflowError) -> bool {
        let mut state = self.state.borrow_mut();
        if state.finished {
            return false;
        }
        let blocked = state.waiting.iter().any(Promise::is_pending);
        if state.running || blocked {
            state.pending.get_or_insert(error);
            true
        } else {
            false
        }
    }

    fn force(&self, error: WorkflowError) {
        let mut state = self.state.borrow_mut();
        if !state.finished {
            state.pending = Some(error);
        }
    }

    fn take(&self) -> Option<WorkflowError> {
        self.state.borrow_mut().pending.take()
    }

    fn set_running(&self, running: bool) {
        self.state.borrow_mut().running = running;
    }

    fn set_waiting(&self, waiting: Vec<Promise>) {
        self.state.borrow_mut().waiting = waiting;
    }

    fn is_ready(&self) -> bool {
        let state = self.state.borrow();
        !state.waiting.is_empty()
            && (state.pending.is_some() || state.waiting.iter().any(|p| !p.is_pending()))
    }

    fn finish(&self) {
        let mut state = self.state.borrow_mut();
        state.finished = true;
        state.pending = None;
        state.waiting.clear();
    }
}

struct ActiveFrame {
    interrupt: Interrupt,
    scope: Scope,
    waiting: Vec<Promise>,
}

thread_local! {
    static ACTIVE: RefCell<Option<ActiveFrame>> = const { RefCell::new(None) };
}

/// Called by a pending promise being polled. Records it as a suspension
/// point of the active coroutine, or hands back an injected error instead.
pub(crate) fn suspend_on(promise: &Promise) -> Option<WorkflowError> {
    ACTIVE.with(|active| {
        let mut active = active.borrow_mut();
        let frame = active.as_mut()?;
        if let Some(error) = frame.interrupt.take() {
            return Some(error);
        }
        frame.waiting.push(promise.clone());
        None
    })
}

/// Scope of the coroutine currently being polled, if any.
pub(crate) fn current_scope() -> Option<Scope> {
    ACTIVE.with(|active| active.borrow().as_ref().map(|frame| frame.scope.clone()))
}

/// A resumable unit of workflow code.
pub struct Coroutine {
    future: Option<LocalBoxFuture<'static, Outcome>>,
    state: ProcessState,
    scope: Scope,
    owns_scope: bool,
    interrupt: Interrupt,
    result: Option<Outcome>,
    completion: Promise,
}

impl Coroutine {
    /// A coroutine running inside `scope` without owning it.
    pub fn new(future: impl Future<Output = Outcome> + 'static, scope: Scope) -> Self {
        Self {
            future: Some(Box::pin(future)),
            state: ProcessState::Pending,
            scope,
            owns_scope: false,
            interrupt: Interrupt::default(),
            result: None,
            completion: Promise::new(),
        }
    }

    /// A coroutine that is the body of `scope`: cancelling the scope
    /// interrupts it, and the scope is marked complete when it finishes.
    pub fn for_scope(future: impl Future<Output = Outcome> + 'static, scope: Scope) -> Self {
        let mut coroutine = Self::new(future, scope);
        coroutine.scope.attach_interrupt(coroutine.interrupt.clone());
        coroutine.owns_scope = true;
        coroutine
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn result(&self) -> Option<&Outcome> {
        self.result.as_ref()
    }

    /// Promise settled with the terminal outcome.
    pub fn completion(&self) -> Promise {
        self.completion.clone()
    }

    /// Fires exactly once with the terminal outcome.
    pub fn on_complete(&self, callback: impl FnOnce(&Outcome) + 'static) {
        self.completion.on_settle(callback);
    }

    /// First poll. No-op unless the coroutine is still pending.
    pub fn start(&mut self) {
        if self.state == ProcessState::Pending {
            self.poll_once();
        }
    }

    /// Re-poll after suspension points settled.
    pub fn resume(&mut self) {
        match self.state {
            ProcessState::Pending | ProcessState::Suspended => self.poll_once(),
            _ => {}
        }
    }

    /// Surface `error` at the current suspension point and re-poll.
    pub fn throw_into(&mut self, error: WorkflowError) {
        if self.state.is_terminal() {
            return;
        }
        self.interrupt.force(error);
        self.resume();
    }

    /// Record `error` for injection at the next scheduling opportunity.
    /// Returns false when the coroutine is not suspended on anything pending.
    pub fn interrupt(&self, error: WorkflowError) -> bool {
        self.interrupt.schedule(error)
    }

    /// Suspended and at least one suspension point settled (or an error is
    /// waiting to be injected).
    pub fn is_ready(&self) -> bool {
        self.state == ProcessState::Suspended && self.interrupt.is_ready()
    }

    fn poll_once(&mut self) {
        let Some(future) = self.future.as_mut() else {
            return;
        };

        self.state = ProcessState::Running;
        self.interrupt.set_running(true);
        let previous = ACTIVE.with(|active| {
            active.replace(Some(ActiveFrame {
                interrupt: self.interrupt.clone(),
                scope: self.scope.clone(),
                waiting: Vec::new(),
            }))
        });

        let mut cx = Context::from_waker(noop_waker_ref());
        let polled = panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));

        let frame = ACTIVE.with(|active| active.replace(previous));
        self.interrupt.set_running(false);
        let waiting = frame.map(|frame| frame.waiting).unwrap_or_default();

        match polled {
            Ok(Poll::Pending) => {
                self.state = ProcessState::Suspended;
                self.interrupt.set_waiting(waiting);
            }
            Ok(Poll::Ready(outcome)) => self.finish(outcome),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                debug!(%message, "coroutine panicked");
                self.finish(Err(WorkflowError::failure(format!("panic: {message}"))));
            }
        }
    }

    fn finish(&mut self, outcome: Outcome) {
        self.future = None;
        self.state = if outcome.is_ok() {
            ProcessState::Completed
        } else {
            ProcessState::Failed
        };
        self.interrupt.finish();
        if self.owns_scope {
            self.scope.mark_completed();
        }
        self.result = Some(outcome.clone());
        self.completion.settle(outcome);
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Ordered set of coroutines belonging to one run.
#[derive(Default)]
pub(crate) struct Scheduler {
    coroutines: RefCell<Vec<Rc<RefCell<Coroutine>>>>,
}

impl Scheduler {
    /// Register and immediately start a coroutine.
    pub(crate) fn spawn(&self, coroutine: Coroutine) -> Rc<RefCell<Coroutine>> {
        let handle = Rc::new(RefCell::new(coroutine));
        self.coroutines.borrow_mut().push(handle.clone());
        handle.borrow_mut().start();
        handle
    }

    /// Resume ready coroutines in creation order until a full pass makes no
    /// progress. `after_pass` runs after every pass and reports whether it
    /// settled anything.
    pub(crate) fn run_until_stalled(&self, mut after_pass: impl FnMut() -> bool) {
        loop {
            let snapshot: Vec<_> = self.coroutines.borrow().clone();
            let mut progressed = false;
            for coroutine in snapshot {
                let ready = coroutine.borrow().is_ready();
                if ready {
                    coroutine.borrow_mut().resume();
                    progressed = true;
                }
            }
            self.coroutines
                .borrow_mut()
                .retain(|coroutine| !coroutine.borrow().state().is_terminal());

            if after_pass() {
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.coroutines.borrow().len()
    }

    /// Drop every coroutine together with its suspended future.
    pub(crate) fn clear(&self) {
        let coroutines = std::mem::take(&mut *self.coroutines.borrow_mut());
        drop(coroutines);
    }
}
