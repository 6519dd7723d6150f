// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cancellation scopes.
//!
//! Scopes form a tree rooted at the workflow's main coroutine. Every
//! cancellable promise registers with the ambient scope of the coroutine
//! that created it. Cancelling a scope cancels its children depth first,
//! then its own registrations, then schedules a `Cancelled` injection into
//! the scope's body if the body is blocked on something still pending.
//! A scope whose body already returned still passes cancellation on to
//! descendants that are running.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::coroutine::Interrupt;
use crate::error::WorkflowError;
use crate::promise::{Outcome, Promise};

type CancelAction = Box<dyn FnOnce()>;

struct Registration {
    promise: Promise,
    on_cancel: Option<CancelAction>,
}

impl Registration {
    fn cancel(self) {
        if !self.promise.is_pending() {
            return;
        }
        if let Some(action) = self.on_cancel {
            action();
        }
        self.promise.reject(WorkflowError::cancelled());
    }
}

#[derive(Default)]
struct ScopeState {
    cancelled: bool,
    completed: bool,
    children: Vec<Scope>,
    registrations: Vec<Registration>,
    on_cancel: Vec<CancelAction>,
    interrupt: Option<Interrupt>,
}

/// Node of the cancellation tree.
#[derive(Clone, Default)]
pub struct Scope {
    state: Rc<RefCell<ScopeState>>,
}

impl Scope {
    pub fn root() -> Self {
        Self::default()
    }

    /// A scope with no parent; only an explicit `cancel` reaches it.
    pub fn detached() -> Self {
        Self::default()
    }

    /// New child scope. A child of a cancelled scope starts cancelled.
    pub fn child(&self) -> Scope {
        let child = Scope::default();
        let parent_cancelled = {
            let mut state = self.state.borrow_mut();
            if !state.cancelled {
                state.children.retain(|c| !c.is_settled());
                state.children.push(child.clone());
            }
            state.cancelled
        };
        if parent_cancelled {
            child.cancel();
        }
        child
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.borrow().cancelled
    }

    /// Cancelled, or completed with no live descendant left.
    fn is_settled(&self) -> bool {
        let state = self.state.borrow();
        state.cancelled || (state.completed && state.children.iter().all(Scope::is_settled))
    }

    /// Track `promise` so that cancelling the scope rejects it. `on_cancel`
    /// runs first, while the promise is still pending.
    pub fn register(&self, promise: Promise, on_cancel: Option<CancelAction>) {
        let registration = Registration { promise, on_cancel };
        {
            let mut state = self.state.borrow_mut();
            if !state.cancelled {
                state.registrations.retain(|r| r.promise.is_pending());
                state.registrations.push(registration);
                return;
            }
        }
        registration.cancel();
    }

    /// Run `callback` once when the scope is cancelled.
    pub fn on_cancel(&self, callback: impl FnOnce() + 'static) {
        {
            let mut state = self.state.borrow_mut();
            if !state.cancelled {
                state.on_cancel.push(Box::new(callback));
                return;
            }
        }
        callback();
    }

    /// Cancel the scope. Idempotent. Once the body completed only the
    /// descendants are cancelled.
    pub fn cancel(&self) {
        let (children, registrations, callbacks, interrupt) = {
            let mut state = self.state.borrow_mut();
            if state.cancelled {
                return;
            }
            if state.completed {
                let children = std::mem::take(&mut state.children);
                drop(state);
                for child in children {
                    child.cancel();
                }
                return;
            }
            state.cancelled = true;
            (
                std::mem::take(&mut state.children),
                std::mem::take(&mut state.registrations),
                std::mem::take(&mut state.on_cancel),
                state.interrupt.clone(),
            )
        };

        for child in children {
            child.cancel();
        }
        for registration in registrations {
            registration.cancel();
        }
        if let Some(interrupt) = interrupt {
            interrupt.schedule(WorkflowError::cancelled());
        }
        for callback in callbacks {
            callback();
        }
    }

    pub(crate) fn attach_interrupt(&self, interrupt: Interrupt) {
        self.state.borrow_mut().interrupt = Some(interrupt);
    }

    pub(crate) fn mark_completed(&self) {
        self.state.borrow_mut().completed = true;
    }

    #[cfg(test)]
    fn registration_count(&self) -> usize {
        self.state.borrow().registrations.len()
    }
}

/// Handle to a scope started with `WorkflowContext::new_scope`.
///
/// Awaiting the handle yields the body's outcome.
#[derive(Clone)]
pub struct ScopeHandle {
    scope: Scope,
    completion: Promise,
}

impl ScopeHandle {
    pub(crate) fn new(scope: Scope, completion: Promise) -> Self {
        Self { scope, completion }
    }

    pub fn cancel(&self) {
        self.scope.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.scope.is_cancelled()
    }

    pub fn on_cancel(&self, callback: impl FnOnce() + 'static) {
        self.scope.on_cancel(callback);
    }

    /// Promise settled with the body's outcome.
    pub fn promise(&self) -> Promise {
        self.completion.clone()
    }
}

impl Future for ScopeHandle {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Outcome> {
        Pin::new(&mut self.get_mut().completion).poll(cx)
    }
}
