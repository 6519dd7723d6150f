// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Single-assignment promises awaited by workflow code.
//!
//! A [`Promise`] starts pending and settles at most once, either resolved
//! with [`Payloads`] or rejected with a [`WorkflowError`]. Promises are
//! plain `Future`s: awaiting one inside a workflow coroutine registers it as
//! a suspension point, and the scheduler re-polls the coroutine once it
//! settles. Combinators (`then`, `all`, `any`, `race`) build derived
//! promises out of settle callbacks, so no executor is involved.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::coroutine;
use crate::error::WorkflowError;
use crate::payload::Payloads;

/// Settled value of a promise.
pub type Outcome = Result<Payloads, WorkflowError>;

type SettleCallback = Box<dyn FnOnce(&Outcome)>;

#[derive(Default)]
struct PromiseState {
    outcome: Option<Outcome>,
    callbacks: Vec<SettleCallback>,
}

/// Shared handle to a single-assignment result.
#[derive(Clone, Default)]
pub struct Promise {
    state: Rc<RefCell<PromiseState>>,
}

impl std::fmt::Debug for Promise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("outcome", &self.state.borrow().outcome)
            .finish()
    }
}

impl Promise {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolved(payloads: Payloads) -> Self {
        let promise = Self::new();
        promise.resolve(payloads);
        promise
    }

    pub fn rejected(error: WorkflowError) -> Self {
        let promise = Self::new();
        promise.reject(error);
        promise
    }

    pub fn resolve(&self, payloads: Payloads) -> bool {
        self.settle(Ok(payloads))
    }

    pub fn reject(&self, error: WorkflowError) -> bool {
        self.settle(Err(error))
    }

    /// Settle the promise. Returns `false` if it was already settled.
    pub fn settle(&self, outcome: Outcome) -> bool {
        let callbacks = {
            let mut state = self.state.borrow_mut();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome.clone());
            std::mem::take(&mut state.callbacks)
        };
        for callback in callbacks {
            callback(&outcome);
        }
        true
    }

    pub fn is_pending(&self) -> bool {
        self.state.borrow().outcome.is_none()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.state.borrow().outcome.clone()
    }

    /// Run `callback` once the promise settles, immediately if it already has.
    pub fn on_settle(&self, callback: impl FnOnce(&Outcome) + 'static) {
        let outcome = {
            let mut state = self.state.borrow_mut();
            match &state.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    state.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&outcome);
    }

    /// Derive a promise from the resolved value. Rejections pass through.
    pub fn then<F>(&self, f: F) -> Promise
    where
        F: FnOnce(Payloads) -> Outcome + 'static,
    {
        let derived = Promise::new();
        let target = derived.clone();
        self.on_settle(move |outcome| match outcome {
            Ok(payloads) => {
                target.settle(f(payloads.clone()));
            }
            Err(err) => {
                target.reject(err.clone());
            }
        });
        derived
    }

    /// Resolves once every input resolved, with one value per input (its
    /// first payload, `null` when empty). Rejects with the first rejection.
    pub fn all(promises: impl IntoIterator<Item = Promise>) -> Promise {
        let promises: Vec<Promise> = promises.into_iter().collect();
        let combined = Promise::new();
        if promises.is_empty() {
            combined.resolve(Payloads::new());
            return combined;
        }

        let values = Rc::new(RefCell::new(vec![Value::Null; promises.len()]));
        let remaining = Rc::new(Cell::new(promises.len()));
        for (index, promise) in promises.iter().enumerate() {
            let combined = combined.clone();
            let values = values.clone();
            let remaining = remaining.clone();
            promise.on_settle(move |outcome| match outcome {
                Ok(payloads) => {
                    values.borrow_mut()[index] = payloads.first_value();
                    remaining.set(remaining.get() - 1);
                    if remaining.get() == 0 {
                        let values = std::mem::take(&mut *values.borrow_mut());
                        combined.resolve(Payloads::from(values));
                    }
                }
                Err(err) => {
                    combined.reject(err.clone());
                }
            });
        }
        combined
    }

    /// Resolves with the first resolution; rejects with the last error once
    /// every input rejected.
    pub fn any(promises: impl IntoIterator<Item = Promise>) -> Promise {
        let promises: Vec<Promise> = promises.into_iter().collect();
        let combined = Promise::new();
        if promises.is_empty() {
            combined.reject(WorkflowError::InvalidArgument(
                "any() needs at least one promise".to_string(),
            ));
            return combined;
        }

        let remaining = Rc::new(Cell::new(promises.len()));
        for promise in &promises {
            let combined = combined.clone();
            let remaining = remaining.clone();
            promise.on_settle(move |outcome| match outcome {
                Ok(payloads) => {
                    combined.resolve(payloads.clone());
                }
                Err(err) => {
                    remaining.set(remaining.get() - 1);
                    if remaining.get() == 0 {
                        combined.reject(err.clone());
                    }
                }
            });
        }
        combined
    }

    /// Settles like whichever input settles first.
    pub fn race(promises: impl IntoIterator<Item = Promise>) -> Promise {
        let combined = Promise::new();
        for promise in promises {
            let combined = combined.clone();
            promise.on_settle(move |outcome| {
                combined.settle(outcome.clone());
            });
        }
        combined
    }

    /// Await the promise and decode its first payload.
    pub async fn value<T: DeserializeOwned>(self) -> Result<T, WorkflowError> {
        let payloads = self.await?;
        payloads.decode(0)
    }
}

impl Future for Promise {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Outcome> {
        if let Some(outcome) = self.outcome() {
            return Poll::Ready(outcome);
        }
        match coroutine::suspend_on(&self) {
            Some(injected) => Poll::Ready(Err(injected)),
            None => Poll::Pending,
        }
    }
}
