// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow and activity registration tables.
//!
//! Handlers are registered explicitly by name at startup:
//!
//! ```ignore
//! let workflows = WorkflowRegistry::builder()
//!     .register("Greeting", greeting_workflow)
//!     .build();
//! let activities = ActivityRegistry::builder()
//!     .register("ComposeGreeting", compose_greeting)
//!     .build();
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;

use futures::future::{BoxFuture, LocalBoxFuture};
use tracing::warn;

use crate::activity::ActivityContext;
use crate::context::WorkflowContext;
use crate::error::ActivityError;
use crate::payload::Payloads;
use crate::promise::Outcome;

/// A workflow entry point. Workflow futures are single-threaded.
pub type WorkflowHandler = Rc<dyn Fn(WorkflowContext) -> LocalBoxFuture<'static, Outcome>>;

/// An activity entry point. Activities may run on any runtime thread.
pub type ActivityHandler = Arc<
    dyn Fn(ActivityContext) -> BoxFuture<'static, Result<Payloads, ActivityError>> + Send + Sync,
>;

/// Workflow types known to the worker.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    handlers: BTreeMap<String, WorkflowHandler>,
}

impl WorkflowRegistry {
    pub fn builder() -> WorkflowRegistryBuilder {
        WorkflowRegistryBuilder::default()
    }

    pub fn get(&self, workflow_type: &str) -> Option<WorkflowHandler> {
        self.handlers.get(workflow_type).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[derive(Default)]
pub struct WorkflowRegistryBuilder {
    handlers: BTreeMap<String, WorkflowHandler>,
}

impl WorkflowRegistryBuilder {
    /// Register `handler` under `workflow_type`. A second registration of the
    /// same type replaces the first.
    pub fn register<F, Fut>(mut self, workflow_type: &str, handler: F) -> Self
    where
        F: Fn(WorkflowContext) -> Fut + 'static,
        Fut: Future<Output = Outcome> + 'static,
    {
        let handler: WorkflowHandler =
            Rc::new(move |ctx: WorkflowContext| -> LocalBoxFuture<'static, Outcome> {
                Box::pin(handler(ctx))
            });
        if self
            .handlers
            .insert(workflow_type.to_string(), handler)
            .is_some()
        {
            warn!(workflow_type, "workflow registered twice, keeping the latest");
        }
        self
    }

    pub fn build(self) -> WorkflowRegistry {
        WorkflowRegistry {
            handlers: self.handlers,
        }
    }
}

/// Activity types known to the worker.
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    handlers: BTreeMap<String, ActivityHandler>,
}

impl ActivityRegistry {
    pub fn builder() -> ActivityRegistryBuilder {
        ActivityRegistryBuilder::default()
    }

    pub fn get(&self, activity_type: &str) -> Option<ActivityHandler> {
        self.handlers.get(activity_type).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[derive(Default)]
pub struct ActivityRegistryBuilder {
    handlers: BTreeMap<String, ActivityHandler>,
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, activity_type: &str, handler: F) -> Self
    where
        F: Fn(ActivityContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payloads, ActivityError>> + Send + 'static,
    {
        let handler: ActivityHandler = Arc::new(
            move |ctx: ActivityContext| -> BoxFuture<'static, Result<Payloads, ActivityError>> {
                Box::pin(handler(ctx))
            },
        );
        if self
            .handlers
            .insert(activity_type.to_string(), handler)
            .is_some()
        {
            warn!(activity_type, "activity registered twice, keeping the latest");
        }
        self
    }

    pub fn build(self) -> ActivityRegistry {
        ActivityRegistry {
            handlers: self.handlers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn noop_workflow(_ctx: WorkflowContext) -> Outcome {
        Ok(Payloads::new())
    }

    async fn echo_activity(ctx: ActivityContext) -> Result<Payloads, ActivityError> {
        Ok(ctx.input().clone())
    }

    #[test]
    fn test_workflow_registry_lookup() {
        let registry = WorkflowRegistry::builder()
            .register("B", noop_workflow)
            .register("A", noop_workflow)
            .build();
        assert_eq!(registry.names(), vec!["A", "B"]);
        assert!(registry.get("A").is_some());
        assert!(registry.get("C").is_none());
    }

    #[test]
    fn test_duplicate_registration_replaces() {
        let registry = ActivityRegistry::builder()
            .register("Echo", echo_activity)
            .register("Echo", echo_activity)
            .build();
        assert_eq!(registry.len(), 1);
    }
}
