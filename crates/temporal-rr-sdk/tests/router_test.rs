// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for batch dispatch.
//!
//! Each test plays the host: it feeds batches to a [`Router`] and answers the
//! commands the workflows issue, one tick at a time.
//!
//! Run with:
//! ```bash
//! cargo test -p temporal-rr-sdk --test router_test
//! ```

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use temporal_rr_sdk::protocol::{Batch, CommandId, ErrorCode, Message, Request, TickContext, commands};
use temporal_rr_sdk::{
    ActivityContext, ActivityError, ActivityOptions, ActivityRegistry, Outcome, Payloads, Promise,
    Router, WorkflowContext, WorkflowError, WorkflowRegistry,
};

// ============================================================================
// Host helpers
// ============================================================================

fn tick(seconds: i64) -> TickContext {
    TickContext {
        tick_time: DateTime::<Utc>::from_timestamp(1_700_000_000 + seconds, 0).unwrap(),
        replay: false,
        history_length: 0,
        history_size: 0,
    }
}

fn start(id: CommandId, workflow_type: &str, run_id: &str, input: Vec<Value>) -> Message {
    let mut request = Request::new(id, commands::START_WORKFLOW);
    request.params.insert(
        "info".to_string(),
        json!({
            "workflowType": workflow_type,
            "workflowId": format!("wf-{run_id}"),
            "runId": run_id,
        }),
    );
    request.payloads = input;
    Message::Request(request)
}

fn run_request(id: CommandId, command: &str, run_id: &str, name: &str, payloads: Vec<Value>) -> Message {
    let mut request = Request::new(id, command);
    request.run_id = Some(run_id.to_string());
    request.params.insert("name".to_string(), json!(name));
    request.payloads = payloads;
    Message::Request(request)
}

/// Commands the worker sent in a reply batch.
fn issued(batch: &Batch) -> Vec<Request> {
    batch
        .messages
        .iter()
        .filter_map(|message| match message {
            Message::Request(request) => Some(request.clone()),
            _ => None,
        })
        .collect()
}

fn issued_named(batch: &Batch, name: &str) -> Vec<Request> {
    issued(batch)
        .into_iter()
        .filter(|request| request.command == name)
        .collect()
}

fn response(batch: &Batch, id: CommandId) -> Message {
    batch
        .messages
        .iter()
        .find(|message| message.is_response() && message.id() == id)
        .cloned()
        .unwrap_or_else(|| panic!("no response for request {id}"))
}

fn timer_with_ms(batch: &Batch, ms: i64) -> Request {
    issued_named(batch, commands::NEW_TIMER)
        .into_iter()
        .find(|request| request.params["ms"] == json!(ms))
        .unwrap_or_else(|| panic!("no {ms}ms timer issued"))
}

// ============================================================================
// Workflows and activities under test
// ============================================================================

async fn answer_workflow(ctx: WorkflowContext) -> Outcome {
    let answer: i64 = ctx
        .execute_activity("Answer", Payloads::new(), ActivityOptions::new())
        .value()
        .await?;
    Payloads::encode(&answer)
}

async fn fan_out_workflow(ctx: WorkflowContext) -> Outcome {
    let pending: Vec<Promise> = ["A", "B", "C"]
        .iter()
        .map(|name| ctx.execute_activity(name, Payloads::new(), ActivityOptions::new()))
        .collect();
    let mut results = Vec::new();
    for promise in pending {
        results.push(promise.value::<String>().await?);
    }
    Payloads::encode(&results)
}

async fn cancel_scope_workflow(ctx: WorkflowContext) -> Outcome {
    let scope = ctx.new_scope(|ctx| async move {
        ctx.timer(Duration::from_secs(60)).await?;
        Payloads::encode(&"fired")
    });
    ctx.timer(Duration::from_secs(1)).await?;
    scope.cancel();
    scope.cancel();
    match scope.await {
        Err(err) if err.is_cancelled() => Payloads::encode(&"cancelled"),
        other => other,
    }
}

async fn nested_scope_workflow(ctx: WorkflowContext) -> Outcome {
    let inner = Rc::new(RefCell::new(None));
    let slot = inner.clone();
    let outer = ctx.new_scope(move |ctx| async move {
        let started = ctx.new_scope(|ctx| async move {
            ctx.timer(Duration::from_secs(60)).await?;
            Payloads::encode(&"fired")
        });
        *slot.borrow_mut() = Some(started);
        Ok(Payloads::new())
    });
    outer.promise().await?;
    outer.cancel();

    let inner = inner
        .borrow_mut()
        .take()
        .ok_or_else(|| WorkflowError::failure("inner scope was not started"))?;
    match inner.await {
        Err(err) if err.is_cancelled() => Payloads::encode(&"cancelled"),
        other => other,
    }
}

async fn sleepy_workflow(ctx: WorkflowContext) -> Outcome {
    ctx.timer(Duration::from_secs(3600)).await?;
    Payloads::encode(&"woke")
}

async fn late_handler_workflow(ctx: WorkflowContext) -> Outcome {
    ctx.timer(Duration::from_secs(1)).await?;

    let seen = Rc::new(RefCell::new(Vec::<String>::new()));
    let sink = seen.clone();
    ctx.register_signal_handler("s", move |_ctx: WorkflowContext, args: Payloads| {
        let sink = sink.clone();
        async move {
            sink.borrow_mut().push(args.decode(0)?);
            Ok(())
        }
    });

    let watched = seen.clone();
    ctx.await_condition(move || watched.borrow().len() == 2)
        .await?;
    let collected = seen.borrow().clone();
    Payloads::encode(&collected)
}

async fn status_workflow(ctx: WorkflowContext) -> Outcome {
    let status = Rc::new(RefCell::new("waiting".to_string()));
    let reader = status.clone();
    ctx.register_query_handler("status", move |_args| Payloads::encode(&*reader.borrow()));
    ctx.timer(Duration::from_secs(5)).await?;
    *status.borrow_mut() = "done".to_string();
    Payloads::encode(&"ok")
}

async fn answer_activity(_ctx: ActivityContext) -> Result<Payloads, ActivityError> {
    Ok(Payloads::encode(&42)?)
}

async fn rejecting_activity(_ctx: ActivityContext) -> Result<Payloads, ActivityError> {
    Err(ActivityError::non_retryable("card declined", "PaymentError"))
}

async fn panicking_activity(_ctx: ActivityContext) -> Result<Payloads, ActivityError> {
    panic!("activity blew up")
}

fn router() -> Router {
    let workflows = WorkflowRegistry::builder()
        .register("Answer", answer_workflow)
        .register("FanOut", fan_out_workflow)
        .register("CancelScope", cancel_scope_workflow)
        .register("NestedScope", nested_scope_workflow)
        .register("Sleepy", sleepy_workflow)
        .register("LateHandler", late_handler_workflow)
        .register("Status", status_workflow)
        .build();
    let activities = ActivityRegistry::builder()
        .register("Answer", answer_activity)
        .register("Reject", rejecting_activity)
        .register("Panic", panicking_activity)
        .build();
    Router::new(workflows, activities).with_task_queue("orders")
}

// ============================================================================
// Start and completion
// ============================================================================

#[tokio::test]
async fn test_activity_result_completes_workflow() {
    let mut router = router();

    let reply = router
        .dispatch(Batch::new(vec![start(1, "Answer", "run-1", vec![])]).with_context(tick(0)))
        .await;
    assert_eq!(
        response(&reply, 1),
        Message::success(1, vec![json!({"workflowId": "wf-run-1", "runId": "run-1"})])
    );
    let activity = &issued_named(&reply, commands::EXECUTE_ACTIVITY)[0];
    assert_eq!(activity.params["name"], "Answer");
    assert_eq!(activity.run_id.as_deref(), Some("run-1"));

    let reply = router
        .dispatch(
            Batch::new(vec![Message::success(activity.id, vec![json!(42)])])
                .with_context(tick(1)),
        )
        .await;
    let complete = issued_named(&reply, commands::COMPLETE_WORKFLOW);
    assert_eq!(complete.len(), 1);
    assert_eq!(complete[0].payloads, vec![json!(42)]);
    assert_eq!(complete[0].run_id.as_deref(), Some("run-1"));
    assert!(router.running().is_empty());
}

#[tokio::test]
async fn test_duplicate_start_is_protocol_violation() {
    let mut router = router();

    router
        .dispatch(Batch::new(vec![start(1, "Sleepy", "run-1", vec![])]))
        .await;
    let reply = router
        .dispatch(Batch::new(vec![start(2, "Sleepy", "run-1", vec![])]))
        .await;

    match response(&reply, 2) {
        Message::Failure(failure) => {
            assert_eq!(failure.error.error_code(), Some(ErrorCode::ProtocolViolation));
        }
        other => panic!("expected a failure, got {other:?}"),
    }
    assert!(issued(&reply).is_empty(), "no second run may issue commands");
    assert_eq!(router.running().len(), 1);
}

#[tokio::test]
async fn test_unregistered_workflow_type_is_rejected() {
    let mut router = router();
    let reply = router
        .dispatch(Batch::new(vec![start(1, "Missing", "run-1", vec![])]))
        .await;
    assert!(matches!(response(&reply, 1), Message::Failure(_)));
    assert!(router.running().is_empty());
}

#[tokio::test]
async fn test_unknown_command_is_protocol_violation() {
    let mut router = router();
    let reply = router
        .dispatch(Batch::new(vec![Message::Request(Request::new(7, "Bogus"))]))
        .await;
    match response(&reply, 7) {
        Message::Failure(failure) => {
            assert_eq!(failure.error.error_code(), Some(ErrorCode::ProtocolViolation));
        }
        other => panic!("expected a failure, got {other:?}"),
    }
}

// ============================================================================
// Correlation
// ============================================================================

/// Responses are matched by id, whatever order the host sends them in.
#[tokio::test]
async fn test_permuted_responses_resolve_matching_promises() {
    let permutations = [
        [0, 1, 2],
        [0, 2, 1],
        [1, 0, 2],
        [1, 2, 0],
        [2, 0, 1],
        [2, 1, 0],
    ];

    for order in permutations {
        let mut router = router();
        let reply = router
            .dispatch(Batch::new(vec![start(1, "FanOut", "run-1", vec![])]))
            .await;
        let activities = issued_named(&reply, commands::EXECUTE_ACTIVITY);
        assert_eq!(activities.len(), 3);

        let responses = order
            .iter()
            .map(|&index| {
                let request = &activities[index];
                let name = request.params["name"].as_str().unwrap();
                Message::success(request.id, vec![json!(format!("result-of-{name}"))])
            })
            .collect();
        let reply = router.dispatch(Batch::new(responses)).await;

        let complete = issued_named(&reply, commands::COMPLETE_WORKFLOW);
        assert_eq!(
            complete[0].payloads,
            vec![json!(["result-of-A", "result-of-B", "result-of-C"])],
            "order {order:?}"
        );
    }
}

/// A stray response neither fails the tick nor reaches a run.
#[tokio::test]
async fn test_response_for_unknown_id_is_ignored() {
    let mut router = router();
    router
        .dispatch(Batch::new(vec![start(1, "Sleepy", "run-1", vec![])]))
        .await;
    let reply = router
        .dispatch(Batch::new(vec![Message::success(999, vec![json!(1)])]))
        .await;
    assert!(reply.messages.is_empty());
    assert!(router.running().is_running("run-1"));
}

// ============================================================================
// Cancellation
// ============================================================================

/// A second cancel of the same scope emits nothing.
#[tokio::test]
async fn test_scope_cancel_is_idempotent() {
    let mut router = router();
    let reply = router
        .dispatch(Batch::new(vec![start(1, "CancelScope", "run-1", vec![])]))
        .await;
    let long = timer_with_ms(&reply, 60_000);
    let short = timer_with_ms(&reply, 1_000);

    let reply = router
        .dispatch(Batch::new(vec![Message::success(short.id, vec![])]))
        .await;

    let cancels = issued_named(&reply, commands::CANCEL);
    assert_eq!(cancels.len(), 1, "a second cancel must not emit anything");
    assert_eq!(cancels[0].params["ids"], json!([long.id]));

    let complete = issued_named(&reply, commands::COMPLETE_WORKFLOW);
    assert_eq!(complete[0].payloads, vec![json!("cancelled")]);
}

/// Cancelling a scope whose body returned reaches the scope it left running.
#[tokio::test]
async fn test_cancel_reaches_scope_started_by_finished_body() {
    let mut router = router();
    let reply = router
        .dispatch(Batch::new(vec![start(1, "NestedScope", "run-1", vec![])]))
        .await;

    let timer = timer_with_ms(&reply, 60_000);
    let cancels = issued_named(&reply, commands::CANCEL);
    assert_eq!(cancels.len(), 1);
    assert_eq!(cancels[0].params["ids"], json!([timer.id]));

    let complete = issued_named(&reply, commands::COMPLETE_WORKFLOW);
    assert_eq!(complete[0].payloads, vec![json!("cancelled")]);
}

#[tokio::test]
async fn test_cancel_workflow_fails_pending_timer() {
    let mut router = router();
    let reply = router
        .dispatch(Batch::new(vec![start(1, "Sleepy", "run-1", vec![])]))
        .await;
    let timer = timer_with_ms(&reply, 3_600_000);

    let reply = router
        .dispatch(Batch::new(vec![run_request(
            2,
            commands::CANCEL_WORKFLOW,
            "run-1",
            "",
            vec![],
        )]))
        .await;

    assert_eq!(response(&reply, 2), Message::success(2, vec![]));
    let cancels = issued_named(&reply, commands::CANCEL);
    assert_eq!(cancels.len(), 1);
    assert_eq!(cancels[0].params["ids"], json!([timer.id]));

    let complete = issued_named(&reply, commands::COMPLETE_WORKFLOW);
    assert_eq!(complete.len(), 1);
    assert_eq!(
        complete[0].params["failure"]["code"],
        json!(ErrorCode::Cancelled.code())
    );
    assert!(router.running().is_empty());
}

#[tokio::test]
async fn test_destroy_drops_run_without_terminal_command() {
    let mut router = router();
    router
        .dispatch(Batch::new(vec![start(1, "Sleepy", "run-1", vec![])]))
        .await;

    let reply = router
        .dispatch(Batch::new(vec![run_request(
            2,
            commands::DESTROY_WORKFLOW,
            "run-1",
            "",
            vec![],
        )]))
        .await;
    assert_eq!(reply.messages, vec![Message::success(2, vec![])]);
    assert!(router.running().is_empty());
}

// ============================================================================
// Signals and queries
// ============================================================================

/// Signals sent before the handler exists are delivered in arrival order.
#[tokio::test]
async fn test_buffered_signals_replay_in_arrival_order() {
    let mut router = router();
    let reply = router
        .dispatch(Batch::new(vec![start(1, "LateHandler", "run-1", vec![])]))
        .await;
    let timer = timer_with_ms(&reply, 1_000);

    let reply = router
        .dispatch(Batch::new(vec![
            run_request(2, commands::INVOKE_SIGNAL, "run-1", "s", vec![json!("foo")]),
            run_request(3, commands::INVOKE_SIGNAL, "run-1", "s", vec![json!("bar")]),
            Message::success(timer.id, vec![]),
        ]))
        .await;

    assert_eq!(response(&reply, 2), Message::success(2, vec![]));
    assert_eq!(response(&reply, 3), Message::success(3, vec![]));
    let complete = issued_named(&reply, commands::COMPLETE_WORKFLOW);
    assert_eq!(complete[0].payloads, vec![json!(["foo", "bar"])]);
}

#[tokio::test]
async fn test_signal_for_unknown_run_fails() {
    let mut router = router();
    let reply = router
        .dispatch(Batch::new(vec![run_request(
            1,
            commands::INVOKE_SIGNAL,
            "nope",
            "s",
            vec![],
        )]))
        .await;
    assert!(matches!(response(&reply, 1), Message::Failure(_)));
}

/// Queries see the state after this tick's responses were applied.
#[tokio::test]
async fn test_query_reads_state_after_drive() {
    let mut router = router();
    let reply = router
        .dispatch(Batch::new(vec![start(1, "Status", "run-1", vec![])]))
        .await;
    let timer = timer_with_ms(&reply, 5_000);

    let reply = router
        .dispatch(Batch::new(vec![run_request(
            2,
            commands::INVOKE_QUERY,
            "run-1",
            "status",
            vec![],
        )]))
        .await;
    assert_eq!(response(&reply, 2), Message::success(2, vec![json!("waiting")]));

    // Queries are answered after the tick's responses are applied
    let reply = router
        .dispatch(Batch::new(vec![
            Message::success(timer.id, vec![]),
            run_request(3, commands::INVOKE_QUERY, "run-1", "missing", vec![]),
        ]))
        .await;
    assert!(matches!(response(&reply, 3), Message::Failure(_)));
    assert_eq!(issued_named(&reply, commands::COMPLETE_WORKFLOW).len(), 1);
}

// ============================================================================
// Activities and worker info
// ============================================================================

fn invoke_activity(id: CommandId, activity_type: &str) -> Message {
    let mut request = Request::new(id, commands::INVOKE_ACTIVITY);
    request.params.insert(
        "info".to_string(),
        json!({
            "activityId": format!("act-{id}"),
            "activityType": activity_type,
            "taskToken": "dG9rZW4=",
        }),
    );
    Message::Request(request)
}

/// Concurrent activities still answer in request order.
#[tokio::test]
async fn test_activities_answer_in_request_order() {
    let mut router = router();
    let reply = router
        .dispatch(Batch::new(vec![
            invoke_activity(1, "Answer"),
            invoke_activity(2, "Reject"),
            invoke_activity(3, "Panic"),
            invoke_activity(4, "Missing"),
        ]))
        .await;

    let ids: Vec<CommandId> = reply.messages.iter().map(Message::id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);
    assert_eq!(reply.messages[0], Message::success(1, vec![json!(42)]));

    match &reply.messages[1] {
        Message::Failure(failure) => {
            assert_eq!(failure.error.message, "card declined");
            assert_eq!(failure.error.data["type"], "PaymentError");
            assert_eq!(failure.error.data["nonRetryable"], true);
        }
        other => panic!("expected a failure, got {other:?}"),
    }
    match &reply.messages[2] {
        Message::Failure(failure) => assert!(failure.error.message.contains("activity blew up")),
        other => panic!("expected a failure, got {other:?}"),
    }
    match &reply.messages[3] {
        Message::Failure(failure) => {
            assert_eq!(failure.error.error_code(), Some(ErrorCode::ProtocolViolation));
        }
        other => panic!("expected a failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_get_worker_info() {
    let mut router = router();
    let reply = router
        .dispatch(Batch::new(vec![Message::Request(Request::new(
            1,
            commands::GET_WORKER_INFO,
        ))]))
        .await;

    let Message::Success(success) = &reply.messages[0] else {
        panic!("expected a success");
    };
    assert_eq!(success.result[0]["taskQueue"], "orders");
    assert_eq!(success.result[0]["activities"], json!(["Answer", "Panic", "Reject"]));
    assert_eq!(
        success.result[0]["workflows"],
        json!(["Answer", "CancelScope", "FanOut", "LateHandler", "Sleepy", "Status"])
    );
}
