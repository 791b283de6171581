//! Ticket lifecycle integration tests.
//!
//! These tests drive a ticket through every flow type:
//! approval -> pause -> resource apply -> inner pipeline -> delivery

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use dbflow_core::{
    external::ApprovalStatus,
    manager::ManagerError,
    pipeline::{ActivityOutcome, ActivityStep, NodeKind, NodeStatus},
    testing::{fixtures, ScriptedActivity, TestStack},
    todo::{TodoAction, TodoError, TodoStatus, TodoType},
    FlowTemplate, FlowType, TicketStatus, TicketTypeDefinition, TicketTypeRegistry,
};

/// Test helper wiring the full five-flow ticket type.
struct TestHarness {
    stack: TestStack,
    prepare: Arc<ScriptedActivity>,
    install: Arc<ScriptedActivity>,
    verify: Arc<ScriptedActivity>,
}

impl TestHarness {
    fn new() -> Self {
        let prepare = Arc::new(
            ScriptedActivity::new("prepare")
                .with_outcomes(vec![Ok(ActivityOutcome::success_with(
                    "package",
                    json!("mysql-8.0.36"),
                ))]),
        );
        let install = Arc::new(ScriptedActivity::new("install").mutating());
        let verify = Arc::new(ScriptedActivity::new("verify").with_delay(Duration::from_millis(5)));

        let registry = TicketTypeRegistry::new()
            .register(
                TicketTypeDefinition::new("cluster_apply")
                    .describe("Provision hosts and install a cluster")
                    .flow(FlowTemplate::new(FlowType::Approval, "leader approval"))
                    .flow(
                        FlowTemplate::new(FlowType::Pause, "ops confirmation")
                            .with_details(json!({"operators": ["alice"]})),
                    )
                    .flow(FlowTemplate::new(FlowType::ResourceApply, "apply hosts"))
                    .flow(FlowTemplate::new(FlowType::Inner, "install cluster"))
                    .flow(FlowTemplate::new(FlowType::Delivery, "deliver"))
                    .with_pipeline(|builder| {
                        let cluster = builder.context().details["cluster_id"].clone();
                        builder
                            .add_step(
                                ActivityStep::new("prepare", "prepare", json!({}))
                                    .reads(["hosts"])
                                    .writes(["package"]),
                            )
                            .add_step(
                                ActivityStep::new(
                                    "install",
                                    "install",
                                    json!({"cluster_id": cluster}),
                                )
                                .reads(["hosts", "package"]),
                            )
                            .add_parallel_activities(vec![
                                ActivityStep::new("verify-read", "verify", json!({"check": "read"})),
                                ActivityStep::new("verify-write", "verify", json!({"check": "write"})),
                                ActivityStep::new("verify-repl", "verify", json!({"check": "repl"})),
                            ])
                            .build()
                    }),
            )
            .expect("Failed to register ticket type");

        let stack = TestStack::builder()
            .registry(registry)
            .activity(prepare.clone())
            .activity(install.clone())
            .activity(verify.clone())
            .build();

        Self {
            stack,
            prepare,
            install,
            verify,
        }
    }

    /// Wait for the ticket's approval to be created and return its id.
    async fn approval_id(&self) -> String {
        let deadline = tokio::time::Instant::now() + fixtures::WAIT_TIMEOUT;
        loop {
            if let Some((id, _)) = self.stack.approval.created().await.into_iter().next() {
                return id;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("approval was never requested");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[tokio::test]
async fn test_full_lifecycle_with_resource_shortage() {
    let harness = TestHarness::new();
    let manager = &harness.stack.manager;
    harness.stack.resources.push_shortage("no hosts in zone a").await;
    manager.start().await;

    let ticket = manager
        .submit_ticket(fixtures::submit_request(
            "cluster_apply",
            "bob",
            json!({"cluster_id": "c-1", "version": "8.0"}),
        ))
        .await
        .expect("Failed to submit ticket");
    assert_eq!(ticket.status, TicketStatus::Pending);

    // Approval
    fixtures::wait_for_status(manager, &ticket.id, TicketStatus::Running).await;
    let approval_id = harness.approval_id().await;
    harness
        .stack
        .approval
        .decide(&approval_id, ApprovalStatus::finished(true))
        .await;

    // Pause: only alice may confirm
    let d1 = fixtures::wait_for_open_todo(manager, &ticket.id).await;
    assert_eq!(d1.todo_type, TodoType::Approve);
    assert_eq!(d1.operators, vec!["alice"]);

    let err = manager
        .resolve_todo(&d1.id, "bob", TodoAction::Approve, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::Todo(TodoError::WrongOperator { .. })));

    let d1 = manager
        .resolve_todo(&d1.id, "alice", TodoAction::Approve, None)
        .await
        .expect("alice should be able to confirm");
    assert_eq!(d1.status, TodoStatus::Done);
    assert_eq!(d1.resolved_by.as_deref(), Some("alice"));

    // Resource shortage opens a second todo
    let d2 = fixtures::wait_for_open_todo(manager, &ticket.id).await;
    assert_ne!(d2.id, d1.id);
    assert_eq!(d2.todo_type, TodoType::ResourceReplenish);
    let view = manager.get_ticket_status(&ticket.id).unwrap();
    let active = view.active_flow.expect("resource flow should be active");
    assert_eq!(active.flow_type, FlowType::ResourceApply);
    assert_eq!(active.status, TicketStatus::Running);
    assert_eq!(view.overall_status, TicketStatus::Running);

    manager
        .resolve_todo(&d2.id, "bob", TodoAction::ResourceReapply, None)
        .await
        .expect("Failed to reapply resources");

    // Pipeline and delivery
    fixtures::wait_for_status(manager, &ticket.id, TicketStatus::Succeeded).await;

    let view = manager.get_ticket_status(&ticket.id).unwrap();
    let types: Vec<FlowType> = view.flows.iter().map(|f| f.flow_type).collect();
    assert_eq!(
        types,
        vec![
            FlowType::Approval,
            FlowType::Pause,
            FlowType::ResourceApply,
            FlowType::Inner,
            FlowType::Delivery,
        ]
    );
    assert!(view.flows.iter().all(|f| f.status == TicketStatus::Succeeded));
    assert!(view.open_todos.is_empty());
    assert!(view.failing_node.is_none());
    assert_eq!(harness.stack.resources.requests().await.len(), 2);

    // Sequential nodes saw the outputs of earlier nodes
    assert_eq!(harness.prepare.call_count(), 1);
    assert_eq!(harness.prepare.calls()[0].inputs["hosts"], json!(["10.0.0.1"]));
    let install_call = &harness.install.calls()[0];
    assert_eq!(install_call.inputs["package"], json!("mysql-8.0.36"));
    assert_eq!(install_call.params["cluster_id"], json!("c-1"));
    assert_eq!(harness.verify.call_count(), 3);

    let pipeline_id = view.flows[3]
        .flow_obj_id
        .clone()
        .expect("inner flow should record its pipeline");
    let nodes = manager.engine().nodes(&pipeline_id).unwrap();
    assert!(nodes.iter().all(|n| n.status == NodeStatus::Succeeded));
    assert_eq!(
        nodes.iter().filter(|n| n.kind == NodeKind::Parallel).count(),
        1
    );
    assert_eq!(harness.stack.mutex.locked_clusters(), 0);

    manager.stop().await;
}

#[tokio::test]
async fn test_failed_node_is_reported_and_retried() {
    let harness = TestHarness::new();
    let manager = &harness.stack.manager;
    harness
        .stack
        .approval
        .set_default_status(ApprovalStatus::finished(true))
        .await;
    harness
        .install
        .push_outcome(Ok(ActivityOutcome::failed("package checksum mismatch")));
    manager.start().await;

    let ticket = manager
        .submit_ticket(fixtures::submit_request(
            "cluster_apply",
            "bob",
            json!({"cluster_id": "c-2"}),
        ))
        .await
        .unwrap();

    let d1 = fixtures::wait_for_open_todo(manager, &ticket.id).await;
    manager
        .resolve_todo(&d1.id, "alice", TodoAction::Approve, None)
        .await
        .unwrap();

    fixtures::wait_for_status(manager, &ticket.id, TicketStatus::Failed).await;
    let view = manager.get_ticket_status(&ticket.id).unwrap();
    let failing = view.failing_node.expect("failing node should be reported");
    assert_eq!(failing.name, "install");
    assert_eq!(failing.error.as_deref(), Some("package checksum mismatch"));
    assert_eq!(
        view.active_flow.and_then(|f| f.message).as_deref(),
        Some("node install failed: package checksum mismatch")
    );
    assert_eq!(harness.verify.call_count(), 0);
    assert_eq!(harness.stack.mutex.locked_clusters(), 0);

    let retried = manager.retry_node(&failing.node_id, "alice").await.unwrap();
    assert!(retried >= 1);

    fixtures::wait_for_status(manager, &ticket.id, TicketStatus::Succeeded).await;
    let node = manager.engine().node(&failing.node_id).unwrap();
    assert_eq!(node.status, NodeStatus::Succeeded);
    assert!(node.version > failing.version);
    assert_eq!(harness.install.call_count(), 2);
    assert_eq!(harness.verify.call_count(), 3);

    manager.stop().await;
}

#[tokio::test]
async fn test_terminate_from_pause_closes_todo() {
    let harness = TestHarness::new();
    let manager = &harness.stack.manager;
    harness
        .stack
        .approval
        .set_default_status(ApprovalStatus::finished(true))
        .await;
    manager.start().await;

    let ticket = manager
        .submit_ticket(fixtures::submit_request(
            "cluster_apply",
            "bob",
            json!({"cluster_id": "c-3"}),
        ))
        .await
        .unwrap();

    let d1 = fixtures::wait_for_open_todo(manager, &ticket.id).await;
    let terminated = manager
        .terminate_ticket(&ticket.id, "alice")
        .await
        .expect("Failed to terminate ticket");
    assert_eq!(terminated.status, TicketStatus::Terminated);

    let view = manager.get_ticket_status(&ticket.id).unwrap();
    assert!(view.open_todos.is_empty());
    assert_eq!(view.flows[1].status, TicketStatus::Terminated);
    assert!(view.flows[2..]
        .iter()
        .all(|f| f.status == TicketStatus::Pending));

    let err = manager
        .resolve_todo(&d1.id, "alice", TodoAction::Approve, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::Todo(TodoError::AlreadyResolved { .. })));

    let err = manager.retry_flow(&ticket.id, "alice").await.unwrap_err();
    assert!(matches!(err, ManagerError::InvalidState { .. }));
    assert!(harness.stack.resources.requests().await.is_empty());

    manager.stop().await;
}

#[tokio::test]
async fn test_rejected_approval_can_be_retried() {
    let harness = TestHarness::new();
    let manager = &harness.stack.manager;
    harness
        .stack
        .approval
        .set_default_status(ApprovalStatus::finished(false))
        .await;
    manager.start().await;

    let ticket = manager
        .submit_ticket(fixtures::submit_request(
            "cluster_apply",
            "bob",
            json!({"cluster_id": "c-4"}),
        ))
        .await
        .unwrap();

    fixtures::wait_for_status(manager, &ticket.id, TicketStatus::Failed).await;
    let view = manager.get_ticket_status(&ticket.id).unwrap();
    let active = view.active_flow.unwrap();
    assert_eq!(active.flow_type, FlowType::Approval);
    assert_eq!(active.message.as_deref(), Some("approval rejected"));

    harness
        .stack
        .approval
        .set_default_status(ApprovalStatus::finished(true))
        .await;
    manager.retry_flow(&ticket.id, "bob").await.unwrap();

    let d1 = fixtures::wait_for_open_todo(manager, &ticket.id).await;
    assert_eq!(d1.todo_type, TodoType::Approve);
    assert_eq!(harness.stack.approval.created().await.len(), 2);

    manager.stop().await;
}
