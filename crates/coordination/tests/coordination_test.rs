//! Concurrency properties and end-to-end scenarios on the in-memory store
//!
//! Run with: cargo test -p convoy-coordination --test coordination_test

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::{json, Value};
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

use convoy_coordination::advisor::{
    CanaryOrchestration, Decision, ExecutionContext, ExecutionEvent, ExecutionStatus,
    FailureStrategy, InMemoryWorkflowLookup, OrchestrationWorkflow, PhaseNode, RepairActionCode,
    RollbackAdvisor, StateNode, Workflow, WorkflowExecution, WorkflowPhase, WorkflowType,
};
use convoy_coordination::constraint::{AcquireRequest, Actor, ConstraintEngine, Holder};
use convoy_coordination::persistence::{
    BarrierParticipant, ConstraintStrategy, CoordinationStore, HoldingScope,
    InMemoryCoordinationStore, InstanceState,
};
use convoy_coordination::reliability::{PollConfig, RetryPolicy};
use convoy_coordination::{
    BarrierCoordinator, CoordinationConfig, CoordinationError, IdempotencyManager, Reaper,
};

/// Fast polling and generous conflict retries for contended tests
fn contended_config() -> CoordinationConfig {
    CoordinationConfig::default()
        .with_conflict_retry(
            RetryPolicy::default()
                .with_max_retries(1_000)
                .with_initial_interval(Duration::from_millis(1))
                .with_max_interval(Duration::from_millis(5)),
        )
        .with_wait(
            PollConfig::new()
                .with_min_interval(Duration::from_millis(1))
                .with_max_interval(Duration::from_millis(10))
                .with_max_wait(Duration::from_secs(30)),
        )
}

fn setup(config: CoordinationConfig) -> (ConstraintEngine, Arc<InMemoryCoordinationStore>) {
    let store = Arc::new(InMemoryCoordinationStore::new());
    (ConstraintEngine::new(store.clone(), config), store)
}

async fn active_permits(store: &InMemoryCoordinationStore, constraint_id: uuid::Uuid) -> u32 {
    store
        .list_instances(constraint_id, Some("db-1"), &[InstanceState::Active])
        .await
        .unwrap()
        .iter()
        .map(|i| i.permits)
        .sum()
}

// ============================================
// Resource constraint properties
// ============================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_capacity_never_exceeded_under_contention() {
    let (engine, store) = setup(contended_config());
    let constraint = engine
        .create_constraint(&Actor::new("ops"), "acct", "db", 3, ConstraintStrategy::Asap)
        .await
        .unwrap();

    let tasks = (0..40).map(|n| {
        let engine = engine.clone();
        let store = store.clone();
        tokio::spawn(async move {
            let request = AcquireRequest::new("db-1", Holder::workflow(format!("w{n}")))
                .with_permits(1 + (n % 2) as u32);
            let result = engine.acquire(constraint.id, request).await.unwrap();
            if !result.granted {
                engine
                    .wait_for_grant(result.instance_id, &CancellationToken::new())
                    .await
                    .unwrap();
            }

            let in_use = active_permits(&store, constraint.id).await;
            tokio::time::sleep(Duration::from_millis(2)).await;
            engine.release(result.instance_id).await.unwrap();
            in_use
        })
    });

    for observed in join_all(tasks).await {
        assert!(observed.unwrap() <= 3);
    }
    assert_eq!(active_permits(&store, constraint.id).await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fifo_grants_in_queue_order() {
    let (engine, _) = setup(contended_config());
    let constraint = engine
        .create_constraint(&Actor::new("ops"), "acct", "db", 1, ConstraintStrategy::Fifo)
        .await
        .unwrap();
    let granted = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let tasks = (0..20).map(|n| {
        let engine = engine.clone();
        let granted = granted.clone();
        tokio::spawn(async move {
            let request = AcquireRequest::new("db-1", Holder::workflow(format!("w{n}")));
            let result = engine.acquire(constraint.id, request).await.unwrap();
            if !result.granted {
                engine
                    .wait_for_grant(result.instance_id, &CancellationToken::new())
                    .await
                    .unwrap();
            }
            granted.lock().push(result.order);
            tokio::time::sleep(Duration::from_millis(1)).await;
            engine.release(result.instance_id).await.unwrap();
        })
    });
    for task in join_all(tasks).await {
        task.unwrap();
    }

    let granted = granted.lock().clone();
    assert_eq!(granted.len(), 20);
    assert!(granted.windows(2).all(|w| w[0] < w[1]), "out of order: {granted:?}");
}

#[tokio::test]
async fn test_fifo_head_blocks_smaller_requests() {
    let (engine, _) = setup(CoordinationConfig::default());
    let constraint = engine
        .create_constraint(&Actor::new("ops"), "acct", "db", 2, ConstraintStrategy::Fifo)
        .await
        .unwrap();

    let holder = engine
        .acquire(constraint.id, AcquireRequest::new("db-1", Holder::workflow("w1")))
        .await
        .unwrap();
    let big = engine
        .acquire(
            constraint.id,
            AcquireRequest::new("db-1", Holder::workflow("w2")).with_permits(2),
        )
        .await
        .unwrap();
    let small = engine
        .acquire(constraint.id, AcquireRequest::new("db-1", Holder::workflow("w3")))
        .await
        .unwrap();

    assert!(holder.granted);
    assert!(!big.granted);
    assert!(!small.granted);

    engine.release(holder.instance_id).await.unwrap();
    assert!(engine.poll(big.instance_id).await.unwrap().granted);
    assert!(!engine.poll(small.instance_id).await.unwrap().granted);
}

#[tokio::test]
async fn test_scenario_capacity_one_handover() {
    let (engine, _) = setup(CoordinationConfig::default());
    let constraint = engine
        .create_constraint(&Actor::new("ops"), "acct", "prod-db", 1, ConstraintStrategy::Fifo)
        .await
        .unwrap();

    let first = engine
        .acquire(constraint.id, AcquireRequest::new("db-1", Holder::workflow("w1")))
        .await
        .unwrap();
    let second = engine
        .acquire(constraint.id, AcquireRequest::new("db-1", Holder::workflow("w2")))
        .await
        .unwrap();
    assert!(first.granted);
    assert!(!second.granted);

    assert_ok!(engine.release(first.instance_id).await);

    let second = assert_ok!(engine.instance(second.instance_id).await);
    assert_eq!(second.state, InstanceState::Active);
    assert!(second.acquired_at.is_some());
    let usage = engine.usage(constraint.id).await.unwrap();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].release_entity_id, "w2");
}

#[tokio::test]
async fn test_release_entity_frees_all_units() {
    let (engine, _) = setup(CoordinationConfig::default());
    let constraint = engine
        .create_constraint(&Actor::new("ops"), "acct", "hosts", 1, ConstraintStrategy::Fifo)
        .await
        .unwrap();

    for unit in ["host-a", "host-b"] {
        let result = engine
            .acquire(
                constraint.id,
                AcquireRequest::new(unit, Holder::pipeline("pipe-1")),
            )
            .await
            .unwrap();
        assert!(result.granted);
    }
    let waiter = engine
        .acquire(constraint.id, AcquireRequest::new("host-a", Holder::workflow("w9")))
        .await
        .unwrap();
    assert!(!waiter.granted);

    let released = engine
        .release_entity(HoldingScope::Pipeline, "pipe-1")
        .await
        .unwrap();
    assert_eq!(released, 2);
    assert!(engine.poll(waiter.instance_id).await.unwrap().granted);
}

#[tokio::test]
async fn test_reaper_hands_expired_capacity_to_waiter() {
    let (engine, store) = setup(CoordinationConfig::default());
    let constraint = engine
        .create_constraint(&Actor::new("ops"), "acct", "db", 1, ConstraintStrategy::Fifo)
        .await
        .unwrap();

    let orphan = engine
        .acquire(constraint.id, AcquireRequest::new("db-1", Holder::workflow("crashed")))
        .await
        .unwrap();
    let waiter = engine
        .acquire(constraint.id, AcquireRequest::new("db-1", Holder::workflow("w2")))
        .await
        .unwrap();
    store.set_instance_valid_until(
        orphan.instance_id,
        chrono::Utc::now() - chrono::Duration::seconds(1),
    );

    let report = Reaper::new(store.clone(), Duration::from_secs(60))
        .sweep_once()
        .await
        .unwrap();
    assert_eq!(report.expired_instances, 1);
    assert!(engine.poll(waiter.instance_id).await.unwrap().granted);
    assert!(matches!(
        engine.poll(orphan.instance_id).await,
        Err(CoordinationError::InstanceExpired(_))
    ));
}

// ============================================
// Barrier properties
// ============================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_check_ins_bring_barrier_down_once() {
    let store = Arc::new(InMemoryCoordinationStore::new());
    let barriers = BarrierCoordinator::new(store, contended_config());
    let participants = (0..16)
        .map(|n| BarrierParticipant::new(format!("w{n}")))
        .collect();
    barriers
        .declare("app", "join", "exec-1", participants)
        .await
        .unwrap();

    let waiter = {
        let barriers = barriers.clone();
        tokio::spawn(async move {
            barriers
                .await_down("join", "exec-1", &CancellationToken::new())
                .await
        })
    };

    let arrivals = (0..16).map(|n| {
        let barriers = barriers.clone();
        tokio::spawn(async move { barriers.check_in("join", "exec-1", &format!("w{n}")).await })
    });
    let downs = join_all(arrivals)
        .await
        .into_iter()
        .filter(|r| *r.as_ref().unwrap().as_ref().unwrap())
        .count();
    assert_eq!(downs, 1);

    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    // Late and repeated arrivals leave it down
    assert!(barriers.check_in("join", "exec-1", "w0").await.unwrap());
}

#[tokio::test]
async fn test_scenario_barrier_two_workflows() {
    let store = Arc::new(InMemoryCoordinationStore::new());
    let barriers = BarrierCoordinator::new(store, CoordinationConfig::default());
    barriers
        .declare(
            "app",
            "deploy-join",
            "exec-7",
            vec![BarrierParticipant::new("W1"), BarrierParticipant::new("W2")],
        )
        .await
        .unwrap();

    assert!(!barriers.check_in("deploy-join", "exec-7", "W1").await.unwrap());
    assert!(barriers.check_in("deploy-join", "exec-7", "W2").await.unwrap());
}

// ============================================
// Idempotency properties
// ============================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_runs_execute_once() {
    let store = Arc::new(InMemoryCoordinationStore::new());
    let idem = IdempotencyManager::new(store, contended_config());
    let calls = Arc::new(AtomicUsize::new(0));

    let tasks = (0..12).map(|_| {
        let idem = idem.clone();
        let calls = calls.clone();
        tokio::spawn(async move {
            idem.run("artifact-push-42", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, CoordinationError>(vec![json!({"digest": "sha256:abc"})])
            })
            .await
        })
    });

    let results: Vec<Vec<Value>> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(results
        .iter()
        .all(|r| r == &vec![json!({"digest": "sha256:abc"})]));
}

// ============================================
// Rollback advisor scenario
// ============================================

#[test_log::test(tokio::test)]
async fn test_canary_rollback_walks_back_to_failure() {
    let mut canary = CanaryOrchestration::default()
        .with_failure_strategy(FailureStrategy::new(RepairActionCode::RollbackWorkflow));
    for n in 1..=3 {
        let forward = WorkflowPhase::forward(format!("p{n}"), format!("Phase {n}"));
        let rollback =
            WorkflowPhase::rollback_of(format!("rb{n}"), format!("Rollback Phase {n}"), &forward);
        canary = canary.with_phase(forward, Some(rollback));
    }

    let lookup = InMemoryWorkflowLookup::new();
    lookup.insert_execution(WorkflowExecution {
        id: "exec-1".into(),
        app_id: "app".into(),
        workflow_id: "wf".into(),
        workflow_type: WorkflowType::Orchestration,
    });
    lookup.insert_workflow(Workflow {
        id: "wf".into(),
        app_id: "app".into(),
        name: "canary".into(),
        orchestration: Some(OrchestrationWorkflow::Canary(canary)),
    });
    let advisor = RollbackAdvisor::new(Arc::new(lookup));

    let event = |node: PhaseNode, status| ExecutionEvent {
        context: ExecutionContext {
            app_id: "app".into(),
            workflow_execution_id: "exec-1".into(),
        },
        state: StateNode::Phase(node),
        status,
        failure_types: vec![],
        retry_count: 0,
    };
    let rollback_node = |n: u32| PhaseNode {
        id: format!("rb{n}"),
        name: format!("Rollback Phase {n}"),
        rollback: true,
        phase_name_for_rollback: Some(format!("Phase {n}")),
    };

    let failed = PhaseNode {
        id: "p3".into(),
        name: "Phase 3".into(),
        rollback: false,
        phase_name_for_rollback: None,
    };
    let mut decisions = vec![advisor.advise(&event(failed, ExecutionStatus::Failed)).await];
    for n in (1..=3).rev() {
        decisions.push(
            advisor
                .advise(&event(rollback_node(n), ExecutionStatus::Success))
                .await,
        );
    }

    assert_eq!(
        decisions,
        vec![
            Decision::transition_to("Rollback Phase 3"),
            Decision::transition_to("Rollback Phase 2"),
            Decision::transition_to("Rollback Phase 1"),
            Decision::MarkFailed,
        ]
    );
}
