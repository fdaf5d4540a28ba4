use anyhow::anyhow;
use async_trait::async_trait;
use common::{
    init_structured_logging, BackoffConfig, CoordinatorConfig, LoggingConfig, RejectionReason,
};
use mockall::{mock, Sequence};
use orchestrator::{provider_fn, CapabilityProvider, Coordinator, PhaseInput};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tandem_core::{
    AgentDescriptor, Event, EventHandler, MemoryTier, Phase, PhaseStatus, RoleId, TaskRequest,
    Topics, WorkflowStatus,
};
use tokio::sync::{Notify, Semaphore};

mock! {
    pub Agent {}

    #[async_trait]
    impl CapabilityProvider for Agent {
        async fn invoke(&self, role: &RoleId, input: PhaseInput) -> anyhow::Result<Value>;
    }
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    fn topics(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.topic.clone()).collect()
    }

    fn with_topic(&self, topic: &str) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.topic == topic)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventHandler for Recorder {
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        self.events.lock().push(event);
        Ok(())
    }

    fn name(&self) -> String {
        "recorder".to_string()
    }
}

fn test_config() -> CoordinatorConfig {
    // Only the first test to get here installs the subscriber
    let _ = init_structured_logging(LoggingConfig {
        color_output: false,
        ..LoggingConfig::default()
    });
    CoordinatorConfig {
        max_retries: 3,
        default_phase_timeout_ms: 2_000,
        backoff: BackoffConfig::immediate(),
        ..CoordinatorConfig::default()
    }
}

/// Strategist plans and reviews, builder implements from the plan
fn coordinator_with_agents(config: CoordinatorConfig) -> Coordinator {
    let coordinator = Coordinator::new(config).unwrap();
    coordinator
        .register_agent(
            AgentDescriptor::strategist(["plan", "review"]),
            provider_fn(|_, input: PhaseInput| async move {
                Ok(json!({ "steps": ["parse args", "print"], "goal": input.input["goal"] }))
            }),
        )
        .unwrap();
    coordinator
        .register_agent(
            AgentDescriptor::builder(["implement"]),
            provider_fn(|_, input: PhaseInput| async move {
                let steps = input.prior("plan").map(|p| p["steps"].clone());
                Ok(json!({ "implemented": steps }))
            }),
        )
        .unwrap();
    coordinator
}

fn plan_then_implement() -> TaskRequest {
    TaskRequest::new(vec![
        Phase::new("plan", "plan", json!({ "goal": "cli" })),
        Phase::new("implement", "implement", json!({})),
    ])
}

#[tokio::test]
async fn test_two_phase_workflow_hands_off_between_roles() {
    let coordinator = coordinator_with_agents(test_config());
    let recorder = Arc::new(Recorder::default());
    coordinator.bus().subscribe("workflow.*", recorder.clone());

    let handle = coordinator.submit_task(plan_then_implement()).unwrap();
    let finished = handle.wait().await;

    assert_eq!(finished.status, WorkflowStatus::Completed);
    assert_eq!(finished.phases[0].assigned_role, Some("strategist".into()));
    assert_eq!(finished.phases[1].assigned_role, Some("builder".into()));
    assert_eq!(
        finished.context["implement"],
        json!({ "implemented": ["parse args", "print"] })
    );

    assert!(coordinator.flush(Duration::from_secs(2)).await);
    assert_eq!(
        recorder.topics(),
        vec![Topics::WORKFLOW_STARTED, Topics::WORKFLOW_COMPLETED]
    );
    let completed = &recorder.with_topic(Topics::WORKFLOW_COMPLETED)[0];
    assert_eq!(completed.correlation_id, Some(handle.id()));
    assert_eq!(completed.payload["context"]["plan"]["goal"], json!("cli"));
    assert!(completed.payload["context"].get("implement").is_some());

    // Cross-agent history lands in the episodic tier
    let session = handle.id().to_string();
    let episodes = coordinator.memory().episodes(&session, ..);
    assert_eq!(episodes.len(), 2);
    assert_eq!(episodes[0].value["role"], json!("strategist"));
    assert_eq!(episodes[1].value["phase_id"], json!("implement"));
    let first = coordinator
        .memory()
        .get(MemoryTier::Episodic, &format!("{}#0", session))
        .unwrap();
    assert_eq!(first["capability"], json!("plan"));

    let metrics = coordinator.metrics();
    assert_eq!(metrics.workflows_completed, 1);
    assert_eq!(metrics.handoffs.get("strategist->builder"), Some(&1));
    assert_eq!(metrics.role("builder").unwrap().phases_succeeded, 1);
    assert_eq!(
        metrics.workflow(handle.id()).unwrap().status,
        WorkflowStatus::Completed
    );

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_missing_capability_is_rejected_without_a_workflow() {
    let coordinator = coordinator_with_agents(test_config());
    let request = TaskRequest::new(vec![
        Phase::new("plan", "plan", json!({})),
        Phase::new("audit", "security_audit", json!({})),
    ]);

    let err = coordinator.submit_task(request).unwrap_err();
    assert_eq!(
        err,
        RejectionReason::ResourceUnavailable {
            capability: "security_audit".into()
        }
    );
    assert_eq!(coordinator.status().active_workflows, 0);

    assert!(coordinator.flush(Duration::from_secs(2)).await);
    let metrics = coordinator.metrics();
    assert_eq!(metrics.rejections.get("resource_unavailable"), Some(&1));
    assert_eq!(metrics.workflows_started, 0);
}

#[tokio::test]
async fn test_exhausted_retries_abort_and_skip_later_phases() {
    let coordinator = Coordinator::new(test_config()).unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    coordinator
        .register_agent(
            AgentDescriptor::strategist(["plan", "review"]),
            provider_fn(|_, _| async { Ok(json!("ok")) }),
        )
        .unwrap();
    let counter = calls.clone();
    coordinator
        .register_agent(
            AgentDescriptor::builder(["implement"]),
            provider_fn(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow!("compiler exploded")) }
            }),
        )
        .unwrap();
    let recorder = Arc::new(Recorder::default());
    coordinator.bus().subscribe("phase.started", recorder.clone());

    let handle = coordinator
        .submit_task(TaskRequest::new(vec![
            Phase::new("plan", "plan", json!({})),
            Phase::new("implement", "implement", json!({})),
            Phase::new("review", "review", json!({})),
        ]))
        .unwrap();
    let finished = handle.wait().await;

    assert_eq!(finished.status, WorkflowStatus::Aborted);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(finished.phases[0].status, PhaseStatus::Succeeded);
    assert_eq!(finished.phases[1].status, PhaseStatus::Failed);
    assert_eq!(finished.phases[1].attempts, 3);
    assert_eq!(finished.phases[2].status, PhaseStatus::Skipped);
    assert_eq!(finished.phases[2].attempts, 0);
    assert_eq!(
        finished.abort_reason.as_deref(),
        Some("Phase 'implement' failed: compiler exploded")
    );

    assert!(coordinator.flush(Duration::from_secs(2)).await);
    let started: Vec<Value> = recorder
        .events
        .lock()
        .iter()
        .map(|e| e.payload["phase_id"].clone())
        .collect();
    assert_eq!(started.len(), 4);
    assert!(!started.contains(&json!("review")));

    let metrics = coordinator.metrics();
    assert_eq!(metrics.workflows_aborted, 1);
    assert_eq!(metrics.phases_failed, 3);
    assert_eq!(metrics.retries, 2);
    assert_eq!(metrics.workflow(handle.id()).unwrap().attempts, 4);
}

#[tokio::test]
async fn test_timed_out_attempt_is_retried() {
    let coordinator = Coordinator::new(test_config()).unwrap();
    coordinator
        .register_agent(
            AgentDescriptor::builder(["implement"]),
            provider_fn(|_, input: PhaseInput| async move {
                if input.attempt == 1 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok(json!({ "attempt": input.attempt }))
            }),
        )
        .unwrap();

    let request = TaskRequest::new(vec![
        Phase::new("implement", "implement", json!({})).with_timeout(Duration::from_millis(50))
    ]);
    let finished = coordinator.submit_task(request).unwrap().wait().await;

    assert_eq!(finished.status, WorkflowStatus::Completed);
    assert_eq!(finished.phases[0].attempts, 2);
    assert_eq!(finished.context["implement"], json!({ "attempt": 2 }));

    assert!(coordinator.flush(Duration::from_secs(2)).await);
    let metrics = coordinator.metrics();
    assert_eq!(metrics.phase_timeouts, 1);
    assert_eq!(metrics.role("builder").unwrap().timeouts, 1);
}

#[tokio::test]
async fn test_every_attempt_timing_out_aborts() {
    let config = CoordinatorConfig {
        max_retries: 2,
        ..test_config()
    };
    let coordinator = Coordinator::new(config).unwrap();
    coordinator
        .register_agent(
            AgentDescriptor::builder(["implement"]),
            provider_fn(|_, _| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!(null))
            }),
        )
        .unwrap();

    let request = TaskRequest::new(vec![
        Phase::new("implement", "implement", json!({})).with_timeout(Duration::from_millis(20))
    ]);
    let finished = coordinator.submit_task(request).unwrap().wait().await;

    assert_eq!(finished.status, WorkflowStatus::Aborted);
    assert_eq!(finished.phases[0].attempts, 2);
    assert_eq!(
        finished.abort_reason.as_deref(),
        Some("Phase 'implement' timed out after 20ms")
    );
}

#[tokio::test]
async fn test_cancel_lets_running_phase_finish_then_stops() {
    let coordinator = coordinator_with_agents(test_config());
    let started = Arc::new(Notify::new());
    let signal = started.clone();
    coordinator
        .register_agent(
            AgentDescriptor::strategist(["plan"]),
            provider_fn(move |_, _| {
                let signal = signal.clone();
                async move {
                    signal.notify_one();
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(json!("plan"))
                }
            }),
        )
        .unwrap();

    let handle = coordinator.submit_task(plan_then_implement()).unwrap();
    started.notified().await;
    assert!(coordinator.cancel(handle.id()));
    let finished = handle.wait().await;

    assert_eq!(finished.status, WorkflowStatus::Aborted);
    assert_eq!(finished.phases[0].status, PhaseStatus::Succeeded);
    assert_eq!(finished.phases[1].status, PhaseStatus::Skipped);
    assert!(finished
        .abort_reason
        .unwrap()
        .contains("cancelled by submitter before phase 'implement'"));

    // Terminal workflows stay queryable but can no longer be cancelled
    assert!(!coordinator.cancel(handle.id()));
    assert_eq!(
        coordinator.workflow(handle.id()).unwrap().status,
        WorkflowStatus::Aborted
    );
}

#[tokio::test]
async fn test_cancel_during_last_phase_aborts() {
    let coordinator = Coordinator::new(test_config()).unwrap();
    let started = Arc::new(Notify::new());
    let signal = started.clone();
    coordinator
        .register_agent(
            AgentDescriptor::builder(["implement"]),
            provider_fn(move |_, _| {
                let signal = signal.clone();
                async move {
                    signal.notify_one();
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(json!("built"))
                }
            }),
        )
        .unwrap();
    let recorder = Arc::new(Recorder::default());
    coordinator.bus().subscribe("workflow.*", recorder.clone());

    let handle = coordinator
        .submit_task(TaskRequest::single("implement", json!({})))
        .unwrap();
    started.notified().await;
    assert!(coordinator.cancel(handle.id()));
    let finished = handle.wait().await;

    // The in-flight result is kept, but the workflow does not complete
    assert_eq!(finished.status, WorkflowStatus::Aborted);
    assert_eq!(finished.phases[0].status, PhaseStatus::Succeeded);
    assert_eq!(finished.context["implement"], json!("built"));
    assert_eq!(
        finished.abort_reason.as_deref(),
        Some("Workflow cancelled by submitter after phase 'implement'")
    );

    assert!(coordinator.flush(Duration::from_secs(2)).await);
    assert_eq!(
        recorder.topics(),
        vec![Topics::WORKFLOW_STARTED, Topics::WORKFLOW_ABORTED]
    );
    let aborted = &recorder.with_topic(Topics::WORKFLOW_ABORTED)[0];
    assert_eq!(aborted.payload["retryable"], json!(false));
    let metrics = coordinator.metrics();
    assert_eq!(metrics.workflows_aborted, 1);
    assert_eq!(metrics.workflows_completed, 0);
}

#[tokio::test]
async fn test_workflow_completes_while_another_is_blocked() {
    let coordinator = coordinator_with_agents(test_config());
    let gate = Arc::new(Semaphore::new(0));
    let started = Arc::new(Notify::new());
    let (held, signal) = (gate.clone(), started.clone());
    coordinator
        .register_agent(
            AgentDescriptor::builder(["implement"]),
            provider_fn(move |_, _| {
                let (held, signal) = (held.clone(), signal.clone());
                async move {
                    signal.notify_one();
                    match held.acquire().await {
                        Ok(_permit) => Ok(json!("built")),
                        Err(e) => Err(anyhow!(e)),
                    }
                }
            }),
        )
        .unwrap();

    let slow = coordinator
        .submit_task(TaskRequest::single("implement", json!({})))
        .unwrap();
    started.notified().await;

    let fast = coordinator
        .submit_task(TaskRequest::single("plan", json!({ "goal": "cli" })))
        .unwrap();
    assert_eq!(fast.wait().await.status, WorkflowStatus::Completed);

    let blocked = coordinator.workflow(slow.id()).unwrap();
    assert_eq!(blocked.status, WorkflowStatus::Running);
    assert_eq!(blocked.phases[0].status, PhaseStatus::Running);

    gate.add_permits(1);
    let finished = slow.wait().await;
    assert_eq!(finished.status, WorkflowStatus::Completed);
    assert_eq!(finished.context["implement"], json!("built"));
}

#[tokio::test]
async fn test_workflow_completes_while_another_backs_off() {
    let config = CoordinatorConfig {
        backoff: BackoffConfig {
            initial_delay_ms: 10_000,
            multiplier: 1.0,
            max_delay_ms: 10_000,
            jitter: false,
        },
        ..test_config()
    };
    let coordinator = coordinator_with_agents(config);
    let failed = Arc::new(Notify::new());
    let signal = failed.clone();
    coordinator
        .register_agent(
            AgentDescriptor::builder(["implement"]),
            provider_fn(move |_, _| {
                let signal = signal.clone();
                async move {
                    signal.notify_one();
                    Err(anyhow!("linker busy"))
                }
            }),
        )
        .unwrap();

    let started_at = std::time::Instant::now();
    let waiting = coordinator
        .submit_task(TaskRequest::single("implement", json!({})))
        .unwrap();
    failed.notified().await;

    let fast = coordinator
        .submit_task(TaskRequest::single("plan", json!({})))
        .unwrap();
    assert_eq!(fast.wait().await.status, WorkflowStatus::Completed);

    let backing_off = coordinator.workflow(waiting.id()).unwrap();
    assert_eq!(backing_off.status, WorkflowStatus::Running);
    assert_eq!(backing_off.phases[0].attempts, 1);

    // Cancelling interrupts the backoff instead of waiting it out
    assert!(coordinator.cancel(waiting.id()));
    let finished = waiting.wait().await;
    assert_eq!(finished.status, WorkflowStatus::Aborted);
    assert_eq!(finished.phases[0].attempts, 1);
    assert_eq!(
        finished.abort_reason.as_deref(),
        Some("Workflow cancelled by submitter during phase 'implement'")
    );
    assert!(started_at.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_finished_workflows_are_retained_up_to_the_limit() {
    let config = CoordinatorConfig {
        max_finished_workflows: 2,
        ..test_config()
    };
    let coordinator = coordinator_with_agents(config);

    let mut ids = Vec::new();
    for _ in 0..3 {
        let handle = coordinator
            .submit_task(TaskRequest::single("implement", json!({})))
            .unwrap();
        assert_eq!(handle.wait().await.status, WorkflowStatus::Completed);
        ids.push(handle.id());
    }

    assert!(coordinator.workflow(ids[0]).is_none());
    assert!(coordinator.workflow(ids[1]).is_some());
    assert!(coordinator.workflow(ids[2]).is_some());
    assert_eq!(coordinator.status().finished_workflows, 2);

    assert!(coordinator.flush(Duration::from_secs(2)).await);
    let metrics = coordinator.metrics();
    assert_eq!(metrics.workflows_completed, 3);
    assert_eq!(metrics.workflows.len(), 2);
    assert!(metrics.workflow(ids[0]).is_none());
}

#[tokio::test]
async fn test_ceiling_plus_one_is_overloaded() {
    let config = CoordinatorConfig {
        max_concurrent_workflows: 1,
        ..test_config()
    };
    let coordinator = Coordinator::new(config).unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let held = gate.clone();
    coordinator
        .register_agent(
            AgentDescriptor::builder(["implement"]),
            provider_fn(move |_, _| {
                let held = held.clone();
                async move {
                    match held.acquire().await {
                        Ok(_permit) => Ok(json!("built")),
                        Err(e) => Err(anyhow!(e)),
                    }
                }
            }),
        )
        .unwrap();

    let first = coordinator
        .submit_task(TaskRequest::single("implement", json!({})))
        .unwrap();
    let second = coordinator.submit_task(TaskRequest::single("implement", json!({})));
    assert_eq!(second.unwrap_err(), RejectionReason::Overloaded { limit: 1 });
    assert_eq!(coordinator.status().router.in_flight, 1);

    gate.add_permits(1);
    assert_eq!(first.wait().await.status, WorkflowStatus::Completed);

    // The finished workflow gave its slot back
    gate.add_permits(1);
    let third = coordinator
        .submit_task(TaskRequest::single("implement", json!({})))
        .unwrap();
    assert_eq!(third.wait().await.status, WorkflowStatus::Completed);

    assert!(coordinator.flush(Duration::from_secs(2)).await);
    assert_eq!(coordinator.metrics().rejections.get("overloaded"), Some(&1));
}

#[tokio::test]
async fn test_retry_reuses_the_same_agent_with_prior_context() {
    let coordinator = coordinator_with_agents(test_config());

    let mut agent = MockAgent::new();
    let mut seq = Sequence::new();
    agent
        .expect_invoke()
        .withf(|role, input| role.as_str() == "builder" && input.attempt == 1)
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Err(anyhow!("flaky toolchain")));
    agent
        .expect_invoke()
        .withf(|role, input| {
            role.as_str() == "builder" && input.attempt == 2 && input.prior("plan").is_some()
        })
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_, _| Ok(json!("built on retry")));
    coordinator
        .register_agent(AgentDescriptor::builder(["implement"]), Arc::new(agent))
        .unwrap();

    let finished = coordinator
        .submit_task(plan_then_implement())
        .unwrap()
        .wait()
        .await;

    assert_eq!(finished.status, WorkflowStatus::Completed);
    assert_eq!(finished.phases[1].attempts, 2);
    assert_eq!(finished.phases[1].last_error, None);
    assert_eq!(finished.context["implement"], json!("built on retry"));
}

#[tokio::test]
async fn test_shutdown_cancels_running_workflows() {
    let coordinator = Coordinator::new(test_config()).unwrap();
    coordinator
        .register_agent(
            AgentDescriptor::strategist(["plan", "review"]),
            provider_fn(|_, _| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(json!("done"))
            }),
        )
        .unwrap();

    let handle = coordinator
        .submit_task(TaskRequest::new(vec![
            Phase::new("plan", "plan", json!({})),
            Phase::new("review", "review", json!({})),
        ]))
        .unwrap();
    coordinator.shutdown().await;

    let finished = handle.wait().await;
    assert_eq!(finished.status, WorkflowStatus::Aborted);
    assert_eq!(coordinator.status().active_workflows, 0);
    assert!(coordinator.bus().is_shut_down());
}
