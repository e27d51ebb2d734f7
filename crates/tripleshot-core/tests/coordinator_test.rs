//! End-to-end coordinator tests against the scripted orchestrator.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use tripleshot_core::coordinator::{CoordinatorOptions, TripleShotCoordinator};
use tripleshot_core::events::EventBus;
use tripleshot_core::host::HostSession;
use tripleshot_core::orchestrator::Orchestrator;
use tripleshot_core::session::{AttemptStatus, MergeStrategy, Phase, Session, SessionConfig};

use tripleshot_test_utils::{
    Actor, BusLog, CallbackLog, ScriptedOrchestrator, wait_for, write_completion,
    write_evaluation, write_raw,
};

// ===========================================================================
// Test harness
// ===========================================================================

struct TestHarness {
    _base: tempfile::TempDir,
    base_dir: PathBuf,
    bus: Arc<EventBus>,
    orchestrator: Arc<ScriptedOrchestrator>,
    callback_log: Arc<CallbackLog>,
    bus_log: Arc<BusLog>,
}

impl TestHarness {
    fn new() -> Self {
        let base = tempfile::tempdir().expect("failed to create base dir");
        let base_dir = base.path().to_path_buf();
        let bus = Arc::new(EventBus::new());
        let orchestrator = ScriptedOrchestrator::new(base_dir.join("instances"));
        std::fs::create_dir_all(base_dir.join("instances")).unwrap();
        let bus_log = BusLog::attach(&bus);
        Self {
            _base: base,
            base_dir,
            bus,
            orchestrator,
            callback_log: CallbackLog::new(),
            bus_log,
        }
    }

    fn coordinator(&self, config: SessionConfig) -> Arc<TripleShotCoordinator> {
        self.orchestrator.host().create_group("group-1", "tripleshot");
        let session = Session::new("group-1", "Implement rate limiter", config);
        let coordinator = TripleShotCoordinator::new(
            Arc::clone(&self.orchestrator) as Arc<dyn Orchestrator>,
            self.orchestrator.host() as Arc<dyn HostSession>,
            Arc::clone(&self.bus),
            &self.base_dir,
            session,
            CoordinatorOptions {
                poll_interval: Duration::from_millis(15),
                base_branch: "main".to_string(),
            },
        )
        .expect("failed to build coordinator");
        coordinator.set_callbacks(self.callback_log.callbacks());
        coordinator
    }

    fn script_worker(&self, attempt: usize, status: &'static str) {
        self.orchestrator
            .on(Actor::Worker { attempt, round: 1 }, move |env| {
                write_completion(env.dir, attempt as i32, status, "did the thing");
            });
    }

    fn script_judge(&self, winner: i32, strategy: &'static str, reasoning: &'static str) {
        self.orchestrator.on(Actor::Judge, move |env| {
            write_evaluation(env.dir, winner, strategy, reasoning);
        });
    }
}

async fn wait_for_phase(coordinator: &Arc<TripleShotCoordinator>, phase: Phase) {
    let reached = wait_for(Duration::from_secs(10), || {
        coordinator.session().phase == phase
    })
    .await;
    assert!(
        reached,
        "session never reached {phase}; current phase {}, error {:?}",
        coordinator.session().phase,
        coordinator.session().error,
    );
}

// ===========================================================================
// S1: happy path
// ===========================================================================

#[tokio::test]
async fn happy_path_selects_winner() {
    let h = TestHarness::new();
    for i in 0..3 {
        h.script_worker(i, "complete");
    }
    h.script_judge(1, "select", "cleanest");

    let coordinator = h.coordinator(SessionConfig::default());
    coordinator.start(CancellationToken::new()).await.unwrap();

    wait_for_phase(&coordinator, Phase::Complete).await;
    let session = coordinator.session();

    // Terminal-state invariants.
    assert_eq!(session.attempts.len(), 3);
    assert!(session.evaluation.is_some());
    assert!(session.completed_at.is_some());
    assert!(session.judge_id.is_some());
    assert!(session.error.is_none());
    assert_eq!(session.successful_attempt_count(), 3);
    assert!(session.all_attempts_complete());
    assert_eq!(
        session.evaluation.as_ref().unwrap().merge_strategy,
        MergeStrategy::Select
    );

    // Winning branch matches attempt 1.
    let winner_branch = session.attempts[1].branch.clone().unwrap();
    assert_eq!(coordinator.get_winning_branch(), Some(winner_branch.clone()));

    // OnComplete carries the documented summary.
    let expected = format!(
        "complete:true:Selected attempt 2 (branch: {winner_branch}). Reasoning: cleanest"
    );
    assert!(
        h.callback_log.contains(&expected),
        "missing {expected:?} in {:?}",
        h.callback_log.events()
    );

    // Phase callbacks in transition order, with no adversarial phase.
    let events = h.callback_log.events();
    let working = events.iter().position(|e| e == "phase:working").unwrap();
    let evaluating = events.iter().position(|e| e == "phase:evaluating").unwrap();
    let complete = events.iter().position(|e| e == "phase:complete").unwrap();
    assert!(working < evaluating && evaluating < complete);
    assert!(!events.iter().any(|e| e == "phase:adversarial_review"));

    // OnEvaluationReady before OnPhaseChange(Complete) before OnComplete.
    let eval_ready = events
        .iter()
        .position(|e| e.starts_with("evaluation_ready"))
        .unwrap();
    let on_complete = events
        .iter()
        .position(|e| e.starts_with("complete:true"))
        .unwrap();
    assert!(eval_ready < complete && complete < on_complete);

    // Triple-shot events exactly once per attempt index, judge once.
    for i in 0..3 {
        assert_eq!(
            h.bus_log.count(&format!("tripleshot.attempt_completed:{i}:")),
            1
        );
    }
    assert_eq!(h.bus_log.count("tripleshot.judge_completed:true"), 1);
    assert_eq!(h.bus_log.count("tripleshot.judge_completed:false"), 0);

    // team.completed precedes the matching bridge.task_completed.
    for i in 0..3 {
        let team = h.bus_log.position(&format!("team.completed:attempt-{i}:")).unwrap();
        let task = h
            .bus_log
            .position(&format!("bridge.task_completed:attempt-{i}:"))
            .unwrap();
        assert!(team < task, "team.completed must precede bridge.task_completed");
    }

    // Implementers were regrouped: the parent's direct list was cleared
    // (only the judge may have been added afterwards) and the sub-group
    // holds the three worker instances.
    let subgroup_id = session
        .implementers_group_id
        .clone()
        .expect("implementers sub-group recorded on session");
    let group = h.orchestrator.host().group_by_id("group-1").unwrap();
    let workers: Vec<String> = session
        .attempts
        .iter()
        .filter_map(|a| a.instance_id.clone())
        .collect();
    assert!(
        !group.instances().iter().any(|id| workers.contains(id)),
        "workers must leave the parent group"
    );
    let subgroup = group.create_subgroup(&subgroup_id, "Implementers").unwrap();
    for worker in &workers {
        assert!(subgroup.instances().contains(worker));
    }

    // The persistence hook ran at least once.
    let saved = wait_for(Duration::from_secs(5), || h.orchestrator.save_count() >= 1).await;
    assert!(saved, "save_session never invoked");

    coordinator.stop().await;
}

// ===========================================================================
// S2: two successes, one failure
// ===========================================================================

#[tokio::test]
async fn judge_runs_with_two_successes() {
    let h = TestHarness::new();
    h.script_worker(0, "complete");
    h.script_worker(1, "failed");
    h.script_worker(2, "complete");
    h.script_judge(0, "select", "first one works");

    let coordinator = h.coordinator(SessionConfig::default());
    coordinator.start(CancellationToken::new()).await.unwrap();

    wait_for_phase(&coordinator, Phase::Complete).await;
    let session = coordinator.session();

    assert!(session.all_attempts_complete());
    assert_eq!(session.successful_attempt_count(), 2);
    assert_eq!(session.attempts[1].status, AttemptStatus::Failed);
    assert_eq!(
        coordinator.get_winning_branch(),
        session.attempts[0].branch.clone()
    );
    assert!(h.callback_log.contains("attempt_failed:1"));

    coordinator.stop().await;
}

// ===========================================================================
// S3: too few successes
// ===========================================================================

#[tokio::test]
async fn fails_without_judge_when_under_two_successes() {
    let h = TestHarness::new();
    h.script_worker(0, "failed");
    h.script_worker(1, "failed");
    h.script_worker(2, "complete");
    // A judge script is registered, but must never run.
    h.script_judge(0, "select", "unreachable");

    let coordinator = h.coordinator(SessionConfig::default());
    coordinator.start(CancellationToken::new()).await.unwrap();

    wait_for_phase(&coordinator, Phase::Failed).await;
    let session = coordinator.session();

    assert_eq!(session.error.as_deref(), Some("fewer than 2 attempts succeeded"));
    assert!(session.completed_at.is_some());
    assert!(h
        .callback_log
        .contains("complete:false:fewer than 2 attempts succeeded"));

    // No judge was added: no judge instance, no judge-completed event.
    assert_eq!(h.bus_log.count("tripleshot.judge_completed"), 0);
    assert!(
        !h.orchestrator
            .started()
            .iter()
            .any(|s| s.actor == Some(Actor::Judge)),
        "judge must not start"
    );

    coordinator.stop().await;
}

// ===========================================================================
// S4: malformed judge evaluation
// ===========================================================================

#[tokio::test]
async fn malformed_evaluation_fails_session() {
    let h = TestHarness::new();
    for i in 0..3 {
        h.script_worker(i, "complete");
    }
    h.orchestrator.on(Actor::Judge, |env| {
        write_raw(
            env.dir,
            tripleshot_core::artifact::EVALUATION_ARTIFACT,
            "this is not json",
        );
    });

    let coordinator = h.coordinator(SessionConfig::default());
    coordinator.start(CancellationToken::new()).await.unwrap();

    wait_for_phase(&coordinator, Phase::Failed).await;
    let session = coordinator.session();

    let error = session.error.expect("failed session must carry an error");
    assert!(
        error.contains("parse evaluation"),
        "error should mention evaluation parsing: {error}"
    );
    assert_eq!(h.bus_log.count("tripleshot.judge_completed:false"), 1);
    assert_eq!(h.bus_log.count("tripleshot.judge_completed:true"), 0);

    coordinator.stop().await;
}

// ===========================================================================
// Judge free-text fallback
// ===========================================================================

#[tokio::test]
async fn judge_output_fallback_accepted() {
    let h = TestHarness::new();
    for i in 0..3 {
        h.script_worker(i, "complete");
    }
    h.orchestrator.on(Actor::Judge, |env| {
        env.set_output(
            "Thinking it over...\n<evaluation>\n\
             {\"winner_index\":2,\"merge_strategy\":\"select\",\"reasoning\":\"most tested\"}\n\
             </evaluation>\n",
        );
    });

    let coordinator = h.coordinator(SessionConfig::default());
    coordinator.start(CancellationToken::new()).await.unwrap();

    wait_for_phase(&coordinator, Phase::Complete).await;
    let session = coordinator.session();
    let evaluation = session.evaluation.unwrap();
    assert_eq!(evaluation.winner_index, 2);
    assert_eq!(evaluation.reasoning.as_str(), "most tested");

    coordinator.stop().await;
}

// ===========================================================================
// Workers that die silently
// ===========================================================================

#[tokio::test]
async fn workers_exiting_without_artifacts_fail_the_session() {
    let h = TestHarness::new();
    // No worker scripts: every instance exits without a completion artifact.

    let coordinator = h.coordinator(SessionConfig::default());
    coordinator.start(CancellationToken::new()).await.unwrap();

    wait_for_phase(&coordinator, Phase::Failed).await;
    let session = coordinator.session();
    assert_eq!(session.error.as_deref(), Some("fewer than 2 attempts succeeded"));
    assert!(session.attempts.iter().all(|a| a.status == AttemptStatus::Failed));

    coordinator.stop().await;
}

// ===========================================================================
// Lifecycle
// ===========================================================================

#[tokio::test]
async fn stop_cancels_in_flight_workers() {
    let h = TestHarness::new();
    for attempt in 0..3 {
        h.orchestrator.hang(Actor::Worker { attempt, round: 1 });
    }

    let coordinator = h.coordinator(SessionConfig::default());
    coordinator.start(CancellationToken::new()).await.unwrap();

    // Let the workers spin up, then tear down mid-flight.
    let spun_up = wait_for(Duration::from_secs(5), || {
        h.orchestrator.started().len() == 3
    })
    .await;
    assert!(spun_up, "workers never started");

    coordinator.stop().await;
    let session = coordinator.session();
    assert!(!session.phase.is_terminal());
    assert_eq!(h.bus_log.count("team.completed"), 0);
}

#[tokio::test]
async fn double_start_rejected() {
    let h = TestHarness::new();
    for i in 0..3 {
        h.script_worker(i, "complete");
    }
    h.script_judge(0, "select", "ok");

    let coordinator = h.coordinator(SessionConfig::default());
    coordinator.start(CancellationToken::new()).await.unwrap();
    let second = coordinator.start(CancellationToken::new()).await;
    assert!(second.is_err());
    coordinator.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent_and_tolerates_never_started() {
    let h = TestHarness::new();
    let coordinator = h.coordinator(SessionConfig::default());

    // Stop before start: no-op.
    coordinator.stop().await;
    assert_eq!(coordinator.session().phase, Phase::Working);

    coordinator.start(CancellationToken::new()).await.unwrap();
    coordinator.stop().await;
    coordinator.stop().await;
}

#[tokio::test]
async fn empty_task_rejected_at_construction() {
    let h = TestHarness::new();
    let session = Session::new("group-1", "   ", SessionConfig::default());
    let result = TripleShotCoordinator::new(
        Arc::clone(&h.orchestrator) as Arc<dyn Orchestrator>,
        h.orchestrator.host() as Arc<dyn HostSession>,
        Arc::clone(&h.bus),
        &h.base_dir,
        session,
        CoordinatorOptions::default(),
    );
    assert!(result.is_err());
}
