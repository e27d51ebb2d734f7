//! Adversarial review loop tests: approve-after-feedback, round
//! exhaustion, and reviewer failure modes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use tripleshot_core::coordinator::{CoordinatorOptions, TripleShotCoordinator};
use tripleshot_core::events::EventBus;
use tripleshot_core::host::HostSession;
use tripleshot_core::orchestrator::Orchestrator;
use tripleshot_core::session::{AttemptStatus, Phase, Session, SessionConfig};

use tripleshot_test_utils::{
    Actor, BusLog, CallbackLog, ScriptedOrchestrator, wait_for, write_completion,
    write_evaluation, write_review,
};

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

    fn adversarial_config(&self) -> SessionConfig {
        SessionConfig {
            adversarial: true,
            max_adversarial_rounds: 3,
            min_passing_score: 8,
            ..SessionConfig::default()
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

    /// Worker writes a successful completion on the given round.
    fn script_worker_round(&self, attempt: usize, round: u32) {
        self.orchestrator
            .on(Actor::Worker { attempt, round }, move |env| {
                write_completion(env.dir, attempt as i32, "complete", "did the thing");
            });
    }

    /// Reviewer verdict on the given round.
    fn script_reviewer(&self, attempt: usize, round: u32, approved: bool, score: i32) {
        self.orchestrator
            .on(Actor::Reviewer { attempt, round }, move |env| {
                write_review(env.dir, attempt as i32, round as i32, approved, score, &["x"]);
            });
    }

    /// Attempts 1 and 2 sail through review on round 1.
    fn script_clean_attempts_1_and_2(&self) {
        for attempt in [1, 2] {
            self.script_worker_round(attempt, 1);
            self.script_reviewer(attempt, 1, true, 9);
        }
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
// S5: approve on round 2
// ===========================================================================

#[tokio::test]
async fn rejected_then_approved_on_round_two() {
    let h = TestHarness::new();
    h.script_worker_round(0, 1);
    h.script_reviewer(0, 1, false, 6);
    h.script_worker_round(0, 2);
    h.script_reviewer(0, 2, true, 9);
    h.script_clean_attempts_1_and_2();
    h.orchestrator.on(Actor::Judge, |env| {
        write_evaluation(env.dir, 0, "select", "persevered");
    });

    let coordinator = h.coordinator(h.adversarial_config());
    coordinator.start(CancellationToken::new()).await.unwrap();

    wait_for_phase(&coordinator, Phase::Complete).await;
    let session = coordinator.session();
    let attempt = &session.attempts[0];

    assert_eq!(attempt.status, AttemptStatus::Completed);
    assert_eq!(attempt.review_round, 2);
    assert_eq!(attempt.review_approved, Some(true));
    assert_eq!(attempt.review_score, Some(9));
    assert_eq!(attempt.round_history.len(), 2);
    assert_eq!(attempt.round_history[0].round, 1);
    assert_eq!(attempt.round_history[1].round, 2);

    // Reject fires before the round-2 approval.
    let events = h.callback_log.events();
    let rejected = events
        .iter()
        .position(|e| e.starts_with("review_rejected:0:6:x"))
        .expect("rejection callback");
    let approved = events
        .iter()
        .position(|e| e.starts_with("review_approved:0:9"))
        .expect("approval callback");
    assert!(rejected < approved);

    // The session passed through the adversarial phase.
    let adversarial = events
        .iter()
        .position(|e| e == "phase:adversarial_review")
        .expect("adversarial phase callback");
    let evaluating = events.iter().position(|e| e == "phase:evaluating").unwrap();
    assert!(adversarial < evaluating);

    // The restarted implementer got the feedback tail.
    let restarted = h
        .orchestrator
        .started()
        .into_iter()
        .find(|s| s.actor == Some(Actor::Worker { attempt: 0, round: 2 }))
        .expect("round-2 implementer started");
    assert!(restarted.prompt.contains("Previous Review Feedback"));
    assert!(restarted.prompt.contains("6/10"));
    assert!(restarted.prompt.contains("- x"));

    // Each attempt still completes exactly once on the bus.
    for i in 0..3 {
        assert_eq!(
            h.bus_log.count(&format!("tripleshot.attempt_completed:{i}:")),
            1
        );
    }

    coordinator.stop().await;
}

// ===========================================================================
// S6: exhaust the round budget
// ===========================================================================

#[tokio::test]
async fn rejection_at_round_budget_fails_attempt() {
    let h = TestHarness::new();
    for round in 1..=3 {
        h.script_worker_round(0, round);
        h.script_reviewer(0, round, false, 5);
    }
    h.script_clean_attempts_1_and_2();
    h.orchestrator.on(Actor::Judge, |env| {
        write_evaluation(env.dir, 1, "select", "only clean survivor");
    });

    let coordinator = h.coordinator(h.adversarial_config());
    coordinator.start(CancellationToken::new()).await.unwrap();

    wait_for_phase(&coordinator, Phase::Complete).await;
    let session = coordinator.session();
    let attempt = &session.attempts[0];

    assert_eq!(attempt.status, AttemptStatus::Failed);
    assert_eq!(attempt.review_round, 3);
    assert_eq!(attempt.review_approved, Some(false));
    assert_eq!(attempt.round_history.len(), 3);
    assert_eq!(session.successful_attempt_count(), 2);

    let failed_event = h
        .callback_log
        .events()
        .into_iter()
        .find(|e| e.starts_with("attempt_failed:0"))
        .expect("attempt 0 failure callback");
    assert!(
        failed_event.contains("Exhausted 3 adversarial rounds"),
        "unexpected failure reason: {failed_event}"
    );
    assert!(failed_event.contains("final score: 5/10"));

    // No fourth round was attempted.
    assert!(
        !h.orchestrator
            .started()
            .iter()
            .any(|s| s.actor == Some(Actor::Worker { attempt: 0, round: 4 })),
        "no restart after exhaustion"
    );

    coordinator.stop().await;
}

// ===========================================================================
// Reviewer failure modes
// ===========================================================================

#[tokio::test]
async fn out_of_range_review_fails_attempt() {
    let h = TestHarness::new();
    h.script_worker_round(0, 1);
    h.orchestrator
        .on(Actor::Reviewer { attempt: 0, round: 1 }, |env| {
            write_review(env.dir, 0, 1, true, 99, &[]);
        });
    h.script_clean_attempts_1_and_2();
    h.orchestrator.on(Actor::Judge, |env| {
        write_evaluation(env.dir, 1, "select", "survivors");
    });

    let coordinator = h.coordinator(h.adversarial_config());
    coordinator.start(CancellationToken::new()).await.unwrap();

    wait_for_phase(&coordinator, Phase::Complete).await;
    let session = coordinator.session();
    assert_eq!(session.attempts[0].status, AttemptStatus::Failed);

    let failed_event = h
        .callback_log
        .events()
        .into_iter()
        .find(|e| e.starts_with("attempt_failed:0"))
        .expect("attempt 0 failure callback");
    assert!(
        failed_event.contains("invalid review"),
        "expected an invalid-review reason, got {failed_event}"
    );

    coordinator.stop().await;
}

#[tokio::test]
async fn reviewer_exiting_without_artifact_fails_attempt() {
    let h = TestHarness::new();
    h.script_worker_round(0, 1);
    // No script for Reviewer{0,1}: the reviewer instance exits silently.
    h.script_clean_attempts_1_and_2();
    h.orchestrator.on(Actor::Judge, |env| {
        write_evaluation(env.dir, 2, "select", "survivors");
    });

    let coordinator = h.coordinator(h.adversarial_config());
    coordinator.start(CancellationToken::new()).await.unwrap();

    wait_for_phase(&coordinator, Phase::Complete).await;
    let session = coordinator.session();
    assert_eq!(session.attempts[0].status, AttemptStatus::Failed);

    let failed_event = h
        .callback_log
        .events()
        .into_iter()
        .find(|e| e.starts_with("attempt_failed:0"))
        .expect("attempt 0 failure callback");
    assert!(failed_event.contains("reviewer exited"));

    coordinator.stop().await;
}
