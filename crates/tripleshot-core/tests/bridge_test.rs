//! Bridge claim-loop tests: retry requeue, retry override, dependency
//! gating, and event ordering.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tripleshot_core::bridge::{
    Bridge, BridgeOptions, CompletionChecker, InstanceFactory, TaskOutcome, TracingRecorder,
};
use tripleshot_core::events::EventBus;
use tripleshot_core::host::InstanceInfo;
use tripleshot_core::team::{ClaimedTask, PlannedTask, Team, TeamManager, TeamRole, TeamSpec};

use tripleshot_test_utils::{BusLog, wait_for};

// ===========================================================================
// Local mocks
// ===========================================================================

/// Factory whose instances are bare directory handles.
struct DirFactory {
    root: PathBuf,
}

#[async_trait]
impl InstanceFactory for DirFactory {
    async fn create(&self, task: &ClaimedTask) -> Result<InstanceInfo> {
        Ok(InstanceInfo {
            id: format!("inst-{}", Uuid::new_v4().simple()),
            working_dir: self.root.clone(),
            branch: Some(format!("branch-{}", task.task_id)),
        })
    }
}

/// Checker that replays a fixed sequence of outcomes, then succeeds.
struct ReplayChecker {
    outcomes: Mutex<VecDeque<TaskOutcome>>,
}

impl ReplayChecker {
    fn new(outcomes: Vec<TaskOutcome>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
        })
    }
}

#[async_trait]
impl CompletionChecker for ReplayChecker {
    async fn check(
        &self,
        _task: &ClaimedTask,
        _instance: &InstanceInfo,
    ) -> Result<Option<TaskOutcome>> {
        let next = self.outcomes.lock().unwrap().pop_front();
        Ok(Some(next.unwrap_or_else(|| TaskOutcome::success(0))))
    }
}

fn spec(id: &str, depends_on: &[&str]) -> TeamSpec {
    TeamSpec {
        id: id.to_string(),
        role: TeamRole::Execution,
        size: 1,
        depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
        tasks: vec![PlannedTask::new(format!("{id}-task"), "do work")],
    }
}

fn bridge_for(team: Arc<Team>, checker: Arc<dyn CompletionChecker>, bus: Arc<EventBus>) -> Arc<Bridge> {
    let root = std::env::temp_dir();
    Bridge::new(
        team,
        Arc::new(DirFactory { root }),
        checker,
        Arc::new(TracingRecorder),
        bus,
        BridgeOptions {
            poll_interval: Duration::from_millis(10),
        },
    )
}

// ===========================================================================
// Retry behavior
// ===========================================================================

#[tokio::test]
async fn failed_task_retries_and_spawns_second_pass() {
    let bus = Arc::new(EventBus::new());
    let bus_log = BusLog::attach(&bus);
    let manager = TeamManager::new(Arc::clone(&bus), "/tmp");
    let team = manager.add_team(spec("alpha", &[])).unwrap();
    manager.start().unwrap();

    let checker = ReplayChecker::new(vec![TaskOutcome::failure("transient")]);
    let bridge = bridge_for(team, checker, Arc::clone(&bus));
    let cancel = CancellationToken::new();
    bridge.start(&cancel).unwrap();

    let done = wait_for(Duration::from_secs(5), || {
        bus_log.count("team.completed:alpha:true") == 1
    })
    .await;
    assert!(done, "team never completed: {:?}", bus_log.events());

    // Two passes: the retried task is observed as a second start.
    assert_eq!(bus_log.count("bridge.task_started:alpha:alpha-task"), 2);
    assert_eq!(bus_log.count("bridge.task_completed:alpha:alpha-task:false"), 1);
    assert_eq!(bus_log.count("bridge.task_completed:alpha:alpha-task:true"), 1);

    // The retry table recorded one failure, then the success.
    let state = manager.retry_manager().get("alpha-task").unwrap();
    assert!(state.succeeded);
    assert_eq!(state.retry_count, 1);

    bridge.stop().await;
}

#[tokio::test]
async fn zero_retry_override_fails_terminally_on_first_failure() {
    let bus = Arc::new(EventBus::new());
    let bus_log = BusLog::attach(&bus);
    let manager = TeamManager::new(Arc::clone(&bus), "/tmp");
    let team = manager.add_team(spec("alpha", &[])).unwrap();
    team.hub().set_max_retries("alpha-task", 0).unwrap();
    manager.start().unwrap();

    let checker = ReplayChecker::new(vec![TaskOutcome::failure("fatal")]);
    let bridge = bridge_for(team, checker, Arc::clone(&bus));
    let cancel = CancellationToken::new();
    bridge.start(&cancel).unwrap();

    let done = wait_for(Duration::from_secs(5), || {
        bus_log.count("team.completed:alpha:false") == 1
    })
    .await;
    assert!(done, "team never completed: {:?}", bus_log.events());

    // Exactly one pass; no spurious second worker.
    assert_eq!(bus_log.count("bridge.task_started:alpha:alpha-task"), 1);
    assert_eq!(bus_log.count("bridge.task_completed:alpha:alpha-task:false"), 1);

    bridge.stop().await;
}

// ===========================================================================
// Ordering & dependencies
// ===========================================================================

#[tokio::test]
async fn team_completed_precedes_final_task_completed() {
    let bus = Arc::new(EventBus::new());
    let bus_log = BusLog::attach(&bus);
    let manager = TeamManager::new(Arc::clone(&bus), "/tmp");
    let team = manager.add_team(spec("alpha", &[])).unwrap();
    manager.start().unwrap();

    let bridge = bridge_for(team, ReplayChecker::new(vec![]), Arc::clone(&bus));
    let cancel = CancellationToken::new();
    bridge.start(&cancel).unwrap();

    let done = wait_for(Duration::from_secs(5), || {
        bus_log.count("bridge.task_completed:alpha:alpha-task:true") == 1
    })
    .await;
    assert!(done, "task never completed: {:?}", bus_log.events());

    let team_completed = bus_log.position("team.completed:alpha").unwrap();
    let task_completed = bus_log
        .position("bridge.task_completed:alpha:alpha-task")
        .unwrap();
    assert!(team_completed < task_completed);

    bridge.stop().await;
}

#[tokio::test]
async fn dependent_team_waits_for_predecessor() {
    let bus = Arc::new(EventBus::new());
    let bus_log = BusLog::attach(&bus);
    let manager = TeamManager::new(Arc::clone(&bus), "/tmp");
    let first = manager.add_team(spec("first", &[])).unwrap();
    let second = manager.add_team(spec("second", &["first"])).unwrap();
    manager.start().unwrap();

    let cancel = CancellationToken::new();
    // Delay the first team so the second one demonstrably waits.
    let slow_checker = ReplayChecker::new(vec![]);
    let first_bridge = bridge_for(first, slow_checker, Arc::clone(&bus));
    let second_bridge = bridge_for(second, ReplayChecker::new(vec![]), Arc::clone(&bus));
    second_bridge.start(&cancel).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    // The gated team must not have claimed anything yet.
    assert_eq!(bus_log.count("bridge.task_started:second"), 0);

    first_bridge.start(&cancel).unwrap();
    let done = wait_for(Duration::from_secs(5), || {
        bus_log.count("team.completed:second:true") == 1
    })
    .await;
    assert!(done, "second team never completed: {:?}", bus_log.events());

    let first_done = bus_log.position("team.completed:first").unwrap();
    let second_started = bus_log.position("bridge.task_started:second").unwrap();
    assert!(first_done < second_started);

    first_bridge.stop().await;
    second_bridge.stop().await;
}

// ===========================================================================
// Lifecycle
// ===========================================================================

#[tokio::test]
async fn bridge_stop_is_idempotent_and_double_start_rejected() {
    let bus = Arc::new(EventBus::new());
    let manager = TeamManager::new(Arc::clone(&bus), "/tmp");
    let team = manager.add_team(spec("alpha", &[])).unwrap();
    // Never started: hub stays unready, the loop just polls.

    let bridge = bridge_for(team, ReplayChecker::new(vec![]), Arc::clone(&bus));
    let cancel = CancellationToken::new();
    bridge.start(&cancel).unwrap();
    assert!(bridge.start(&cancel).is_err());

    bridge.stop().await;
    bridge.stop().await;
}
