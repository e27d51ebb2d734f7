//! The triple-shot coordinator.
//!
//! Owns one [`Session`] and drives it to a terminal outcome: three worker
//! teams run the same task in parallel worktrees, and once all three have
//! completed, a judge team -- added dynamically, depending on all three --
//! evaluates the results.
//!
//! Locking: the coordinator holds exactly one lock (`mu`). Every state
//! mutation happens under it; every bus publish and callback invocation
//! happens strictly after releasing it. Bus handlers are synchronous, so
//! anything that must publish or perform async work (judge startup) is
//! dispatched to a fresh task.

mod checkers;
mod judge;
pub mod prompts;
mod review;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::artifact;
use crate::bridge::{
    Bridge, BridgeOptions, CompletionChecker, InstanceFactory, TracingRecorder,
};
use crate::events::{BusEvent, EventBus, SubscriptionId, Topic};
use crate::host::{HostSession, InstanceInfo};
use crate::orchestrator::{InstanceRequest, Orchestrator, Workspace};
use crate::session::{AttemptStatus, Evaluation, Phase, Session, ATTEMPT_COUNT};
use crate::team::{ClaimedTask, PlannedTask, TeamManager, TeamRole, TeamSpec};
use crate::worktree::WorktreeManager;

use checkers::WorkerArtifactChecker;
use review::AdversarialGate;

/// Team id of the dynamically added judge team.
pub const JUDGE_TEAM_ID: &str = "judge";

/// Task id of the judge's single planned task.
pub const JUDGE_TASK_ID: &str = "judge-task";

fn attempt_team_id(index: usize) -> String {
    format!("attempt-{index}")
}

fn attempt_task_id(index: usize) -> String {
    format!("attempt-{index}-task")
}

// ---------------------------------------------------------------------------
// Callbacks
// ---------------------------------------------------------------------------

/// Host-UI callback record. All fields optional; invoked strictly outside
/// the coordinator lock.
#[derive(Clone, Default)]
pub struct CoordinatorCallbacks {
    pub on_phase_change: Option<Arc<dyn Fn(Phase) + Send + Sync>>,
    pub on_attempt_start: Option<Arc<dyn Fn(usize, &str) + Send + Sync>>,
    pub on_attempt_complete: Option<Arc<dyn Fn(usize) + Send + Sync>>,
    pub on_attempt_failed: Option<Arc<dyn Fn(usize, &str) + Send + Sync>>,
    pub on_judge_start: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub on_evaluation_ready: Option<Arc<dyn Fn(&Evaluation) + Send + Sync>>,
    pub on_complete: Option<Arc<dyn Fn(bool, &str) + Send + Sync>>,
    pub on_reviewer_start: Option<Arc<dyn Fn(usize, &str) + Send + Sync>>,
    pub on_review_approved: Option<Arc<dyn Fn(usize, i32) + Send + Sync>>,
    pub on_review_rejected: Option<Arc<dyn Fn(usize, i32, &[String]) + Send + Sync>>,
}

impl CoordinatorCallbacks {
    fn phase_change(&self, phase: Phase) {
        if let Some(f) = &self.on_phase_change {
            f(phase);
        }
    }

    fn attempt_start(&self, index: usize, instance_id: &str) {
        if let Some(f) = &self.on_attempt_start {
            f(index, instance_id);
        }
    }

    fn attempt_complete(&self, index: usize) {
        if let Some(f) = &self.on_attempt_complete {
            f(index);
        }
    }

    fn attempt_failed(&self, index: usize, reason: &str) {
        if let Some(f) = &self.on_attempt_failed {
            f(index, reason);
        }
    }

    fn judge_start(&self, instance_id: &str) {
        if let Some(f) = &self.on_judge_start {
            f(instance_id);
        }
    }

    fn evaluation_ready(&self, evaluation: &Evaluation) {
        if let Some(f) = &self.on_evaluation_ready {
            f(evaluation);
        }
    }

    fn complete(&self, success: bool, summary: &str) {
        if let Some(f) = &self.on_complete {
            f(success, summary);
        }
    }

    fn reviewer_start(&self, index: usize, instance_id: &str) {
        if let Some(f) = &self.on_reviewer_start {
            f(index, instance_id);
        }
    }

    fn review_approved(&self, index: usize, score: i32) {
        if let Some(f) = &self.on_review_approved {
            f(index, score);
        }
    }

    fn review_rejected(&self, index: usize, score: i32, issues: &[String]) {
        if let Some(f) = &self.on_review_rejected {
            f(index, score, issues);
        }
    }
}

impl std::fmt::Debug for CoordinatorCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorCallbacks").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Options & state
// ---------------------------------------------------------------------------

/// Tuning knobs for the coordinator's bridges and git interactions.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Poll interval for sentinel artifacts.
    pub poll_interval: std::time::Duration,
    /// Base branch commit counts are measured against.
    pub base_branch: String,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            poll_interval: std::time::Duration::from_millis(500),
            base_branch: "main".to_string(),
        }
    }
}

struct CoordinatorState {
    started: bool,
    /// Attempt teams observed completing. Guards the duplicate-event and
    /// judge-startup races.
    completed_attempts: u32,
    judge_started: bool,
    session: Session,
    bridges: Vec<Arc<Bridge>>,
    subscriptions: Vec<SubscriptionId>,
    manager: Option<Arc<TeamManager>>,
    cancel: Option<CancellationToken>,
    callbacks: CoordinatorCallbacks,
    judge_task: Option<JoinHandle<()>>,
    attempt_team_ids: [String; ATTEMPT_COUNT],
}

impl CoordinatorState {
    fn attempt_index_of(&self, team_id: &str) -> Option<usize> {
        self.attempt_team_ids.iter().position(|id| id == team_id)
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Drives one triple-shot session to a terminal outcome.
pub struct TripleShotCoordinator {
    orchestrator: Arc<dyn Orchestrator>,
    host: Arc<dyn HostSession>,
    bus: Arc<EventBus>,
    base_dir: PathBuf,
    options: CoordinatorOptions,
    mu: Mutex<CoordinatorState>,
}

impl TripleShotCoordinator {
    /// Create a coordinator for `session`.
    ///
    /// Fails fast on unusable configuration; these errors are not
    /// recoverable at runtime.
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        host: Arc<dyn HostSession>,
        bus: Arc<EventBus>,
        base_dir: impl Into<PathBuf>,
        session: Session,
        options: CoordinatorOptions,
    ) -> Result<Arc<Self>> {
        let base_dir = base_dir.into();
        if base_dir.as_os_str().is_empty() {
            bail!("base directory must not be empty");
        }
        if session.task.trim().is_empty() {
            bail!("session task must not be empty");
        }
        if options.base_branch.is_empty() {
            bail!("base branch must not be empty");
        }
        Ok(Arc::new(Self {
            orchestrator,
            host,
            bus,
            base_dir,
            options,
            mu: Mutex::new(CoordinatorState {
                started: false,
                completed_attempts: 0,
                judge_started: false,
                session,
                bridges: Vec::new(),
                subscriptions: Vec::new(),
                manager: None,
                cancel: None,
                callbacks: CoordinatorCallbacks::default(),
                judge_task: None,
                attempt_team_ids: std::array::from_fn(attempt_team_id),
            }),
        }))
    }

    /// Snapshot of the owned session. Callers must treat it as read-only;
    /// the coordinator is the only mutator.
    pub fn session(&self) -> Session {
        self.lock().session.clone()
    }

    /// Swap the callback record. Safe under a concurrent `start`.
    pub fn set_callbacks(&self, callbacks: CoordinatorCallbacks) {
        self.lock().callbacks = callbacks;
    }

    /// Branch of the winning attempt, if the judge selected one.
    pub fn get_winning_branch(&self) -> Option<String> {
        self.lock().session.winning_branch()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CoordinatorState> {
        self.mu.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -----------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------

    /// Start the session: create the three worker teams, their bridges,
    /// and begin working. Rejects a second call.
    pub async fn start(self: &Arc<Self>, parent: CancellationToken) -> Result<()> {
        // Phase 1, under the lock: teams, retry overrides, subscriptions.
        let (cancel, manager) = {
            let mut st = self.lock();
            if st.started {
                bail!("coordinator already started");
            }
            let cancel = parent.child_token();
            st.session.started_at = Some(Utc::now());

            let manager = TeamManager::new(Arc::clone(&self.bus), self.base_dir.clone());
            for i in 0..ATTEMPT_COUNT {
                let spec = TeamSpec {
                    id: attempt_team_id(i),
                    role: TeamRole::Execution,
                    size: 1,
                    depends_on: Vec::new(),
                    tasks: vec![PlannedTask::new(
                        attempt_task_id(i),
                        prompts::attempt_prompt(&st.session.task, i),
                    )],
                };
                let team = manager
                    .add_team(spec)
                    .with_context(|| format!("failed to add team {}", attempt_team_id(i)))?;
                // The workflow owns its own redundancy: a queue-level retry
                // would spawn a duplicate worker observed as a spurious
                // second pass. Failure to disable it is a startup failure.
                team.hub()
                    .set_max_retries(&attempt_task_id(i), 0)
                    .with_context(|| {
                        format!("failed to disable retries for {}", attempt_task_id(i))
                    })?;
            }

            let subscriptions = self.subscribe_handlers();
            if let Err(e) = manager.start() {
                for id in &subscriptions {
                    self.bus.unsubscribe(*id);
                }
                return Err(e).context("failed to start team manager");
            }

            st.manager = Some(Arc::clone(&manager));
            st.subscriptions = subscriptions;
            st.cancel = Some(cancel.clone());
            st.started = true;
            (cancel, manager)
        };

        // Phase 2, outside the lock: bridges. Holding the lock across
        // bridge startup would deadlock with the claim loop's first
        // `bridge.task_started` delivery.
        let adversarial = self.lock().session.config.adversarial;
        let mut created: Vec<Arc<Bridge>> = Vec::new();
        for i in 0..ATTEMPT_COUNT {
            let result = self.start_attempt_bridge(i, adversarial, &manager, &cancel);
            match result {
                Ok(bridge) => created.push(bridge),
                Err(e) => {
                    self.abort_start(created, cancel, manager).await;
                    return Err(e).with_context(|| {
                        format!("failed to start bridge for {}", attempt_team_id(i))
                    });
                }
            }
        }

        let callbacks = {
            let mut st = self.lock();
            st.bridges = created;
            st.session.phase = Phase::Working;
            st.callbacks.clone()
        };
        callbacks.phase_change(Phase::Working);
        self.spawn_save_session();

        tracing::info!(
            session_id = %self.lock().session.id,
            "triple-shot session started"
        );
        Ok(())
    }

    fn start_attempt_bridge(
        self: &Arc<Self>,
        index: usize,
        adversarial: bool,
        manager: &Arc<TeamManager>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Bridge>> {
        let team = manager
            .team(&attempt_team_id(index))
            .with_context(|| format!("team {} vanished", attempt_team_id(index)))?;

        let factory: Arc<dyn InstanceFactory> = Arc::new(AttemptInstanceFactory {
            coordinator: Arc::downgrade(self),
            attempt_index: index,
        });
        let checker: Arc<dyn CompletionChecker> = if adversarial {
            Arc::new(AdversarialGate::new(Arc::downgrade(self), index))
        } else {
            Arc::new(WorkerArtifactChecker::new(
                Arc::clone(&self.orchestrator),
                self.options.base_branch.clone(),
            ))
        };

        let bridge = Bridge::new(
            team,
            factory,
            checker,
            Arc::new(TracingRecorder),
            Arc::clone(&self.bus),
            BridgeOptions {
                poll_interval: self.options.poll_interval,
            },
        );
        bridge.start(cancel)?;
        Ok(bridge)
    }

    /// Roll back a partially started session.
    async fn abort_start(
        &self,
        created: Vec<Arc<Bridge>>,
        cancel: CancellationToken,
        manager: Arc<TeamManager>,
    ) {
        cancel.cancel();
        futures::future::join_all(created.iter().map(|b| b.stop())).await;
        manager.stop();
        let mut st = self.lock();
        for id in st.subscriptions.drain(..) {
            self.bus.unsubscribe(id);
        }
        st.manager = None;
        st.cancel = None;
        st.started = false;
    }

    // -----------------------------------------------------------------
    // Stop
    // -----------------------------------------------------------------

    /// Tear the session down. Idempotent; a coordinator that never started
    /// is a no-op.
    pub async fn stop(&self) {
        let (bridges, cancel, judge_task, manager) = {
            let mut st = self.lock();
            if !st.started {
                return;
            }
            for id in st.subscriptions.drain(..) {
                self.bus.unsubscribe(id);
            }
            let bridges = st.bridges.clone();
            let cancel = st.cancel.take();
            st.started = false;
            (bridges, cancel, st.judge_task.take(), st.manager.take())
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        futures::future::join_all(bridges.iter().map(|b| b.stop())).await;

        // The judge startup task may still be running and may have created
        // another bridge between the snapshot above and now.
        if let Some(handle) = judge_task {
            let _ = handle.await;
        }
        let late_bridges: Vec<Arc<Bridge>> = {
            let mut st = self.lock();
            st.bridges.drain(..).collect()
        };
        futures::future::join_all(late_bridges.iter().map(|b| b.stop())).await;

        if let Some(manager) = manager {
            manager.stop();
        }
        tracing::info!("triple-shot session stopped");
    }

    // -----------------------------------------------------------------
    // Bus handlers
    // -----------------------------------------------------------------

    fn subscribe_handlers(self: &Arc<Self>) -> Vec<SubscriptionId> {
        let weak = Arc::downgrade(self);
        let mut subscriptions = Vec::with_capacity(3);

        let w = weak.clone();
        subscriptions.push(self.bus.subscribe(Topic::TeamCompleted, move |event| {
            let Some(coordinator) = w.upgrade() else { return };
            if let BusEvent::TeamCompleted {
                team_id, success, ..
            } = event
            {
                coordinator.on_team_completed(team_id, *success);
            }
        }));

        let w = weak.clone();
        subscriptions.push(self.bus.subscribe(Topic::BridgeTaskStarted, move |event| {
            let Some(coordinator) = w.upgrade() else { return };
            if let BusEvent::BridgeTaskStarted {
                team_id,
                task_id,
                instance_id,
            } = event
            {
                coordinator.on_bridge_task_started(team_id, task_id, instance_id);
            }
        }));

        let w = weak;
        subscriptions.push(self.bus.subscribe(Topic::BridgeTaskCompleted, move |event| {
            let Some(coordinator) = w.upgrade() else { return };
            if let BusEvent::BridgeTaskCompleted {
                team_id,
                task_id,
                instance_id,
                success,
                commit_count,
                error,
            } = event
            {
                coordinator.on_bridge_task_completed(
                    team_id,
                    task_id,
                    instance_id,
                    *success,
                    *commit_count,
                    error.as_deref(),
                );
            }
        }));

        subscriptions
    }

    fn on_bridge_task_started(self: &Arc<Self>, team_id: &str, task_id: &str, instance_id: &str) {
        enum Target {
            Attempt(usize),
            Judge,
        }

        let (target, callbacks) = {
            let mut st = self.lock();
            if !st.started {
                return;
            }
            if let Some(index) = st.attempt_index_of(team_id) {
                let attempt = &mut st.session.attempts[index];
                attempt.instance_id = Some(instance_id.to_owned());
                attempt.status = AttemptStatus::Working;
                attempt.started_at = Some(Utc::now());
                (Target::Attempt(index), st.callbacks.clone())
            } else if team_id == JUDGE_TEAM_ID {
                (Target::Judge, st.callbacks.clone())
            } else {
                tracing::debug!(team_id, task_id, "task started for unknown team, ignoring");
                return;
            }
        };

        match target {
            Target::Attempt(index) => callbacks.attempt_start(index, instance_id),
            Target::Judge => callbacks.judge_start(instance_id),
        }
    }

    /// The critical race point: the *last* `team.completed` must leave the
    /// attempt terminal before the judge-startup task can observe it, so
    /// the status mutation happens eagerly under the lock here rather than
    /// waiting for the matching `bridge.task_completed`.
    fn on_team_completed(self: &Arc<Self>, team_id: &str, success: bool) {
        let event = {
            let mut st = self.lock();
            if !st.started {
                return;
            }
            let Some(index) = st.attempt_index_of(team_id) else {
                // The judge team's own completion is handled through its
                // bridge.task_completed event.
                return;
            };
            st.completed_attempts += 1;
            if st.completed_attempts > ATTEMPT_COUNT as u32 {
                tracing::warn!(team_id, "duplicate team.completed, ignoring");
                return;
            }
            let attempt = &mut st.session.attempts[index];
            if !attempt.status.is_terminal() {
                attempt.status = if success {
                    AttemptStatus::Completed
                } else {
                    AttemptStatus::Failed
                };
                attempt.completed_at = Some(Utc::now());
            }
            BusEvent::AttemptCompleted {
                attempt_index: index,
                team_id: team_id.to_owned(),
                success,
            }
        };

        self.bus.publish(event);

        let mut st = self.lock();
        if st.started && st.completed_attempts == ATTEMPT_COUNT as u32 && !st.judge_started {
            st.judge_started = true;
            let coordinator = Arc::clone(self);
            // Dispatched on a fresh task: judge startup performs async
            // orchestrator work and publishes events of its own, neither of
            // which belongs inside a synchronous bus handler.
            st.judge_task = Some(tokio::spawn(async move {
                coordinator.start_judge().await;
            }));
        }
    }

    fn on_bridge_task_completed(
        self: &Arc<Self>,
        team_id: &str,
        task_id: &str,
        instance_id: &str,
        success: bool,
        _commit_count: u32,
        error: Option<&str>,
    ) {
        if team_id == JUDGE_TEAM_ID {
            self.on_judge_completed(instance_id, success, error);
            return;
        }

        let (index, callbacks) = {
            let mut st = self.lock();
            if !st.started {
                return;
            }
            let Some(index) = st.attempt_index_of(team_id) else {
                tracing::debug!(team_id, task_id, "task completed for unknown team, ignoring");
                return;
            };
            let attempt = &mut st.session.attempts[index];
            // For the last attempt, on_team_completed already ran and its
            // timestamp stands; otherwise record the terminal state now.
            if !attempt.status.is_terminal() {
                attempt.status = if success {
                    AttemptStatus::Completed
                } else {
                    AttemptStatus::Failed
                };
                attempt.completed_at = Some(Utc::now());
            }
            (index, st.callbacks.clone())
        };

        if success {
            callbacks.attempt_complete(index);
        } else {
            callbacks.attempt_failed(index, error.unwrap_or("attempt failed"));
        }
    }

    // -----------------------------------------------------------------
    // Shared failure path
    // -----------------------------------------------------------------

    /// Transition the session to `Failed` and notify. Does not publish the
    /// judge-completed event; callers for whom the judge logically ran use
    /// `fail_judge` instead.
    fn fail_session(&self, reason: &str) {
        let callbacks = {
            let mut st = self.lock();
            if st.session.phase.is_terminal() {
                return;
            }
            st.session.error = Some(reason.to_owned());
            if let Err(e) = st.session.transition_phase(Phase::Failed) {
                tracing::error!(error = %e, "failed to transition session to failed");
                return;
            }
            st.callbacks.clone()
        };
        tracing::warn!(reason, "triple-shot session failed");
        callbacks.phase_change(Phase::Failed);
        callbacks.complete(false, reason);
        self.spawn_save_session();
    }

    /// Persist the host session in the background, logging failures.
    fn spawn_save_session(&self) {
        let orchestrator = Arc::clone(&self.orchestrator);
        tokio::spawn(async move {
            if let Err(e) = orchestrator.save_session().await {
                tracing::debug!(error = %e, "save_session failed");
            }
        });
    }
}

impl std::fmt::Debug for TripleShotCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.lock();
        f.debug_struct("TripleShotCoordinator")
            .field("session_id", &st.session.id)
            .field("phase", &st.session.phase)
            .field("started", &st.started)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Attempt instance factory
// ---------------------------------------------------------------------------

/// Creates the worker instance for one attempt: stub first (so the host UI
/// shows the attempt while its worktree is being set up), then workspace
/// setup, then start.
struct AttemptInstanceFactory {
    coordinator: Weak<TripleShotCoordinator>,
    attempt_index: usize,
}

#[async_trait::async_trait]
impl InstanceFactory for AttemptInstanceFactory {
    async fn create(&self, task: &ClaimedTask) -> Result<InstanceInfo> {
        let coordinator = self
            .coordinator
            .upgrade()
            .context("coordinator dropped before instance creation")?;
        coordinator
            .create_attempt_instance(self.attempt_index, task)
            .await
    }
}

impl TripleShotCoordinator {
    async fn create_attempt_instance(
        self: &Arc<Self>,
        index: usize,
        task: &ClaimedTask,
    ) -> Result<InstanceInfo> {
        let (group_id, branch) = {
            let st = self.lock();
            let id = st.session.id.simple().to_string();
            (
                st.session.group_id.clone(),
                WorktreeManager::attempt_branch(&id[..8], index),
            )
        };

        let request = InstanceRequest {
            title: format!("Attempt {}", index + 1),
            group_id,
            workspace: Workspace::FreshWorktree {
                branch: branch.clone(),
            },
        };

        let stub = self
            .orchestrator
            .create_stub_instance(&request)
            .await
            .context("failed to create stub instance")?;
        {
            let mut st = self.lock();
            let attempt = &mut st.session.attempts[index];
            attempt.instance_id = Some(stub.id.clone());
            attempt.status = AttemptStatus::Preparing;
        }

        let info = self
            .orchestrator
            .complete_stub_setup(&stub.id)
            .await
            .context("failed to complete instance setup")?;
        {
            let mut st = self.lock();
            let attempt = &mut st.session.attempts[index];
            attempt.worktree = Some(info.working_dir.clone());
            attempt.branch = info.branch.clone().or(Some(branch));
        }

        // A stale completion artifact from an earlier run in the same
        // worktree would register as an instant finish.
        if let Err(e) = artifact::remove_artifact(&info.working_dir, artifact::COMPLETION_ARTIFACT)
        {
            tracing::warn!(error = %e, "failed to clear stale completion artifact");
        }

        self.orchestrator
            .start_instance(&info.id, &task.description)
            .await
            .context("failed to start worker instance")?;

        Ok(info)
    }
}
