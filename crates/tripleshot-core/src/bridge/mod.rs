//! The bridge between a team's task queue and real worker instances.
//!
//! Each bridge runs a claim loop on its own tokio task: wait for the hub to
//! become ready, claim a task, create a worker instance through the
//! [`InstanceFactory`], publish `bridge.task_started`, then poll the
//! [`CompletionChecker`] until it reports an outcome.
//!
//! Event ordering contract: when an outcome makes the team's queue fully
//! terminal, `team.completed` is published *before* that task's
//! `bridge.task_completed`. Consumers that must observe a consistent
//! terminal state from their `team.completed` handler (the triple-shot
//! coordinator does) rely on this.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::{BusEvent, EventBus};
use crate::host::InstanceInfo;
use crate::team::{ClaimedTask, OutcomeDisposition, Team};

/// Creates a worker instance for a claimed task.
#[async_trait]
pub trait InstanceFactory: Send + Sync {
    async fn create(&self, task: &ClaimedTask) -> Result<InstanceInfo>;
}

/// Observes whether a running instance has finished its task.
#[async_trait]
pub trait CompletionChecker: Send + Sync {
    /// Poll once. `Ok(None)` means still running; an error is a hard
    /// failure of the check itself and fails the task.
    async fn check(
        &self,
        task: &ClaimedTask,
        instance: &InstanceInfo,
    ) -> Result<Option<TaskOutcome>>;
}

/// The result a completion checker reports.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub success: bool,
    pub commit_count: u32,
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn success(commit_count: u32) -> Self {
        Self {
            success: true,
            commit_count,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            commit_count: 0,
            error: Some(error.into()),
        }
    }
}

/// Per-team logging hooks.
pub trait SessionRecorder: Send + Sync {
    fn task_started(&self, task: &ClaimedTask, instance: &InstanceInfo);
    fn task_completed(&self, task: &ClaimedTask, outcome: &TaskOutcome);
}

/// Default recorder: structured tracing events.
#[derive(Debug, Clone)]
pub struct TracingRecorder;

impl SessionRecorder for TracingRecorder {
    fn task_started(&self, task: &ClaimedTask, instance: &InstanceInfo) {
        tracing::info!(
            team_id = %task.team_id,
            task_id = %task.task_id,
            instance_id = %instance.id,
            attempt = task.attempt,
            "task started"
        );
    }

    fn task_completed(&self, task: &ClaimedTask, outcome: &TaskOutcome) {
        tracing::info!(
            team_id = %task.team_id,
            task_id = %task.task_id,
            success = outcome.success,
            commit_count = outcome.commit_count,
            "task completed"
        );
    }
}

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// How often the claim loop polls for readiness and completion.
    pub poll_interval: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Default)]
struct BridgeState {
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

/// Connects one team's hub to worker instances.
pub struct Bridge {
    team: Arc<Team>,
    factory: Arc<dyn InstanceFactory>,
    checker: Arc<dyn CompletionChecker>,
    recorder: Arc<dyn SessionRecorder>,
    bus: Arc<EventBus>,
    options: BridgeOptions,
    state: Mutex<BridgeState>,
}

impl Bridge {
    pub fn new(
        team: Arc<Team>,
        factory: Arc<dyn InstanceFactory>,
        checker: Arc<dyn CompletionChecker>,
        recorder: Arc<dyn SessionRecorder>,
        bus: Arc<EventBus>,
        options: BridgeOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            team,
            factory,
            checker,
            recorder,
            bus,
            options,
            state: Mutex::new(BridgeState::default()),
        })
    }

    pub fn team_id(&self) -> String {
        self.team.id().to_owned()
    }

    /// Launch the claim loop. Fails on a second call.
    pub fn start(self: &Arc<Self>, parent: &CancellationToken) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.handle.is_some() {
            bail!("bridge for team {} already started", self.team.id());
        }
        let cancel = parent.child_token();
        let this = Arc::clone(self);
        let loop_cancel = cancel.clone();
        state.handle = Some(tokio::spawn(async move {
            this.claim_loop(loop_cancel).await;
        }));
        state.cancel = Some(cancel);
        Ok(())
    }

    /// Stop the claim loop and wait for it to exit. Idempotent; a bridge
    /// that never started is a no-op.
    pub async fn stop(&self) {
        let (cancel, handle) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            (state.cancel.take(), state.handle.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn claim_loop(self: Arc<Self>, cancel: CancellationToken) {
        let hub = self.team.hub();
        let mut team_completed_published = false;

        loop {
            if cancel.is_cancelled() {
                tracing::debug!(team_id = %self.team.id(), "bridge cancelled");
                return;
            }

            if !hub.is_ready() {
                if !self.sleep_or_cancel(&cancel).await {
                    return;
                }
                continue;
            }

            if let Some(task) = hub.claim_next() {
                match self.run_task(&task, &cancel).await {
                    Some(published) => team_completed_published |= published,
                    // Cancelled mid-task; exit without publishing.
                    None => return,
                }
                continue;
            }

            if hub.all_terminal() {
                if !team_completed_published {
                    self.publish_team_completed();
                }
                tracing::debug!(team_id = %self.team.id(), "bridge queue drained");
                return;
            }

            if !self.sleep_or_cancel(&cancel).await {
                return;
            }
        }
    }

    /// Run one claimed task to an outcome.
    ///
    /// Returns `Some(published_team_completed)` on completion, `None` when
    /// cancelled before an outcome was observed.
    async fn run_task(&self, task: &ClaimedTask, cancel: &CancellationToken) -> Option<bool> {
        let team_id = self.team.id().to_owned();

        // Create the worker instance. A factory failure is a task outcome,
        // not a bridge crash.
        let instance = match self.factory.create(task).await {
            Ok(instance) => instance,
            Err(e) => {
                tracing::warn!(
                    team_id = %team_id,
                    task_id = %task.task_id,
                    error = %e,
                    "instance creation failed"
                );
                let outcome = TaskOutcome::failure(format!("instance creation failed: {e}"));
                return Some(self.finish_task(task, None, outcome));
            }
        };

        self.bus.publish(BusEvent::BridgeTaskStarted {
            team_id: team_id.clone(),
            task_id: task.task_id.clone(),
            instance_id: instance.id.clone(),
        });
        self.recorder.task_started(task, &instance);

        // Poll for completion.
        let outcome = loop {
            match self.checker.check(task, &instance).await {
                Ok(Some(outcome)) => break outcome,
                Ok(None) => {
                    if !self.sleep_or_cancel(cancel).await {
                        return None;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        team_id = %team_id,
                        task_id = %task.task_id,
                        error = %e,
                        "completion check failed"
                    );
                    break TaskOutcome::failure(format!("completion check failed: {e}"));
                }
            }
        };

        Some(self.finish_task(task, Some(&instance), outcome))
    }

    /// Record the outcome and publish completion events in the documented
    /// order. Returns whether `team.completed` was published.
    fn finish_task(
        &self,
        task: &ClaimedTask,
        instance: Option<&InstanceInfo>,
        outcome: TaskOutcome,
    ) -> bool {
        let hub = self.team.hub();
        let disposition = match hub.record_outcome(
            &task.task_id,
            outcome.success,
            outcome.commit_count,
            outcome.error.as_deref(),
        ) {
            Ok(d) => d,
            Err(e) => {
                tracing::error!(
                    team_id = %self.team.id(),
                    task_id = %task.task_id,
                    error = %e,
                    "failed to record task outcome"
                );
                return false;
            }
        };

        let published_team_completed = matches!(
            disposition,
            OutcomeDisposition::Terminal { .. }
        ) && hub.all_terminal();
        if published_team_completed {
            self.publish_team_completed();
        }

        self.bus.publish(BusEvent::BridgeTaskCompleted {
            team_id: self.team.id().to_owned(),
            task_id: task.task_id.clone(),
            instance_id: instance.map(|i| i.id.clone()).unwrap_or_default(),
            success: outcome.success,
            commit_count: outcome.commit_count,
            error: outcome.error.clone(),
        });
        self.recorder.task_completed(task, &outcome);

        published_team_completed
    }

    fn publish_team_completed(&self) {
        let (tasks_completed, tasks_failed) = self.team.hub().counts();
        self.bus.publish(BusEvent::TeamCompleted {
            team_id: self.team.id().to_owned(),
            success: tasks_failed == 0,
            tasks_completed,
            tasks_failed,
        });
    }

    /// Sleep one poll interval; returns false when cancelled instead.
    async fn sleep_or_cancel(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.options.poll_interval) => true,
            _ = cancel.cancelled() => false,
        }
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("team_id", &self.team.id())
            .field("poll_interval", &self.options.poll_interval)
            .finish()
    }
}
