//! Teams, hubs, and the per-team task queue.
//!
//! A team owns a hub; the hub owns a queue of planned tasks with a per-task
//! retry budget (default 2 -- workflows that manage their own redundancy
//! override it to 0 via [`TeamHub::set_max_retries`]). The [`TeamManager`]
//! gates each team's hub on its dependencies: a hub becomes claimable only
//! once every team it depends on has published `team.completed`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use anyhow::{Result, bail};

use crate::events::{BusEvent, EventBus, SubscriptionId, Topic};
use crate::retry::RetryStateManager;

/// Default per-task retry budget.
pub const DEFAULT_TASK_RETRIES: u32 = 2;

/// What a team is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeamRole {
    Execution,
    Review,
}

impl fmt::Display for TeamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Execution => "execution",
            Self::Review => "review",
        };
        f.write_str(s)
    }
}

/// One planned unit of work for a team.
#[derive(Debug, Clone)]
pub struct PlannedTask {
    pub id: String,
    /// The full prompt handed to the worker instance.
    pub description: String,
    pub max_retries: u32,
}

impl PlannedTask {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            max_retries: DEFAULT_TASK_RETRIES,
        }
    }
}

/// Specification for a team.
#[derive(Debug, Clone)]
pub struct TeamSpec {
    pub id: String,
    pub role: TeamRole,
    /// Worker slots. Triple-shot teams are always size 1.
    pub size: usize,
    /// Teams that must publish `team.completed` before this one runs.
    pub depends_on: Vec<String>,
    pub tasks: Vec<PlannedTask>,
}

/// A task handed out by [`TeamHub::claim_next`].
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub team_id: String,
    pub task_id: String,
    pub description: String,
    /// 0-based pass number; >0 means this is a queue-level retry.
    pub attempt: u32,
}

/// What the queue decided after an outcome was recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeDisposition {
    /// The task failed but has retry budget left and was requeued.
    Requeued { next_attempt: u32 },
    /// The task reached a terminal state.
    Terminal { success: bool },
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueStatus {
    Queued,
    Claimed,
    Succeeded,
    Failed,
}

#[derive(Debug)]
struct QueuedTask {
    task: PlannedTask,
    status: QueueStatus,
    attempt: u32,
}

/// A team's hub: the task queue plus the dependency-readiness flag.
#[derive(Debug)]
pub struct TeamHub {
    team_id: String,
    queue: Mutex<Vec<QueuedTask>>,
    retry: Arc<RetryStateManager>,
    ready: AtomicBool,
}

impl TeamHub {
    fn new(team_id: String, tasks: Vec<PlannedTask>, retry: Arc<RetryStateManager>) -> Self {
        let queue = tasks
            .into_iter()
            .map(|task| QueuedTask {
                task,
                status: QueueStatus::Queued,
                attempt: 0,
            })
            .collect();
        Self {
            team_id,
            queue: Mutex::new(queue),
            retry,
            ready: AtomicBool::new(false),
        }
    }

    pub fn team_id(&self) -> &str {
        &self.team_id
    }

    /// Whether the team's dependencies are satisfied.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn mark_ready(&self) {
        if !self.ready.swap(true, Ordering::SeqCst) {
            tracing::debug!(team_id = %self.team_id, "team ready to claim tasks");
        }
    }

    /// Override a task's retry budget. Must happen before the task is first
    /// claimed; the retry table fixes the budget at claim time.
    pub fn set_max_retries(&self, task_id: &str, max_retries: u32) -> Result<()> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let entry = queue
            .iter_mut()
            .find(|t| t.task.id == task_id)
            .ok_or_else(|| {
                anyhow::anyhow!("no task {task_id} in team {}", self.team_id)
            })?;
        if entry.status != QueueStatus::Queued || entry.attempt > 0 {
            bail!(
                "cannot change retry budget for task {task_id}: already claimed"
            );
        }
        entry.task.max_retries = max_retries;
        Ok(())
    }

    /// Claim the next queued task, registering its retry state on first
    /// claim. Returns `None` when nothing is claimable (or the hub is not
    /// yet ready).
    pub fn claim_next(&self) -> Option<ClaimedTask> {
        if !self.is_ready() {
            return None;
        }
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let entry = queue.iter_mut().find(|t| t.status == QueueStatus::Queued)?;
        entry.status = QueueStatus::Claimed;
        self.retry
            .get_or_create(&entry.task.id, entry.task.max_retries);
        Some(ClaimedTask {
            team_id: self.team_id.clone(),
            task_id: entry.task.id.clone(),
            description: entry.task.description.clone(),
            attempt: entry.attempt,
        })
    }

    /// Record the outcome of a claimed task and decide requeue vs terminal.
    pub fn record_outcome(
        &self,
        task_id: &str,
        success: bool,
        commit_count: u32,
        error: Option<&str>,
    ) -> Result<OutcomeDisposition> {
        self.retry.record_attempt(task_id, success);
        self.retry.record_commit_count(task_id, commit_count);
        if let Some(message) = error {
            self.retry.set_last_error(task_id, message);
        }

        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let entry = queue
            .iter_mut()
            .find(|t| t.task.id == task_id)
            .ok_or_else(|| {
                anyhow::anyhow!("no task {task_id} in team {}", self.team_id)
            })?;
        if entry.status != QueueStatus::Claimed {
            bail!(
                "task {task_id} in team {} is not claimed (status {:?})",
                self.team_id,
                entry.status
            );
        }

        if success {
            entry.status = QueueStatus::Succeeded;
            return Ok(OutcomeDisposition::Terminal { success: true });
        }

        if self.retry.should_retry(task_id) {
            entry.status = QueueStatus::Queued;
            entry.attempt += 1;
            tracing::info!(
                team_id = %self.team_id,
                task_id = %task_id,
                attempt = entry.attempt,
                "task failed, requeued for retry"
            );
            return Ok(OutcomeDisposition::Requeued {
                next_attempt: entry.attempt,
            });
        }

        entry.status = QueueStatus::Failed;
        Ok(OutcomeDisposition::Terminal { success: false })
    }

    /// True when every task is terminal.
    pub fn all_terminal(&self) -> bool {
        let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue
            .iter()
            .all(|t| matches!(t.status, QueueStatus::Succeeded | QueueStatus::Failed))
    }

    /// (succeeded, failed) task counts.
    pub fn counts(&self) -> (u32, u32) {
        let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let succeeded = queue
            .iter()
            .filter(|t| t.status == QueueStatus::Succeeded)
            .count() as u32;
        let failed = queue
            .iter()
            .filter(|t| t.status == QueueStatus::Failed)
            .count() as u32;
        (succeeded, failed)
    }
}

// ---------------------------------------------------------------------------
// Team & manager
// ---------------------------------------------------------------------------

/// A team: its spec plus its hub.
#[derive(Debug)]
pub struct Team {
    spec: TeamSpec,
    hub: Arc<TeamHub>,
}

impl Team {
    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn role(&self) -> TeamRole {
        self.spec.role
    }

    pub fn depends_on(&self) -> &[String] {
        &self.spec.depends_on
    }

    pub fn hub(&self) -> Arc<TeamHub> {
        Arc::clone(&self.hub)
    }
}

#[derive(Default)]
struct ManagerInner {
    teams: HashMap<String, Arc<Team>>,
    completed: HashSet<String>,
    started: bool,
    subscription: Option<SubscriptionId>,
}

/// Owns the teams of one workflow and gates their hubs on dependencies.
pub struct TeamManager {
    bus: Arc<EventBus>,
    base_dir: PathBuf,
    retry: Arc<RetryStateManager>,
    inner: Mutex<ManagerInner>,
}

impl TeamManager {
    pub fn new(bus: Arc<EventBus>, base_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            base_dir: base_dir.into(),
            retry: Arc::new(RetryStateManager::new()),
            inner: Mutex::new(ManagerInner::default()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// The retry table shared by every hub this manager owns.
    pub fn retry_manager(&self) -> Arc<RetryStateManager> {
        Arc::clone(&self.retry)
    }

    /// Add a team before `start`.
    pub fn add_team(&self, spec: TeamSpec) -> Result<Arc<Team>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.started {
            bail!("team manager already started; use add_team_dynamic");
        }
        Self::insert_team(&mut inner, spec, &self.retry)
    }

    /// Add a team to a running manager. Its hub's readiness is evaluated
    /// immediately against the dependency completions recorded so far.
    pub fn add_team_dynamic(&self, spec: TeamSpec) -> Result<Arc<Team>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.started {
            bail!("team manager not started; use add_team");
        }
        let team = Self::insert_team(&mut inner, spec, &self.retry)?;
        Self::refresh_readiness(&inner);
        Ok(team)
    }

    fn insert_team(
        inner: &mut ManagerInner,
        spec: TeamSpec,
        retry: &Arc<RetryStateManager>,
    ) -> Result<Arc<Team>> {
        if spec.size == 0 {
            bail!("team {} must have at least one worker slot", spec.id);
        }
        if inner.teams.contains_key(&spec.id) {
            bail!("duplicate team id {}", spec.id);
        }
        for dep in &spec.depends_on {
            if !inner.teams.contains_key(dep) {
                bail!("team {} depends on unknown team {dep}", spec.id);
            }
        }
        let hub = Arc::new(TeamHub::new(
            spec.id.clone(),
            spec.tasks.clone(),
            Arc::clone(retry),
        ));
        let team = Arc::new(Team {
            spec: spec.clone(),
            hub,
        });
        inner.teams.insert(spec.id, Arc::clone(&team));
        Ok(team)
    }

    /// Look up a team by id.
    pub fn team(&self, id: &str) -> Option<Arc<Team>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.teams.get(id).cloned()
    }

    /// Start scheduling: subscribe to `team.completed` and release every
    /// hub whose dependencies are already satisfied.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.started {
            bail!("team manager already started");
        }
        inner.started = true;

        let weak: Weak<Self> = Arc::downgrade(self);
        let id = self.bus.subscribe(Topic::TeamCompleted, move |event| {
            let Some(manager) = weak.upgrade() else {
                return;
            };
            if let BusEvent::TeamCompleted { team_id, .. } = event {
                manager.on_team_completed(team_id);
            }
        });
        inner.subscription = Some(id);

        Self::refresh_readiness(&inner);
        Ok(())
    }

    /// Stop scheduling. Idempotent; tolerates never having started.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(id) = inner.subscription.take() {
            self.bus.unsubscribe(id);
        }
        inner.started = false;
    }

    fn on_team_completed(&self, team_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.completed.insert(team_id.to_owned());
        Self::refresh_readiness(&inner);
    }

    /// Release every hub whose dependency set is covered by the completed
    /// teams. Runs with the manager lock held; only flips atomics.
    fn refresh_readiness(inner: &ManagerInner) {
        if !inner.started {
            return;
        }
        for team in inner.teams.values() {
            let satisfied = team
                .depends_on()
                .iter()
                .all(|dep| inner.completed.contains(dep));
            if satisfied {
                team.hub().mark_ready();
            }
        }
    }
}

impl fmt::Debug for TeamManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("TeamManager")
            .field("teams", &inner.teams.keys().collect::<Vec<_>>())
            .field("completed", &inner.completed)
            .field("started", &inner.started)
            .finish()
    }
}
