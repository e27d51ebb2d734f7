//! Shared test infrastructure for triple-shot integration tests.
//!
//! Provides a scripted, in-process [`Orchestrator`]: instances are plain
//! directories, and "agents" are closures registered per actor (worker N,
//! reviewer N round R, the judge) that run shortly after `start_instance`
//! and typically write sentinel artifacts. This makes race-prone failure
//! paths deterministic without spawning a single real process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use uuid::Uuid;

use tripleshot_core::coordinator::CoordinatorCallbacks;
use tripleshot_core::events::{BusEvent, EventBus, Topic};
use tripleshot_core::host::{HostSession, InMemoryHostSession, InstanceInfo};
use tripleshot_core::orchestrator::{InstanceRequest, Orchestrator, Workspace};
use tripleshot_core::session::Phase;

// ---------------------------------------------------------------------------
// Actors & scripts
// ---------------------------------------------------------------------------

/// Who an instance is, derived from the title the coordinator assigns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Actor {
    Worker { attempt: usize, round: u32 },
    Reviewer { attempt: usize, round: u32 },
    Judge,
}

/// Environment handed to a script when it runs.
pub struct ScriptEnv<'a> {
    /// The instance's working directory.
    pub dir: &'a Path,
    pub instance_id: &'a str,
    orchestrator: &'a ScriptedOrchestrator,
}

impl ScriptEnv<'_> {
    /// Record captured "agent output" for this instance, readable through
    /// `instance_output` (the judge free-text fallback).
    pub fn set_output(&self, text: &str) {
        let mut outputs = self
            .orchestrator
            .outputs
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        outputs.insert(self.instance_id.to_owned(), text.to_owned());
    }
}

type ScriptFn = Box<dyn Fn(&ScriptEnv<'_>) + Send + Sync>;

struct Script {
    delay: Duration,
    action: Option<ScriptFn>,
    /// When false the instance never reports as exited.
    finishes: bool,
}

/// One `start_instance` call, for assertions.
#[derive(Debug, Clone)]
pub struct StartedInstance {
    pub actor: Option<Actor>,
    pub instance_id: String,
    pub title: String,
    pub prompt: String,
}

// ---------------------------------------------------------------------------
// ScriptedOrchestrator
// ---------------------------------------------------------------------------

/// In-process orchestrator whose instances are directories and whose agents
/// are registered closures.
pub struct ScriptedOrchestrator {
    host: Arc<InMemoryHostSession>,
    root: PathBuf,
    weak_self: std::sync::Weak<ScriptedOrchestrator>,
    scripts: Mutex<HashMap<Actor, Script>>,
    titles: Mutex<HashMap<String, String>>,
    pending: Mutex<HashMap<String, InstanceRequest>>,
    running: Mutex<HashMap<String, bool>>,
    outputs: Mutex<HashMap<String, String>>,
    started: Mutex<Vec<StartedInstance>>,
    save_count: AtomicUsize,
}

impl ScriptedOrchestrator {
    /// Create an orchestrator rooted at `root` (instance directories are
    /// created beneath it).
    pub fn new(root: impl Into<PathBuf>) -> Arc<Self> {
        let root = root.into();
        Arc::new_cyclic(|weak_self| Self {
            host: Arc::new(InMemoryHostSession::new()),
            root,
            weak_self: weak_self.clone(),
            scripts: Mutex::new(HashMap::new()),
            titles: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            outputs: Mutex::new(HashMap::new()),
            started: Mutex::new(Vec::new()),
            save_count: AtomicUsize::new(0),
        })
    }

    pub fn host(&self) -> Arc<InMemoryHostSession> {
        Arc::clone(&self.host)
    }

    /// Register a script for an actor, run ~10ms after its instance starts.
    pub fn on(&self, actor: Actor, action: impl Fn(&ScriptEnv<'_>) + Send + Sync + 'static) {
        self.on_with_delay(actor, Duration::from_millis(10), action);
    }

    /// Register a script with an explicit delay before it runs.
    pub fn on_with_delay(
        &self,
        actor: Actor,
        delay: Duration,
        action: impl Fn(&ScriptEnv<'_>) + Send + Sync + 'static,
    ) {
        let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
        scripts.insert(
            actor,
            Script {
                delay,
                action: Some(Box::new(action)),
                finishes: true,
            },
        );
    }

    /// Register an actor that runs forever without producing anything.
    pub fn hang(&self, actor: Actor) {
        let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
        scripts.insert(
            actor,
            Script {
                delay: Duration::ZERO,
                action: None,
                finishes: false,
            },
        );
    }

    /// Every `start_instance` call so far, in order.
    pub fn started(&self) -> Vec<StartedInstance> {
        self.started.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// How many times `save_session` was invoked.
    pub fn save_count(&self) -> usize {
        self.save_count.load(Ordering::SeqCst)
    }

    fn materialize(&self, workspace: &Workspace) -> Result<(PathBuf, Option<String>)> {
        match workspace {
            Workspace::FreshWorktree { branch } => {
                let dir = self.root.join(branch.replace('/', "--"));
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
                Ok((dir, Some(branch.clone())))
            }
            Workspace::Existing { dir } => {
                if !dir.is_dir() {
                    bail!("working directory {} does not exist", dir.display());
                }
                Ok((dir.clone(), None))
            }
        }
    }

    fn register(&self, info: &InstanceInfo, title: &str) {
        self.host.register_instance(info.clone());
        let mut titles = self.titles.lock().unwrap_or_else(|e| e.into_inner());
        titles.insert(info.id.clone(), title.to_owned());
    }

    fn set_running(&self, instance_id: &str, value: bool) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.insert(instance_id.to_owned(), value);
    }
}

/// Derive the actor from the titles the coordinator assigns:
/// `Attempt N`, `Attempt N (round R)`, `Reviewer N (round R)`, `Judge`.
pub fn parse_actor(title: &str) -> Option<Actor> {
    if title == "Judge" {
        return Some(Actor::Judge);
    }
    let (kind, rest) = title.split_once(' ')?;
    let (number, round) = match rest.split_once(" (round ") {
        Some((n, r)) => (n, r.strip_suffix(')')?.parse().ok()?),
        None => (rest, 1),
    };
    let attempt = number.parse::<usize>().ok()?.checked_sub(1)?;
    match kind {
        "Attempt" => Some(Actor::Worker { attempt, round }),
        "Reviewer" => Some(Actor::Reviewer { attempt, round }),
        _ => None,
    }
}

#[async_trait]
impl Orchestrator for ScriptedOrchestrator {
    async fn create_instance(&self, req: &InstanceRequest) -> Result<InstanceInfo> {
        let (working_dir, branch) = self.materialize(&req.workspace)?;
        let info = InstanceInfo {
            id: format!("inst-{}", Uuid::new_v4().simple()),
            working_dir,
            branch,
        };
        self.register(&info, &req.title);
        Ok(info)
    }

    async fn create_stub_instance(&self, req: &InstanceRequest) -> Result<InstanceInfo> {
        let info = InstanceInfo {
            id: format!("inst-{}", Uuid::new_v4().simple()),
            working_dir: self.root.clone(),
            branch: None,
        };
        self.register(&info, &req.title);
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.insert(info.id.clone(), req.clone());
        Ok(info)
    }

    async fn complete_stub_setup(&self, instance_id: &str) -> Result<InstanceInfo> {
        let req = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending
                .remove(instance_id)
                .with_context(|| format!("no pending stub for {instance_id}"))?
        };
        let (working_dir, branch) = self.materialize(&req.workspace)?;
        let info = InstanceInfo {
            id: instance_id.to_owned(),
            working_dir,
            branch,
        };
        self.host.register_instance(info.clone());
        Ok(info)
    }

    async fn start_instance(&self, instance_id: &str, prompt: &str) -> Result<()> {
        let info = self
            .host
            .instance(instance_id)
            .with_context(|| format!("instance {instance_id} not found"))?;
        let title = {
            let titles = self.titles.lock().unwrap_or_else(|e| e.into_inner());
            titles.get(instance_id).cloned().unwrap_or_default()
        };
        let actor = parse_actor(&title);

        {
            let mut started = self.started.lock().unwrap_or_else(|e| e.into_inner());
            started.push(StartedInstance {
                actor,
                instance_id: instance_id.to_owned(),
                title: title.clone(),
                prompt: prompt.to_owned(),
            });
        }

        let script = {
            let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
            match actor.and_then(|a| scripts.get_mut(&a)) {
                Some(script) => Some((
                    script.delay,
                    script.action.take(),
                    script.finishes,
                )),
                None => None,
            }
        };

        let Some((delay, action, finishes)) = script else {
            // No script: the "agent" exits immediately, producing nothing.
            self.set_running(instance_id, false);
            return Ok(());
        };

        if !finishes {
            self.set_running(instance_id, true);
            return Ok(());
        }

        self.set_running(instance_id, true);
        let this = self
            .weak_self
            .upgrade()
            .context("scripted orchestrator dropped")?;
        let id = instance_id.to_owned();
        let dir = info.working_dir.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(action) = action {
                let env = ScriptEnv {
                    dir: &dir,
                    instance_id: &id,
                    orchestrator: &this,
                };
                action(&env);
            }
            this.set_running(&id, false);
        });
        Ok(())
    }

    async fn save_session(&self) -> Result<()> {
        self.save_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_instance_running(&self, instance_id: &str) -> bool {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.get(instance_id).copied().unwrap_or(false)
    }

    fn instance_output(&self, instance_id: &str) -> Result<String> {
        let outputs = self.outputs.lock().unwrap_or_else(|e| e.into_inner());
        outputs
            .get(instance_id)
            .cloned()
            .with_context(|| format!("no captured output for {instance_id}"))
    }
}

// ---------------------------------------------------------------------------
// Artifact writers
// ---------------------------------------------------------------------------

/// Write a worker completion artifact.
pub fn write_completion(dir: &Path, attempt_index: i32, status: &str, summary: &str) {
    write_json(
        dir,
        tripleshot_core::artifact::COMPLETION_ARTIFACT,
        serde_json::json!({
            "attempt_index": attempt_index,
            "status": status,
            "summary": summary,
            "files_modified": ["src/lib.rs"],
            "approach": "scripted",
            "notes": "test artifact",
        }),
    );
}

/// Write an adversarial review artifact.
pub fn write_review(
    dir: &Path,
    attempt_index: i32,
    round: i32,
    approved: bool,
    score: i32,
    issues: &[&str],
) {
    write_json(
        dir,
        tripleshot_core::artifact::REVIEW_ARTIFACT,
        serde_json::json!({
            "attempt_index": attempt_index,
            "round": round,
            "approved": approved,
            "score": score,
            "issues": issues,
            "summary": "scripted review",
            "required_changes": issues,
        }),
    );
}

/// Write a judge evaluation artifact.
pub fn write_evaluation(dir: &Path, winner_index: i32, merge_strategy: &str, reasoning: &str) {
    write_json(
        dir,
        tripleshot_core::artifact::EVALUATION_ARTIFACT,
        serde_json::json!({
            "winner_index": winner_index,
            "merge_strategy": merge_strategy,
            "reasoning": reasoning,
        }),
    );
}

/// Write arbitrary JSON under an artifact name.
pub fn write_json(dir: &Path, name: &str, value: serde_json::Value) {
    std::fs::write(dir.join(name), serde_json::to_string_pretty(&value).unwrap())
        .expect("failed to write artifact");
}

/// Write raw bytes under an artifact name (for malformed-artifact tests).
pub fn write_raw(dir: &Path, name: &str, contents: &str) {
    std::fs::write(dir.join(name), contents).expect("failed to write artifact");
}

// ---------------------------------------------------------------------------
// Callback log
// ---------------------------------------------------------------------------

/// Records coordinator callbacks as formatted strings for assertions.
#[derive(Default)]
pub struct CallbackLog {
    events: Mutex<Vec<String>>,
}

impl CallbackLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, event: String) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.events().iter().any(|e| e.contains(needle))
    }

    /// A full callback record wired to this log.
    pub fn callbacks(self: &Arc<Self>) -> CoordinatorCallbacks {
        let log = |this: &Arc<Self>| {
            let this = Arc::clone(this);
            move |event: String| this.record(event)
        };

        let phase = log(self);
        let attempt_start = log(self);
        let attempt_complete = log(self);
        let attempt_failed = log(self);
        let judge_start = log(self);
        let evaluation_ready = log(self);
        let complete = log(self);
        let reviewer_start = log(self);
        let review_approved = log(self);
        let review_rejected = log(self);

        CoordinatorCallbacks {
            on_phase_change: Some(Arc::new(move |p: Phase| phase(format!("phase:{p}")))),
            on_attempt_start: Some(Arc::new(move |i, id| {
                attempt_start(format!("attempt_start:{i}:{id}"));
            })),
            on_attempt_complete: Some(Arc::new(move |i| {
                attempt_complete(format!("attempt_complete:{i}"));
            })),
            on_attempt_failed: Some(Arc::new(move |i, reason| {
                attempt_failed(format!("attempt_failed:{i}:{reason}"));
            })),
            on_judge_start: Some(Arc::new(move |id| judge_start(format!("judge_start:{id}")))),
            on_evaluation_ready: Some(Arc::new(move |eval| {
                evaluation_ready(format!("evaluation_ready:winner={}", eval.winner_index));
            })),
            on_complete: Some(Arc::new(move |ok, summary| {
                complete(format!("complete:{ok}:{summary}"));
            })),
            on_reviewer_start: Some(Arc::new(move |i, id| {
                reviewer_start(format!("reviewer_start:{i}:{id}"));
            })),
            on_review_approved: Some(Arc::new(move |i, score| {
                review_approved(format!("review_approved:{i}:{score}"));
            })),
            on_review_rejected: Some(Arc::new(move |i, score, issues| {
                review_rejected(format!("review_rejected:{i}:{score}:{}", issues.join(",")));
            })),
        }
    }
}

// ---------------------------------------------------------------------------
// Bus log
// ---------------------------------------------------------------------------

/// Records every bus event as a formatted string for order and
/// exactly-once assertions.
pub struct BusLog {
    events: Mutex<Vec<String>>,
}

impl BusLog {
    /// Subscribe to every topic on `bus`.
    pub fn attach(bus: &Arc<EventBus>) -> Arc<Self> {
        let log = Arc::new(Self {
            events: Mutex::new(Vec::new()),
        });
        for topic in [
            Topic::TeamCompleted,
            Topic::BridgeTaskStarted,
            Topic::BridgeTaskCompleted,
            Topic::AttemptCompleted,
            Topic::JudgeCompleted,
        ] {
            let log_clone = Arc::clone(&log);
            bus.subscribe(topic, move |event| {
                log_clone.push(format_event(event));
            });
        }
        log
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of recorded events containing `needle`.
    pub fn count(&self, needle: &str) -> usize {
        self.events().iter().filter(|e| e.contains(needle)).count()
    }

    /// Position of the first event containing `needle`.
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.events().iter().position(|e| e.contains(needle))
    }
}

fn format_event(event: &BusEvent) -> String {
    match event {
        BusEvent::TeamCompleted {
            team_id, success, ..
        } => format!("team.completed:{team_id}:{success}"),
        BusEvent::BridgeTaskStarted {
            team_id, task_id, ..
        } => format!("bridge.task_started:{team_id}:{task_id}"),
        BusEvent::BridgeTaskCompleted {
            team_id,
            task_id,
            success,
            ..
        } => format!("bridge.task_completed:{team_id}:{task_id}:{success}"),
        BusEvent::AttemptCompleted {
            attempt_index,
            success,
            ..
        } => format!("tripleshot.attempt_completed:{attempt_index}:{success}"),
        BusEvent::JudgeCompleted { success, .. } => {
            format!("tripleshot.judge_completed:{success}")
        }
    }
}

// ---------------------------------------------------------------------------
// Polling helpers
// ---------------------------------------------------------------------------

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
/// Returns whether the condition was met.
pub async fn wait_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
