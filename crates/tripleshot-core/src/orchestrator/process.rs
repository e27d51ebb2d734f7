//! Local orchestrator: one agent CLI subprocess per instance.
//!
//! Spawns the configured agent command (default `claude -p`) in the
//! instance's working directory, hands the prompt over on stdin, and
//! captures combined output to a per-instance log file under the state
//! directory so the judge fallback and postmortems can read it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use uuid::Uuid;

use crate::host::{HostSession, InMemoryHostSession, InstanceInfo};
use crate::worktree::WorktreeManager;

use super::{InstanceRequest, Orchestrator, Workspace};

/// Per-instance bookkeeping.
struct ProcessState {
    child: Child,
}

/// Local subprocess-backed [`Orchestrator`].
pub struct LocalAgentOrchestrator {
    /// Agent command and leading arguments, e.g. `["claude", "-p"]`.
    agent_command: Vec<String>,
    worktrees: WorktreeManager,
    host: Arc<InMemoryHostSession>,
    /// Holds logs and the persisted session snapshot.
    state_dir: PathBuf,
    processes: tokio::sync::Mutex<HashMap<String, ProcessState>>,
    /// Stub instances whose workspace setup is still pending.
    pending: Mutex<HashMap<String, InstanceRequest>>,
}

impl LocalAgentOrchestrator {
    /// Create an orchestrator spawning `agent_command` for each instance.
    ///
    /// `state_dir` is created if missing.
    pub fn new(
        agent_command: Vec<String>,
        worktrees: WorktreeManager,
        host: Arc<InMemoryHostSession>,
        state_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        if agent_command.is_empty() {
            bail!("agent command must not be empty");
        }
        let state_dir = state_dir.into();
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;
        Ok(Self {
            agent_command,
            worktrees,
            host,
            state_dir,
            processes: tokio::sync::Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// The shared host session this orchestrator registers instances in.
    pub fn host(&self) -> Arc<InMemoryHostSession> {
        Arc::clone(&self.host)
    }

    fn log_path(&self, instance_id: &str) -> PathBuf {
        self.state_dir.join(format!("{instance_id}.log"))
    }

    fn materialize_workspace(&self, workspace: &Workspace) -> Result<(PathBuf, Option<String>)> {
        match workspace {
            Workspace::FreshWorktree { branch } => {
                let info = self
                    .worktrees
                    .create_worktree(branch)
                    .with_context(|| format!("failed to create worktree for branch {branch}"))?;
                Ok((info.path, info.branch))
            }
            Workspace::Existing { dir } => {
                if !dir.is_dir() {
                    bail!("working directory {} does not exist", dir.display());
                }
                Ok((dir.clone(), None))
            }
        }
    }

    /// Terminate one instance's process, if it is still running.
    pub async fn kill_instance(&self, instance_id: &str) -> Result<()> {
        let mut processes = self.processes.lock().await;
        if let Some(mut state) = processes.remove(instance_id) {
            state.child.start_kill().ok();
            state.child.wait().await.ok();
        }
        Ok(())
    }

    /// Terminate every spawned process. Used on shutdown.
    pub async fn shutdown(&self) {
        let mut processes = self.processes.lock().await;
        for (id, state) in processes.iter_mut() {
            if state.child.start_kill().is_ok() {
                tracing::debug!(instance_id = %id, "killed agent process");
            }
        }
        for (_, state) in processes.iter_mut() {
            state.child.wait().await.ok();
        }
        processes.clear();
    }
}

#[async_trait]
impl Orchestrator for LocalAgentOrchestrator {
    async fn create_instance(&self, req: &InstanceRequest) -> Result<InstanceInfo> {
        let (working_dir, branch) = self.materialize_workspace(&req.workspace)?;
        let info = InstanceInfo {
            id: format!("inst-{}", Uuid::new_v4().simple()),
            working_dir,
            branch,
        };
        self.host.register_instance(info.clone());
        if let Some(group) = self.host.group_by_id(&req.group_id) {
            group.add_instance(&info.id);
        }
        tracing::info!(
            instance_id = %info.id,
            title = %req.title,
            dir = %info.working_dir.display(),
            "created instance"
        );
        Ok(info)
    }

    async fn create_stub_instance(&self, req: &InstanceRequest) -> Result<InstanceInfo> {
        let info = InstanceInfo {
            id: format!("inst-{}", Uuid::new_v4().simple()),
            // Placeholder until complete_stub_setup materializes the workspace.
            working_dir: self.state_dir.clone(),
            branch: None,
        };
        self.host.register_instance(info.clone());
        if let Some(group) = self.host.group_by_id(&req.group_id) {
            group.add_instance(&info.id);
        }
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.insert(info.id.clone(), req.clone());
        Ok(info)
    }

    async fn complete_stub_setup(&self, instance_id: &str) -> Result<InstanceInfo> {
        let req = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending
                .remove(instance_id)
                .with_context(|| format!("no pending stub for instance {instance_id}"))?
        };
        let (working_dir, branch) = self.materialize_workspace(&req.workspace)?;
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

        let log = std::fs::File::create(self.log_path(instance_id))
            .with_context(|| format!("failed to create log file for {instance_id}"))?;
        let log_err = log
            .try_clone()
            .context("failed to clone log handle for stderr")?;

        let mut cmd = Command::new(&self.agent_command[0]);
        cmd.args(&self.agent_command[1..])
            .current_dir(&info.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn agent {:?}", self.agent_command[0]))?;

        // The agent reads the user prompt from stdin; close it so the agent
        // starts processing.
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .context("failed to write prompt to agent stdin")?;
            drop(stdin);
        }

        tracing::info!(
            instance_id = %instance_id,
            pid = child.id().unwrap_or(0),
            dir = %info.working_dir.display(),
            "started agent instance"
        );

        let mut processes = self.processes.lock().await;
        processes.insert(instance_id.to_owned(), ProcessState { child });
        Ok(())
    }

    async fn save_session(&self) -> Result<()> {
        // Minimal persistence: the set of known instances, enough for a host
        // to re-attach logs after a restart.
        let snapshot: Vec<serde_json::Value> = {
            let mut rows = Vec::new();
            let processes = self.processes.lock().await;
            for id in processes.keys() {
                if let Some(info) = self.host.instance(id) {
                    rows.push(serde_json::json!({
                        "id": info.id,
                        "working_dir": info.working_dir,
                        "branch": info.branch,
                    }));
                }
            }
            rows
        };
        let path = self.state_dir.join("session.json");
        let contents = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(&path, contents)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    async fn is_instance_running(&self, instance_id: &str) -> bool {
        let mut processes = self.processes.lock().await;
        match processes.get_mut(instance_id) {
            Some(state) => match state.child.try_wait() {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(_) => false,
            },
            None => false,
        }
    }

    fn instance_output(&self, instance_id: &str) -> Result<String> {
        let path = self.log_path(instance_id);
        std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read instance output at {}", path.display()))
    }
}

impl std::fmt::Debug for LocalAgentOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAgentOrchestrator")
            .field("agent_command", &self.agent_command)
            .field("state_dir", &self.state_dir)
            .finish()
    }
}
