//! The seam for spawning and managing agent instances.
//!
//! The coordinator consumes this narrow interface; the host application
//! decides what an "instance" actually is. [`process::LocalAgentOrchestrator`]
//! provides the local implementation that spawns an agent CLI subprocess
//! per instance.

pub mod process;

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

use crate::host::InstanceInfo;

/// Where a new instance's working directory comes from.
#[derive(Debug, Clone)]
pub enum Workspace {
    /// Create a fresh git worktree on the given branch.
    FreshWorktree { branch: String },
    /// Run in an existing directory (e.g. another instance's worktree).
    Existing { dir: PathBuf },
}

/// Request to create an agent instance.
#[derive(Debug, Clone)]
pub struct InstanceRequest {
    /// Human-facing title shown in the host UI.
    pub title: String,
    /// Host group the instance renders under.
    pub group_id: String,
    pub workspace: Workspace,
}

/// Operations the coordinator invokes on the host orchestrator.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Create an instance with its workspace ready, but not yet running.
    async fn create_instance(&self, req: &InstanceRequest) -> Result<InstanceInfo>;

    /// Create a placeholder instance visible in the host UI while its
    /// workspace setup is still pending.
    async fn create_stub_instance(&self, req: &InstanceRequest) -> Result<InstanceInfo>;

    /// Finish workspace setup for a stub and return the updated info.
    async fn complete_stub_setup(&self, instance_id: &str) -> Result<InstanceInfo>;

    /// Start the instance's agent with the given prompt.
    async fn start_instance(&self, instance_id: &str, prompt: &str) -> Result<()>;

    /// Persist host session state. Best-effort hook; callers log failures.
    async fn save_session(&self) -> Result<()>;

    /// Whether the instance's agent is still running. Completion checkers
    /// use this to distinguish "not finished yet" from "exited without
    /// writing its artifact".
    async fn is_instance_running(&self, instance_id: &str) -> bool;

    /// Captured textual output of an instance, used for the judge's
    /// free-text evaluation fallback. Synchronous: implementations read
    /// already-captured output, they do not wait for the instance.
    fn instance_output(&self, instance_id: &str) -> Result<String>;
}

// Compile-time assertion: Orchestrator must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Orchestrator) {}
};
