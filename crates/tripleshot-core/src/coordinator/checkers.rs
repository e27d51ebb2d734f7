//! Completion checkers backed by sentinel artifacts.
//!
//! The worker checker watches for the completion artifact in the attempt's
//! worktree; the judge checker watches for (and validates) the evaluation
//! artifact. Both distinguish "not finished yet" from "exited without
//! writing anything" via the orchestrator's liveness probe.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::artifact::{self, ArtifactError};
use crate::bridge::{CompletionChecker, TaskOutcome};
use crate::host::InstanceInfo;
use crate::orchestrator::Orchestrator;
use crate::team::ClaimedTask;
use crate::worktree;

/// Commits on the attempt branch, best-effort: a worktree that is not a
/// git checkout (or has no such base) counts as zero.
pub(crate) fn commit_count_or_zero(dir: &std::path::Path, base: &str) -> u32 {
    match worktree::commit_count_in_dir(dir, base) {
        Ok(count) => count,
        Err(e) => {
            tracing::debug!(dir = %dir.display(), error = %e, "commit count unavailable");
            0
        }
    }
}

// ---------------------------------------------------------------------------
// Worker completion
// ---------------------------------------------------------------------------

/// Watches an attempt worktree for the worker's completion artifact.
pub(crate) struct WorkerArtifactChecker {
    orchestrator: Arc<dyn Orchestrator>,
    base_branch: String,
}

impl WorkerArtifactChecker {
    pub(crate) fn new(orchestrator: Arc<dyn Orchestrator>, base_branch: String) -> Self {
        Self {
            orchestrator,
            base_branch,
        }
    }
}

#[async_trait]
impl CompletionChecker for WorkerArtifactChecker {
    async fn check(
        &self,
        _task: &ClaimedTask,
        instance: &InstanceInfo,
    ) -> Result<Option<TaskOutcome>> {
        match artifact::load_completion(&instance.working_dir) {
            Ok(completion) => {
                let commits = commit_count_or_zero(&instance.working_dir, &self.base_branch);
                if completion.succeeded() {
                    Ok(Some(TaskOutcome::success(commits)))
                } else {
                    let detail = if completion.summary.is_empty() {
                        "worker reported failure".to_string()
                    } else {
                        format!("worker reported failure: {}", completion.summary)
                    };
                    Ok(Some(TaskOutcome {
                        success: false,
                        commit_count: commits,
                        error: Some(detail),
                    }))
                }
            }
            Err(e) if e.is_not_found() => {
                if self.orchestrator.is_instance_running(&instance.id).await {
                    return Ok(None);
                }
                // The worker exited; one re-check guards the write race.
                match artifact::load_completion(&instance.working_dir) {
                    Ok(_) => Ok(None),
                    Err(e) if e.is_not_found() => Ok(Some(TaskOutcome::failure(
                        "worker exited without writing a completion artifact",
                    ))),
                    Err(e) => classify_worker_error(e),
                }
            }
            Err(e) => classify_worker_error(e),
        }
    }
}

fn classify_worker_error(e: ArtifactError) -> Result<Option<TaskOutcome>> {
    match e {
        ArtifactError::Parse { .. } | ArtifactError::InvalidReview(_) => Ok(Some(
            TaskOutcome::failure(format!("failed to parse completion artifact: {e}")),
        )),
        // I/O errors other than not-found propagate unchanged.
        other => Err(other.into()),
    }
}

// ---------------------------------------------------------------------------
// Judge evaluation
// ---------------------------------------------------------------------------

/// Watches the judge's working directory for a valid evaluation artifact,
/// falling back to `<evaluation>` tags in the judge's captured output when
/// the process exits without the file.
pub(crate) struct JudgeArtifactChecker {
    orchestrator: Arc<dyn Orchestrator>,
}

impl JudgeArtifactChecker {
    pub(crate) fn new(orchestrator: Arc<dyn Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl CompletionChecker for JudgeArtifactChecker {
    async fn check(
        &self,
        _task: &ClaimedTask,
        instance: &InstanceInfo,
    ) -> Result<Option<TaskOutcome>> {
        match artifact::load_evaluation(&instance.working_dir) {
            Ok(_) => Ok(Some(TaskOutcome::success(0))),
            Err(e) if e.is_not_found() => {
                if self.orchestrator.is_instance_running(&instance.id).await {
                    return Ok(None);
                }
                match artifact::load_evaluation(&instance.working_dir) {
                    Ok(_) => return Ok(Some(TaskOutcome::success(0))),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return classify_judge_error(e),
                }
                // Exited without the artifact: accept tagged output instead.
                match self.orchestrator.instance_output(&instance.id) {
                    Ok(output) => match artifact::evaluation_from_output(&output) {
                        Ok(_) => Ok(Some(TaskOutcome::success(0))),
                        Err(ArtifactError::MissingEvaluationBlock) => {
                            Ok(Some(TaskOutcome::failure(
                                "judge exited without writing an evaluation artifact",
                            )))
                        }
                        Err(e) => Ok(Some(TaskOutcome::failure(format!(
                            "failed to parse evaluation from judge output: {e}"
                        )))),
                    },
                    Err(e) => Ok(Some(TaskOutcome::failure(format!(
                        "judge exited without an evaluation and its output is unreadable: {e}"
                    )))),
                }
            }
            Err(e) => classify_judge_error(e),
        }
    }
}

fn classify_judge_error(e: ArtifactError) -> Result<Option<TaskOutcome>> {
    match e {
        ArtifactError::Parse { .. } => Ok(Some(TaskOutcome::failure(format!(
            "failed to parse evaluation artifact: {e}"
        )))),
        other => Err(other.into()),
    }
}
