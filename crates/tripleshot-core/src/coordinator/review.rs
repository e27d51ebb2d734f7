//! The adversarial review gate.
//!
//! In adversarial mode each attempt's completion checker is replaced by
//! this gate: when the worker's completion artifact appears, the attempt
//! moves to `UnderReview` and a reviewer instance is spawned *in the same
//! worktree*. A rejection inside the round budget restarts the implementer
//! with the reviewer's feedback appended to the base prompt; approval or an
//! exhausted budget resolves the attempt.

use std::path::Path;
use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::artifact::{self, ArtifactError, ReviewArtifact};
use crate::bridge::{CompletionChecker, TaskOutcome};
use crate::host::InstanceInfo;
use crate::orchestrator::{InstanceRequest, Workspace};
use crate::session::{AttemptRound, AttemptStatus, Phase};
use crate::team::ClaimedTask;

use super::TripleShotCoordinator;
use super::checkers::commit_count_or_zero;
use super::prompts;

/// Round budget applied when the configured value is non-positive by the
/// time it reaches the gate (sessions built through `Session::new` have
/// already been normalized to the configuration default of 10).
const FALLBACK_REVIEW_ROUNDS: u32 = 3;

enum GatePhase {
    /// Waiting for the implementer's completion artifact.
    AwaitingCompletion,
    /// Waiting for the reviewer's review artifact.
    AwaitingReview,
}

/// Completion checker that interposes an implement/review loop.
pub(super) struct AdversarialGate {
    coordinator: Weak<TripleShotCoordinator>,
    attempt_index: usize,
    phase: tokio::sync::Mutex<GatePhase>,
}

impl AdversarialGate {
    pub(super) fn new(coordinator: Weak<TripleShotCoordinator>, attempt_index: usize) -> Self {
        Self {
            coordinator,
            attempt_index,
            phase: tokio::sync::Mutex::new(GatePhase::AwaitingCompletion),
        }
    }
}

#[async_trait]
impl CompletionChecker for AdversarialGate {
    async fn check(
        &self,
        task: &ClaimedTask,
        instance: &InstanceInfo,
    ) -> Result<Option<TaskOutcome>> {
        let coordinator = self
            .coordinator
            .upgrade()
            .context("coordinator dropped while attempt under review")?;

        // The worktree is stable across implementer restarts even though
        // the instance changes; every artifact check goes through it.
        let worktree = instance.working_dir.as_path();

        let mut phase = self.phase.lock().await;
        match &*phase {
            GatePhase::AwaitingCompletion => {
                self.check_completion(&coordinator, worktree, &mut phase).await
            }
            GatePhase::AwaitingReview => {
                self.check_review(&coordinator, task, worktree, &mut phase).await
            }
        }
    }
}

impl AdversarialGate {
    async fn check_completion(
        &self,
        coordinator: &Arc<TripleShotCoordinator>,
        worktree: &Path,
        phase: &mut GatePhase,
    ) -> Result<Option<TaskOutcome>> {
        let index = self.attempt_index;

        let completion = match artifact::load_completion(worktree) {
            Ok(completion) => completion,
            Err(e) if e.is_not_found() => {
                return self
                    .pending_or_dead(
                        coordinator,
                        worktree,
                        Liveness::Implementer,
                        "worker exited without writing a completion artifact",
                    )
                    .await;
            }
            Err(e @ (ArtifactError::Parse { .. } | ArtifactError::InvalidReview(_))) => {
                return Ok(Some(TaskOutcome::failure(format!(
                    "failed to parse completion artifact: {e}"
                ))));
            }
            Err(e) => return Err(e.into()),
        };

        // Completion observed: move the attempt under review.
        let (round, entered_review_phase, callbacks, task_text, min_score, group_id) = {
            let mut st = coordinator.lock();
            let entered = if st.session.phase == Phase::Working {
                st.session.transition_phase(Phase::AdversarialReview).is_ok()
            } else {
                false
            };
            let attempt = &mut st.session.attempts[index];
            if attempt.review_round == 0 {
                attempt.review_round = 1;
            }
            attempt.status = AttemptStatus::UnderReview;
            (
                attempt.review_round,
                entered,
                st.callbacks.clone(),
                st.session.task.clone(),
                st.session.config.effective_min_passing_score(),
                st.session.group_id.clone(),
            )
        };
        if entered_review_phase {
            callbacks.phase_change(Phase::AdversarialReview);
        }

        // A stale review from a previous round would be read immediately.
        if let Err(e) = artifact::remove_artifact(worktree, artifact::REVIEW_ARTIFACT) {
            tracing::warn!(error = %e, "failed to clear stale review artifact");
        }

        let prompt = prompts::reviewer_prompt(&task_text, index, round, &completion, min_score);
        let request = InstanceRequest {
            title: format!("Reviewer {} (round {round})", index + 1),
            group_id,
            workspace: Workspace::Existing {
                dir: worktree.to_path_buf(),
            },
        };
        let reviewer = match coordinator.orchestrator.create_instance(&request).await {
            Ok(reviewer) => reviewer,
            Err(e) => {
                return Ok(Some(TaskOutcome::failure(format!(
                    "failed to spawn reviewer: {e}"
                ))));
            }
        };
        if let Err(e) = coordinator
            .orchestrator
            .start_instance(&reviewer.id, &prompt)
            .await
        {
            return Ok(Some(TaskOutcome::failure(format!(
                "failed to start reviewer: {e}"
            ))));
        }

        coordinator.lock().session.attempts[index].reviewer_id = Some(reviewer.id.clone());
        callbacks.reviewer_start(index, &reviewer.id);

        tracing::info!(
            attempt = index,
            round,
            reviewer_id = %reviewer.id,
            "attempt under adversarial review"
        );
        *phase = GatePhase::AwaitingReview;
        Ok(None)
    }

    async fn check_review(
        &self,
        coordinator: &Arc<TripleShotCoordinator>,
        task: &ClaimedTask,
        worktree: &Path,
        phase: &mut GatePhase,
    ) -> Result<Option<TaskOutcome>> {
        let review = match artifact::load_review(worktree) {
            Ok(review) => review,
            Err(e) if e.is_not_found() => {
                return self
                    .pending_or_dead(
                        coordinator,
                        worktree,
                        Liveness::Reviewer,
                        "reviewer exited without writing a review artifact",
                    )
                    .await;
            }
            Err(e @ (ArtifactError::Parse { .. } | ArtifactError::InvalidReview(_))) => {
                // Clean up so a later pass cannot re-read the bad file.
                if let Err(remove_err) =
                    artifact::remove_artifact(worktree, artifact::REVIEW_ARTIFACT)
                {
                    tracing::warn!(error = %remove_err, "failed to remove review artifact");
                }
                return Ok(Some(TaskOutcome::failure(format!(
                    "failed to parse review artifact: {e}"
                ))));
            }
            Err(e) => return Err(e.into()),
        };

        // The review artifact is consumed regardless of its verdict.
        if let Err(e) = artifact::remove_artifact(worktree, artifact::REVIEW_ARTIFACT) {
            tracing::warn!(error = %e, "failed to remove review artifact");
        }

        self.decide(coordinator, task, worktree, review, phase).await
    }

    /// Apply a parsed review: approve, exhaust, or restart the implementer.
    async fn decide(
        &self,
        coordinator: &Arc<TripleShotCoordinator>,
        task: &ClaimedTask,
        worktree: &Path,
        review: ReviewArtifact,
        phase: &mut GatePhase,
    ) -> Result<Option<TaskOutcome>> {
        let index = self.attempt_index;
        let commit_count = commit_count_or_zero(worktree, &coordinator.options.base_branch);

        if review.approved {
            let callbacks = {
                let mut st = coordinator.lock();
                let attempt = &mut st.session.attempts[index];
                attempt.review_score = Some(review.score);
                attempt.review_approved = Some(true);
                attempt.status = AttemptStatus::Completed;
                attempt.completed_at = Some(Utc::now());
                let entry = AttemptRound {
                    round: attempt.review_round,
                    implementer_id: attempt.instance_id.clone().unwrap_or_default(),
                    reviewer_id: attempt.reviewer_id.clone().unwrap_or_default(),
                    subgroup_id: None,
                };
                attempt.round_history.push(entry);
                st.callbacks.clone()
            };
            callbacks.review_approved(index, review.score);
            tracing::info!(attempt = index, score = review.score, "review approved");
            return Ok(Some(TaskOutcome::success(commit_count)));
        }

        let issues: Vec<String> = review.issues.as_slice().to_vec();
        let (round, max_rounds, callbacks) = {
            let mut st = coordinator.lock();
            let configured = st.session.config.max_adversarial_rounds;
            let max_rounds = if configured == 0 {
                FALLBACK_REVIEW_ROUNDS
            } else {
                configured
            };
            let attempt = &mut st.session.attempts[index];
            attempt.review_score = Some(review.score);
            attempt.review_approved = Some(false);
            (attempt.review_round, max_rounds, st.callbacks.clone())
        };

        if round >= max_rounds {
            let reason = format!(
                "Exhausted {max_rounds} adversarial rounds without approval (final score: {}/10)",
                review.score
            );
            {
                let mut st = coordinator.lock();
                let attempt = &mut st.session.attempts[index];
                attempt.status = AttemptStatus::Failed;
                attempt.completed_at = Some(Utc::now());
                let entry = AttemptRound {
                    round,
                    implementer_id: attempt.instance_id.clone().unwrap_or_default(),
                    reviewer_id: attempt.reviewer_id.clone().unwrap_or_default(),
                    subgroup_id: None,
                };
                attempt.round_history.push(entry);
            }
            callbacks.review_rejected(index, review.score, &issues);
            tracing::warn!(attempt = index, rounds = max_rounds, "adversarial rounds exhausted");
            return Ok(Some(TaskOutcome {
                success: false,
                commit_count,
                error: Some(reason),
            }));
        }

        // Rounds remain: reject, then restart the implementer with the
        // reviewer's feedback.
        callbacks.review_rejected(index, review.score, &issues);

        let (new_round, group_id) = {
            let mut st = coordinator.lock();
            let attempt = &mut st.session.attempts[index];
            let entry = AttemptRound {
                round: attempt.review_round,
                implementer_id: attempt.instance_id.clone().unwrap_or_default(),
                reviewer_id: attempt.reviewer_id.clone().unwrap_or_default(),
                subgroup_id: None,
            };
            attempt.round_history.push(entry);
            attempt.review_round += 1;
            attempt.status = AttemptStatus::Working;
            (attempt.review_round, st.session.group_id.clone())
        };

        // The old completion artifact must go before a new implementer
        // starts, or the gate would see it as an instant finish.
        if let Err(e) = artifact::remove_artifact(worktree, artifact::COMPLETION_ARTIFACT) {
            tracing::warn!(error = %e, "failed to remove old completion artifact");
        }

        let prompt = prompts::implementer_feedback_prompt(&task.description, &review);
        let request = InstanceRequest {
            title: format!("Attempt {} (round {new_round})", index + 1),
            group_id,
            workspace: Workspace::Existing {
                dir: worktree.to_path_buf(),
            },
        };
        let implementer = match coordinator.orchestrator.create_instance(&request).await {
            Ok(implementer) => implementer,
            Err(e) => {
                return Ok(Some(TaskOutcome::failure(format!(
                    "failed to restart implementer: {e}"
                ))));
            }
        };
        if let Err(e) = coordinator
            .orchestrator
            .start_instance(&implementer.id, &prompt)
            .await
        {
            return Ok(Some(TaskOutcome::failure(format!(
                "failed to restart implementer: {e}"
            ))));
        }

        {
            let mut st = coordinator.lock();
            let attempt = &mut st.session.attempts[index];
            attempt.instance_id = Some(implementer.id.clone());
            attempt.reviewer_id = None;
        }
        tracing::info!(
            attempt = index,
            round = new_round,
            instance_id = %implementer.id,
            "implementer restarted with review feedback"
        );
        *phase = GatePhase::AwaitingCompletion;
        Ok(None)
    }

    /// Artifact not present: report pending while the relevant instance is
    /// alive; once it has exited (and a re-check still finds nothing), the
    /// attempt fails with `dead_reason`.
    async fn pending_or_dead(
        &self,
        coordinator: &Arc<TripleShotCoordinator>,
        worktree: &Path,
        who: Liveness,
        dead_reason: &str,
    ) -> Result<Option<TaskOutcome>> {
        let (instance_id, artifact_name) = {
            let st = coordinator.lock();
            let attempt = &st.session.attempts[self.attempt_index];
            match who {
                Liveness::Implementer => (
                    attempt.instance_id.clone(),
                    artifact::COMPLETION_ARTIFACT,
                ),
                Liveness::Reviewer => (attempt.reviewer_id.clone(), artifact::REVIEW_ARTIFACT),
            }
        };
        let Some(instance_id) = instance_id else {
            return Ok(None);
        };
        if coordinator
            .orchestrator
            .is_instance_running(&instance_id)
            .await
        {
            return Ok(None);
        }
        // One re-check guards the exit/write race; a hit is picked up by
        // the next poll.
        match artifact::find_artifact(worktree, artifact_name) {
            Ok(_) => Ok(None),
            Err(e) if e.is_not_found() => Ok(Some(TaskOutcome::failure(dead_reason))),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Clone, Copy)]
enum Liveness {
    Implementer,
    Reviewer,
}
