//! Judge startup and completion.
//!
//! The judge team is added dynamically after the third `team.completed`,
//! depending on all three attempt teams. Startup runs on its own task: it
//! performs async orchestrator work and publishes events, neither of which
//! is allowed inside a synchronous bus handler.

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use anyhow::{Context, Result};

use crate::artifact;
use crate::bridge::{Bridge, BridgeOptions, InstanceFactory, TracingRecorder};
use crate::events::BusEvent;
use crate::host::{InstanceInfo, deterministic_group_id};
use crate::orchestrator::{InstanceRequest, Workspace};
use crate::session::{AttemptStatus, Evaluation, MergeStrategy, Phase, Session, ATTEMPT_COUNT};
use crate::team::{ClaimedTask, PlannedTask, TeamRole, TeamSpec};

use super::checkers::JudgeArtifactChecker;
use super::prompts::{self, AttemptBrief};
use super::{JUDGE_TASK_ID, JUDGE_TEAM_ID, TripleShotCoordinator};

impl TripleShotCoordinator {
    /// Start the judge pipeline. Runs on a dedicated task spawned by the
    /// third `team.completed` handler.
    pub(super) async fn start_judge(self: &Arc<Self>) {
        // Too few successes: the session fails without a judge, and no
        // judge-completed event is published because no judge ever ran.
        let (task_text, attempt_snapshot, group_id, session_id) = {
            let st = self.lock();
            if !st.started {
                return;
            }
            if st.session.successful_attempt_count() < 2 {
                drop(st);
                self.fail_session("fewer than 2 attempts succeeded");
                return;
            }
            let attempts: Vec<(AttemptStatus, Option<String>)> = st
                .session
                .attempts
                .iter()
                .map(|a| (a.status, a.instance_id.clone()))
                .collect();
            (
                st.session.task.clone(),
                attempts,
                st.session.group_id.clone(),
                st.session.id,
            )
        };

        tracing::info!(session_id = %session_id, "all attempts ready, starting judge");

        // Inspect each completed attempt's artifact and worktree.
        let mut briefs = Vec::with_capacity(ATTEMPT_COUNT);
        let mut discovered: Vec<Option<(PathBuf, Option<String>)>> = vec![None; ATTEMPT_COUNT];
        for (index, (status, instance_id)) in attempt_snapshot.iter().enumerate() {
            briefs.push(self.inspect_attempt(
                index,
                *status,
                instance_id.as_deref(),
                &mut discovered[index],
            ));
        }

        // Write back what was discovered, format the judge prompt, and move
        // to Evaluating.
        let judge_prompt;
        let callbacks = {
            let mut st = self.lock();
            for (index, found) in discovered.into_iter().enumerate() {
                if let Some((worktree, branch)) = found {
                    let attempt = &mut st.session.attempts[index];
                    attempt.worktree = Some(worktree);
                    if branch.is_some() {
                        attempt.branch = branch;
                    }
                }
            }
            judge_prompt = prompts::judge_prompt(&task_text, &briefs);
            if let Err(e) = st.session.transition_phase(Phase::Evaluating) {
                tracing::warn!(error = %e, "cannot move to evaluating, session no longer eligible");
                return;
            }
            st.callbacks.clone()
        };
        callbacks.phase_change(Phase::Evaluating);
        self.spawn_save_session();

        self.regroup_implementers(&group_id, &session_id.simple().to_string(), &attempt_snapshot);

        if let Err(e) = self.add_judge_team(judge_prompt).await {
            self.fail_session(&format!("failed to start judge: {e}"));
        }
    }

    /// Build the judge-facing brief for one attempt, recording its worktree
    /// and branch when the completion artifact is readable.
    fn inspect_attempt(
        &self,
        index: usize,
        status: AttemptStatus,
        instance_id: Option<&str>,
        discovered: &mut Option<(PathBuf, Option<String>)>,
    ) -> AttemptBrief {
        let mut brief = AttemptBrief {
            index,
            instance_id: instance_id.unwrap_or_default().to_owned(),
            branch: String::new(),
            worktree: String::new(),
            summary: String::new(),
        };

        if status != AttemptStatus::Completed {
            brief.summary = prompts::placeholder_summary(index, "attempt failed");
            return brief;
        }
        let Some(id) = instance_id else {
            brief.summary = prompts::placeholder_summary(index, "no instance recorded");
            return brief;
        };
        let Some(info) = self.host.instance(id) else {
            brief.summary = prompts::placeholder_summary(index, "instance not found");
            return brief;
        };

        match artifact::load_completion(&info.working_dir) {
            Ok(completion) => {
                brief.summary = prompts::completion_summary(&completion);
                brief.worktree = info.working_dir.display().to_string();
                brief.branch = info.branch.clone().unwrap_or_default();
                *discovered = Some((info.working_dir, info.branch));
            }
            Err(e) => {
                tracing::warn!(
                    attempt = index,
                    error = %e,
                    "completion artifact unreadable at judge startup"
                );
                brief.summary =
                    prompts::placeholder_summary(index, &format!("completion unreadable: {e}"));
            }
        }
        brief
    }

    /// Move the worker instances into an "Implementers" sub-group so the
    /// judge renders at the top level. Hosts without sub-group support are
    /// left as-is.
    fn regroup_implementers(
        &self,
        group_id: &str,
        session_key: &str,
        attempts: &[(AttemptStatus, Option<String>)],
    ) {
        let Some(group) = self.host.group_by_id(group_id) else {
            return;
        };
        let subgroup_id = deterministic_group_id(session_key, "implementers");
        let Some(subgroup) = group.create_subgroup(&subgroup_id, "Implementers") else {
            return;
        };
        for (_, instance_id) in attempts {
            if let Some(id) = instance_id {
                subgroup.add_instance(id);
            }
        }
        group.set_instances(Vec::new());
        self.lock().session.implementers_group_id = Some(subgroup.id());
    }

    /// Add the judge team, disable its retries, and start its bridge.
    async fn add_judge_team(self: &Arc<Self>, judge_prompt: String) -> Result<()> {
        let (manager, cancel, attempt_team_ids) = {
            let st = self.lock();
            if !st.started {
                anyhow::bail!("coordinator stopped");
            }
            (
                st.manager.clone().context("team manager missing")?,
                st.cancel.clone().context("cancellation token missing")?,
                st.attempt_team_ids.clone(),
            )
        };

        let spec = TeamSpec {
            id: JUDGE_TEAM_ID.to_owned(),
            role: TeamRole::Review,
            size: 1,
            depends_on: attempt_team_ids.to_vec(),
            tasks: vec![PlannedTask::new(JUDGE_TASK_ID, judge_prompt)],
        };
        let team = manager
            .add_team_dynamic(spec)
            .context("failed to add judge team")?;
        team.hub()
            .set_max_retries(JUDGE_TASK_ID, 0)
            .context("failed to disable judge retries")?;

        let factory: Arc<dyn InstanceFactory> = Arc::new(JudgeInstanceFactory {
            coordinator: Arc::downgrade(self),
        });
        let bridge = Bridge::new(
            team,
            factory,
            Arc::new(JudgeArtifactChecker::new(Arc::clone(&self.orchestrator))),
            Arc::new(TracingRecorder),
            Arc::clone(&self.bus),
            BridgeOptions {
                poll_interval: self.options.poll_interval,
            },
        );
        bridge
            .start(&cancel)
            .context("failed to start judge bridge")?;
        self.lock().bridges.push(bridge);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Judge completion
    // -----------------------------------------------------------------

    /// Handle the judge team's `bridge.task_completed`.
    pub(super) fn on_judge_completed(
        self: &Arc<Self>,
        instance_id: &str,
        success: bool,
        error: Option<&str>,
    ) {
        {
            let st = self.lock();
            if !st.started {
                return;
            }
        }

        if !success {
            self.fail_judge(error.unwrap_or("judge task failed"));
            return;
        }

        let Some(info) = self.host.instance(instance_id) else {
            self.fail_judge(&format!("judge instance {instance_id} not found"));
            return;
        };

        let evaluation = match artifact::load_evaluation(&info.working_dir) {
            Ok(evaluation) => evaluation,
            Err(e) if e.is_not_found() => {
                // Free-text fallback: the evaluation JSON between
                // <evaluation> tags in the judge's captured output.
                match self.orchestrator.instance_output(instance_id) {
                    Ok(output) => match artifact::evaluation_from_output(&output) {
                        Ok(evaluation) => evaluation,
                        Err(e) => {
                            self.fail_judge(&format!("failed to parse evaluation: {e}"));
                            return;
                        }
                    },
                    Err(e) => {
                        self.fail_judge(&format!(
                            "failed to parse evaluation: judge output unavailable: {e}"
                        ));
                        return;
                    }
                }
            }
            Err(e) => {
                self.fail_judge(&format!("failed to parse evaluation artifact: {e}"));
                return;
            }
        };

        let (callbacks, summary) = {
            let mut st = self.lock();
            if st.session.phase.is_terminal() {
                return;
            }
            st.session.judge_id = Some(instance_id.to_owned());
            st.session.evaluation = Some(evaluation.clone());
            if let Err(e) = st.session.transition_phase(Phase::Complete) {
                tracing::error!(error = %e, "failed to transition session to complete");
                return;
            }
            // Summarized under the lock so the branch read is consistent
            // with what get_winning_branch would return.
            let summary = judge_summary(&st.session, &evaluation);
            (st.callbacks.clone(), summary)
        };

        callbacks.evaluation_ready(&evaluation);
        callbacks.phase_change(Phase::Complete);
        callbacks.complete(true, &summary);
        self.bus.publish(BusEvent::JudgeCompleted {
            team_id: JUDGE_TEAM_ID.to_owned(),
            success: true,
        });
        self.spawn_save_session();
    }

    /// Terminal failure in the judge pipeline after the judge logically
    /// ran: fail the session and publish the judge-completed event exactly
    /// once.
    pub(super) fn fail_judge(&self, reason: &str) {
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
        tracing::warn!(reason, "judge pipeline failed");
        callbacks.phase_change(Phase::Failed);
        callbacks.complete(false, reason);
        self.bus.publish(BusEvent::JudgeCompleted {
            team_id: JUDGE_TEAM_ID.to_owned(),
            success: false,
        });
        self.spawn_save_session();
    }
}

/// The one-line outcome summary handed to `OnComplete`.
fn judge_summary(session: &Session, evaluation: &Evaluation) -> String {
    let in_range = (0..ATTEMPT_COUNT as i32).contains(&evaluation.winner_index);
    if evaluation.merge_strategy == MergeStrategy::Select && in_range {
        let index = evaluation.winner_index as usize;
        let branch = session.attempts[index].branch.clone().unwrap_or_default();
        format!(
            "Selected attempt {} (branch: {}). Reasoning: {}",
            index + 1,
            branch,
            evaluation.reasoning.as_str()
        )
    } else {
        format!(
            "Strategy: {}. Reasoning: {}",
            evaluation.merge_strategy,
            evaluation.reasoning.as_str()
        )
    }
}

// ---------------------------------------------------------------------------
// Judge instance factory
// ---------------------------------------------------------------------------

/// Creates the judge instance in the session's base directory.
struct JudgeInstanceFactory {
    coordinator: Weak<TripleShotCoordinator>,
}

#[async_trait::async_trait]
impl InstanceFactory for JudgeInstanceFactory {
    async fn create(&self, task: &ClaimedTask) -> Result<InstanceInfo> {
        let coordinator = self
            .coordinator
            .upgrade()
            .context("coordinator dropped before judge creation")?;
        coordinator.create_judge_instance(task).await
    }
}

impl TripleShotCoordinator {
    async fn create_judge_instance(self: &Arc<Self>, task: &ClaimedTask) -> Result<InstanceInfo> {
        let group_id = self.lock().session.group_id.clone();
        let request = InstanceRequest {
            title: "Judge".to_owned(),
            group_id,
            workspace: Workspace::Existing {
                dir: self.base_dir.clone(),
            },
        };
        let info = self
            .orchestrator
            .create_instance(&request)
            .await
            .context("failed to create judge instance")?;

        // A leftover evaluation from an earlier run would be read as an
        // instant verdict.
        if let Err(e) =
            artifact::remove_artifact(&info.working_dir, artifact::EVALUATION_ARTIFACT)
        {
            tracing::warn!(error = %e, "failed to clear stale evaluation artifact");
        }

        self.orchestrator
            .start_instance(&info.id, &task.description)
            .await
            .context("failed to start judge instance")?;
        Ok(info)
    }
}
