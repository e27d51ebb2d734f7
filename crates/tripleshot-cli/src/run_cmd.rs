//! `tripleshot run`: drive one triple-shot session to completion.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use tripleshot_core::coordinator::{
    CoordinatorCallbacks, CoordinatorOptions, TripleShotCoordinator,
};
use tripleshot_core::events::EventBus;
use tripleshot_core::host::{HostSession, InMemoryHostSession};
use tripleshot_core::orchestrator::Orchestrator;
use tripleshot_core::orchestrator::process::LocalAgentOrchestrator;
use tripleshot_core::session::{MergeStrategy, Session};
use tripleshot_core::worktree::{MergeResult, WorktreeManager};

use crate::config::TripleshotConfig;

/// The session-type tag groups are registered under.
const GROUP_KIND: &str = "tripleshot";

pub struct RunArgs {
    pub task: String,
    pub repo: PathBuf,
    pub poll_interval_ms: u64,
}

/// Run the `run` subcommand.
pub async fn run(args: RunArgs, config: TripleshotConfig) -> Result<()> {
    let repo = args
        .repo
        .canonicalize()
        .with_context(|| format!("repository path {} not found", args.repo.display()))?;

    println!("Running triple-shot task in {}", repo.display());
    println!("  Agent: {}", config.agent_command.join(" "));
    println!("  Adversarial: {}", config.session.adversarial);

    let worktrees = WorktreeManager::new(&repo, None)
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("repository is not usable for worktrees")?;
    let merge_worktrees = worktrees.clone();

    let host: Arc<InMemoryHostSession> = Arc::new(InMemoryHostSession::new());
    let orchestrator = Arc::new(LocalAgentOrchestrator::new(
        config.agent_command.clone(),
        worktrees,
        Arc::clone(&host),
        repo.join(".tripleshot"),
    )?);
    let bus = Arc::new(EventBus::new());

    let session = Session::new(GROUP_KIND, args.task, config.session.clone());
    host.create_group(GROUP_KIND, GROUP_KIND);
    let auto_approve = session.config.auto_approve;

    let coordinator = TripleShotCoordinator::new(
        Arc::clone(&orchestrator) as Arc<dyn Orchestrator>,
        Arc::clone(&host) as Arc<dyn HostSession>,
        bus,
        &repo,
        session,
        CoordinatorOptions {
            poll_interval: std::time::Duration::from_millis(args.poll_interval_ms),
            base_branch: config.base_branch.clone(),
        },
    )?;

    // Completion is signalled through the callback surface.
    let (done_tx, mut done_rx) = tokio::sync::mpsc::channel::<(bool, String)>(1);
    coordinator.set_callbacks(progress_callbacks(done_tx));

    // Graceful shutdown: first signal cancels, second force-exits.
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let got_first_signal = Arc::new(AtomicBool::new(false));
    let got_first_clone = Arc::clone(&got_first_signal);
    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_clone.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nShutting down gracefully (Ctrl+C again to force)...");
            cancel_clone.cancel();
        }
    });

    coordinator.start(cancel.clone()).await?;

    let outcome = tokio::select! {
        outcome = done_rx.recv() => outcome,
        _ = cancel.cancelled() => None,
    };

    let winning_branch = coordinator.get_winning_branch();
    let strategy = coordinator
        .session()
        .evaluation
        .as_ref()
        .map(|e| e.merge_strategy);

    coordinator.stop().await;
    orchestrator.shutdown().await;

    match outcome {
        Some((true, summary)) => {
            println!("\n{summary}");
            if let Some(branch) = winning_branch {
                apply_winner(&merge_worktrees, &config.base_branch, &branch, auto_approve)?;
            } else if strategy.is_some_and(|s| s != MergeStrategy::Select) {
                println!("The verdict is not a single-branch selection; merge by hand.");
            }
            Ok(())
        }
        Some((false, reason)) => {
            println!("\nTriple-shot failed: {reason}");
            std::process::exit(1);
        }
        None => {
            println!("\nInterrupted. Worktrees and branches were left in place.");
            std::process::exit(130);
        }
    }
}

/// Merge the winning branch, or print how to.
fn apply_winner(
    worktrees: &WorktreeManager,
    base_branch: &str,
    branch: &str,
    auto_approve: bool,
) -> Result<()> {
    let commits = worktrees.commit_count(branch, base_branch).unwrap_or(0);
    if !auto_approve {
        println!("Winning branch: {branch} ({commits} commits ahead of {base_branch})");
        println!("To apply it:  git merge --no-ff {branch}");
        return Ok(());
    }

    if !worktrees
        .branch_exists(branch)
        .map_err(|e| anyhow::anyhow!("{e}"))?
    {
        anyhow::bail!("winning branch {branch} no longer exists");
    }

    println!("Merging winning branch {branch} ({commits} commits) into {base_branch}...");
    worktrees
        .checkout(base_branch)
        .map_err(|e| anyhow::anyhow!("{e}"))
        .with_context(|| format!("failed to checkout {base_branch}"))?;
    match worktrees
        .merge_branch(branch)
        .map_err(|e| anyhow::anyhow!("{e}"))?
    {
        MergeResult::Success => {
            println!("Merged.");
            // The branch cannot be deleted while its worktree holds it.
            if let Ok(registered) = worktrees.list_worktrees() {
                if let Some(info) = registered
                    .into_iter()
                    .find(|w| w.branch.as_deref() == Some(branch))
                {
                    if let Err(e) = worktrees.remove_worktree(&info.path) {
                        println!("Note: could not remove worktree {}: {e}", info.path.display());
                    }
                }
            }
            match worktrees.delete_branch(branch) {
                Ok(()) => println!("Deleted {branch}."),
                Err(e) => println!("Note: could not delete {branch}: {e}"),
            }
            Ok(())
        }
        MergeResult::Conflict { details } => {
            println!("Merge conflicted and was aborted:\n{details}");
            println!("Resolve by hand:  git merge --no-ff {branch}");
            Ok(())
        }
    }
}

/// Progress printing plus the completion signal.
fn progress_callbacks(
    done_tx: tokio::sync::mpsc::Sender<(bool, String)>,
) -> CoordinatorCallbacks {
    CoordinatorCallbacks {
        on_phase_change: Some(Arc::new(|phase| {
            println!("phase: {phase}");
        })),
        on_attempt_start: Some(Arc::new(|index, instance_id| {
            println!("attempt {} started ({instance_id})", index + 1);
        })),
        on_attempt_complete: Some(Arc::new(|index| {
            println!("attempt {} completed", index + 1);
        })),
        on_attempt_failed: Some(Arc::new(|index, reason| {
            println!("attempt {} failed: {reason}", index + 1);
        })),
        on_judge_start: Some(Arc::new(|instance_id| {
            println!("judge started ({instance_id})");
        })),
        on_evaluation_ready: Some(Arc::new(|evaluation| {
            for item in &evaluation.attempt_evaluations {
                println!(
                    "  attempt {}: {}/10",
                    item.attempt_index + 1,
                    item.score
                );
            }
        })),
        on_reviewer_start: Some(Arc::new(|index, instance_id| {
            println!("reviewer examining attempt {} ({instance_id})", index + 1);
        })),
        on_review_approved: Some(Arc::new(|index, score| {
            println!("attempt {} approved by reviewer ({score}/10)", index + 1);
        })),
        on_review_rejected: Some(Arc::new(|index, score, issues| {
            println!(
                "attempt {} rejected ({score}/10): {}",
                index + 1,
                issues.join("; ")
            );
        })),
        on_complete: Some(Arc::new(move |success, summary| {
            let _ = done_tx.try_send((success, summary.to_owned()));
        })),
    }
}
