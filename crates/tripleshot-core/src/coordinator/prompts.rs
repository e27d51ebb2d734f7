//! Prompt documents handed to worker, reviewer, and judge instances.
//!
//! Every prompt ends with instructions for the sentinel artifact the agent
//! must write; the artifact names and schemas are the wire contract the
//! rest of the engine polls on.

use crate::artifact::{
    COMPLETION_ARTIFACT, CompletionArtifact, EVALUATION_ARTIFACT, REVIEW_ARTIFACT, ReviewArtifact,
};

/// What the judge is told about one attempt.
#[derive(Debug, Clone)]
pub struct AttemptBrief {
    pub index: usize,
    pub instance_id: String,
    pub branch: String,
    pub worktree: String,
    pub summary: String,
}

/// The prompt for one of the three parallel workers.
pub fn attempt_prompt(task: &str, attempt_index: usize) -> String {
    format!(
        "You are attempt {n} of 3 working independently on the following task.\n\
         Two other agents are attempting the same task in separate worktrees;\n\
         do not coordinate with them.\n\n\
         ## Task\n\n{task}\n\n\
         ## When you are done\n\n\
         Write a file named `{artifact}` in your working directory with this\n\
         exact JSON shape:\n\n\
         {{\n\
         \x20 \"attempt_index\": {i},\n\
         \x20 \"status\": \"complete\" or \"failed\",\n\
         \x20 \"summary\": \"what you did\",\n\
         \x20 \"files_modified\": [\"path\", ...],\n\
         \x20 \"approach\": \"how you went about it\",\n\
         \x20 \"notes\": \"anything the evaluator should know\"\n\
         }}\n\n\
         Commit your work before writing the file.\n",
        n = attempt_index + 1,
        i = attempt_index,
        task = task,
        artifact = COMPLETION_ARTIFACT,
    )
}

/// The prompt for the judge, embedding each attempt's result.
pub fn judge_prompt(task: &str, attempts: &[AttemptBrief]) -> String {
    let mut out = String::new();
    out.push_str(
        "You are the judge of a triple-shot run: three agents attempted the\n\
         same task independently. Evaluate their results and produce a verdict.\n\n",
    );
    out.push_str(&format!("## Original task\n\n{task}\n\n"));

    for brief in attempts {
        out.push_str(&format!(
            "## Attempt {n}\n\n\
             - Instance: {instance}\n\
             - Branch: {branch}\n\
             - Worktree: {worktree}\n\n\
             {summary}\n\n",
            n = brief.index + 1,
            instance = brief.instance_id,
            branch = brief.branch,
            worktree = brief.worktree,
            summary = brief.summary,
        ));
    }

    out.push_str(&format!(
        "## Verdict\n\n\
         Inspect the branches as needed, then write a file named\n\
         `{artifact}` in your working directory with this exact JSON shape:\n\n\
         {{\n\
         \x20 \"winner_index\": 0, 1, or 2 (-1 when not selecting a single attempt),\n\
         \x20 \"merge_strategy\": \"select\", \"merge\", or \"combine\",\n\
         \x20 \"reasoning\": \"why\",\n\
         \x20 \"attempt_evaluations\": [\n\
         \x20   {{\"attempt_index\": 0, \"score\": 1-10, \"strengths\": [...], \"weaknesses\": [...]}}\n\
         \x20 ],\n\
         \x20 \"suggested_changes\": [\"...\"]\n\
         }}\n\n\
         If you cannot write the file, print the same JSON between\n\
         <evaluation> and </evaluation> tags instead.\n",
        artifact = EVALUATION_ARTIFACT,
    ));
    out
}

/// The prompt for an adversarial reviewer examining one attempt.
///
/// The passing threshold appears three times on purpose: models follow the
/// rubric far more reliably when the number is repeated at the scoring
/// rule, the approval rule, and the output schema.
pub fn reviewer_prompt(
    task: &str,
    attempt_index: usize,
    round: u32,
    completion: &CompletionArtifact,
    min_passing_score: i32,
) -> String {
    format!(
        "You are an adversarial reviewer. An agent claims to have completed\n\
         the task below (attempt {n}, review round {round}). Your job is to\n\
         find real problems, not to be agreeable. Score strictly: work scoring\n\
         below {score} out of 10 must be rejected.\n\n\
         ## Original task\n\n{task}\n\n\
         ## The implementer reported\n\n\
         Summary: {summary}\n\
         Approach: {approach}\n\
         Files modified: {files}\n\
         Notes: {notes}\n\n\
         ## Review\n\n\
         Verify the work in this worktree yourself. Approve only if it scores\n\
         at least {score}/10.\n\n\
         Write a file named `{artifact}` in this directory with this exact\n\
         JSON shape:\n\n\
         {{\n\
         \x20 \"attempt_index\": {i},\n\
         \x20 \"round\": {round},\n\
         \x20 \"approved\": true only when the score is >= {score},\n\
         \x20 \"score\": 1-10,\n\
         \x20 \"strengths\": [\"...\"],\n\
         \x20 \"issues\": [\"...\"],\n\
         \x20 \"suggestions\": [\"...\"],\n\
         \x20 \"summary\": \"one-paragraph assessment\",\n\
         \x20 \"required_changes\": [\"...\"]\n\
         }}\n",
        n = attempt_index + 1,
        i = attempt_index,
        round = round,
        task = task,
        summary = completion.summary,
        approach = completion.approach,
        files = completion.files_modified.join(", "),
        notes = completion.notes.as_str(),
        score = min_passing_score,
        artifact = REVIEW_ARTIFACT,
    )
}

/// The restart prompt for an implementer whose work was rejected.
pub fn implementer_feedback_prompt(base_prompt: &str, review: &ReviewArtifact) -> String {
    let mut out = String::new();
    out.push_str(base_prompt);
    out.push_str("\n\n## Previous Review Feedback\n\n");
    out.push_str(&format!(
        "Your previous submission was rejected with a score of {}/10.\n",
        review.score
    ));
    if !review.issues.is_empty() {
        out.push_str("\nIssues found:\n");
        for issue in &review.issues {
            out.push_str(&format!("- {issue}\n"));
        }
    }
    if !review.required_changes.is_empty() {
        out.push_str("\nRequired changes:\n");
        for change in &review.required_changes {
            out.push_str(&format!("- {change}\n"));
        }
    }
    if !review.summary.is_empty() {
        out.push_str(&format!("\nReviewer summary: {}\n", review.summary));
    }
    out.push_str("\nAddress the feedback, then write the completion file again.\n");
    out
}

/// Placeholder summary for an attempt the judge cannot inspect.
pub fn placeholder_summary(attempt_index: usize, detail: &str) -> String {
    format!("Attempt {} did not complete successfully: {detail}", attempt_index + 1)
}

/// Textual summary of a parsed completion artifact for the judge prompt.
pub fn completion_summary(completion: &CompletionArtifact) -> String {
    format!(
        "Status: {status}\nSummary: {summary}\nApproach: {approach}\nFiles modified: {files}",
        status = if completion.succeeded() { "complete" } else { "failed" },
        summary = completion.summary,
        approach = completion.approach,
        files = completion.files_modified.join(", "),
    )
}
