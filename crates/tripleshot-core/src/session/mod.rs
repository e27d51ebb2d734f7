//! The authoritative data model of one triple-shot run.
//!
//! A [`Session`] owns exactly three [`Attempt`]s, an optional judge
//! [`Evaluation`], and a lifecycle [`Phase`]. Only the coordinator mutates a
//! session; everything else reads snapshots through its accessor.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::artifact::flex::{FlexibleString, FlexibleStringSlice};

/// Number of parallel attempts in every session. Never resized.
pub const ATTEMPT_COUNT: usize = 3;

/// Default approval threshold for adversarial review (score out of 10).
pub const DEFAULT_MIN_PASSING_SCORE: i32 = 8;

/// Default adversarial round budget applied when the configured value is 0.
pub const DEFAULT_MAX_ADVERSARIAL_ROUNDS: u32 = 10;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle phase of a session.
///
/// ```text
/// working -> adversarial_review -> evaluating -> complete
/// working ----------------------> evaluating
/// any non-terminal -------------> failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Working,
    AdversarialReview,
    Evaluating,
    Complete,
    Failed,
}

impl Phase {
    /// Whether this phase admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Check whether `from -> to` is an edge in the phase graph.
    ///
    /// `Failed` is reachable from any non-terminal phase.
    pub fn is_valid_transition(from: Phase, to: Phase) -> bool {
        if to == Phase::Failed {
            return !from.is_terminal();
        }
        matches!(
            (from, to),
            (Phase::Working, Phase::AdversarialReview)
                | (Phase::Working, Phase::Evaluating)
                | (Phase::AdversarialReview, Phase::Evaluating)
                | (Phase::Evaluating, Phase::Complete)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Working => "working",
            Self::AdversarialReview => "adversarial_review",
            Self::Evaluating => "evaluating",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for Phase {
    type Err = PhaseParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "working" => Ok(Self::Working),
            "adversarial_review" => Ok(Self::AdversarialReview),
            "evaluating" => Ok(Self::Evaluating),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            other => Err(PhaseParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Phase`] string.
#[derive(Debug, Clone)]
pub struct PhaseParseError(pub String);

impl fmt::Display for PhaseParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid phase: {:?}", self.0)
    }
}

impl std::error::Error for PhaseParseError {}

// ---------------------------------------------------------------------------

/// Per-attempt status.
///
/// Only `Completed` and `Failed` are terminal. `UnderReview` occurs in
/// adversarial mode only and is explicitly *not* terminal: a rejected
/// attempt returns to `Working`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    #[default]
    Pending,
    Preparing,
    Working,
    UnderReview,
    Completed,
    Failed,
}

impl AttemptStatus {
    /// Whether this status admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Preparing => "preparing",
            Self::Working => "working",
            Self::UnderReview => "under_review",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------

/// The verdict type recorded in an [`Evaluation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Pick one attempt wholesale.
    Select,
    /// Blend the attempts.
    Merge,
    /// Cherry-pick pieces from several attempts.
    Combine,
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Select => "select",
            Self::Merge => "merge",
            Self::Combine => "combine",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Per-session configuration knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Skip user confirmation when applying the winning branch.
    #[serde(default)]
    pub auto_approve: bool,
    /// Gate each attempt behind an adversarial reviewer.
    #[serde(default)]
    pub adversarial: bool,
    /// Approval threshold (1-10) for adversarial review.
    #[serde(default = "default_min_passing_score")]
    pub min_passing_score: i32,
    /// Adversarial round budget. 0 means "use the default of 10".
    #[serde(default)]
    pub max_adversarial_rounds: u32,
}

fn default_min_passing_score() -> i32 {
    DEFAULT_MIN_PASSING_SCORE
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_approve: false,
            adversarial: false,
            min_passing_score: DEFAULT_MIN_PASSING_SCORE,
            max_adversarial_rounds: DEFAULT_MAX_ADVERSARIAL_ROUNDS,
        }
    }
}

impl SessionConfig {
    /// The passing score the reviewer prompt embeds, falling back to the
    /// default when the configured value is out of the meaningful range.
    pub fn effective_min_passing_score(&self) -> i32 {
        if self.min_passing_score <= 0 {
            DEFAULT_MIN_PASSING_SCORE
        } else {
            self.min_passing_score
        }
    }
}

// ---------------------------------------------------------------------------
// Attempts
// ---------------------------------------------------------------------------

/// One round of the adversarial implement/review alternation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRound {
    /// 1-based round number.
    pub round: u32,
    /// Instance that implemented this round.
    pub implementer_id: String,
    /// Instance that reviewed this round.
    pub reviewer_id: String,
    /// UI sub-group the round's instances were moved into, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subgroup_id: Option<String>,
}

/// One of the three parallel solution tracks within a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Attempt {
    /// Identifier of the worker instance currently driving this attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// Worktree the attempt runs in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<PathBuf>,
    /// Branch the attempt commits to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default = "pending")]
    pub status: AttemptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Reviewer instance currently examining this attempt (adversarial only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_approved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_score: Option<i32>,
    /// Current review round, 1-based. 0 until the first review begins.
    #[serde(default)]
    pub review_round: u32,
    /// History of completed implement/review rounds.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub round_history: Vec<AttemptRound>,
}

fn pending() -> AttemptStatus {
    AttemptStatus::Pending
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// The judge's scoring of a single attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptEvaluation {
    pub attempt_index: i32,
    /// Score 1-10.
    pub score: i32,
    #[serde(default)]
    pub strengths: FlexibleStringSlice,
    #[serde(default)]
    pub weaknesses: FlexibleStringSlice,
}

/// The judge's verdict over all three attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    /// Index of the winning attempt, or -1 for a non-select strategy.
    pub winner_index: i32,
    pub merge_strategy: MergeStrategy,
    #[serde(default)]
    pub reasoning: FlexibleString,
    #[serde(default)]
    pub attempt_evaluations: Vec<AttemptEvaluation>,
    #[serde(default)]
    pub suggested_changes: FlexibleStringSlice,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One triple-shot run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    /// The host orchestrator's instance group this session renders under.
    pub group_id: String,
    /// The original task text.
    pub task: String,
    pub phase: Phase,
    pub attempts: [Attempt; ATTEMPT_COUNT],
    /// The judge instance, once started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<Evaluation>,
    /// Populated on transition to `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// UI sub-group the worker instances were moved into for judging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementers_group_id: Option<String>,
    pub config: SessionConfig,
}

impl Session {
    /// Create a session in the `Working` phase with three pending attempts.
    ///
    /// A configured round budget of 0 is normalized to
    /// [`DEFAULT_MAX_ADVERSARIAL_ROUNDS`] here; the adversarial gate applies
    /// its own fallback when handed a session that bypassed this
    /// constructor.
    pub fn new(group_id: impl Into<String>, task: impl Into<String>, mut config: SessionConfig) -> Self {
        if config.max_adversarial_rounds == 0 {
            config.max_adversarial_rounds = DEFAULT_MAX_ADVERSARIAL_ROUNDS;
        }
        Self {
            id: Uuid::new_v4(),
            group_id: group_id.into(),
            task: task.into(),
            phase: Phase::Working,
            attempts: std::array::from_fn(|_| Attempt::default()),
            judge_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            evaluation: None,
            error: None,
            implementers_group_id: None,
            config,
        }
    }

    /// True iff every attempt is in a terminal status.
    ///
    /// `UnderReview` is not terminal: an attempt awaiting its reviewer still
    /// counts as in flight.
    pub fn all_attempts_complete(&self) -> bool {
        self.attempts.iter().all(|a| a.status.is_terminal())
    }

    /// Number of attempts that reached `Completed`.
    pub fn successful_attempt_count(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.status == AttemptStatus::Completed)
            .count()
    }

    /// Branch of the winning attempt, when the evaluation selected one.
    ///
    /// Returns `None` unless an evaluation exists, its strategy is
    /// `Select`, and the winner index is in range.
    pub fn winning_branch(&self) -> Option<String> {
        let eval = self.evaluation.as_ref()?;
        if eval.merge_strategy != MergeStrategy::Select {
            return None;
        }
        let idx = usize::try_from(eval.winner_index).ok()?;
        self.attempts.get(idx)?.branch.clone()
    }

    /// Execute a phase transition, stamping `completed_at` on terminal
    /// phases. Returns an error on an edge not in the phase graph.
    pub fn transition_phase(&mut self, to: Phase) -> Result<()> {
        if !Phase::is_valid_transition(self.phase, to) {
            bail!(
                "invalid phase transition: {} -> {} for session {}",
                self.phase,
                to,
                self.id
            );
        }
        self.phase = to;
        if to.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }
}
