//! Sentinel artifact layer.
//!
//! Workers, reviewers, and the judge signal their results by writing JSON
//! artifacts into their own working directory. This module locates those
//! artifacts (root first, then one level of non-hidden subdirectories),
//! parses them with tolerant decoding, and validates the fields agents are
//! known to get wrong.

pub mod flex;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::Evaluation;
use flex::{FlexibleString, FlexibleStringSlice};

/// Written by a worker when its attempt is done.
pub const COMPLETION_ARTIFACT: &str = ".claudio-tripleshot-complete.json";

/// Written by the judge with its verdict over all attempts.
pub const EVALUATION_ARTIFACT: &str = ".claudio-tripleshot-evaluation.json";

/// Written by an adversarial reviewer after examining an attempt.
pub const REVIEW_ARTIFACT: &str = ".claudio-tripleshot-review.json";

/// Literal tags delimiting an evaluation embedded in judge free text.
const EVALUATION_OPEN_TAG: &str = "<evaluation>";
const EVALUATION_CLOSE_TAG: &str = "</evaluation>";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from locating, reading, or decoding a sentinel artifact.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// The artifact exists neither at the root nor one level down. This is
    /// the sentinel the polling layer treats as "not finished yet".
    #[error("artifact {name} not found in {}", dir.display())]
    NotFound { name: String, dir: PathBuf },

    /// Any stat/read failure other than not-found, propagated unchanged.
    #[error("i/o error reading artifact: {0}")]
    Io(#[from] io::Error),

    /// The file exists but is not valid JSON for its schema.
    #[error("failed to parse {name}: {source}")]
    Parse {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    /// The review decoded but carries out-of-range values.
    #[error("invalid review artifact: {0}")]
    InvalidReview(String),

    /// Judge free text contained no `<evaluation>` block.
    #[error("no <evaluation> block found in judge output")]
    MissingEvaluationBlock,
}

impl ArtifactError {
    /// Whether this error is the not-found sentinel (as opposed to a real
    /// failure that must be surfaced).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

// ---------------------------------------------------------------------------
// Location policy
// ---------------------------------------------------------------------------

/// Locate `name` under `dir`.
///
/// The root location is preferred: `dir/name` wins even when a copy exists
/// in a subdirectory. Otherwise the immediate subdirectories of `dir`
/// (depth exactly 1, skipping names that begin with `.`) are scanned in
/// lexical order and the first hit is returned.
pub fn find_artifact(dir: &Path, name: &str) -> Result<PathBuf, ArtifactError> {
    let root = dir.join(name);
    match fs::metadata(&root) {
        Ok(_) => return Ok(root),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(ArtifactError::Io(e)),
    }

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ArtifactError::NotFound {
                name: name.to_owned(),
                dir: dir.to_path_buf(),
            });
        }
        Err(e) => return Err(ArtifactError::Io(e)),
    };

    let mut subdirs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(ArtifactError::Io)?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        if entry.file_type().map_err(ArtifactError::Io)?.is_dir() {
            subdirs.push(entry.path());
        }
    }
    subdirs.sort();

    for sub in subdirs {
        let candidate = sub.join(name);
        match fs::metadata(&candidate) {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(ArtifactError::Io(e)),
        }
    }

    Err(ArtifactError::NotFound {
        name: name.to_owned(),
        dir: dir.to_path_buf(),
    })
}

/// Delete `name` under `dir` wherever the location policy finds it.
///
/// Best-effort: a missing artifact is not an error.
pub fn remove_artifact(dir: &Path, name: &str) -> Result<(), ArtifactError> {
    match find_artifact(dir, name) {
        Ok(path) => {
            fs::remove_file(&path)?;
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(dir: &Path, name: &str) -> Result<T, ArtifactError> {
    let path = find_artifact(dir, name)?;
    let contents = fs::read_to_string(&path)?;
    serde_json::from_str(&contents).map_err(|source| ArtifactError::Parse {
        name: name.to_owned(),
        source,
    })
}

// ---------------------------------------------------------------------------
// Worker completion
// ---------------------------------------------------------------------------

/// The `status` field of a completion artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    Complete,
    Failed,
}

/// The JSON a worker writes when its attempt is done.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionArtifact {
    #[serde(default)]
    pub attempt_index: i32,
    pub status: CompletionStatus,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub approach: String,
    #[serde(default)]
    pub notes: FlexibleString,
}

impl CompletionArtifact {
    pub fn succeeded(&self) -> bool {
        self.status == CompletionStatus::Complete
    }
}

/// Load and parse a worker completion artifact from `dir`.
pub fn load_completion(dir: &Path) -> Result<CompletionArtifact, ArtifactError> {
    read_json(dir, COMPLETION_ARTIFACT)
}

// ---------------------------------------------------------------------------
// Adversarial review
// ---------------------------------------------------------------------------

/// The JSON an adversarial reviewer writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewArtifact {
    pub attempt_index: i32,
    /// 1-based review round.
    pub round: i32,
    pub approved: bool,
    /// Score 1-10.
    pub score: i32,
    #[serde(default)]
    pub strengths: FlexibleStringSlice,
    #[serde(default)]
    pub issues: FlexibleStringSlice,
    #[serde(default)]
    pub suggestions: FlexibleStringSlice,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub required_changes: FlexibleStringSlice,
}

impl ReviewArtifact {
    /// Range-check the fields reviewers are known to get wrong.
    ///
    /// Returns [`ArtifactError::InvalidReview`], distinct from a JSON parse
    /// error, so callers can tell a malformed file from an out-of-range one.
    pub fn validate(&self) -> Result<(), ArtifactError> {
        if !(0..=2).contains(&self.attempt_index) {
            return Err(ArtifactError::InvalidReview(format!(
                "attempt_index {} out of range [0,2]",
                self.attempt_index
            )));
        }
        if self.round < 1 {
            return Err(ArtifactError::InvalidReview(format!(
                "round {} must be >= 1",
                self.round
            )));
        }
        if !(1..=10).contains(&self.score) {
            return Err(ArtifactError::InvalidReview(format!(
                "score {} out of range [1,10]",
                self.score
            )));
        }
        Ok(())
    }
}

/// Load, parse, and validate a review artifact from `dir`.
pub fn load_review(dir: &Path) -> Result<ReviewArtifact, ArtifactError> {
    let review: ReviewArtifact = read_json(dir, REVIEW_ARTIFACT)?;
    review.validate()?;
    Ok(review)
}

// ---------------------------------------------------------------------------
// Judge evaluation
// ---------------------------------------------------------------------------

/// Load and parse the judge's evaluation artifact from `dir`.
pub fn load_evaluation(dir: &Path) -> Result<Evaluation, ArtifactError> {
    read_json(dir, EVALUATION_ARTIFACT)
}

/// Extract an evaluation from judge free text.
///
/// Searches for the first region delimited by the literal `<evaluation>` /
/// `</evaluation>` tags, trims surrounding whitespace, and parses the inner
/// text as evaluation JSON.
pub fn evaluation_from_output(output: &str) -> Result<Evaluation, ArtifactError> {
    let start = output
        .find(EVALUATION_OPEN_TAG)
        .ok_or(ArtifactError::MissingEvaluationBlock)?;
    let after_open = start + EVALUATION_OPEN_TAG.len();
    let end = output[after_open..]
        .find(EVALUATION_CLOSE_TAG)
        .ok_or(ArtifactError::MissingEvaluationBlock)?;
    let inner = output[after_open..after_open + end].trim();
    serde_json::from_str(inner).map_err(|source| ArtifactError::Parse {
        name: EVALUATION_ARTIFACT.to_owned(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MergeStrategy;

    fn write(dir: &Path, rel: &str, contents: &str) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn find_prefers_root_over_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), &format!("sub/{COMPLETION_ARTIFACT}"), "{}");
        write(dir.path(), COMPLETION_ARTIFACT, "{}");

        let found = find_artifact(dir.path(), COMPLETION_ARTIFACT).unwrap();
        assert_eq!(found, dir.path().join(COMPLETION_ARTIFACT));
    }

    #[test]
    fn find_descends_exactly_one_level() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), &format!("sub/{COMPLETION_ARTIFACT}"), "{}");

        let found = find_artifact(dir.path(), COMPLETION_ARTIFACT).unwrap();
        assert_eq!(found, dir.path().join("sub").join(COMPLETION_ARTIFACT));
    }

    #[test]
    fn find_never_descends_two_levels() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), &format!("a/b/{COMPLETION_ARTIFACT}"), "{}");

        let err = find_artifact(dir.path(), COMPLETION_ARTIFACT).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn find_skips_hidden_directories() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), &format!(".git/{COMPLETION_ARTIFACT}"), "{}");

        let err = find_artifact(dir.path(), COMPLETION_ARTIFACT).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn find_missing_directory_is_not_found() {
        let err = find_artifact(Path::new("/nonexistent/tripleshot-test"), COMPLETION_ARTIFACT)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), REVIEW_ARTIFACT, "{}");
        remove_artifact(dir.path(), REVIEW_ARTIFACT).unwrap();
        remove_artifact(dir.path(), REVIEW_ARTIFACT).unwrap();
        assert!(!dir.path().join(REVIEW_ARTIFACT).exists());
    }

    #[test]
    fn completion_parses_with_array_notes() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            COMPLETION_ARTIFACT,
            r#"{"attempt_index":1,"status":"complete","summary":"did it",
                "files_modified":["src/lib.rs"],"approach":"tests first",
                "notes":["note one","note two"]}"#,
        );
        let completion = load_completion(dir.path()).unwrap();
        assert!(completion.succeeded());
        assert_eq!(completion.notes.as_str(), "note one\nnote two");
        assert_eq!(completion.files_modified, ["src/lib.rs"]);
    }

    #[test]
    fn completion_failed_status() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), COMPLETION_ARTIFACT, r#"{"status":"failed"}"#);
        let completion = load_completion(dir.path()).unwrap();
        assert!(!completion.succeeded());
    }

    #[test]
    fn completion_bad_json_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), COMPLETION_ARTIFACT, "not json");
        let err = load_completion(dir.path()).unwrap_err();
        assert!(matches!(err, ArtifactError::Parse { .. }), "got {err:?}");
    }

    #[test]
    fn review_validation_rejects_out_of_range_values() {
        let base = ReviewArtifact {
            attempt_index: 0,
            round: 1,
            approved: false,
            score: 5,
            strengths: FlexibleStringSlice::default(),
            issues: FlexibleStringSlice::default(),
            suggestions: FlexibleStringSlice::default(),
            summary: String::new(),
            required_changes: FlexibleStringSlice::default(),
        };

        let mut bad = base.clone();
        bad.score = 11;
        assert!(matches!(
            bad.validate().unwrap_err(),
            ArtifactError::InvalidReview(_)
        ));

        let mut bad = base.clone();
        bad.score = 0;
        assert!(bad.validate().is_err());

        let mut bad = base.clone();
        bad.attempt_index = 3;
        assert!(bad.validate().is_err());

        let mut bad = base.clone();
        bad.round = 0;
        assert!(bad.validate().is_err());

        assert!(base.validate().is_ok());
    }

    #[test]
    fn review_invalid_values_distinct_from_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            REVIEW_ARTIFACT,
            r#"{"attempt_index":0,"round":1,"approved":true,"score":99}"#,
        );
        let err = load_review(dir.path()).unwrap_err();
        assert!(matches!(err, ArtifactError::InvalidReview(_)), "got {err:?}");
    }

    #[test]
    fn review_issues_accept_object_elements() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            REVIEW_ARTIFACT,
            r#"{"attempt_index":2,"round":3,"approved":false,"score":4,
                "issues":[{"description":"missing tests"},{"text":"no error handling"}],
                "summary":"needs work"}"#,
        );
        let review = load_review(dir.path()).unwrap();
        assert_eq!(review.issues.as_slice(), ["missing tests", "no error handling"]);
    }

    #[test]
    fn evaluation_reasoning_decodes_string_or_array_identically() {
        let as_string = r#"{"winner_index":0,"merge_strategy":"select","reasoning":"a\nb"}"#;
        let as_array = r#"{"winner_index":0,"merge_strategy":"select","reasoning":["a","b"]}"#;
        let left: Evaluation = serde_json::from_str(as_string).unwrap();
        let right: Evaluation = serde_json::from_str(as_array).unwrap();
        assert_eq!(left.reasoning.as_str(), right.reasoning.as_str());
    }

    #[test]
    fn evaluation_from_tagged_output() {
        let output = "Here is my verdict.\n<evaluation>\n\
            {\"winner_index\":1,\"merge_strategy\":\"select\",\"reasoning\":\"cleanest\"}\n\
            </evaluation>\nDone.";
        let eval = evaluation_from_output(output).unwrap();
        assert_eq!(eval.winner_index, 1);
        assert_eq!(eval.merge_strategy, MergeStrategy::Select);
        assert_eq!(eval.reasoning.as_str(), "cleanest");
    }

    #[test]
    fn evaluation_output_without_tags_is_missing_block() {
        let err = evaluation_from_output("no tags here").unwrap_err();
        assert!(matches!(err, ArtifactError::MissingEvaluationBlock));
    }

    #[test]
    fn evaluation_bad_inner_json_is_parse_error() {
        let err = evaluation_from_output("<evaluation>nope</evaluation>").unwrap_err();
        assert!(matches!(err, ArtifactError::Parse { .. }));
    }
}
