//! Submissions and what grading them produces.

use std::{fmt, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Serialize};

use crate::runner::model::RunResult;

/// A student's submission: a directory of files plus who submitted it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub dir: PathBuf,
    pub user: String,
    #[serde(default)]
    pub message: String,
}

impl Submission {
    pub fn new(dir: impl Into<PathBuf>, user: impl Into<String>) -> Submission {
        Submission {
            dir: dir.into(),
            user: user.into(),
            message: String::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Submission {
        self.message = message.into();
        self
    }
}

/// The score of a single question.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct GradedQuestion {
    pub name: String,
    pub score: f64,
    pub max_points: f64,
    #[serde(default)]
    pub message: String,
}

/// The structured result of grading one submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct GradingInfo {
    #[serde(default)]
    pub course_id: String,
    #[serde(default)]
    pub assignment_id: String,
    #[serde(default)]
    pub user: String,
    /// The message the student attached to the submission.
    #[serde(default)]
    pub submission_message: String,

    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub questions: Vec<GradedQuestion>,
    pub score: f64,
    pub max_points: f64,
    /// Free-form feedback from the grader.
    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub grading_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub grading_end_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_info: Option<serde_json::Value>,
}

/// What a grader reports. Totals may be omitted, in which case they are
/// summed over the questions.
#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ReportedGradingInfo {
    #[serde(default)]
    name: String,
    #[serde(default)]
    questions: Vec<GradedQuestion>,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    max_points: Option<f64>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    additional_info: Option<serde_json::Value>,
}

impl GradingInfo {
    /// Parse the JSON a grader writes out. The value must be an object that
    /// reports a `score` or at least one question.
    pub fn from_json(s: &str) -> serde_json::Result<GradingInfo> {
        let value: serde_json::Value = serde_json::from_str(s)?;
        let has_score = match value.as_object() {
            Some(map) => map.contains_key("score"),
            None => return Err(de::Error::custom("grading result must be a JSON object")),
        };
        let reported: ReportedGradingInfo = serde_json::from_value(value)?;
        if !has_score && reported.questions.is_empty() {
            return Err(de::Error::custom(
                "grading result reports neither a score nor any questions",
            ));
        }

        let score = reported
            .score
            .unwrap_or_else(|| reported.questions.iter().fold(0.0, |acc, q| acc + q.score));
        let max_points = reported.max_points.unwrap_or_else(|| {
            reported
                .questions
                .iter()
                .fold(0.0, |acc, q| acc + q.max_points)
        });
        Ok(GradingInfo {
            name: reported.name,
            questions: reported.questions,
            score,
            max_points,
            message: reported.message,
            additional_info: reported.additional_info,
            ..Default::default()
        })
    }

    /// Compare the grading content of two infos. Identification and
    /// timestamps are never compared; messages only when `check_messages`.
    pub fn equals(&self, other: &GradingInfo, check_messages: bool) -> bool {
        if self.name != other.name
            || self.score != other.score
            || self.max_points != other.max_points
            || self.questions.len() != other.questions.len()
        {
            return false;
        }

        if check_messages && self.message != other.message {
            return false;
        }

        self.questions.iter().zip(&other.questions).all(|(a, b)| {
            a.name == b.name
                && a.score == b.score
                && a.max_points == b.max_points
                && (!check_messages || a.message == b.message)
        })
    }
}

/// A successful grading: the parsed info plus the raw run it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingResult {
    pub info: GradingInfo,
    pub output: RunResult,
}

/// A terminal outcome meaning the submission cannot be graded and must not
/// count against the student. This is not an error: nothing went wrong on
/// the grading side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Rejection {
    MissingSubmission { path: PathBuf },
    NotADirectory { path: PathBuf },
    /// A symbolic link inside the submission. `path` is relative to the
    /// submission directory.
    SymlinkInSubmission { path: PathBuf },
    EmptySubmission,
    SubmissionTooLarge { size_kb: u64, max_kb: u64 },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::MissingSubmission { path } => {
                write!(f, "Submission directory '{}' does not exist.", path.display())
            }
            Rejection::NotADirectory { path } => {
                write!(f, "Submission path '{}' is not a directory.", path.display())
            }
            Rejection::SymlinkInSubmission { path } => write!(
                f,
                "Submission contains a symbolic link '{}', which is not allowed.",
                path.display()
            ),
            Rejection::EmptySubmission => write!(f, "Submission contains no files."),
            Rejection::SubmissionTooLarge { size_kb, max_kb } => write!(
                f,
                "Submission is too large ({} KB), the maximum allowed size is {} KB.",
                size_kb, max_kb
            ),
        }
    }
}
