use std::{fmt, time::Duration};

use err_derive::Error;
use serde::{Deserialize, Serialize};

use super::output::{append_marker, limit_bytes, BoundedOutput};

/// How a grading process ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub enum ExitStatus {
    /// The process exited by itself. Negative codes are signals on the local
    /// runner.
    Code(i64),
    /// The process was killed after running into the wall-clock timeout.
    Timeout,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        *self == ExitStatus::Code(0)
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Code(code) => write!(f, "exit code {}", code),
            ExitStatus::Timeout => write!(f, "timed out"),
        }
    }
}

/// The result of running a grading process.
///
/// `stdout` and `stderr` hold at most the configured output limit each; the
/// `*_truncated` flags tell whether anything was cut off.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunResult {
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub status: ExitStatus,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    /// Byte limit the streams were cut at, if any.
    pub output_limit: Option<usize>,
}

impl RunResult {
    pub fn new(
        stdout: BoundedOutput,
        stderr: BoundedOutput,
        status: ExitStatus,
        duration: Duration,
    ) -> RunResult {
        RunResult {
            output_limit: stdout.limit,
            stdout: stdout.text,
            stderr: stderr.text,
            stdout_truncated: stdout.truncated,
            stderr_truncated: stderr.truncated,
            status,
            duration,
        }
    }

    /// Stdout, with a truncation marker line if anything was cut off.
    pub fn stdout_with_marker(&self) -> String {
        self.marked(&self.stdout, self.stdout_truncated)
    }

    /// Stderr, with a truncation marker line if anything was cut off.
    pub fn stderr_with_marker(&self) -> String {
        self.marked(&self.stderr, self.stderr_truncated)
    }

    fn marked(&self, text: &str, truncated: bool) -> String {
        match (truncated, self.output_limit) {
            (true, Some(limit)) => append_marker(text, limit),
            _ => text.to_owned(),
        }
    }

    /// An empty result, e.g. for a process that produced nothing.
    pub fn empty(status: ExitStatus, duration: Duration, limit_kb: i64) -> RunResult {
        RunResult {
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            status,
            duration,
            output_limit: limit_bytes(limit_kb),
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Failures of a grading run. A process exiting with a non-zero code is not
/// one of them.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(display = "Grading in {} timed out after {:?}", tag, limit)]
    Timeout {
        tag: String,
        limit: Duration,
        /// Whatever the process printed before it was killed.
        partial: Option<Box<RunResult>>,
    },

    #[error(display = "Container engine failure while running {}: {:#}", tag, error)]
    Engine { tag: String, error: anyhow::Error },

    #[error(display = "Failed to spawn grading process {:?}: {}", command, source)]
    Spawn {
        command: Vec<String>,
        #[error(source)]
        source: std::io::Error,
    },

    #[error(display = "Assignment {} has no invocation, cannot grade without docker", _0)]
    NoInvocation(String),

    #[error(display = "I/O error while grading: {}", _0)]
    Io(#[error(source)] std::io::Error),
}

impl RunError {
    pub fn engine(tag: &str, error: anyhow::Error) -> RunError {
        RunError::Engine {
            tag: tag.to_owned(),
            error,
        }
    }

    /// Take the partial output of a timed out run.
    pub fn take_partial(&mut self) -> Option<RunResult> {
        match self {
            RunError::Timeout { partial, .. } => partial.take().map(|p| *p),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RunError::Timeout { .. })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::runner::output::BoundedBuffer;

    #[test]
    fn test_markers_only_on_truncated_streams() {
        let mut stdout = BoundedBuffer::new(1);
        stdout.append(&[b'a'; 2000]);
        let mut stderr = BoundedBuffer::new(1);
        stderr.append(b"warning");

        let res = RunResult::new(
            stdout.finish(),
            stderr.finish(),
            ExitStatus::Code(0),
            Duration::from_millis(10),
        );
        assert_eq!(res.stdout.len(), 1024);
        assert!(res
            .stdout_with_marker()
            .ends_with("--- output truncated at 1024 bytes ---\n"));
        assert_eq!(res.stderr_with_marker(), "warning");
    }

    #[test]
    fn test_serialize_run_result() {
        let res = RunResult::empty(ExitStatus::Timeout, Duration::from_millis(1500), 4);
        let json = serde_json::to_value(&res).unwrap();
        assert_eq!(json["duration"], 1500);
        assert_eq!(json["status"], "Timeout");
        assert_eq!(json["output_limit"], 4096);
    }
}
