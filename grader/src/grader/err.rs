use std::{fmt, sync::Arc};

use err_derive::Error;

use crate::{
    assemble::AssembleError,
    runner::{BuildError, ExitStatus, RunError, RunResult},
};

/// Why a grading attempt failed on the grading side.
#[derive(Debug, Error)]
pub enum GradeErrorKind {
    #[error(display = "{}", _0)]
    Build(#[error(source, no_from)] Arc<BuildError>),

    #[error(display = "{}", _0)]
    Run(#[error(source, no_from)] RunError),

    #[error(display = "Failed to parse grading output ({}): {}", status, reason)]
    Parse { reason: String, status: ExitStatus },

    #[error(display = "{}", _0)]
    Assemble(#[error(source, no_from)] AssembleError),

    #[error(display = "I/O error while grading: {}", _0)]
    Io(#[error(source, no_from)] std::io::Error),
}

/// An infrastructure failure of a grading attempt. If the grading process
/// ran, whatever it printed is kept in `output` for diagnosis; it is never a
/// valid result.
#[derive(Debug)]
pub struct GradeError {
    pub kind: GradeErrorKind,
    pub output: Option<RunResult>,
}

impl GradeError {
    pub fn with_output(kind: GradeErrorKind, output: RunResult) -> GradeError {
        GradeError {
            kind,
            output: Some(output),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(&self.kind, GradeErrorKind::Run(e) if e.is_timeout())
    }
}

impl fmt::Display for GradeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for GradeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

impl From<GradeErrorKind> for GradeError {
    fn from(kind: GradeErrorKind) -> Self {
        GradeError { kind, output: None }
    }
}

impl From<RunError> for GradeError {
    fn from(mut e: RunError) -> Self {
        let output = e.take_partial();
        GradeError {
            kind: GradeErrorKind::Run(e),
            output,
        }
    }
}

impl From<Arc<BuildError>> for GradeError {
    fn from(e: Arc<BuildError>) -> Self {
        GradeErrorKind::Build(e).into()
    }
}

impl From<AssembleError> for GradeError {
    fn from(e: AssembleError) -> Self {
        GradeErrorKind::Assemble(e).into()
    }
}

impl From<std::io::Error> for GradeError {
    fn from(e: std::io::Error) -> Self {
        GradeErrorKind::Io(e).into()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_timeout_keeps_partial_output() {
        let partial = RunResult::empty(ExitStatus::Timeout, Duration::from_secs(2), 1);
        let err: GradeError = RunError::Timeout {
            tag: "autograder.c.a".into(),
            limit: Duration::from_secs(2),
            partial: Some(Box::new(partial.clone())),
        }
        .into();

        assert!(err.is_timeout());
        assert_eq!(err.output, Some(partial));
        assert_eq!(err.to_string(), "Grading in autograder.c.a timed out after 2s");
    }
}
