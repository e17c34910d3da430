//! The grading pipeline: validate a submission, make sure the assignment's
//! image exists, run it and turn its output into a [`GradingInfo`].

use std::{path::Path, sync::Arc};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{
    assemble::{lay_out_grading_dir, GradingDirs},
    config::GraderConfig,
    engine::ContainerEngine,
    model::{AssignmentImageSpec, GradingInfo, GradingResult, Rejection, Submission, TimeoutPolicy},
    runner::{
        BuildError, BuildOptions, BuildReport, ImageBuilder, LocalRunner, RunResult,
        SandboxRunner,
    },
    util::{
        fs::{copy_path, dir_stats, ScratchDir},
        names::transform_string_as_docker_tag,
    },
};

mod err;

pub use err::{GradeError, GradeErrorKind};

/// File a grader may write its result to, inside its output directory.
/// Takes precedence over stdout.
pub const RESULT_FILENAME: &str = "result.json";

pub const GRADING_DIR_PREFIX: &str = "autograder-grading-";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradeOptions {
    /// Run the grading logic as a local subprocess instead of a container.
    #[serde(default)]
    pub no_docker: bool,
}

/// Grades submissions. Cheap to clone; clones share the image builder, so
/// per-tag build deduplication holds across all of them.
#[derive(Clone)]
pub struct Grader {
    config: Arc<GraderConfig>,
    builder: ImageBuilder,
    sandbox: SandboxRunner,
    local: LocalRunner,
}

impl Grader {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: GraderConfig) -> Grader {
        let config = Arc::new(config);
        Grader {
            builder: ImageBuilder::new(engine.clone(), config.clone()),
            sandbox: SandboxRunner::new(engine, config.output_limit_kb),
            local: LocalRunner::new(config.output_limit_kb),
            config,
        }
    }

    pub fn config(&self) -> &GraderConfig {
        &self.config
    }

    pub fn image_builder(&self) -> &ImageBuilder {
        &self.builder
    }

    /// Build the image of `assignment`. See [`ImageBuilder::build`].
    pub async fn build(
        &self,
        assignment: &AssignmentImageSpec,
        options: BuildOptions,
    ) -> Result<BuildReport, Arc<BuildError>> {
        self.builder.build(assignment, options).await
    }

    /// Grade one submission.
    ///
    /// # Error Handling
    ///
    /// Returning `Ok(_)` means grading did not run into any infrastructure
    /// failure; the outcome is wrapped in the inner `Result`, where
    /// `Err(Rejection)` means the submission cannot be graded at all. An
    /// `Err(GradeError)` is always a failure on the grading side, even if it
    /// carries partial output.
    #[tracing::instrument(
        skip_all,
        fields(assignment = %assignment.full_id(), user = %submission.user)
    )]
    pub async fn grade(
        &self,
        assignment: &AssignmentImageSpec,
        submission: &Submission,
        debug: bool,
        options: &GradeOptions,
    ) -> Result<Result<GradingResult, Rejection>, GradeError> {
        if let Some(rejection) = self.check_submission(&submission.dir).await? {
            tracing::info!(%rejection, "Submission rejected");
            return Ok(Err(rejection));
        }

        let start_time = Utc::now();
        let limits = assignment.limits.merged_over(&self.config.default_limits);

        let scratch = ScratchDir::create(
            &self.config.temp_root,
            &format!(
                "{}{}-",
                GRADING_DIR_PREFIX,
                transform_string_as_docker_tag(&assignment.assignment_id)
            ),
            debug || self.config.debug,
        )?;

        let run = if options.no_docker || self.config.docker_disabled {
            tracing::debug!("Grading without docker");
            let dirs = lay_out_grading_dir(assignment, scratch.path()).await?;
            copy_path(&submission.dir, &dirs.input).await?;
            self.local
                .run(assignment, &dirs, &submission.user, &limits)
                .await
        } else {
            let build = self.builder.ensure_built(assignment).await?;
            tracing::debug!(cached = build.cached, "Image ready");
            let dirs = GradingDirs::create(scratch.path()).await?;
            copy_path(&submission.dir, &dirs.input).await?;
            self.sandbox
                .run(
                    &build.tag,
                    &dirs.input,
                    &dirs.output,
                    &submission.user,
                    &limits,
                )
                .await
        };

        let output = match run {
            Ok(output) => output,
            Err(mut e) if e.is_timeout() && limits.timeout_policy() == TimeoutPolicy::ParseOutput => {
                match e.take_partial() {
                    Some(partial) => {
                        tracing::info!("Grading timed out, parsing partial output");
                        partial
                    }
                    None => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        };

        let output_dir = GradingDirs::in_base(scratch.path()).output;
        let mut info = match parse_grading_info(&output_dir, &output).await {
            Ok(info) => info,
            Err(reason) => {
                tracing::warn!(%reason, status = %output.status, "Could not parse grading output");
                let kind = GradeErrorKind::Parse {
                    reason,
                    status: output.status,
                };
                return Err(GradeError::with_output(kind, output));
            }
        };

        info.course_id = assignment.course_id.clone();
        info.assignment_id = assignment.assignment_id.clone();
        info.user = submission.user.clone();
        info.submission_message = submission.message.clone();
        info.grading_start_time = Some(start_time);
        info.grading_end_time = Some(Utc::now());

        tracing::info!(score = info.score, max_points = info.max_points, "Submission graded");
        Ok(Ok(GradingResult { info, output }))
    }

    /// Checks that need no grading run. `Ok(None)` means the submission may
    /// be graded.
    async fn check_submission(&self, dir: &Path) -> Result<Option<Rejection>, GradeError> {
        let meta = match tokio::fs::metadata(dir).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Some(Rejection::MissingSubmission {
                    path: dir.to_owned(),
                }))
            }
            Err(e) => return Err(e.into()),
        };
        if !meta.is_dir() {
            return Ok(Some(Rejection::NotADirectory {
                path: dir.to_owned(),
            }));
        }

        let stats = dir_stats(dir).await?;
        if let Some(link) = stats.symlinks.first() {
            return Ok(Some(Rejection::SymlinkInSubmission {
                path: link.strip_prefix(dir).unwrap_or(link).to_owned(),
            }));
        }
        if stats.files == 0 {
            return Ok(Some(Rejection::EmptySubmission));
        }

        let max_kb = self.config.max_submission_size_kb;
        if max_kb > 0 && stats.bytes > (max_kb as u64) * 1024 {
            return Ok(Some(Rejection::SubmissionTooLarge {
                size_kb: (stats.bytes + 1023) / 1024,
                max_kb: max_kb as u64,
            }));
        }
        Ok(None)
    }
}

/// Find the grading result of a run: the result file in its output
/// directory if there is one, otherwise the last non-empty line of stdout.
async fn parse_grading_info(output_dir: &Path, output: &RunResult) -> Result<GradingInfo, String> {
    let result_path = output_dir.join(RESULT_FILENAME);
    match tokio::fs::read_to_string(&result_path).await {
        Ok(text) => {
            return GradingInfo::from_json(&text)
                .map_err(|e| format!("malformed {}: {}", RESULT_FILENAME, e))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(format!("failed to read {}: {}", result_path.display(), e)),
    }

    let line = output
        .stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| "grader printed nothing to stdout".to_owned())?;
    GradingInfo::from_json(line).map_err(|e| format!("last line of stdout is not a grading result: {}", e))
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::runner::output::BoundedBuffer;
    use crate::runner::ExitStatus;

    fn run_result(stdout: &str) -> RunResult {
        let mut buf = BoundedBuffer::new(0);
        buf.append(stdout.as_bytes());
        RunResult::new(
            buf.finish(),
            BoundedBuffer::new(0).finish(),
            ExitStatus::Code(0),
            Duration::from_millis(1),
        )
    }

    #[tokio::test]
    async fn test_parse_last_stdout_line() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_result("running tests...\n{\"score\": 3, \"max-points\": 4}\n\n");
        let info = parse_grading_info(dir.path(), &out).await.unwrap();
        assert_eq!(info.score, 3.0);
        assert_eq!(info.max_points, 4.0);
    }

    #[tokio::test]
    async fn test_result_file_wins_over_stdout() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join(RESULT_FILENAME), r#"{"score": 1, "max-points": 1}"#)
            .await
            .unwrap();
        let out = run_result("{\"score\": 0, \"max-points\": 1}\n");
        let info = parse_grading_info(dir.path(), &out).await.unwrap();
        assert_eq!(info.score, 1.0);
    }

    #[tokio::test]
    async fn test_parse_failures() {
        let dir = tempfile::tempdir().unwrap();
        parse_grading_info(dir.path(), &run_result("")).await.unwrap_err();
        parse_grading_info(dir.path(), &run_result("Segmentation fault\n"))
            .await
            .unwrap_err();
    }
}
