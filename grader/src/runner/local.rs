//! Grading without docker: the assignment's invocation runs as a plain
//! subprocess inside a grading directory laid out like the image.
//!
//! Only the timeout is enforced here; memory, CPU and process limits need the
//! sandbox.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Instant,
};

use tokio::{io::AsyncRead, process::Command};

use crate::{
    assemble::{GradingDirs, DOCKER_BASE_DIR},
    model::{AssignmentImageSpec, ResourceLimits},
};

use super::{
    grading_env,
    model::{ExitStatus, RunError, RunResult},
    output::BoundedBuffer,
};

#[derive(Debug, Clone)]
pub struct LocalRunner {
    output_limit_kb: i64,
}

impl LocalRunner {
    pub fn new(output_limit_kb: i64) -> LocalRunner {
        LocalRunner { output_limit_kb }
    }

    /// Run the invocation of `spec` in `dirs`, which must already hold the
    /// grading config, the static files and the submission.
    #[tracing::instrument(skip_all, fields(assignment = %spec.full_id(), base = %dirs.base.display()))]
    pub async fn run(
        &self,
        spec: &AssignmentImageSpec,
        dirs: &GradingDirs,
        identity: &str,
        limits: &ResourceLimits,
    ) -> Result<RunResult, RunError> {
        let invocation = match &spec.invocation {
            Some(inv) if !inv.is_empty() => inv,
            _ => return Err(RunError::NoInvocation(spec.full_id())),
        };
        let args = invocation
            .iter()
            .map(|arg| localize_arg(arg, &dirs.base))
            .collect::<Vec<_>>();

        let mut cmd = Command::new(&args[0]);
        cmd.args(&args[1..])
            .current_dir(&dirs.base)
            .envs(grading_env(&dirs.base, &dirs.input, &dirs.output, identity))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(command = ?args, "Spawning grading process");
        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| RunError::Spawn {
            command: args.clone(),
            source,
        })?;

        let mut child_stdout = child.stdout.take();
        let mut child_stderr = child.stderr.take();
        let mut stdout = BoundedBuffer::new(self.output_limit_kb);
        let mut stderr = BoundedBuffer::new(self.output_limit_kb);

        let limit = limits.timeout();
        let execution = async {
            tokio::try_join!(
                capture(&mut stdout, child_stdout.as_mut()),
                capture(&mut stderr, child_stderr.as_mut()),
            )?;
            child.wait().await
        };
        let outcome = tokio::time::timeout(limit, execution).await;
        let duration = start.elapsed();

        match outcome {
            Ok(Ok(status)) => Ok(RunResult::new(
                stdout.finish(),
                stderr.finish(),
                ExitStatus::Code(exit_code(status)),
                duration,
            )),
            Ok(Err(e)) => Err(RunError::Io(e)),
            Err(_) => {
                tracing::info!(?limit, "Grading process timed out, killing it");
                if let Err(e) = child.kill().await {
                    tracing::warn!("Failed to kill grading process: {}", e);
                }
                let partial = RunResult::new(
                    stdout.finish(),
                    stderr.finish(),
                    ExitStatus::Timeout,
                    duration,
                );
                Err(RunError::Timeout {
                    tag: spec.full_id(),
                    limit,
                    partial: Some(Box::new(partial)),
                })
            }
        }
    }
}

/// Read a pipe into `buf`; whatever does not fit is read and thrown away so
/// the process never blocks on a full pipe.
async fn capture<R>(buf: &mut BoundedBuffer, pipe: Option<&mut R>) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    if let Some(pipe) = pipe {
        if buf.read_from(pipe).await? {
            tokio::io::copy(pipe, &mut tokio::io::sink()).await?;
        }
    }
    Ok(())
}

/// Point an in-image path (`/autograder/...`) at the local grading directory.
fn localize_arg(arg: &str, base: &Path) -> String {
    if arg == DOCKER_BASE_DIR {
        return base.to_string_lossy().into_owned();
    }
    match arg.strip_prefix(DOCKER_BASE_DIR) {
        Some(rest) if rest.starts_with('/') => {
            let local: PathBuf = base.join(rest.trim_start_matches('/'));
            local.to_string_lossy().into_owned()
        }
        _ => arg.to_owned(),
    }
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i64 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code as i64,
        (None, Some(sig)) => -(sig as i64),
        (None, None) => -1,
    }
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i64 {
    status.code().map_or(-1, |c| c as i64)
}
