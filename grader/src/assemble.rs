//! Build context assembly.
//!
//! Turns an [`AssignmentImageSpec`] into a self-contained directory that the
//! container engine can build an image from:
//!
//! ```text
//! <context>/
//!   Dockerfile      generated build manifest
//!   config.json     the assignment's grading config
//!   input/          empty, mirrors /autograder/input
//!   output/         empty, mirrors /autograder/output
//!   work/           static files, after their transforms
//! ```
//!
//! The same layout (minus the `Dockerfile`) doubles as the grading directory
//! of the local runner.

use std::{
    io,
    path::{Path, PathBuf},
};

use err_derive::Error;
use path_slash::PathExt;
use sha2::{Digest, Sha256};

use crate::{
    model::{AssignmentImageSpec, FileOp, StaticFile},
    util::{
        fs::{canonical_join, copy_path, list_files, remove_path, sorted_entries},
        path_security::resolve_child_path,
    },
};

pub const DOCKER_BASE_DIR: &str = "/autograder";
pub const DOCKER_INPUT_DIR: &str = "/autograder/input";
pub const DOCKER_OUTPUT_DIR: &str = "/autograder/output";
pub const DOCKER_WORK_DIR: &str = "/autograder/work";
pub const DOCKER_CONFIG_PATH: &str = "/autograder/config.json";

pub const INPUT_DIRNAME: &str = "input";
pub const OUTPUT_DIRNAME: &str = "output";
pub const WORK_DIRNAME: &str = "work";
pub const CONFIG_FILENAME: &str = "config.json";
pub const MANIFEST_FILENAME: &str = "Dockerfile";

#[derive(Debug, Error)]
pub enum AssembleError {
    #[error(display = "Could not create directory {:?}: {}", path, source)]
    CreateDir {
        path: PathBuf,
        #[error(source)]
        source: io::Error,
    },

    #[error(display = "Invalid static file {:?}: {}", path, reason)]
    InvalidStaticFile { path: PathBuf, reason: String },

    #[error(display = "Failed to copy static file {:?} to {:?}: {}", from, to, source)]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[error(source)]
        source: io::Error,
    },

    #[error(display = "File operation '{}' failed: {}", op, reason)]
    FileOp { op: FileOp, reason: String },

    #[error(display = "Failed to serialize grading config: {}", _0)]
    SerializeConfig(#[error(source)] serde_json::Error),

    #[error(display = "Failed to write {:?}: {}", path, source)]
    Write {
        path: PathBuf,
        #[error(source)]
        source: io::Error,
    },

    #[error(display = "Failed to read {:?}: {}", path, source)]
    Read {
        path: PathBuf,
        #[error(source)]
        source: io::Error,
    },
}

/// The standard directories of a build context or grading directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GradingDirs {
    pub base: PathBuf,
    pub input: PathBuf,
    pub output: PathBuf,
    pub work: PathBuf,
}

impl GradingDirs {
    pub fn in_base(base: &Path) -> GradingDirs {
        GradingDirs {
            base: base.to_owned(),
            input: base.join(INPUT_DIRNAME),
            output: base.join(OUTPUT_DIRNAME),
            work: base.join(WORK_DIRNAME),
        }
    }

    /// Create every standard directory under `base`.
    pub async fn create(base: &Path) -> Result<GradingDirs, AssembleError> {
        let dirs = GradingDirs::in_base(base);
        for dir in [&dirs.base, &dirs.input, &dirs.output, &dirs.work] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| AssembleError::CreateDir {
                    path: dir.clone(),
                    source,
                })?;
        }
        Ok(dirs)
    }

    pub fn config_path(&self) -> PathBuf {
        self.base.join(CONFIG_FILENAME)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.base.join(MANIFEST_FILENAME)
    }
}

/// Assemble a complete build context for `spec` inside `dest_dir`.
///
/// On failure the partially written context is left as is; discarding it is
/// up to the caller.
#[tracing::instrument(skip(spec), fields(assignment = %spec.full_id()))]
pub async fn assemble(
    spec: &AssignmentImageSpec,
    dest_dir: &Path,
) -> Result<GradingDirs, AssembleError> {
    let dirs = lay_out_grading_dir(spec, dest_dir).await?;

    let work_entries = work_entries(&dirs.work).await?;
    let path = dirs.manifest_path();
    tokio::fs::write(&path, manifest(spec, &work_entries))
        .await
        .map_err(|source| AssembleError::Write { path, source })?;

    tracing::debug!(static_entries = work_entries.len(), "Build context assembled");
    Ok(dirs)
}

/// Create the standard directories, copy and transform the static files and
/// write the grading config. Everything but the build manifest.
pub async fn lay_out_grading_dir(
    spec: &AssignmentImageSpec,
    dest_dir: &Path,
) -> Result<GradingDirs, AssembleError> {
    let dirs = GradingDirs::create(dest_dir).await?;

    for file in &spec.static_files {
        apply_static_file(spec, &dirs, file).await?;
    }

    let config = serde_json::to_vec_pretty(&spec.grading_config)
        .map_err(AssembleError::SerializeConfig)?;
    let path = dirs.config_path();
    tokio::fs::write(&path, config)
        .await
        .map_err(|source| AssembleError::Write { path, source })?;

    Ok(dirs)
}

async fn apply_static_file(
    spec: &AssignmentImageSpec,
    dirs: &GradingDirs,
    file: &StaticFile,
) -> Result<(), AssembleError> {
    let invalid = |reason: String| AssembleError::InvalidStaticFile {
        path: file.source.clone(),
        reason,
    };

    let from = canonical_join(&spec.base_dir, &file.source).map_err(|e| invalid(e.to_string()))?;
    let dest = file
        .dest_path()
        .ok_or_else(|| invalid("cannot derive a destination name".into()))?;
    let to = resolve_child_path(&dirs.work, &dest).map_err(invalid)?;

    for op in &file.pre_ops {
        apply_file_op(&dirs.work, op).await?;
    }

    copy_path(&from, &to)
        .await
        .map_err(|source| AssembleError::Copy { from, to, source })?;

    for op in &file.post_ops {
        apply_file_op(&dirs.work, op).await?;
    }
    Ok(())
}

/// Run one transform hook inside `work_dir`.
pub async fn apply_file_op(work_dir: &Path, op: &FileOp) -> Result<(), AssembleError> {
    let fail = |reason: String| AssembleError::FileOp {
        op: op.clone(),
        reason,
    };
    let resolve = |path: &Path| resolve_child_path(work_dir, path).map_err(fail);

    let res = match op {
        FileOp::Copy { from, to } => copy_path(&resolve(from)?, &resolve(to)?).await,
        FileOp::Move { from, to } => {
            let (from, to) = (resolve(from)?, resolve(to)?);
            if let Some(parent) = to.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| fail(e.to_string()))?;
            }
            tokio::fs::rename(from, to).await
        }
        FileOp::Mkdir { path } => tokio::fs::create_dir_all(resolve(path)?).await,
        FileOp::Remove { path } => remove_path(&resolve(path)?).await,
    };
    res.map_err(|e| fail(e.to_string()))
}

/// Top-level names in the work directory, in name order.
async fn work_entries(work_dir: &Path) -> Result<Vec<String>, AssembleError> {
    let entries = sorted_entries(work_dir)
        .await
        .map_err(|source| AssembleError::Read {
            path: work_dir.to_owned(),
            source,
        })?;
    Ok(entries
        .iter()
        .filter_map(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .collect())
}

/// Generate the build manifest for `spec`, given the (already transformed)
/// top-level entries of the work directory.
///
/// Pre-static commands run before any static file is visible in the image,
/// post-static commands after all of them are copied in.
pub fn manifest(spec: &AssignmentImageSpec, work_entries: &[String]) -> String {
    let mut lines: Vec<String> = vec![];

    lines.push(format!("FROM {}", spec.image));
    lines.push(String::new());

    lines.push("# Core directories".into());
    for dir in [DOCKER_BASE_DIR, DOCKER_INPUT_DIR, DOCKER_OUTPUT_DIR, DOCKER_WORK_DIR] {
        lines.push(format!("RUN mkdir -p '{}'", dir));
    }
    lines.push(String::new());

    lines.push(format!("WORKDIR {}", DOCKER_BASE_DIR));
    lines.push(String::new());

    lines.push(format!("COPY {} {}", CONFIG_FILENAME, DOCKER_CONFIG_PATH));
    lines.push(String::new());

    lines.push("# Pre-Static Commands".into());
    lines.extend(spec.pre_static_docker_commands.iter().cloned());
    lines.push(String::new());

    lines.push("# Static Files".into());
    for entry in work_entries {
        let source = format!("{}/{}", WORK_DIRNAME, entry);
        let dest = format!("{}/{}", DOCKER_WORK_DIR, entry);
        lines.push(format!("COPY {}", json_array(&[source, dest])));
    }
    lines.push(String::new());

    lines.push("# Post-Static Commands".into());
    lines.extend(spec.post_static_docker_commands.iter().cloned());
    lines.push(String::new());

    if let Some(invocation) = &spec.invocation {
        lines.push(format!("CMD {}", json_array(invocation)));
        lines.push(String::new());
    }

    lines.join("\n")
}

fn json_array(items: &[String]) -> String {
    // A list of strings always serializes.
    serde_json::to_string(items).unwrap_or_default()
}

/// A digest over everything in an assembled context: each file's path
/// (relative, forward slashes) and contents, in name order. Two contexts with
/// the same digest build the same image.
pub async fn context_digest(context_dir: &Path) -> Result<String, AssembleError> {
    let read_err = |source| AssembleError::Read {
        path: context_dir.to_owned(),
        source,
    };

    let mut hasher = Sha256::new();
    for file in list_files(context_dir).await.map_err(read_err)? {
        let relative = file
            .strip_prefix(context_dir)
            .unwrap_or(&file)
            .to_slash_lossy();
        let contents = tokio::fs::read(&file)
            .await
            .map_err(|source| AssembleError::Read {
                path: file.clone(),
                source,
            })?;

        hasher.update(relative.as_bytes());
        hasher.update([0u8]);
        hasher.update((contents.len() as u64).to_le_bytes());
        hasher.update(&contents);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
