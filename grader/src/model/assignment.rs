//! How an assignment's sandbox image is described.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Deserializer, Serialize};

use crate::util::{names, string_or_list, string_or_struct, Void};

/// Timeout used when neither the assignment nor the grader config sets one.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Everything needed to build (and run) the sandbox image of one assignment.
///
/// Owned by the course model; the pipeline only ever reads it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct AssignmentImageSpec {
    pub course_id: String,
    pub assignment_id: String,

    /// Directory that relative static file sources are resolved against.
    /// Usually the directory the assignment config was loaded from.
    #[serde(default)]
    pub base_dir: PathBuf,

    /// The base image, e.g. `python:3.11-slim`.
    pub image: String,

    /// Files copied into the image's work directory, in declared order.
    #[serde(default)]
    pub static_files: Vec<StaticFile>,

    /// Build commands emitted before any static file is visible in the image.
    #[serde(default, deserialize_with = "string_or_list")]
    pub pre_static_docker_commands: Vec<String>,

    /// Build commands emitted after all static files are copied in.
    #[serde(default, deserialize_with = "string_or_list")]
    pub post_static_docker_commands: Vec<String>,

    /// The grading command. Becomes the image's `CMD`, and is what the local
    /// (non-docker) runner executes. When absent the base image's command is
    /// used and local grading is unavailable.
    #[serde(default)]
    pub invocation: Option<Vec<String>>,

    /// Resource limits for grading runs. Unset fields fall back to the grader
    /// defaults.
    #[serde(default)]
    pub limits: ResourceLimits,

    /// Opaque payload written into the image as `config.json`.
    #[serde(default)]
    pub grading_config: serde_json::Value,
}

impl AssignmentImageSpec {
    /// Load a spec from a JSON file, resolving static files relative to the
    /// file's directory unless `base-dir` is given explicitly.
    pub async fn load_json(path: &Path) -> anyhow::Result<AssignmentImageSpec> {
        let text = tokio::fs::read(path).await?;
        let spec: AssignmentImageSpec = serde_json::from_slice(&text)?;
        Ok(spec.with_default_base_dir(path))
    }

    /// Load a spec from a TOML file, see [`AssignmentImageSpec::load_json`].
    pub async fn load_toml(path: &Path) -> anyhow::Result<AssignmentImageSpec> {
        let text = tokio::fs::read_to_string(path).await?;
        let spec: AssignmentImageSpec = toml::from_str(&text)?;
        Ok(spec.with_default_base_dir(path))
    }

    fn with_default_base_dir(mut self, config_path: &Path) -> Self {
        if self.base_dir.as_os_str().is_empty() {
            if let Some(parent) = config_path.parent() {
                self.base_dir = parent.to_owned();
            }
        } else if self.base_dir.is_relative() {
            if let Some(parent) = config_path.parent() {
                self.base_dir = parent.join(&self.base_dir);
            }
        }
        self
    }

    /// `course/assignment`, for logs and messages.
    pub fn full_id(&self) -> String {
        format!("{}/{}", self.course_id, self.assignment_id)
    }

    /// The tag this assignment's image is built and cached under.
    pub fn image_tag(&self) -> String {
        names::image_tag(&self.course_id, &self.assignment_id)
    }
}

/// One static file (or directory) copied into the image's work directory.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct StaticFile {
    /// Source path, relative to the assignment's base directory.
    pub source: PathBuf,
    /// Destination relative to the work directory. Defaults to the source's
    /// file name.
    pub dest: Option<PathBuf>,
    /// Transforms run on the work directory before the copy.
    pub pre_ops: Vec<FileOp>,
    /// Transforms run on the work directory after the copy.
    pub post_ops: Vec<FileOp>,
}

impl StaticFile {
    pub fn new(source: impl Into<PathBuf>) -> StaticFile {
        StaticFile {
            source: source.into(),
            dest: None,
            pre_ops: vec![],
            post_ops: vec![],
        }
    }

    /// The destination of this file relative to the work directory, or
    /// `None` if the source has no file name (e.g. `..`).
    pub fn dest_path(&self) -> Option<PathBuf> {
        match &self.dest {
            Some(dest) => Some(dest.clone()),
            None => self.source.file_name().map(PathBuf::from),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct StaticFileFields {
    source: PathBuf,
    #[serde(default)]
    dest: Option<PathBuf>,
    #[serde(default)]
    pre_ops: Vec<FileOp>,
    #[serde(default)]
    post_ops: Vec<FileOp>,
}

impl FromStr for StaticFileFields {
    type Err = Void;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(StaticFileFields {
            source: s.into(),
            dest: None,
            pre_ops: vec![],
            post_ops: vec![],
        })
    }
}

impl<'de> Deserialize<'de> for StaticFile {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let fields: StaticFileFields = string_or_struct(deserializer)?;
        Ok(StaticFile {
            source: fields.source,
            dest: fields.dest,
            pre_ops: fields.pre_ops,
            post_ops: fields.post_ops,
        })
    }
}

/// A transform hook applied to the work directory of a build context. All
/// paths are relative to the work directory and may not leave it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum FileOp {
    Copy { from: PathBuf, to: PathBuf },
    Move { from: PathBuf, to: PathBuf },
    Mkdir { path: PathBuf },
    Remove { path: PathBuf },
}

impl fmt::Display for FileOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileOp::Copy { from, to } => write!(f, "copy {} -> {}", from.display(), to.display()),
            FileOp::Move { from, to } => write!(f, "move {} -> {}", from.display(), to.display()),
            FileOp::Mkdir { path } => write!(f, "mkdir {}", path.display()),
            FileOp::Remove { path } => write!(f, "remove {}", path.display()),
        }
    }
}

/// What a wall-clock timeout means for a grading run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TimeoutPolicy {
    /// The run failed; grading reports an infrastructure timeout.
    Error,
    /// The assignment's grader reports timeouts itself, so whatever it
    /// printed before being stopped is still parsed.
    ParseOutput,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        TimeoutPolicy::Error
    }
}

/// Resource ceilings of a grading run. Every field is optional so that an
/// assignment can override only some of the grader defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct ResourceLimits {
    /// Wall-clock timeout, in seconds.
    pub timeout_secs: Option<u64>,
    /// Memory limit of the container, in bytes.
    pub memory_bytes: Option<i64>,
    /// CPU share, e.g. `0.5` for half a core.
    pub cpus: Option<f64>,
    /// Maximum number of processes inside the container.
    pub max_processes: Option<i64>,
    /// Whether the container gets network access. Defaults to false.
    pub network: Option<bool>,
    pub on_timeout: Option<TimeoutPolicy>,
}

impl ResourceLimits {
    /// Fill every unset field from `defaults`.
    pub fn merged_over(&self, defaults: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            timeout_secs: self.timeout_secs.or(defaults.timeout_secs),
            memory_bytes: self.memory_bytes.or(defaults.memory_bytes),
            cpus: self.cpus.or(defaults.cpus),
            max_processes: self.max_processes.or(defaults.max_processes),
            network: self.network.or(defaults.network),
            on_timeout: self.on_timeout.or(defaults.on_timeout),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS))
    }

    pub fn network_enabled(&self) -> bool {
        self.network.unwrap_or(false)
    }

    pub fn timeout_policy(&self) -> TimeoutPolicy {
        self.on_timeout.unwrap_or_default()
    }
}
