use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::model::{ResourceLimits, DEFAULT_TIMEOUT_SECS};

/// Process-wide settings of the grading pipeline.
///
/// This value is passed explicitly into [`crate::Grader::new`]; nothing in the
/// pipeline reads ambient global state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraderConfig {
    /// Ceiling of captured stdout and stderr, each, in kilobytes. Zero or
    /// negative disables the limit.
    pub output_limit_kb: i64,

    /// Never use docker; grade every submission with the local runner.
    pub docker_disabled: bool,

    /// Leave temporary build and grading directories behind for inspection.
    pub debug: bool,

    /// Where temporary build and grading directories are created.
    pub temp_root: PathBuf,

    /// Largest accepted submission, in kilobytes. Zero or negative disables
    /// the check.
    pub max_submission_size_kb: i64,

    /// Limits applied to every run, unless the assignment overrides them.
    pub default_limits: ResourceLimits,

    /// CPU share available for image building use. This field will result
    /// in allowing the CPU to run `build_cpu_share * 100ms` in every 100ms
    /// CPU time.
    pub build_cpu_share: Option<f64>,
}

impl Default for GraderConfig {
    fn default() -> Self {
        GraderConfig {
            output_limit_kb: 4 * 1024,
            docker_disabled: false,
            debug: false,
            temp_root: std::env::temp_dir(),
            max_submission_size_kb: 10 * 1024,
            default_limits: ResourceLimits {
                timeout_secs: Some(DEFAULT_TIMEOUT_SECS),
                memory_bytes: Some(1 << 30),
                cpus: Some(1.0),
                max_processes: Some(256),
                network: Some(false),
                on_timeout: None,
            },
            build_cpu_share: Some(0.5),
        }
    }
}

impl GraderConfig {
    pub fn from_toml(s: &str) -> Result<GraderConfig, toml::de::Error> {
        toml::from_str(s)
    }

    pub async fn load(path: &Path) -> anyhow::Result<GraderConfig> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read grader config {}", path.display()))?;
        Self::from_toml(&text)
            .with_context(|| format!("Failed to parse grader config {}", path.display()))
    }
}
