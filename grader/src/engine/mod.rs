//! The container engine the pipeline builds images with and runs sandboxes
//! in.
//!
//! Everything engine-specific stays behind [`ContainerEngine`]; the builder
//! and the runner only ever see tags, container ids and streams.

use std::{collections::HashMap, path::Path};

use async_trait::async_trait;
use bytes::Bytes;
use derive_builder::Builder;
use futures::stream::BoxStream;

mod docker;

pub use docker::DockerEngine;

/// One classified line of an image build log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildLogLine {
    /// The engine reported an error. Fails the build.
    Error {
        message: String,
        detail: Option<String>,
    },
    /// Regular build output.
    Stream(String),
    /// Anything else the engine sent (progress, aux data, ...).
    Unrecognized(String),
}

impl BuildLogLine {
    pub fn is_error(&self) -> bool {
        matches!(self, BuildLogLine::Error { .. })
    }
}

/// Options of a single engine-level image build.
#[derive(Debug, Clone, Default)]
pub struct EngineBuildOptions {
    pub tag: String,
    /// Disable the engine's layer cache.
    pub no_cache: bool,
    /// Labels attached to the built image.
    pub labels: HashMap<String, String>,
    /// CPU share available to the build, e.g. `0.5`.
    pub cpu_share: Option<f64>,
}

/// A host directory bound into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// Everything needed to create one sandbox container.
#[derive(Debug, Clone, Builder)]
#[builder(setter(into), pattern = "owned")]
pub struct ContainerSpec {
    pub image: String,

    /// Container name. Must be unique among live containers.
    pub name: String,

    /// Command to run instead of the image's own `CMD`.
    #[builder(default)]
    pub cmd: Option<Vec<String>>,

    /// Environment, as `KEY=value` pairs.
    #[builder(default)]
    pub env: Vec<String>,

    #[builder(default)]
    pub labels: HashMap<String, String>,

    #[builder(default)]
    pub mounts: Vec<MountSpec>,

    #[builder(default)]
    pub working_dir: Option<String>,

    #[builder(default)]
    pub memory_bytes: Option<i64>,

    /// The CPU fraction allowed to use
    #[builder(default)]
    pub cpus: Option<f64>,

    #[builder(default)]
    pub max_processes: Option<i64>,

    #[builder(default = "false")]
    pub network_enabled: bool,
}

impl ContainerSpec {
    pub fn builder() -> ContainerSpecBuilder {
        ContainerSpecBuilder::default()
    }
}

/// A piece of a container's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Bytes),
    Stderr(Bytes),
}

pub type BuildLogStream = BoxStream<'static, anyhow::Result<BuildLogLine>>;
pub type OutputStream = BoxStream<'static, anyhow::Result<OutputChunk>>;

/// Some kind of container engine that can build images and run containers.
#[async_trait]
pub trait ContainerEngine: Send + Sync + 'static {
    /// The name of this engine, used in logs
    fn name(&self) -> &'static str;

    /// Labels of the image tagged `tag`, or `None` if there is no such image.
    async fn image_labels(&self, tag: &str) -> anyhow::Result<Option<HashMap<String, String>>>;

    /// Start building `context_dir` (which contains a `Dockerfile`) into an
    /// image. The build is finished once the returned log stream ends.
    async fn build_image(
        &self,
        context_dir: &Path,
        options: EngineBuildOptions,
    ) -> anyhow::Result<BuildLogStream>;

    /// Create a container, returning its id.
    async fn create_container(&self, spec: ContainerSpec) -> anyhow::Result<String>;

    async fn start_container(&self, id: &str) -> anyhow::Result<()>;

    /// Follow the output of a started container until it exits.
    async fn output(&self, id: &str) -> anyhow::Result<OutputStream>;

    /// Exit code of a container that has stopped.
    async fn exit_code(&self, id: &str) -> anyhow::Result<i64>;

    async fn kill_container(&self, id: &str) -> anyhow::Result<()>;

    /// Forcibly remove a container, along with its anonymous volumes.
    async fn remove_container(&self, id: &str) -> anyhow::Result<()>;
}
