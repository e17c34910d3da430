//! Building and caching assignment images.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use dashmap::{mapref::entry::Entry, DashMap};
use err_derive::Error;
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tracing_futures::Instrument;

use crate::{
    assemble::{assemble, context_digest, AssembleError},
    config::GraderConfig,
    engine::{BuildLogLine, ContainerEngine, EngineBuildOptions},
    model::AssignmentImageSpec,
    util::fs::ScratchDir,
};

/// Image label holding the digest of the context an image was built from.
pub const CONTEXT_HASH_LABEL: &str = "autograder.context-hash";

pub const BUILD_DIR_PREFIX: &str = "autograder-docker-build-";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOptions {
    /// Ignore every cache and build from scratch.
    #[serde(default)]
    pub rebuild: bool,
}

/// What a finished build produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub tag: String,
    /// Digest of the build context, as stored in [`CONTEXT_HASH_LABEL`].
    pub context_hash: String,
    /// The existing image was up to date and no build ran.
    pub cached: bool,
    /// Accumulated engine build output.
    pub log: String,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(display = "Failed to create build directory: {}", _0)]
    TempDir(#[error(source)] std::io::Error),

    #[error(display = "Failed to assemble build context of {}: {}", tag, source)]
    Context {
        tag: String,
        #[error(source)]
        source: AssembleError,
    },

    #[error(display = "Image build of {} failed: {}", tag, message)]
    Engine {
        tag: String,
        message: String,
        detail: Option<String>,
        /// Build output up to the failure.
        log: String,
    },

    #[error(display = "Container engine failure while building {}: {:#}", tag, error)]
    EngineFailure {
        tag: String,
        error: anyhow::Error,
        log: String,
    },

    #[error(display = "Build of {} was aborted: {}", tag, reason)]
    Aborted { tag: String, reason: String },
}

impl BuildError {
    pub fn log(&self) -> Option<&str> {
        match self {
            BuildError::Engine { log, .. } | BuildError::EngineFailure { log, .. } => Some(log),
            _ => None,
        }
    }
}

type SharedBuild = Shared<BoxFuture<'static, Result<BuildReport, Arc<BuildError>>>>;

struct InFlightBuild {
    id: u64,
    build: SharedBuild,
}

/// Builds assignment images. At most one build per image tag runs at any
/// time; callers asking for a tag that is already being built wait for that
/// build and get its result.
#[derive(Clone)]
pub struct ImageBuilder {
    engine: Arc<dyn ContainerEngine>,
    config: Arc<GraderConfig>,
    in_flight: Arc<DashMap<String, InFlightBuild>>,
    next_build_id: Arc<AtomicU64>,
}

impl ImageBuilder {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: Arc<GraderConfig>) -> ImageBuilder {
        ImageBuilder {
            engine,
            config,
            in_flight: Arc::new(DashMap::new()),
            next_build_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Make sure the image of `spec` exists and is up to date.
    pub async fn ensure_built(
        &self,
        spec: &AssignmentImageSpec,
    ) -> Result<BuildReport, Arc<BuildError>> {
        self.build(spec, BuildOptions::default()).await
    }

    /// Build the image of `spec`, or join the build of its tag that is
    /// already running.
    ///
    /// The build itself runs on its own task: dropping this future does not
    /// cancel it for other callers.
    pub async fn build(
        &self,
        spec: &AssignmentImageSpec,
        options: BuildOptions,
    ) -> Result<BuildReport, Arc<BuildError>> {
        let tag = spec.image_tag();

        let build = match self.in_flight.entry(tag.clone()) {
            Entry::Occupied(entry) => {
                tracing::debug!(%tag, "Joining in-flight build");
                entry.get().build.clone()
            }
            Entry::Vacant(entry) => {
                let id = self.next_build_id.fetch_add(1, Ordering::Relaxed);
                let build = self.spawn_build(id, spec.clone(), options);
                entry.insert(InFlightBuild {
                    id,
                    build: build.clone(),
                });
                build
            }
        };

        build.await
    }

    /// Whether a build of `tag` is currently running.
    pub fn is_building(&self, tag: &str) -> bool {
        self.in_flight.contains_key(tag)
    }

    fn spawn_build(
        &self,
        id: u64,
        spec: AssignmentImageSpec,
        options: BuildOptions,
    ) -> SharedBuild {
        let tag = spec.image_tag();
        let job = BuildJob {
            engine: self.engine.clone(),
            tag: tag.clone(),
            spec,
            options,
            temp_root: self.config.temp_root.clone(),
            retain_context: self.config.debug,
            cpu_share: self.config.build_cpu_share,
        };

        let in_flight = self.in_flight.clone();
        let span = tracing::info_span!("image_build", %tag, rebuild = options.rebuild);
        let task_tag = tag.clone();
        let handle = tokio::spawn(
            async move {
                let res = job.run().await.map_err(Arc::new);
                in_flight.remove_if(&task_tag, |_, b| b.id == id);
                res
            }
            .instrument(span),
        );

        async move {
            match handle.await {
                Ok(res) => res,
                Err(e) => Err(Arc::new(BuildError::Aborted {
                    tag,
                    reason: e.to_string(),
                })),
            }
        }
        .boxed()
        .shared()
    }
}

/// One build of one image.
pub struct BuildJob {
    engine: Arc<dyn ContainerEngine>,
    tag: String,
    spec: AssignmentImageSpec,
    options: BuildOptions,
    temp_root: PathBuf,
    retain_context: bool,
    cpu_share: Option<f64>,
}

impl BuildJob {
    pub async fn run(self) -> Result<BuildReport, BuildError> {
        let tag = self.tag;
        let context = ScratchDir::create(
            &self.temp_root,
            &format!("{}{}-", BUILD_DIR_PREFIX, tag),
            self.retain_context,
        )
        .map_err(BuildError::TempDir)?;

        assemble(&self.spec, context.path())
            .await
            .map_err(|source| BuildError::Context {
                tag: tag.clone(),
                source,
            })?;
        let context_hash =
            context_digest(context.path())
                .await
                .map_err(|source| BuildError::Context {
                    tag: tag.clone(),
                    source,
                })?;

        if !self.options.rebuild {
            let labels = self.engine.image_labels(&tag).await.map_err(|error| {
                BuildError::EngineFailure {
                    tag: tag.clone(),
                    error,
                    log: String::new(),
                }
            })?;
            if let Some(labels) = labels {
                if labels.get(CONTEXT_HASH_LABEL) == Some(&context_hash) {
                    tracing::info!("Image is up to date, skipping build");
                    return Ok(BuildReport {
                        tag,
                        context_hash,
                        cached: true,
                        log: String::new(),
                    });
                }
                tracing::info!("Image is out of date, rebuilding");
            }
        }

        let mut labels = HashMap::new();
        labels.insert(CONTEXT_HASH_LABEL.to_owned(), context_hash.clone());
        let engine_options = EngineBuildOptions {
            tag: tag.clone(),
            no_cache: self.options.rebuild,
            labels,
            cpu_share: self.cpu_share,
        };

        tracing::info!(engine = self.engine.name(), "Building image");
        let mut build_log = self
            .engine
            .build_image(context.path(), engine_options)
            .await
            .map_err(|error| BuildError::EngineFailure {
                tag: tag.clone(),
                error,
                log: String::new(),
            })?;

        let mut log = String::new();
        while let Some(line) = build_log.next().await {
            match line {
                Ok(BuildLogLine::Stream(text)) => {
                    tracing::debug!("{}", text.trim_end());
                    log.push_str(&text);
                }
                Ok(BuildLogLine::Unrecognized(text)) => {
                    if !text.is_empty() {
                        tracing::trace!("{}", text);
                        log.push_str(&text);
                        log.push('\n');
                    }
                }
                Ok(BuildLogLine::Error { message, detail }) => {
                    tracing::warn!(%message, "Image build failed");
                    return Err(BuildError::Engine {
                        tag,
                        message,
                        detail,
                        log,
                    });
                }
                Err(error) => {
                    tracing::warn!("Container engine failed during build: {:#}", error);
                    return Err(BuildError::EngineFailure { tag, error, log });
                }
            }
        }

        tracing::info!("Image built");
        Ok(BuildReport {
            tag,
            context_hash,
            cached: false,
            log,
        })
    }
}
