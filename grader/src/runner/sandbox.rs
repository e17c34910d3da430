//! Running built images as resource-bounded sandbox containers.

use std::{collections::HashMap, path::Path, sync::Arc, time::Instant};

use tokio_stream::StreamExt;

use crate::{
    assemble::{DOCKER_BASE_DIR, DOCKER_INPUT_DIR, DOCKER_OUTPUT_DIR},
    engine::{ContainerEngine, ContainerSpec, MountSpec, OutputChunk},
    model::ResourceLimits,
    util::{fs::absolute, names::unique_container_name},
};

use super::{
    grading_env,
    model::{ExitStatus, RunError, RunResult},
    output::BoundedBuffer,
};

/// Label carrying the identity a container grades for.
pub const USER_LABEL: &str = "autograder.user";

/// A live container. Removed explicitly with [`Container::remove`]; if it is
/// dropped before that (the run was cancelled or panicked), a forced removal
/// is spawned onto the current runtime.
pub struct Container {
    engine: Arc<dyn ContainerEngine>,
    id: String,
    name: String,
    removed: bool,
}

impl Container {
    pub async fn create(
        engine: Arc<dyn ContainerEngine>,
        spec: ContainerSpec,
    ) -> anyhow::Result<Container> {
        let name = spec.name.clone();
        let id = engine.create_container(spec).await?;
        tracing::debug!(container = %name, %id, "Created container");
        Ok(Container {
            engine,
            id,
            name,
            removed: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn remove(mut self) -> anyhow::Result<()> {
        self.engine.remove_container(&self.id).await?;
        self.removed = true;
        tracing::debug!(container = %self.name, "Removed container");
        Ok(())
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        let id = std::mem::take(&mut self.id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(container = %self.name, "Container dropped without removal, removing it");
                let engine = self.engine.clone();
                let name = std::mem::take(&mut self.name);
                handle.spawn(async move {
                    if let Err(e) = engine.remove_container(&id).await {
                        tracing::error!(container = %name, "Failed to remove container: {:#}", e);
                    }
                });
            }
            Err(_) => {
                tracing::error!(container = %self.name, %id, "No runtime left to remove container");
            }
        }
    }
}

/// Runs grading images in containers.
#[derive(Clone)]
pub struct SandboxRunner {
    engine: Arc<dyn ContainerEngine>,
    output_limit_kb: i64,
}

impl SandboxRunner {
    pub fn new(engine: Arc<dyn ContainerEngine>, output_limit_kb: i64) -> SandboxRunner {
        SandboxRunner {
            engine,
            output_limit_kb,
        }
    }

    /// Run `image_tag` once, with `input_dir` mounted read-only as the
    /// container's input directory and `output_dir` as its output directory.
    ///
    /// A non-zero exit code is part of the result. Running into the
    /// timeout kills the container and returns [`RunError::Timeout`] with the
    /// output captured so far. The container is removed on every path.
    #[tracing::instrument(skip(self, input_dir, output_dir, limits), fields(engine = self.engine.name()))]
    pub async fn run(
        &self,
        image_tag: &str,
        input_dir: &Path,
        output_dir: &Path,
        identity: &str,
        limits: &ResourceLimits,
    ) -> Result<RunResult, RunError> {
        let spec = self.container_spec(image_tag, input_dir, output_dir, identity, limits)?;

        let container = Container::create(self.engine.clone(), spec)
            .await
            .map_err(|e| RunError::engine(image_tag, e))?;

        let res = self.run_in(&container, image_tag, limits).await;

        if let Err(e) = container.remove().await {
            tracing::warn!("{:#}", e);
        }

        match &res {
            Ok(r) => tracing::info!(status = %r.status, duration = ?r.duration, "Grading run finished"),
            Err(e) => tracing::warn!("Grading run failed: {}", e),
        }
        res
    }

    fn container_spec(
        &self,
        image_tag: &str,
        input_dir: &Path,
        output_dir: &Path,
        identity: &str,
        limits: &ResourceLimits,
    ) -> Result<ContainerSpec, RunError> {
        let input_dir = absolute(input_dir).map_err(RunError::Io)?;
        let output_dir = absolute(output_dir).map_err(RunError::Io)?;

        let env = grading_env(
            Path::new(DOCKER_BASE_DIR),
            Path::new(DOCKER_INPUT_DIR),
            Path::new(DOCKER_OUTPUT_DIR),
            identity,
        )
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>();

        let mut labels = HashMap::new();
        labels.insert(USER_LABEL.to_owned(), identity.to_owned());

        ContainerSpec::builder()
            .image(image_tag)
            .name(unique_container_name(image_tag))
            .env(env)
            .labels(labels)
            .working_dir(DOCKER_BASE_DIR.to_owned())
            .mounts(vec![
                MountSpec {
                    source: input_dir.to_string_lossy().into_owned(),
                    target: DOCKER_INPUT_DIR.into(),
                    read_only: true,
                },
                MountSpec {
                    source: output_dir.to_string_lossy().into_owned(),
                    target: DOCKER_OUTPUT_DIR.into(),
                    read_only: false,
                },
            ])
            .memory_bytes(limits.memory_bytes)
            .cpus(limits.cpus)
            .max_processes(limits.max_processes)
            .network_enabled(limits.network_enabled())
            .build()
            .map_err(|e| RunError::engine(image_tag, anyhow::anyhow!("{}", e)))
    }

    async fn run_in(
        &self,
        container: &Container,
        tag: &str,
        limits: &ResourceLimits,
    ) -> Result<RunResult, RunError> {
        let engine = &self.engine;
        let id = container.id();
        let limit = limits.timeout();

        let mut stdout = BoundedBuffer::new(self.output_limit_kb);
        let mut stderr = BoundedBuffer::new(self.output_limit_kb);

        let start = Instant::now();
        let execution = async {
            engine.start_container(id).await?;
            let mut output = engine.output(id).await?;
            while let Some(chunk) = output.next().await {
                match chunk? {
                    OutputChunk::Stdout(bytes) => stdout.append(&bytes),
                    OutputChunk::Stderr(bytes) => stderr.append(&bytes),
                }
            }
            engine.exit_code(id).await
        };
        let outcome = tokio::time::timeout(limit, execution).await;
        let duration = start.elapsed();

        match outcome {
            Ok(Ok(code)) => Ok(RunResult::new(
                stdout.finish(),
                stderr.finish(),
                ExitStatus::Code(code),
                duration,
            )),
            Ok(Err(e)) => Err(RunError::engine(tag, e)),
            Err(_) => {
                tracing::info!(container = %container.name(), ?limit, "Run timed out, killing container");
                if let Err(e) = engine.kill_container(id).await {
                    tracing::warn!("{:#}", e);
                }
                let partial = RunResult::new(
                    stdout.finish(),
                    stderr.finish(),
                    ExitStatus::Timeout,
                    duration,
                );
                Err(RunError::Timeout {
                    tag: tag.to_owned(),
                    limit,
                    partial: Some(Box::new(partial)),
                })
            }
        }
    }
}
