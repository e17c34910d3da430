use std::{collections::HashMap, path::Path};

use anyhow::Context;
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogOutput,
        LogsOptions, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
    },
    errors::Error as DockerError,
    image::BuildImageOptions,
    models::{BuildInfo, HostConfig, Mount, MountTypeEnum},
    Docker,
};
use futures::{future, StreamExt};
use hyper::Body;

use super::{
    BuildLogLine, BuildLogStream, ContainerEngine, ContainerSpec, EngineBuildOptions,
    OutputChunk, OutputStream,
};
use crate::{assemble::MANIFEST_FILENAME, util::tar::pack_as_tar};

/// [`ContainerEngine`] backed by a Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn new(docker: Docker) -> DockerEngine {
        DockerEngine { docker }
    }

    pub fn connect_with_local_defaults() -> anyhow::Result<DockerEngine> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to docker")?;
        Ok(DockerEngine::new(docker))
    }
}

/// Errors inside a docker response stream that do not end the stream.
pub fn is_recoverable_error(e: &DockerError) -> bool {
    matches!(
        &e,
        DockerError::JsonDataError { .. }
            | DockerError::JsonSerdeError { .. }
            | DockerError::StrParseError { .. }
            | DockerError::StrFmtError { .. }
            | DockerError::URLEncodedError { .. }
    )
}

fn is_not_found(e: &DockerError) -> bool {
    matches!(
        e,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

impl From<BuildInfo> for BuildLogLine {
    fn from(info: BuildInfo) -> Self {
        if let Some(message) = info.error {
            BuildLogLine::Error {
                message,
                detail: info.error_detail.and_then(|d| d.message),
            }
        } else if let Some(stream) = info.stream {
            BuildLogLine::Stream(stream)
        } else {
            let status = [info.status, info.progress]
                .iter()
                .flatten()
                .cloned()
                .collect::<Vec<_>>()
                .join(" ");
            BuildLogLine::Unrecognized(status)
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn image_labels(&self, tag: &str) -> anyhow::Result<Option<HashMap<String, String>>> {
        match self.docker.inspect_image(tag).await {
            Ok(image) => Ok(Some(
                image
                    .config
                    .and_then(|config| config.labels)
                    .unwrap_or_default(),
            )),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(anyhow::Error::new(e).context(format!("Failed to inspect image {}", tag))),
        }
    }

    async fn build_image(
        &self,
        context_dir: &Path,
        options: EngineBuildOptions,
    ) -> anyhow::Result<BuildLogStream> {
        let cpu_quota = options.cpu_share.map(|x| (x * 100_000f64).floor() as u64);
        let cpu_period = cpu_quota.map(|_| 100_000);

        let build_options = BuildImageOptions::<String> {
            dockerfile: MANIFEST_FILENAME.into(),
            t: options.tag.clone(),
            nocache: options.no_cache,
            rm: true,
            cpuquota: cpu_quota,
            cpuperiod: cpu_period,
            labels: options.labels,
            ..Default::default()
        };

        let (tar, join_tar) = pack_as_tar(context_dir.to_owned());

        let log = self
            .docker
            .build_image(build_options, None, Some(Body::wrap_stream(tar)))
            .filter_map(|info| {
                future::ready(match info {
                    Ok(info) => Some(Ok(BuildLogLine::from(info))),
                    Err(e) if is_recoverable_error(&e) => {
                        tracing::warn!("Skipping malformed build log entry: {}", e);
                        None
                    }
                    Err(e) => Some(Err(anyhow::Error::new(e).context("Image build failed"))),
                })
            });

        // the archive is complete once the daemon stops reading it
        let archive_result = futures::stream::once(async move {
            match join_tar.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(Err(
                    anyhow::Error::new(e).context("Failed to archive build context")
                )),
                Err(e) => Some(Err(
                    anyhow::Error::new(e).context("Internal panic when archiving files")
                )),
            }
        })
        .filter_map(future::ready);

        Ok(log.chain(archive_result).boxed())
    }

    async fn create_container(&self, spec: ContainerSpec) -> anyhow::Result<String> {
        let mounts = spec
            .mounts
            .into_iter()
            .map(|m| Mount {
                target: Some(m.target),
                source: Some(m.source),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(m.read_only),
                ..Default::default()
            })
            .collect();

        let res = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    ..Default::default()
                }),
                Config {
                    image: Some(spec.image),
                    cmd: spec.cmd,
                    env: Some(spec.env),
                    labels: Some(spec.labels),
                    working_dir: spec.working_dir,
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(false),
                    network_disabled: Some(!spec.network_enabled),
                    host_config: Some(HostConfig {
                        mounts: Some(mounts),
                        memory: spec.memory_bytes,
                        nano_cpus: spec.cpus.map(|x| (x * 1e9) as i64),
                        pids_limit: spec.max_processes,
                        network_mode: if spec.network_enabled {
                            None
                        } else {
                            Some("none".into())
                        },
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await
            .with_context(|| format!("Failed to create container {}", spec.name))?;

        for warning in &res.warnings {
            tracing::warn!(container = %spec.name, "{}", warning);
        }
        Ok(res.id)
    }

    async fn start_container(&self, id: &str) -> anyhow::Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .with_context(|| format!("Failed to start container {}", id))
    }

    async fn output(&self, id: &str) -> anyhow::Result<OutputStream> {
        let logs = self
            .docker
            .logs(
                id,
                Some(LogsOptions::<String> {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                }),
            )
            .filter_map(|out| {
                future::ready(match out {
                    Ok(LogOutput::StdOut { message }) => Some(Ok(OutputChunk::Stdout(message))),
                    Ok(LogOutput::StdErr { message }) => Some(Ok(OutputChunk::Stderr(message))),
                    Ok(LogOutput::StdIn { .. }) | Ok(LogOutput::Console { .. }) => None,
                    Err(e) if is_recoverable_error(&e) => None,
                    Err(e) => Some(Err(e.into())),
                })
            });
        Ok(logs.boxed())
    }

    async fn exit_code(&self, id: &str) -> anyhow::Result<i64> {
        // A non-zero exit surfaces as an error item on some daemon versions;
        // the code is read back from the container state either way.
        let _ = self
            .docker
            .wait_container(
                id,
                Some(WaitContainerOptions {
                    condition: "not-running",
                }),
            )
            .collect::<Vec<_>>()
            .await;

        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .with_context(|| format!("Failed to inspect container {}", id))?;
        info.state
            .and_then(|state| state.exit_code)
            .ok_or_else(|| anyhow::anyhow!("Container {} reported no exit code", id))
    }

    async fn kill_container(&self, id: &str) -> anyhow::Result<()> {
        self.docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await
            .with_context(|| format!("Failed to kill container {}", id))
    }

    async fn remove_container(&self, id: &str) -> anyhow::Result<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .with_context(|| format!("Failed to remove container {}", id))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bollard::models::ErrorDetail;

    #[test]
    fn test_build_info_classification() {
        let line = BuildLogLine::from(BuildInfo {
            error: Some("failed".into()),
            error_detail: Some(ErrorDetail {
                code: Some(1),
                message: Some("exit code 1".into()),
            }),
            ..Default::default()
        });
        assert_eq!(
            line,
            BuildLogLine::Error {
                message: "failed".into(),
                detail: Some("exit code 1".into())
            }
        );

        let line = BuildLogLine::from(BuildInfo {
            stream: Some("Step 1/3 : FROM alpine\n".into()),
            ..Default::default()
        });
        assert_eq!(line, BuildLogLine::Stream("Step 1/3 : FROM alpine\n".into()));

        let line = BuildLogLine::from(BuildInfo {
            status: Some("Downloading".into()),
            ..Default::default()
        });
        assert_eq!(line, BuildLogLine::Unrecognized("Downloading".into()));
        assert!(!line.is_error());

        let line = BuildLogLine::from(BuildInfo {
            status: Some("Downloading".into()),
            progress: Some("[==>    ]".into()),
            ..Default::default()
        });
        assert_eq!(line, BuildLogLine::Unrecognized("Downloading [==>    ]".into()));
    }
}
