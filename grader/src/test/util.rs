//! An in-memory container engine and fixtures for pipeline tests.

use std::{
    collections::HashMap,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use tempfile::TempDir;

use crate::{
    assemble::{DOCKER_OUTPUT_DIR, MANIFEST_FILENAME},
    config::GraderConfig,
    engine::{
        BuildLogLine, BuildLogStream, ContainerEngine, ContainerSpec, EngineBuildOptions,
        OutputChunk, OutputStream,
    },
    model::{AssignmentImageSpec, ResourceLimits, StaticFile},
};

/// What a container does once started.
#[derive(Debug, Clone)]
pub enum RunScript {
    /// Print, write files into the output mount, then exit.
    Exit {
        stdout: String,
        stderr: String,
        files: Vec<(String, String)>,
        code: i64,
    },
    /// Print, then never exit.
    Hang { stdout: String },
    /// The engine loses the container while streaming its output.
    Fail(String),
}

impl RunScript {
    pub fn stdout(stdout: impl Into<String>) -> RunScript {
        RunScript::Exit {
            stdout: stdout.into(),
            stderr: String::new(),
            files: vec![],
            code: 0,
        }
    }
}

/// One build the engine was asked to run.
#[derive(Debug, Clone)]
pub struct MockBuild {
    pub tag: String,
    pub no_cache: bool,
    pub labels: HashMap<String, String>,
    pub manifest: String,
}

#[derive(Default)]
struct MockState {
    images: HashMap<String, HashMap<String, String>>,
    builds: Vec<MockBuild>,
    live: HashMap<String, ContainerSpec>,
    created: Vec<ContainerSpec>,
    killed: Vec<String>,
}

pub struct MockEngine {
    state: Mutex<MockState>,
    build_delay: Duration,
    build_lines: Vec<BuildLogLine>,
    run: RunScript,
    next_id: AtomicU64,
}

impl MockEngine {
    pub fn new() -> MockEngine {
        MockEngine {
            state: Mutex::new(MockState::default()),
            build_delay: Duration::from_millis(0),
            build_lines: vec![BuildLogLine::Stream("Step 1/1 : FROM alpine\n".into())],
            run: RunScript::stdout(""),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = delay;
        self
    }

    pub fn build_lines(mut self, lines: Vec<BuildLogLine>) -> Self {
        self.build_lines = lines;
        self
    }

    pub fn run(mut self, script: RunScript) -> Self {
        self.run = script;
        self
    }

    pub fn builds(&self) -> Vec<MockBuild> {
        self.state.lock().unwrap().builds.clone()
    }

    pub fn build_count(&self) -> usize {
        self.state.lock().unwrap().builds.len()
    }

    pub fn insert_image(&self, tag: &str, labels: HashMap<String, String>) {
        self.state
            .lock()
            .unwrap()
            .images
            .insert(tag.to_owned(), labels);
    }

    pub fn live_containers(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    pub fn created_containers(&self) -> Vec<ContainerSpec> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn killed_containers(&self) -> Vec<String> {
        self.state.lock().unwrap().killed.clone()
    }

    fn container(&self, id: &str) -> anyhow::Result<ContainerSpec> {
        self.state
            .lock()
            .unwrap()
            .live
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No such container: {}", id))
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn image_labels(&self, tag: &str) -> anyhow::Result<Option<HashMap<String, String>>> {
        Ok(self.state.lock().unwrap().images.get(tag).cloned())
    }

    async fn build_image(
        &self,
        context_dir: &Path,
        options: EngineBuildOptions,
    ) -> anyhow::Result<BuildLogStream> {
        let manifest = tokio::fs::read_to_string(context_dir.join(MANIFEST_FILENAME)).await?;
        self.state.lock().unwrap().builds.push(MockBuild {
            tag: options.tag.clone(),
            no_cache: options.no_cache,
            labels: options.labels.clone(),
            manifest,
        });

        tokio::time::sleep(self.build_delay).await;

        if !self.build_lines.iter().any(BuildLogLine::is_error) {
            self.state
                .lock()
                .unwrap()
                .images
                .insert(options.tag, options.labels);
        }
        let lines = self.build_lines.clone().into_iter().map(Ok);
        Ok(stream::iter(lines).boxed())
    }

    async fn create_container(&self, spec: ContainerSpec) -> anyhow::Result<String> {
        let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut state = self.state.lock().unwrap();
        if !state.images.contains_key(&spec.image) {
            anyhow::bail!("No such image: {}", spec.image);
        }
        state.created.push(spec.clone());
        state.live.insert(id.clone(), spec);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> anyhow::Result<()> {
        self.container(id).map(|_| ())
    }

    async fn output(&self, id: &str) -> anyhow::Result<OutputStream> {
        let spec = self.container(id)?;
        let chunks: OutputStream = match &self.run {
            RunScript::Exit {
                stdout,
                stderr,
                files,
                ..
            } => {
                let output_mount = spec
                    .mounts
                    .iter()
                    .find(|m| m.target == DOCKER_OUTPUT_DIR)
                    .ok_or_else(|| anyhow::anyhow!("No output mount"))?;
                for (name, content) in files {
                    tokio::fs::write(Path::new(&output_mount.source).join(name), content).await?;
                }
                stream::iter(vec![
                    Ok(OutputChunk::Stdout(Bytes::from(stdout.clone()))),
                    Ok(OutputChunk::Stderr(Bytes::from(stderr.clone()))),
                ])
                .boxed()
            }
            RunScript::Hang { stdout } => {
                stream::iter(vec![Ok(OutputChunk::Stdout(Bytes::from(stdout.clone())))])
                    .chain(stream::pending())
                    .boxed()
            }
            RunScript::Fail(message) => {
                stream::iter(vec![Err(anyhow::anyhow!("{}", message))]).boxed()
            }
        };
        Ok(chunks)
    }

    async fn exit_code(&self, id: &str) -> anyhow::Result<i64> {
        self.container(id)?;
        match &self.run {
            RunScript::Exit { code, .. } => Ok(*code),
            _ => Ok(0),
        }
    }

    async fn kill_container(&self, id: &str) -> anyhow::Result<()> {
        self.container(id)?;
        self.state.lock().unwrap().killed.push(id.to_owned());
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> anyhow::Result<()> {
        self.state
            .lock()
            .unwrap()
            .live
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| anyhow::anyhow!("No such container: {}", id))
    }
}

/// An assignment with its static files on disk.
pub struct AssignmentFixture {
    pub dir: TempDir,
    pub spec: AssignmentImageSpec,
}

impl AssignmentFixture {
    /// A shell-graded assignment. `grade.sh` checks whether the submission
    /// contains `answer.txt` with the right content.
    pub fn new(course: &str, assignment: &str) -> AssignmentFixture {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("grade.sh"),
            r#"#!/bin/sh
answer=$(cat "$AUTOGRADER_INPUT_DIR/answer.txt" 2>/dev/null)
if [ "$answer" = "42" ]; then score=1; else score=0; fi
echo "grading for $AUTOGRADER_USER"
echo "{\"name\": \"hw\", \"questions\": [{\"name\": \"Q1\", \"score\": $score, \"max-points\": 1}]}"
"#,
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("data/cases")).unwrap();
        std::fs::write(dir.path().join("data/cases/1.in"), "1 2\n").unwrap();
        std::fs::write(dir.path().join("data/README"), "staff only\n").unwrap();

        let spec = AssignmentImageSpec {
            course_id: course.into(),
            assignment_id: assignment.into(),
            base_dir: dir.path().to_owned(),
            image: "alpine:3".into(),
            static_files: vec![StaticFile::new("grade.sh"), StaticFile::new("data")],
            pre_static_docker_commands: vec!["RUN apk add --no-cache bash".into()],
            post_static_docker_commands: vec!["RUN chmod +x /autograder/work/grade.sh".into()],
            invocation: Some(vec!["sh".into(), "/autograder/work/grade.sh".into()]),
            limits: ResourceLimits::default(),
            grading_config: serde_json::json!({"questions": 1}),
        };
        AssignmentFixture { dir, spec }
    }
}

/// A grader config that keeps all temp files inside a fresh directory.
pub fn test_config() -> (TempDir, GraderConfig) {
    let temp_root = tempfile::tempdir().unwrap();
    let config = GraderConfig {
        temp_root: temp_root.path().to_owned(),
        ..Default::default()
    };
    (temp_root, config)
}

/// A submission directory holding the given files.
pub fn submission_dir(files: &[(&str, &str)]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (name, content) in files {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }
    dir
}

/// Number of entries directly inside `dir`.
pub fn entry_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}
