//! Tests to verify grading without docker, against real subprocesses.
#![cfg(unix)]

use std::{sync::Arc, time::Duration};

use pretty_assertions::assert_eq;
use test_env_log::test;

use crate::{
    assemble::lay_out_grading_dir,
    grader::{GradeErrorKind, GradeOptions, Grader},
    model::{ResourceLimits, Submission},
    runner::{ExitStatus, LocalRunner, RunError},
};

use super::util::{submission_dir, test_config, AssignmentFixture, MockEngine};

fn no_docker() -> GradeOptions {
    GradeOptions { no_docker: true }
}

fn timeout(secs: u64) -> ResourceLimits {
    ResourceLimits {
        timeout_secs: Some(secs),
        ..Default::default()
    }
}

#[test(tokio::test)]
async fn test_local_grade() {
    let fixture = AssignmentFixture::new("course101", "hw0");
    let (_temp, config) = test_config();
    let engine = Arc::new(MockEngine::new());
    let grader = Grader::new(engine.clone(), config);

    let right = submission_dir(&[("answer.txt", "42")]);
    let result = grader
        .grade(
            &fixture.spec,
            &Submission::new(right.path(), "alice@test.edu"),
            false,
            &no_docker(),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.info.score, 1.0);
    assert_eq!(result.info.max_points, 1.0);
    assert_eq!(result.output.status, ExitStatus::Code(0));
    assert!(result.output.stdout.starts_with("grading for alice@test.edu\n"));

    let wrong = submission_dir(&[("answer.txt", "41")]);
    let result = grader
        .grade(
            &fixture.spec,
            &Submission::new(wrong.path(), "bob@test.edu"),
            false,
            &no_docker(),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.info.score, 0.0);
    assert_eq!(result.info.user, "bob@test.edu");

    // nothing touched the engine
    assert_eq!(engine.build_count(), 0);
    assert!(engine.created_containers().is_empty());
}

#[test(tokio::test)]
async fn test_docker_disabled_in_config() {
    let fixture = AssignmentFixture::new("course101", "hw0");
    let (_temp, mut config) = test_config();
    config.docker_disabled = true;
    let engine = Arc::new(MockEngine::new());
    let grader = Grader::new(engine.clone(), config);
    let sub = submission_dir(&[("answer.txt", "42")]);

    let result = grader
        .grade(
            &fixture.spec,
            &Submission::new(sub.path(), "alice@test.edu"),
            false,
            &GradeOptions::default(),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.info.score, 1.0);
    assert_eq!(engine.build_count(), 0);
}

#[test(tokio::test)]
async fn test_local_result_file() {
    let mut fixture = AssignmentFixture::new("course101", "hw0");
    fixture.spec.invocation = Some(vec![
        "sh".into(),
        "-c".into(),
        r#"echo garbage; echo '{"score": 7, "max-points": 10}' > "$AUTOGRADER_OUTPUT_DIR/result.json""#
            .into(),
    ]);
    let (_temp, config) = test_config();
    let grader = Grader::new(Arc::new(MockEngine::new()), config);
    let sub = submission_dir(&[("answer.txt", "42")]);

    let result = grader
        .grade(
            &fixture.spec,
            &Submission::new(sub.path(), "alice@test.edu"),
            false,
            &no_docker(),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.info.score, 7.0);
    assert_eq!(result.info.max_points, 10.0);
}

#[test(tokio::test)]
async fn test_local_timeout_kills_process() {
    let mut fixture = AssignmentFixture::new("course101", "hw0");
    fixture.spec.invocation = Some(vec![
        "sh".into(),
        "-c".into(),
        "echo started; exec sleep 30".into(),
    ]);
    let dir = tempfile::tempdir().unwrap();
    let dirs = lay_out_grading_dir(&fixture.spec, dir.path()).await.unwrap();

    let start = std::time::Instant::now();
    let mut err = LocalRunner::new(4)
        .run(&fixture.spec, &dirs, "alice@test.edu", &timeout(1))
        .await
        .unwrap_err();
    assert!(start.elapsed() < Duration::from_secs(5));

    assert!(err.is_timeout(), "{}", err);
    let partial = err.take_partial().unwrap();
    assert_eq!(partial.status, ExitStatus::Timeout);
    assert_eq!(partial.stdout, "started\n");
}

#[test(tokio::test)]
async fn test_local_output_is_bounded() {
    let mut fixture = AssignmentFixture::new("course101", "hw0");
    fixture.spec.invocation = Some(vec![
        "sh".into(),
        "-c".into(),
        "i=0; while [ $i -lt 500 ]; do echo 0123456789; i=$((i+1)); done; echo oops >&2; exit 2"
            .into(),
    ]);
    let dir = tempfile::tempdir().unwrap();
    let dirs = lay_out_grading_dir(&fixture.spec, dir.path()).await.unwrap();

    let res = LocalRunner::new(1)
        .run(&fixture.spec, &dirs, "alice@test.edu", &timeout(10))
        .await
        .unwrap();

    assert_eq!(res.status, ExitStatus::Code(2));
    assert_eq!(res.stdout.len(), 1024);
    assert!(res.stdout_truncated);
    assert_eq!(res.stderr, "oops\n");
    assert!(!res.stderr_truncated);
}

#[test(tokio::test)]
async fn test_local_signal_exit_is_negative() {
    let mut fixture = AssignmentFixture::new("course101", "hw0");
    fixture.spec.invocation = Some(vec!["sh".into(), "-c".into(), "kill -9 $$".into()]);
    let dir = tempfile::tempdir().unwrap();
    let dirs = lay_out_grading_dir(&fixture.spec, dir.path()).await.unwrap();

    let res = LocalRunner::new(4)
        .run(&fixture.spec, &dirs, "alice@test.edu", &timeout(10))
        .await
        .unwrap();
    assert_eq!(res.status, ExitStatus::Code(-9));
}

#[test(tokio::test)]
async fn test_local_without_invocation() {
    let mut fixture = AssignmentFixture::new("course101", "hw0");
    fixture.spec.invocation = None;
    let (_temp, config) = test_config();
    let grader = Grader::new(Arc::new(MockEngine::new()), config);
    let sub = submission_dir(&[("answer.txt", "42")]);

    let err = grader
        .grade(
            &fixture.spec,
            &Submission::new(sub.path(), "alice@test.edu"),
            false,
            &no_docker(),
        )
        .await
        .unwrap_err();
    assert!(
        matches!(err.kind, GradeErrorKind::Run(RunError::NoInvocation(_))),
        "{}",
        err
    );
}
