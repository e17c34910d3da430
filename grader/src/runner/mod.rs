//! Building grading images and running them.
//!
//! This module is not responsible for deciding what a run means. See
//! [`crate::grader`] for the code that interprets results.

use std::path::Path;

pub mod image;
pub mod local;
pub mod model;
pub mod output;
pub mod sandbox;

pub use image::{BuildError, BuildOptions, BuildReport, ImageBuilder};
pub use local::LocalRunner;
pub use model::{ExitStatus, RunError, RunResult};
pub use sandbox::SandboxRunner;

pub const ENV_BASE_DIR: &str = "AUTOGRADER_BASE_DIR";
pub const ENV_INPUT_DIR: &str = "AUTOGRADER_INPUT_DIR";
pub const ENV_OUTPUT_DIR: &str = "AUTOGRADER_OUTPUT_DIR";
pub const ENV_WORK_DIR: &str = "AUTOGRADER_WORK_DIR";
pub const ENV_USER: &str = "AUTOGRADER_USER";

/// Environment every grading process sees, given where the standard
/// directories are from its point of view.
pub(crate) fn grading_env(
    base: &Path,
    input: &Path,
    output: &Path,
    identity: &str,
) -> Vec<(&'static str, String)> {
    vec![
        (ENV_BASE_DIR, base.to_string_lossy().into_owned()),
        (ENV_INPUT_DIR, input.to_string_lossy().into_owned()),
        (ENV_OUTPUT_DIR, output.to_string_lossy().into_owned()),
        (
            ENV_WORK_DIR,
            base.join(crate::assemble::WORK_DIRNAME)
                .to_string_lossy()
                .into_owned(),
        ),
        (ENV_USER, identity.to_owned()),
    ]
}
