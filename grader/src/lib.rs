//! Grades student submissions inside per-assignment container sandboxes.
//!
//! The pipeline, leaves first:
//!
//! - [`assemble`] turns an [`AssignmentImageSpec`] into a build context.
//! - [`runner::ImageBuilder`] builds and caches the image of an assignment,
//!   one build per image tag at a time.
//! - [`runner::SandboxRunner`] runs an image against a submission with
//!   resource limits and bounded output; [`runner::LocalRunner`] does the
//!   same without docker.
//! - [`Grader`] ties it together and classifies every attempt as a result, a
//!   [`Rejection`] or a [`GradeError`].

pub mod assemble;
pub mod config;
pub mod engine;
pub mod grader;
pub mod model;
pub mod runner;
pub mod util;

#[cfg(test)]
mod test;

pub use config::GraderConfig;
pub use engine::{ContainerEngine, DockerEngine};
pub use grader::{GradeError, GradeErrorKind, GradeOptions, Grader};
pub use model::{AssignmentImageSpec, GradingInfo, GradingResult, Rejection, Submission};
pub use runner::{BuildError, BuildOptions, BuildReport, RunError, RunResult};
