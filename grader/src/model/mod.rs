//! Data shared between the pipeline and its callers.

mod assignment;
mod grading;

pub use assignment::*;
pub use grading::*;
