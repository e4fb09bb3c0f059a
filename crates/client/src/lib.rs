//! Job layer for tundra: a JSON job description, and a runner that turns it
//! into a scan pipeline (optionally followed by a hash aggregation) and
//! collects the result.

pub mod job;
pub mod runner;

pub use job::{JobSpec, NamedAggregate};
pub use runner::{JobOutput, JobRunner};
