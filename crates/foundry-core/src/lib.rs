//! foundry-core — shared types, job model, event framing and configuration.
//! All other Foundry crates depend on this one.

pub mod config;
pub mod event;
pub mod id;
pub mod job;
pub mod record;

pub use event::{BuildEvent, JobState};
pub use job::{Artifact, JobDescriptor, JobDirs, JobOutcome, RawBuildRequest, TargetInfo};
pub use record::ServiceRecord;
