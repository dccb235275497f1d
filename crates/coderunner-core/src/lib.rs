pub mod config;
pub mod pathsafe;
pub mod token;
pub mod types;
pub mod wire;

pub use config::{Config, CowMethod};
pub use types::{
 CapturedOutput, CloneState, ErrorKind, FailStage, Id, Job, JobOptions, JobState, JobSummary,
 Principal, Repository,
};
