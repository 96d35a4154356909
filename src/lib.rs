pub mod adapter;
pub mod config;
pub mod error;
pub mod job;
pub mod logger;
pub mod orchestrator;
pub mod registry;
pub mod request;
pub mod search;
pub mod watch;
pub mod workspace;

pub use error::{BerthError, ErrorKind, JobError};
pub use job::{Job, JobId, JobKind, JobParams, JobResult, JobState};

pub type Result<T> = std::result::Result<T, BerthError>;

// Convenience re-exports for front ends
pub use orchestrator::Orchestrator;
pub use registry::{JobEvent, JobRegistry};
pub use watch::JobFeed;
