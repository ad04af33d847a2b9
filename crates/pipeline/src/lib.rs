//! Background analysis jobs and the read paths that serve their results.

mod cache;
mod orchestrator;
mod progress;

pub use cache::{CacheStats, ContentCache};
pub use orchestrator::{AnalysisOrchestrator, ContentKey};
pub use progress::{
    JobStage, ProgressSnapshot, ProgressTracker, ProgressWriter, MAX_RUNNING_PROGRESS,
};
