//! Sequential job queue: claiming, attempts, backoff and settlement.

pub mod attempt;
pub mod gate;
pub mod job;
pub mod pool;
pub mod processor;

pub use attempt::{backoff_delay, AttemptContext, AttemptError, AttemptOutcome, AttemptReport};
pub use gate::KeyGate;
pub use job::{Job, JobState};
pub use pool::WorkerPool;
pub use processor::{DrainReport, QueueProcessor};
