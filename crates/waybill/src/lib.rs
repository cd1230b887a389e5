pub mod config;
pub mod db;
pub mod error;
pub mod queue;
pub mod service;
pub mod sheet;
pub mod storage;

pub use config::Config;
pub use db::{Database, DatabaseError, LoadError, Loader};
pub use error::{ConfigError, Result, StorageError, ValidationError, WaybillError, WorkerError};
pub use queue::{DrainReport, Job, JobState, KeyGate, QueueProcessor, WorkerPool};
pub use sheet::{FieldValue, Record, RowWarning, SheetBatch};
pub use storage::PayloadStore;
