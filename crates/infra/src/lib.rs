//! Infrastructure layer: job engine, stores, and the remote generation seam.

pub mod generation;
pub mod jobs;
pub mod records;

pub use generation::{BreakerGuardedGenerator, GenerateError, Generator};
pub use jobs::{
    InMemoryJobStore, JobCounts, JobProcessor, JobStore, JobStoreError, ProcessorConfig,
    ProcessorError, RuntimeStats,
};
pub use records::{InMemoryRecordStore, RecordStore, RecordStoreError, WorkRecord};
