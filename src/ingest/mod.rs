//! Document ingestion: coordinator, job queue, and progress events.
//!
//! * [`coordinator`] — the per-document state machine (OCR, chunking,
//!   embedding, persistence, indexing) with retries and cleanup.
//! * [`queue`] — the bounded job queue and worker pool with back-pressure.
//! * [`progress`] — non-blocking stage events for the transport layer.

pub mod coordinator;
pub mod progress;
pub mod queue;

pub use coordinator::{IngestionCoordinator, ProcessOutcome};
pub use progress::{IngestStage, ProgressEvent, ProgressReporter};
pub use queue::{IngestJob, JobQueue, WorkerPool};
