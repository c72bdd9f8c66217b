//! The ingestion and synchronization pipeline: job payloads, the
//! per-location processing pipeline, the batch orchestrator, the periodic
//! scheduler, and the queue workers.

pub mod jobs;
pub mod orchestrator;
pub mod pipeline;
pub mod scheduler;
pub mod worker;
