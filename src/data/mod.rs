//! Database models and persistence for the mirrored catalog.

pub mod kv;
pub mod locations;
pub mod measurements;
pub mod models;
pub mod parameters;
pub mod sensors;
pub mod sync_jobs;
