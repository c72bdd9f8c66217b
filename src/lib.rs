pub mod app;
pub mod cli;
pub mod config;
pub mod data;
pub mod ingest;
pub mod logging;
pub mod openaq;
pub mod utils;
