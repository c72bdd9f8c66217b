//! Client for the upstream OpenAQ v3 REST API: rate limiting, retries,
//! pagination, and payload models.

mod client;
pub mod errors;
mod json;
pub mod models;
pub mod rate_limit;

pub use client::OpenAqApi;
pub use errors::OpenAqError;
