use serde::Deserialize;

fn default_base_url() -> String {
    "https://api.openaq.org/v3".to_string()
}

fn default_country_id() -> i64 {
    // United States in the upstream catalog.
    155
}

fn default_worker_count() -> usize {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_shutdown_timeout() -> u64 {
    10
}

/// Application configuration, extracted from environment variables via figment.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub openaq_api_key: String,
    #[serde(default = "default_base_url")]
    pub openaq_base_url: String,
    /// Upstream country filter for the location catalog.
    #[serde(default = "default_country_id")]
    pub country_id: i64,
    /// Number of concurrent ingestion workers polling the job queue.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Seconds to wait for services to drain on shutdown.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
    /// When set, location-refresh jobs also backfill recent history from the
    /// paged measurements endpoint.
    #[serde(default)]
    pub fetch_history: bool,
    /// Override for the measurement-refresh interval, in seconds.
    #[serde(default)]
    pub measurement_refresh_secs: Option<u64>,
    /// Override for the location-refresh interval, in seconds.
    #[serde(default)]
    pub location_refresh_secs: Option<u64>,
}
