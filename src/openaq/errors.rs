//! Error types for the OpenAQ API client.

#[derive(Debug, thiserror::Error)]
pub enum OpenAqError {
    #[error("Failed to parse response")]
    ParseFailed {
        status: u16,
        url: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    RequestFailed(#[from] anyhow::Error),
}
