use thiserror::Error;

/// Errors talking to a worker.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid worker address {address:?}: {reason}")]
    Address { address: String, reason: String },

    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    #[error("worker responded {status}: {body}")]
    Status {
        status: http::StatusCode,
        body: String,
    },

    #[error("invalid response body: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to build request: {0}")]
    Encode(String),
}

pub type ClientResult<T> = Result<T, ClientError>;
