/// Shared error type used across all tether crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("store: {0}")]
    Store(String),

    #[error("runner {runner_type}: {message}")]
    Runner {
        runner_type: String,
        message: String,
    },

    /// A concrete runner backend could not be reached (e.g. sidecar down).
    /// Maps to HTTP 503 `AGENT_UNAVAILABLE` at the API edge.
    #[error("runner unavailable: {0}")]
    RunnerUnavailable(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
