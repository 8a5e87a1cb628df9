use thiserror::Error;

/// Common error type for quoll components.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("discovery error: {0}")]
    Discovery(String),

    #[error("collector error: {0}")]
    Collector(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<json5::Error> for Error {
    fn from(e: json5::Error) -> Self {
        Error::Config(e.to_string())
    }
}

/// Result type alias using quoll's Error.
pub type Result<T> = std::result::Result<T, Error>;
