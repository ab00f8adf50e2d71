use thiserror::Error;

pub type Result<T> = std::result::Result<T, DispatchError>;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The configuration tree is malformed: missing `topics`, an unknown
    /// key, or a mistyped value. Fatal at startup.
    #[error("invalid dispatcher configuration: {0}")]
    Config(String),

    #[error("invalid interval {0:?}: expected digits followed by ms, s or m")]
    InvalidInterval(String),

    #[error("invalid endpoint {url:?}: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error(transparent)]
    Client(#[from] klite_client::ClientError),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}
