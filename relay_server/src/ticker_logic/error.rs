use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Everything that can go wrong while relaying the ticker feed.
///
/// None of these are fatal: the upstream loop logs them and carries on,
/// and a transport failure always ends in the delayed reconnect path.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("upstream payload is not valid JSON: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("upstream binary frame is not UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    #[error("upstream transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("failed to serialize outbound frame: {0}")]
    Serialize(#[source] serde_json::Error),
}
