use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("undecodable envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("bad content for `{0}`: {1}")]
    Content(&'static str, #[source] serde_json::Error),
    #[error("unknown message type `{0}`")]
    UnknownType(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PushError {
    #[error("outbound queue is full")]
    Full,
    #[error("outbound queue is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("verification request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("verification service answered {0}")]
    Status(reqwest::StatusCode),
    #[error("credential rejected")]
    Rejected,
}
