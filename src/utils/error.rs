use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("octal field error: {0}")]
    Octal(String),

    #[error("property list error: {0}")]
    Plist(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("dns message error: {0}")]
    Dns(String),

    #[error("sender record error: {0}")]
    SenderRecord(String),

    #[error("peer channel error: {0}")]
    Channel(String),

    #[error("no peer registered for host {0:?}")]
    UnknownHost(String),

    #[error("transfer rejected by peer")]
    Rejected,

    #[error("unsupported media type {0:?}")]
    UnsupportedMediaType(String),

    #[error("peer disconnected")]
    PeerGone,

    #[error("platform precondition failed: {0}")]
    Platform(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BridgeError {
    /// HTTP status this error maps to when it escapes a request handler.
    pub fn http_status(&self) -> u16 {
        match self {
            BridgeError::Plist(_) | BridgeError::Octal(_) | BridgeError::SenderRecord(_) => 400,
            BridgeError::UnknownHost(_) => 404,
            BridgeError::Rejected => 406,
            BridgeError::UnsupportedMediaType(_) => 422,
            BridgeError::PeerGone | BridgeError::Channel(_) => 502,
            _ => 500,
        }
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
