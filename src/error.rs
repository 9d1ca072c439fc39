use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// Both identity endpoints rejected the token request.
    AuthRefresh {
        modern_status: u16,
        legacy_status: u16,
        body: String,
    },
    Transport(reqwest::Error),
    HttpStatus { status: u16, body: String },
    InvalidScheduleJson(String),
    DiscoveryExhausted { tried: usize },
    BoostRestoreFailed(Box<Error>),
    MissingConfig(&'static str),
    InvalidMode(String),
    Protocol(String),
    Json(serde_json::Error),
    Io(std::io::Error),
}

impl Error {
    /// Short category name written next to the diagnostic message.
    pub fn category(&self) -> &'static str {
        match self {
            Error::AuthRefresh { .. } => "AuthRefreshError",
            Error::Transport(_) => "TransportError",
            Error::HttpStatus { .. } => "HttpStatusError",
            Error::InvalidScheduleJson(_) => "InvalidScheduleJson",
            Error::DiscoveryExhausted { .. } => "DiscoveryExhausted",
            Error::BoostRestoreFailed(_) => "BoostRestoreFailed",
            Error::MissingConfig(_) => "MissingConfig",
            Error::InvalidMode(_) => "InvalidMode",
            Error::Protocol(_) => "ProtocolError",
            Error::Json(_) => "JsonError",
            Error::Io(_) => "IoError",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AuthRefresh {
                modern_status,
                legacy_status,
                body,
            } => write!(
                f,
                "token refresh failed ({modern_status}/{legacy_status}): {body}"
            ),
            Error::Transport(e) => write!(f, "transport error: {e}"),
            Error::HttpStatus { status, body } => write!(f, "http {status}: {body}"),
            Error::InvalidScheduleJson(msg) => write!(f, "invalid schedule json: {msg}"),
            Error::DiscoveryExhausted { tried } => {
                write!(f, "no device features found ({tried} candidates tried)")
            }
            Error::BoostRestoreFailed(e) => write!(f, "boost restore failed: {e}"),
            Error::MissingConfig(what) => write!(f, "missing configuration: {what}"),
            Error::InvalidMode(mode) => write!(f, "invalid mode: {mode}"),
            Error::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Error::Json(e) => write!(f, "JSON error: {e}"),
            Error::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) => Some(e),
            Error::BoostRestoreFailed(e) => Some(e.as_ref()),
            Error::Json(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Transport(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
