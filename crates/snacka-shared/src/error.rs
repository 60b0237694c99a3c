use thiserror::Error;

/// A push frame that could not be turned into a typed event.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid frame: {0}")]
    InvalidFrame(serde_json::Error),

    #[error("Unknown event kind: {0}")]
    UnknownKind(String),

    #[error("Malformed {kind} payload: {source}")]
    Malformed {
        kind: String,
        source: serde_json::Error,
    },
}

/// Failure reported by the request API for a mutate action.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct RequestError {
    pub kind: RequestErrorKind,
    pub message: String,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestErrorKind {
    /// 4xx-equivalent: the server refused the action.
    #[error("Request rejected ({status})")]
    Rejected { status: u16 },

    /// 5xx-equivalent.
    #[error("Server error ({status})")]
    Server { status: u16 },

    #[error("Service unavailable")]
    Unavailable,

    #[error("Request timed out")]
    Timeout,
}

impl RequestError {
    pub fn new(kind: RequestErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Map an HTTP-like status code onto the error taxonomy.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            400..=499 => RequestErrorKind::Rejected { status },
            500..=599 => RequestErrorKind::Server { status },
            _ => RequestErrorKind::Unavailable,
        };
        Self::new(kind, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status() {
        assert_eq!(
            RequestError::from_status(403, "forbidden").kind,
            RequestErrorKind::Rejected { status: 403 }
        );
        assert_eq!(
            RequestError::from_status(502, "bad gateway").kind,
            RequestErrorKind::Server { status: 502 }
        );
        assert_eq!(
            RequestError::from_status(0, "offline").kind,
            RequestErrorKind::Unavailable
        );
    }

    #[test]
    fn test_display() {
        let err = RequestError::from_status(404, "message not found");
        assert_eq!(err.to_string(), "Request rejected (404): message not found");
    }
}
