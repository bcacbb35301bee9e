#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A connection attempt or a running connection failed for good.
    #[error("session {session_id}: {source}")]
    Session {
        session_id: String,
        #[source]
        source: Box<Error>,
    },
    /// Closing the connection failed. `provoking` is the error that led to
    /// the close, if any.
    #[error("disconnect failed: {action}")]
    Disconnect {
        provoking: Option<Box<Error>>,
        #[source]
        action: Box<Error>,
    },
    /// The server closed the connection.
    #[error("gateway closed with {code}: {reason}")]
    Closed { code: u16, reason: String },
    /// A payload could not be encoded or decoded.
    #[error("event {name}: {source}")]
    Event {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error(transparent)]
    Tungstenite(Box<tokio_tungstenite::tungstenite::Error>),
    #[error(transparent)]
    Rest(#[from] ferrule_rest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Url(#[from] url::ParseError),
    #[error("{message}")]
    Message { message: String },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// The innermost error, looking through session wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Self::Session { source, .. } => source.root(),
            other => other,
        }
    }

    /// Close code when the connection ended with one.
    pub fn close_code(&self) -> Option<u16> {
        match self.root() {
            Self::Closed { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub(crate) fn session(session_id: &str, source: Error) -> Self {
        match source {
            already @ Self::Session { .. } => already,
            source => Self::Session {
                session_id: session_id.to_string(),
                source: Box::new(source),
            },
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Tungstenite(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use std::error::Error as StdError;

    use super::*;

    #[test]
    fn session_wrapping_is_not_nested() {
        let inner = Error::Closed {
            code: 4004,
            reason: "Authentication failed.".into(),
        };
        let wrapped = Error::session("abc", inner);
        let rewrapped = Error::session("def", wrapped);
        match &rewrapped {
            Error::Session { session_id, .. } => assert_eq!(session_id, "abc"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(rewrapped.close_code(), Some(4004));
        assert_eq!(
            rewrapped.to_string(),
            "session abc: gateway closed with 4004: Authentication failed."
        );
    }

    #[test]
    fn disconnect_exposes_action_as_source() {
        let err = Error::Disconnect {
            provoking: Some(Box::new(Error::protocol("no hello"))),
            action: Box::new(Error::message("socket gone")),
        };
        assert_eq!(err.to_string(), "disconnect failed: socket gone");
        let source = StdError::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("socket gone"));
    }
}
