use http::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The server answered with a status the dispatcher does not recover from.
    #[error("{route}/{resource}: {status}: {message}")]
    Request {
        status: StatusCode,
        route: String,
        resource: String,
        message: String,
        /// JSON error code from the response body.
        code: Option<u64>,
        /// Request correlation ID echoed by the server.
        correlation: Option<String>,
    },
    /// The request never produced a response.
    #[error("{route}/{resource}: {source}")]
    Transport {
        route: String,
        resource: String,
        #[source]
        source: reqwest::Error,
    },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),
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

    /// HTTP status of a request error.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Request { status, .. } => Some(*status),
            Self::Transport { source, .. } | Self::Http(source) => source.status(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
