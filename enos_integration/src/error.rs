use std::{error::Error as StdError, fmt::Write};

use enos_tokens::AuthError;
use thiserror::Error;

/// A failed exchange with the integration gateway
#[derive(Debug, Error)]
pub enum Error {
    /// No valid access token could be obtained
    #[error("unable to authenticate with the token service")]
    FailedAuth(#[source] AuthError),
    /// The connection failed below HTTP
    #[error("transport failure: {0}")]
    TransportSocket(String),
    /// The gateway answered with an unsuccessful status
    #[error("remote error {code}: {message}")]
    Remote {
        /// The HTTP status, or the gateway's own error code
        code: i64,
        /// The reason reported alongside the code
        message: String,
    },
    /// The request could not be prepared, or the response could not be understood
    #[error("client error: {0}")]
    ClientDecode(String),
}

/// A result whose failure is an [`Error`]
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn remote(code: impl Into<i64>, message: impl Into<String>) -> Self {
        Self::Remote {
            code: code.into(),
            message: message.into(),
        }
    }

    pub(crate) fn decode(error: impl std::fmt::Display) -> Self {
        Self::ClientDecode(error.to_string())
    }

    /// The numeric code of a remote failure
    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<AuthError> for Error {
    fn from(error: AuthError) -> Self {
        if error.is_transport() {
            Self::TransportSocket(error_chain(&error))
        } else {
            Self::FailedAuth(error)
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        if error.is_builder() || error.is_decode() {
            Self::ClientDecode(error_chain(&error))
        } else {
            Self::TransportSocket(error_chain(&error))
        }
    }
}

impl From<reqwest_middleware::Error> for Error {
    fn from(error: reqwest_middleware::Error) -> Self {
        match error {
            reqwest_middleware::Error::Reqwest(error) => error.into(),
            reqwest_middleware::Error::Middleware(error) => match error.downcast::<AuthError>() {
                Ok(error) => error.into(),
                Err(error) => Self::ClientDecode(format!("{:#}", error)),
            },
        }
    }
}

/// Renders an error along with every source beneath it
pub(crate) fn error_chain(error: &(dyn StdError + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let _ = write!(rendered, ": {}", cause);
        source = cause.source();
    }
    rendered
}
