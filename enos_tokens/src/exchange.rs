//! Token exchanges against an issuing service

use async_trait::async_trait;
use enos_clock::DurationSecs;
use thiserror::Error;

use crate::{AccessToken, AccessTokenRef};

#[cfg(feature = "apim")]
pub mod apim;
#[cfg(feature = "apim")]
mod dto;

#[cfg(feature = "apim")]
pub use apim::ApimTokenExchange;

/// A token as returned by the issuing service
#[derive(Debug)]
pub struct IssuedToken {
    /// The access token
    pub access_token: AccessToken,
    /// How long the token remains valid from the moment it was received
    pub expire_in: DurationSecs,
}

/// An asynchronous exchange that obtains access tokens
#[async_trait]
pub trait TokenExchange: Send + Sync {
    /// Requests a brand new token
    async fn fetch(&self) -> Result<IssuedToken, ExchangeError>;

    /// Requests a replacement for a token that is still valid
    async fn refresh(&self, current: &AccessTokenRef) -> Result<IssuedToken, ExchangeError>;
}

/// An error while exchanging credentials for a token
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The service answered, but did not issue a token
    #[error("token service rejected the request (status {status}): {msg}")]
    Rejected {
        /// The status reported in the response body
        status: i64,
        /// The message reported in the response body
        msg: String,
    },
    /// The response could not be understood
    #[error("unable to decode token response: {0}")]
    Decode(String),
    /// The request never produced a response
    #[cfg(feature = "apim")]
    #[error("error sending request to token service")]
    Transport(#[source] reqwest::Error),
    /// An exchange-specific failure that is not tied to HTTP
    #[error("token exchange failed: {0}")]
    Other(String),
}
