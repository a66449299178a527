//! Access token lifecycle for the EnOS APIM token service
//!
//! Applications calling the EnOS integration gateway must present an access
//! token obtained by signing their application key and secret. This crate keeps
//! such a token valid on behalf of any number of concurrent callers:
//!
//! * the first caller to need a token fetches one;
//! * within ten minutes of expiry, the next caller refreshes it;
//! * once expired, a brand new token is fetched.
//!
//! Only one caller talks to the token service at a time. Others waiting on it
//! are bounded by a configurable timeout, after which they receive an explicit
//! error rather than a stale token.
//!
//! ```no_run
//! use enos_tokens::{exchange::ApimTokenExchange, AppKey, AppSecret, AuthorityConfig, TokenAuthority};
//!
//! # async fn run() -> Result<(), enos_tokens::AuthError> {
//! let exchange = ApimTokenExchange::new(
//!     reqwest::Client::new(),
//!     "https://apim.example.com",
//!     AppKey::from_static("my-app-key"),
//!     AppSecret::from_static("my-app-secret"),
//! );
//!
//! let authority = TokenAuthority::new(exchange, AuthorityConfig::default());
//! authority.ensure_valid().await?;
//!
//! tracing::info!(
//!     token = format_args!("{:#?}", authority.access_token()),
//!     "first access token"
//! );
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! * `apim` (default): Provides [`ApimTokenExchange`][exchange::ApimTokenExchange],
//!   which talks to the APIM token service over HTTP using [reqwest].

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod authority;
mod braids;
pub mod credential;
pub mod exchange;
pub mod gate;
pub mod sign;

pub use authority::{AuthError, AuthorityConfig, TokenAuthority, DEFAULT_AUTH_WAIT};
pub use braids::*;
pub use credential::{Credential, CredentialStatus, CredentialStore};
