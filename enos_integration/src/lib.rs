//! Client for the EnOS HTTP integration gateway
//!
//! An [`HttpConnection`] publishes measurepoints, attributes and events for
//! devices, optionally with file attachments, and manages the files stored
//! alongside them. Every request carries an access token obtained from the
//! APIM token service. The token is fetched on first use, refreshed ahead of
//! its expiry, and shared by all clones of the connection.
//!
//! ```no_run
//! use enos_integration::{
//!     message::{DeviceInfo, MeasurepointPostRequest},
//!     HttpConnection,
//! };
//! use enos_tokens::{AppKey, AppSecret};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() -> enos_integration::Result<()> {
//! let connection = HttpConnection::builder(
//!     "https://broker.example.com",
//!     "https://apim.example.com",
//!     AppKey::from_static("app-key"),
//!     AppSecret::from_static("app-secret"),
//!     "org-id",
//! )
//! .connect()
//! .await?;
//!
//! let request = MeasurepointPostRequest::new()
//!     .add_measurepoints(
//!         DeviceInfo::device("product-key", "device-key"),
//!         1_700_000_000_000,
//!         [("temperature", json!(21.5))],
//!     )
//!     .build();
//!
//! let response = connection.publish(request).await?;
//! assert!(response.is_success());
//! # Ok(()) }
//! ```
//!
//! Each operation also has a `_detached` form that runs on the tokio runtime
//! and hands its outcome to a callback exactly once.

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

pub mod connection;
pub mod dispatch;
pub mod error;
mod form;
pub mod message;
pub mod middleware;

pub use connection::{ConnectionConfig, HttpConnection, HttpConnectionBuilder};
pub use dispatch::{ByteRange, FileDownload};
pub use error::{Error, Result};
pub use middleware::AccessTokenMiddleware;
