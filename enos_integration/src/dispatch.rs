//! Executes prepared requests against the gateway and classifies the outcome

use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;
use enos_clock::Clock;
use enos_tokens::exchange::TokenExchange;
use predicates::Predicate;
use reqwest::{header, Method, Request, RequestBuilder, Response, StatusCode, Url};
use reqwest_middleware::ClientWithMiddleware;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;

use crate::{error::Error, middleware::AccessTokenMiddleware, Result};

static REQUEST_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Allocates the next process-wide request identifier
///
/// Identifiers increase strictly and are never reused within a process.
pub fn next_request_id() -> String {
    (REQUEST_SEQUENCE.fetch_add(1, Ordering::Relaxed) + 1).to_string()
}

/// Sends requests through the token-attaching middleware
#[derive(Clone, Debug)]
pub struct Dispatcher {
    builder: reqwest::Client,
    client: ClientWithMiddleware,
}

impl Dispatcher {
    /// Constructs a dispatcher that authenticates requests with `middleware`
    pub fn new<X, C, P>(client: reqwest::Client, middleware: AccessTokenMiddleware<X, C, P>) -> Self
    where
        X: TokenExchange + 'static,
        C: Clock + Send + Sync + 'static,
        P: Predicate<Request> + Send + Sync + 'static,
    {
        Self {
            client: reqwest_middleware::ClientBuilder::new(client.clone())
                .with(middleware)
                .build(),
            builder: client,
        }
    }

    /// Starts a request to be passed to one of the dispatch methods
    pub fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.builder.request(method, url)
    }

    /// Sends a request, failing on any unsuccessful HTTP status
    #[tracing::instrument(
        level = "debug",
        skip(self, request),
        fields(method = %request.method(), path = request.url().path())
    )]
    pub async fn send(&self, request: Request) -> Result<Response> {
        let response = self.client.execute(request).await.map_err(|error| {
            let error = Error::from(error);
            tracing::warn!(
                error = (&error as &dyn std::error::Error),
                "request was not completed"
            );
            error
        })?;

        let status = response.status();
        tracing::debug!(response.status = status.as_u16(), "received response");

        if !status.is_success() {
            tracing::warn!(
                response.status = status.as_u16(),
                "gateway returned an unsuccessful status"
            );
            return Err(Error::remote(
                status.as_u16(),
                status.canonical_reason().unwrap_or_default(),
            ));
        }

        Ok(response)
    }

    /// Sends a request and decodes its JSON body
    pub async fn execute<T: DeserializeOwned>(&self, request: Request) -> Result<T> {
        let response = self.send(request).await?;
        let payload = response.bytes().await.map_err(Error::from)?;
        decode(&payload)
    }

    /// Sends a request on the runtime and hands the decoded outcome to `callback`
    ///
    /// `callback` runs exactly once, on whichever worker completes the exchange.
    pub fn execute_detached<T, F>(&self, request: Request, callback: F) -> JoinHandle<()>
    where
        T: DeserializeOwned + Send + 'static,
        F: FnOnce(Result<T>) + Send + 'static,
    {
        let dispatcher = self.clone();
        tokio::spawn(async move { callback(dispatcher.execute(request).await) })
    }

    /// Sends a download request, exposing range details on partial content
    pub async fn download(&self, request: Request) -> Result<FileDownload> {
        let response = self.send(request).await?;
        FileDownload::from_response(response)
    }

    /// Sends a download request on the runtime and hands the outcome to `callback`
    pub fn download_detached<F>(&self, request: Request, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<FileDownload>) + Send + 'static,
    {
        let dispatcher = self.clone();
        tokio::spawn(async move { callback(dispatcher.download(request).await) })
    }
}

pub(crate) fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    if payload.is_empty() {
        tracing::warn!("response body was empty");
        return Err(Error::ClientDecode("response body is empty".into()));
    }

    serde_json::from_slice(payload).map_err(|error| {
        tracing::warn!(
            error = (&error as &dyn std::error::Error),
            "failed to decode response"
        );
        Error::decode(error)
    })
}

/// A downloaded file body
#[derive(Debug)]
pub enum FileDownload {
    /// The whole file
    Complete(FileBody),
    /// Part of the file, as requested by a range
    Partial(RangedBody),
}

impl FileDownload {
    fn from_response(response: Response) -> Result<Self> {
        if response.status() == StatusCode::PARTIAL_CONTENT {
            RangedBody::from_response(response).map(Self::Partial)
        } else {
            Ok(Self::Complete(FileBody { response }))
        }
    }

    /// The body, whether complete or partial
    pub fn into_body(self) -> FileBody {
        match self {
            Self::Complete(body) => body,
            Self::Partial(ranged) => ranged.body,
        }
    }

    /// Range details, if only part of the file was sent
    pub fn ranged(&self) -> Option<&RangedBody> {
        match self {
            Self::Complete(_) => None,
            Self::Partial(ranged) => Some(ranged),
        }
    }
}

/// A streamed response body
#[derive(Debug)]
pub struct FileBody {
    response: Response,
}

impl FileBody {
    /// The length of the body, if known ahead of time
    pub fn content_length(&self) -> Option<u64> {
        self.response.content_length()
    }

    /// Reads the next chunk of the body, or `None` once it is exhausted
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        self.response.chunk().await.map_err(Error::from)
    }

    /// Reads the remainder of the body
    pub async fn bytes(self) -> Result<Bytes> {
        self.response.bytes().await.map_err(Error::from)
    }
}

/// A partial-content response body along with its range headers
#[derive(Debug)]
pub struct RangedBody {
    content_length: u64,
    content_range: ContentRange,
    accept_ranges: Option<String>,
    body: FileBody,
}

impl RangedBody {
    fn from_response(response: Response) -> Result<Self> {
        let headers = response.headers();

        let content_length = header_str(headers, header::CONTENT_LENGTH)?
            .parse::<u64>()
            .map_err(|_| Error::ClientDecode("malformed Content-Length on ranged response".into()))?;
        let content_range = header_str(headers, header::CONTENT_RANGE)?.parse::<ContentRange>()?;
        if content_length != content_range.span() {
            return Err(Error::ClientDecode(format!(
                "Content-Length {} does not match Content-Range {}",
                content_length, content_range
            )));
        }

        let accept_ranges = headers
            .get(header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        tracing::debug!(
            content_length,
            content_range = %content_range,
            "received partial content"
        );

        Ok(Self {
            content_length,
            content_range,
            accept_ranges,
            body: FileBody { response },
        })
    }

    /// The number of bytes in this part
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// The range of the file carried by this part
    pub fn content_range(&self) -> &ContentRange {
        &self.content_range
    }

    /// The `Accept-Ranges` value, if the server sent one
    pub fn accept_ranges(&self) -> Option<&str> {
        self.accept_ranges.as_deref()
    }

    /// The body of this part
    pub fn body(&mut self) -> &mut FileBody {
        &mut self.body
    }

    /// Takes the body of this part
    pub fn into_body(self) -> FileBody {
        self.body
    }
}

fn header_str(headers: &header::HeaderMap, name: header::HeaderName) -> Result<&str> {
    headers
        .get(&name)
        .ok_or_else(|| Error::ClientDecode(format!("missing {} on ranged response", name)))?
        .to_str()
        .map_err(|_| Error::ClientDecode(format!("malformed {} on ranged response", name)))
}

/// A `Content-Range` value in bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContentRange {
    /// First byte position, inclusive
    pub first: u64,
    /// Last byte position, inclusive
    pub last: u64,
    /// Length of the whole file, if the server knows it
    pub complete_length: Option<u64>,
}

impl FromStr for ContentRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || Error::ClientDecode(format!("malformed Content-Range: {}", s));

        let spec = s.trim().strip_prefix("bytes ").ok_or_else(malformed)?;
        let (range, complete) = spec.split_once('/').ok_or_else(malformed)?;
        let (first, last) = range.split_once('-').ok_or_else(malformed)?;

        let first: u64 = first.trim().parse().map_err(|_| malformed())?;
        let last: u64 = last.trim().parse().map_err(|_| malformed())?;
        let complete_length: Option<u64> = match complete.trim() {
            "*" => None,
            n => Some(n.parse().map_err(|_| malformed())?),
        };

        if last < first || complete_length.is_some_and(|n| last >= n) {
            return Err(malformed());
        }

        Ok(Self {
            first,
            last,
            complete_length,
        })
    }
}

impl ContentRange {
    /// The number of bytes covered by the range
    pub fn span(&self) -> u64 {
        self.last - self.first + 1
    }
}

impl fmt::Display for ContentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes {}-{}/", self.first, self.last)?;
        match self.complete_length {
            Some(n) => write!(f, "{}", n),
            None => f.write_str("*"),
        }
    }
}

/// A byte range to request when downloading
///
/// Either bound may be left open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte wanted, inclusive
    pub start: Option<u64>,
    /// Last byte wanted, inclusive
    pub end: Option<u64>,
}

impl ByteRange {
    /// Requests bytes `start` through `end`, inclusive
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    /// Requests everything from `start` onwards
    pub fn starting_at(start: u64) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }

    /// The `Range` header value, if any bound is set
    pub fn header_value(&self) -> Option<String> {
        if self.start.is_none() && self.end.is_none() {
            return None;
        }

        let mut value = String::from("bytes=");
        if let Some(start) = self.start {
            value.push_str(&start.to_string());
        }
        value.push('-');
        if let Some(end) = self.end {
            value.push_str(&end.to_string());
        }
        Some(value)
    }
}
