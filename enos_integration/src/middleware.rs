//! Middleware to attach the platform access token to outgoing requests
//!
//! Include [`AccessTokenMiddleware`] in a
//! [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware) stack to
//! make sure a valid token is held before each request leaves, and to send it
//! in the `apim-accesstoken` header.
//!
//! If a request already carries that header, the existing value is left in
//! place.
//!
//! ```
//! use enos_integration::middleware::{AccessTokenMiddleware, SameOrigin};
//! use enos_tokens::{exchange::ApimTokenExchange, AppKey, AppSecret, AuthorityConfig, TokenAuthority};
//! use reqwest_middleware::ClientBuilder;
//!
//! let exchange = ApimTokenExchange::new(
//!     reqwest::Client::new(),
//!     "https://apim.example.com",
//!     AppKey::from_static("my-app-key"),
//!     AppSecret::from_static("my-app-secret"),
//! );
//! let authority = TokenAuthority::new(exchange, AuthorityConfig::default());
//! let broker = reqwest::Url::parse("https://broker.example.com").unwrap();
//!
//! let client = ClientBuilder::new(reqwest::Client::new())
//!     .with(AccessTokenMiddleware::new(authority).with_predicate(SameOrigin::of(&broker)))
//!     .build();
//! ```

use std::fmt;

use enos_clock::{Clock, System};
use enos_tokens::{exchange::TokenExchange, AuthError, TokenAuthority};
use predicates::{constant::BooleanPredicate, prelude::*, reflection};
use reqwest::{
    header::{HeaderName, HeaderValue},
    Request, Response, Url,
};
use reqwest_middleware::{Middleware, Next, Result};

/// The header carrying the platform access token
pub const ACCESS_TOKEN_HEADER: HeaderName = HeaderName::from_static("apim-accesstoken");

/// A middleware that injects an access token into outgoing requests
pub struct AccessTokenMiddleware<X, C = System, P = BooleanPredicate> {
    authority: TokenAuthority<X, C>,
    predicate: P,
}

impl<X, C, P: Clone> Clone for AccessTokenMiddleware<X, C, P> {
    fn clone(&self) -> Self {
        Self {
            authority: self.authority.clone(),
            predicate: self.predicate.clone(),
        }
    }
}

impl<X: fmt::Debug, C: fmt::Debug, P: fmt::Debug> fmt::Debug for AccessTokenMiddleware<X, C, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessTokenMiddleware")
            .field("authority", &self.authority)
            .field("predicate", &self.predicate)
            .finish()
    }
}

impl<X, C> AccessTokenMiddleware<X, C> {
    /// Construct a new middleware from a token authority
    ///
    /// By default, every request receives the token. To restrict it, provide
    /// a custom predicate with [`with_predicate()`][Self::with_predicate()].
    pub fn new(authority: TokenAuthority<X, C>) -> Self {
        Self {
            authority,
            predicate: predicate::always(),
        }
    }
}

impl<X, C, P> AccessTokenMiddleware<X, C, P> {
    /// Replaces the predicate deciding which requests receive the token
    pub fn with_predicate<Q>(self, predicate: Q) -> AccessTokenMiddleware<X, C, Q> {
        AccessTokenMiddleware {
            authority: self.authority,
            predicate,
        }
    }
}

impl<X, C, P> AccessTokenMiddleware<X, C, P>
where
    X: TokenExchange,
    C: Clock + Send + Sync,
{
    async fn header_value(&self) -> std::result::Result<HeaderValue, AuthError> {
        self.authority.ensure_valid().await?;

        let credential = self.authority.credential().ok_or(AuthError::StillMissing)?;

        if tracing::enabled!(tracing::Level::TRACE) {
            let now = self.authority.now();
            tracing::trace!(
                token.status = ?credential.status_at(now),
                token.issued = credential.issued().0,
                token.refresh_at = credential.refresh_at().0,
                token.expire_at = credential.expire_at().0,
                token.until_expired = credential.until_expired_at(now).0,
                "obtained access token"
            );
        }

        let mut value = HeaderValue::from_str(credential.access_token().as_str())
            .map_err(|_| AuthError::Decode("access token is not a valid header value".into()))?;
        value.set_sensitive(true);
        Ok(value)
    }
}

#[async_trait::async_trait]
impl<X, C, P> Middleware for AccessTokenMiddleware<X, C, P>
where
    X: TokenExchange + 'static,
    C: Clock + Send + Sync + 'static,
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if self.predicate.eval(&req) && !req.headers().contains_key(&ACCESS_TOKEN_HEADER) {
            let value = self
                .header_value()
                .await
                .map_err(|error| reqwest_middleware::Error::Middleware(error.into()))?;
            req.headers_mut().insert(ACCESS_TOKEN_HEADER, value);
        }

        next.run(req, extensions).await
    }
}

/// Only attach an access token if the request goes to the given origin
///
/// Scheme, host and port must all match.
#[derive(Clone, Debug)]
pub struct SameOrigin {
    scheme: String,
    host: Option<String>,
    port: Option<u16>,
}

impl SameOrigin {
    /// Construct a predicate matching the origin of `url`
    pub fn of(url: &Url) -> Self {
        Self {
            scheme: url.scheme().to_owned(),
            host: url.host_str().map(str::to_owned),
            port: url.port_or_known_default(),
        }
    }
}

impl Predicate<Request> for SameOrigin {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        let url = req.url();
        url.scheme() == self.scheme
            && url.host_str() == self.host.as_deref()
            && url.port_or_known_default() == self.port
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            let url = req.url();
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "origin",
                    format!(
                        "{}://{}:{}",
                        url.scheme(),
                        url.host_str().unwrap_or_default(),
                        url.port_or_known_default().unwrap_or_default()
                    ),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for SameOrigin {}
impl fmt::Display for SameOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "origin == {}://{}:{}",
            self.scheme,
            self.host.as_deref().unwrap_or_default(),
            self.port.unwrap_or_default()
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    };

    use async_trait::async_trait;
    use enos_clock::DurationSecs;
    use enos_tokens::{
        exchange::{ExchangeError, IssuedToken},
        AccessToken, AccessTokenRef, AuthorityConfig,
    };
    use reqwest::Client;
    use reqwest_middleware::ClientBuilder;

    use super::*;

    const TEST_TOKEN: &str = "this-is-a-test-token";

    #[derive(Debug, Default)]
    struct ConstExchange {
        fetches: AtomicUsize,
        reject: bool,
    }

    #[async_trait]
    impl TokenExchange for ConstExchange {
        async fn fetch(&self) -> std::result::Result<IssuedToken, ExchangeError> {
            self.fetches.fetch_add(1, Ordering::AcqRel);
            if self.reject {
                return Err(ExchangeError::Rejected {
                    status: 1,
                    msg: "no".into(),
                });
            }
            Ok(IssuedToken {
                access_token: AccessToken::from_static(TEST_TOKEN),
                expire_in: DurationSecs(7200),
            })
        }

        async fn refresh(
            &self,
            _: &AccessTokenRef,
        ) -> std::result::Result<IssuedToken, ExchangeError> {
            self.fetch().await
        }
    }

    struct TokenChecker {
        expected: Option<String>,
        checked: AtomicBool,
    }

    impl TokenChecker {
        fn expecting(expected: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                expected: expected.map(str::to_owned),
                checked: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Middleware for TokenChecker {
        async fn handle(
            &self,
            req: Request,
            _: &mut http::Extensions,
            _: Next<'_>,
        ) -> Result<Response> {
            let header = req
                .headers()
                .get(&ACCESS_TOKEN_HEADER)
                .map(|v| v.to_str().expect("token header was not valid UTF-8").to_owned());

            assert_eq!(header, self.expected);
            self.checked.store(true, Ordering::Release);

            Ok(http::Response::<&[u8]>::default().into())
        }
    }

    fn prepare_middleware(exchange: ConstExchange) -> AccessTokenMiddleware<ConstExchange> {
        AccessTokenMiddleware::new(TokenAuthority::new(exchange, AuthorityConfig::default()))
    }

    mod when_request_does_not_have_a_token_header {
        use super::*;

        #[tokio::test]
        async fn middleware_with_defaults_attaches_token() {
            let checker = TokenChecker::expecting(Some(TEST_TOKEN));
            let client = ClientBuilder::new(Client::default())
                .with(prepare_middleware(ConstExchange::default()))
                .with_arc(checker.clone())
                .build();

            let resp = client.get("https://example.com").send().await.unwrap();

            assert_eq!(resp.status(), http::StatusCode::OK);
            assert!(checker.checked.load(Ordering::Acquire));
        }

        #[tokio::test]
        async fn token_is_obtained_once_for_many_requests() {
            let middleware = prepare_middleware(ConstExchange::default());
            let authority = middleware.authority.clone();
            let checker = TokenChecker::expecting(Some(TEST_TOKEN));
            let client = ClientBuilder::new(Client::default())
                .with(middleware)
                .with_arc(checker)
                .build();

            for _ in 0..3 {
                client.get("https://example.com").send().await.unwrap();
            }

            assert_eq!(authority.exchange().fetches.load(Ordering::Acquire), 1);
        }

        #[tokio::test]
        async fn auth_failure_stops_the_request() {
            let checker = TokenChecker::expecting(None);
            let client = ClientBuilder::new(Client::default())
                .with(prepare_middleware(ConstExchange {
                    reject: true,
                    ..ConstExchange::default()
                }))
                .with_arc(checker.clone())
                .build();

            let err = client.get("https://example.com").send().await.unwrap_err();

            assert!(matches!(
                crate::Error::from(err),
                crate::Error::FailedAuth(AuthError::Rejected { status: 1, .. })
            ));
            assert!(!checker.checked.load(Ordering::Acquire));
        }

        mod and_predicate_evaluates_to_ignore {
            use super::*;

            #[tokio::test]
            async fn middleware_does_not_attach_or_fetch_token() {
                let middleware = prepare_middleware(ConstExchange::default()).with_predicate(
                    SameOrigin::of(&Url::parse("https://broker.example.com").unwrap()),
                );
                let authority = middleware.authority.clone();
                let checker = TokenChecker::expecting(None);
                let client = ClientBuilder::new(Client::default())
                    .with(middleware)
                    .with_arc(checker.clone())
                    .build();

                let resp = client
                    .put("https://bucket.example.com/upload?sig=abc")
                    .send()
                    .await
                    .unwrap();

                assert_eq!(resp.status(), http::StatusCode::OK);
                assert!(checker.checked.load(Ordering::Acquire));
                assert_eq!(authority.exchange().fetches.load(Ordering::Acquire), 0);
            }
        }
    }

    mod when_request_already_contains_a_token_header {
        use super::*;

        #[tokio::test]
        async fn middleware_does_not_replace_it() {
            const OVERRIDE_TOKEN: &str = "overridden!";

            let checker = TokenChecker::expecting(Some(OVERRIDE_TOKEN));
            let client = ClientBuilder::new(Client::default())
                .with(prepare_middleware(ConstExchange::default()))
                .with_arc(checker.clone())
                .build();

            let resp = client
                .get("https://example.com")
                .header(ACCESS_TOKEN_HEADER, OVERRIDE_TOKEN)
                .send()
                .await
                .unwrap();

            assert_eq!(resp.status(), http::StatusCode::OK);
            assert!(checker.checked.load(Ordering::Acquire));
        }
    }

    mod same_origin_predicate {
        use super::*;

        fn request(url: &str) -> Request {
            Request::new(reqwest::Method::GET, url.parse().unwrap())
        }

        fn broker() -> SameOrigin {
            SameOrigin::of(&Url::parse("https://broker.example.com/base/").unwrap())
        }

        #[test]
        fn matches_any_path_on_the_same_origin() {
            let req = request("https://broker.example.com/connect-service/v2.1/files?x=1");
            assert!(dbg!(broker().find_case(true, &req)).is_none());
        }

        #[test]
        fn matches_explicit_default_port() {
            let req = request("https://broker.example.com:443/");
            assert!(dbg!(broker().find_case(true, &req)).is_none());
        }

        #[test]
        fn does_not_match_a_different_host() {
            let req = request("https://bucket.example.com/");
            assert!(dbg!(broker().find_case(false, &req)).is_none());
        }

        #[test]
        fn does_not_match_a_different_scheme_or_port() {
            assert!(!broker().eval(&request("http://broker.example.com/")));
            assert!(!broker().eval(&request("https://broker.example.com:8443/")));
        }
    }

    mod when_tracing_token_details {
        use std::{io, sync::Mutex};

        use enos_clock::{TestClock, UnixTime};

        use super::*;

        #[derive(Clone, Default)]
        struct Captured(Arc<Mutex<Vec<u8>>>);

        impl io::Write for Captured {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        #[tokio::test]
        async fn lifetimes_are_measured_with_the_authority_clock() {
            let captured = Captured::default();
            let writer = captured.clone();
            let subscriber = tracing_subscriber::fmt()
                .with_max_level(tracing::Level::TRACE)
                .with_ansi(false)
                .with_writer(move || writer.clone())
                .finish();
            let _guard = tracing::subscriber::set_default(subscriber);

            let clock = TestClock::new(UnixTime(1_700_000_000));
            let authority = TokenAuthority::new(
                ConstExchange::default(),
                AuthorityConfig::default().with_clock(clock),
            );
            let client = ClientBuilder::new(Client::default())
                .with(AccessTokenMiddleware::new(authority))
                .with_arc(TokenChecker::expecting(Some(TEST_TOKEN)))
                .build();

            client.get("https://example.com").send().await.unwrap();

            let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
            assert!(output.contains("token.status=Fresh"), "{}", output);
            assert!(output.contains("token.until_expired=7200"), "{}", output);
        }
    }
}
