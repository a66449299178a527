use std::{fmt, sync::Arc, time::Duration};

use enos_clock::{Clock, System, UnixTime};
use thiserror::Error;

use crate::{
    credential::{Credential, CredentialStatus, CredentialStore},
    exchange::{ExchangeError, TokenExchange},
    gate::RefreshGate,
    AccessToken,
};

/// How long a caller waits for someone else's in-flight token request
pub const DEFAULT_AUTH_WAIT: Duration = Duration::from_secs(10);

/// Configuration for a [`TokenAuthority`]
#[derive(Clone, Debug)]
pub struct AuthorityConfig<C = System> {
    auth_wait: Duration,
    clock: C,
}

impl Default for AuthorityConfig {
    /// Default authority configuration
    ///
    /// Waits up to 10 seconds for an in-flight token request and uses the
    /// system clock.
    fn default() -> Self {
        Self {
            auth_wait: DEFAULT_AUTH_WAIT,
            clock: System,
        }
    }
}

impl AuthorityConfig {
    /// Constructs a configuration that waits up to `auth_wait` for an in-flight token request
    pub fn new(auth_wait: Duration) -> Self {
        Self {
            auth_wait,
            clock: System,
        }
    }
}

impl<C> AuthorityConfig<C> {
    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> AuthorityConfig<D> {
        AuthorityConfig {
            auth_wait: self.auth_wait,
            clock,
        }
    }

    /// Sets how long to wait for an in-flight token request
    pub fn with_auth_wait(mut self, auth_wait: Duration) -> Self {
        self.auth_wait = auth_wait;
        self
    }
}

/// A failure to obtain a valid access token
#[derive(Debug, Error)]
pub enum AuthError {
    /// The token service answered, but did not issue a token
    #[error("token service rejected the request (status {status}): {msg}")]
    Rejected {
        /// The status reported by the token service
        status: i64,
        /// The message reported by the token service
        msg: String,
    },
    /// The token service response could not be understood
    #[error("unable to decode token response: {0}")]
    Decode(String),
    /// Another caller's token request did not finish in time
    #[error("timed out after {0:?} waiting for an in-flight token request")]
    WaitTimedOut(Duration),
    /// Another caller's token request finished without producing a token
    #[error("no access token available after an in-flight token request")]
    StillMissing,
    /// The token exchange failed for a reason unrelated to HTTP
    #[error("token exchange failed: {0}")]
    Unavailable(String),
    /// The token service could not be reached
    #[cfg(feature = "apim")]
    #[error("error sending request to token service")]
    Transport(#[source] reqwest::Error),
}

impl AuthError {
    /// Whether the failure happened below HTTP, while talking to the token service
    pub fn is_transport(&self) -> bool {
        #[cfg(feature = "apim")]
        if let Self::Transport(_) = self {
            return true;
        }
        false
    }
}

impl From<ExchangeError> for AuthError {
    fn from(error: ExchangeError) -> Self {
        match error {
            ExchangeError::Rejected { status, msg } => Self::Rejected { status, msg },
            ExchangeError::Decode(msg) => Self::Decode(msg),
            #[cfg(feature = "apim")]
            ExchangeError::Transport(error) => Self::Transport(error),
            ExchangeError::Other(msg) => Self::Unavailable(msg),
        }
    }
}

struct Inner<X, C> {
    exchange: X,
    store: CredentialStore,
    gate: RefreshGate,
    auth_wait: Duration,
    clock: C,
}

/// Keeps an access token valid on behalf of any number of concurrent callers
///
/// The authority obtains a token lazily on first use, refreshes it once it
/// enters its refresh window and fetches a new one once it expires. Only one
/// caller talks to the token service at a time; everyone else either proceeds
/// with the current token or waits briefly for the in-flight request.
pub struct TokenAuthority<X, C = System> {
    inner: Arc<Inner<X, C>>,
}

impl<X, C> Clone for TokenAuthority<X, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<X: fmt::Debug, C: fmt::Debug> fmt::Debug for TokenAuthority<X, C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenAuthority")
            .field("exchange", &self.inner.exchange)
            .field("credential", &self.inner.store.current())
            .field("gate_held", &self.inner.gate.is_held())
            .field("auth_wait", &self.inner.auth_wait)
            .field("clock", &self.inner.clock)
            .finish()
    }
}

impl<X, C> TokenAuthority<X, C> {
    /// Constructs an authority that holds no token yet
    pub fn new(exchange: X, config: AuthorityConfig<C>) -> Self {
        Self {
            inner: Arc::new(Inner {
                exchange,
                store: CredentialStore::new(),
                gate: RefreshGate::new(),
                auth_wait: config.auth_wait,
                clock: config.clock,
            }),
        }
    }

    /// Gets the current access token, if one has been obtained
    ///
    /// The token is not checked for validity; call
    /// [`ensure_valid()`][Self::ensure_valid] first.
    pub fn access_token(&self) -> Option<AccessToken> {
        self.inner
            .store
            .current()
            .map(|c| c.access_token().to_owned())
    }

    /// Gets a snapshot of the current credential
    pub fn credential(&self) -> Option<Arc<Credential>> {
        self.inner.store.current()
    }

    /// The store holding the current credential
    pub fn store(&self) -> &CredentialStore {
        &self.inner.store
    }

    /// The exchange used to obtain tokens
    pub fn exchange(&self) -> &X {
        &self.inner.exchange
    }
}

impl<X, C: Clock> TokenAuthority<X, C> {
    /// The current time according to the authority's clock
    pub fn now(&self) -> UnixTime {
        self.inner.clock.now()
    }
}

impl<X, C> TokenAuthority<X, C>
where
    X: TokenExchange,
    C: Clock + Send + Sync,
{
    /// Makes sure a usable token is held, fetching or refreshing it if required
    ///
    /// If another caller is already talking to the token service, waits up to
    /// the configured bound for it to finish and then succeeds only if a token
    /// is present.
    pub async fn ensure_valid(&self) -> Result<(), AuthError> {
        let inner = &*self.inner;
        let now = inner.clock.now();
        if !inner.store.needs_initial_fetch_at(now) && !inner.store.needs_proactive_refresh_at(now)
        {
            return Ok(());
        }

        if let Some(_pass) = inner.gate.try_enter() {
            return self.renew().await;
        }

        tracing::debug!(
            wait_ms = inner.auth_wait.as_millis() as u64,
            "token request already in flight, waiting"
        );

        match inner.gate.enter_within(inner.auth_wait).await {
            Some(_pass) => {
                if inner.store.needs_initial_fetch_with_clock(&inner.clock) {
                    tracing::warn!("in-flight token request finished without a usable token");
                    Err(AuthError::StillMissing)
                } else {
                    Ok(())
                }
            }
            None => {
                tracing::warn!(
                    wait_ms = inner.auth_wait.as_millis() as u64,
                    "gave up waiting for in-flight token request"
                );
                Err(AuthError::WaitTimedOut(inner.auth_wait))
            }
        }
    }

    /// Talks to the token service; the caller must hold the gate
    async fn renew(&self) -> Result<(), AuthError> {
        let inner = &*self.inner;
        let now = inner.clock.now();
        let current = inner.store.current();

        let issued = match current.as_deref().map(|c| (c, c.status_at(now))) {
            None | Some((_, CredentialStatus::Expired)) => {
                tracing::debug!("requesting new token");
                inner.exchange.fetch().await
            }
            Some((credential, CredentialStatus::RefreshDue)) => {
                tracing::debug!(
                    expire_at = credential.expire_at().0,
                    "refreshing token before expiry"
                );
                inner.exchange.refresh(credential.access_token()).await
            }
            Some((_, CredentialStatus::Fresh)) => {
                tracing::trace!("token already renewed by another caller");
                return Ok(());
            }
        };

        let issued = issued.map_err(|error| {
            tracing::warn!(
                error = (&error as &dyn std::error::Error),
                "unable to obtain access token"
            );
            AuthError::from(error)
        })?;

        let credential =
            inner
                .store
                .record_at(issued.access_token, issued.expire_in, inner.clock.now());

        tracing::info!(
            refresh_at = credential.refresh_at().0,
            expire_at = credential.expire_at().0,
            "recorded new access token"
        );

        Ok(())
    }
}
