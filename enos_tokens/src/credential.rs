use std::sync::Arc;

use arc_swap::ArcSwapOption;
use enos_clock::{Clock, DurationSecs, UnixTime};

use crate::{AccessToken, AccessTokenRef};

/// How long before expiry a credential becomes due for a proactive refresh
pub const REFRESH_LEAD_TIME: DurationSecs = DurationSecs(10 * 60);

/// An access token along with the instants that bound its usefulness
#[derive(Debug)]
pub struct Credential {
    access_token: AccessToken,
    issued: UnixTime,
    refresh_at: UnixTime,
    expire_at: UnixTime,
}

/// A credential's lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialStatus {
    /// The credential is valid and not yet due for refresh
    Fresh,
    /// The credential is still valid, but should be refreshed
    RefreshDue,
    /// The credential is no longer valid
    Expired,
}

impl Credential {
    fn issue(access_token: AccessToken, expire_in: DurationSecs, now: UnixTime) -> Self {
        let expire_at = now + expire_in;
        Self {
            access_token,
            issued: now,
            refresh_at: expire_at - REFRESH_LEAD_TIME,
            expire_at,
        }
    }

    /// Gets the access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the time the credential was recorded
    #[inline]
    pub fn issued(&self) -> UnixTime {
        self.issued
    }

    /// Gets the time after which a proactive refresh should be attempted
    #[inline]
    pub fn refresh_at(&self) -> UnixTime {
        self.refresh_at
    }

    /// Gets the time after which the credential is no longer valid
    #[inline]
    pub fn expire_at(&self) -> UnixTime {
        self.expire_at
    }

    /// Gets the credential's lifecycle status as of the provided time
    #[inline]
    pub fn status_at(&self, time: UnixTime) -> CredentialStatus {
        if time < self.refresh_at {
            CredentialStatus::Fresh
        } else if time < self.expire_at {
            CredentialStatus::RefreshDue
        } else {
            CredentialStatus::Expired
        }
    }

    /// Gets how much longer the credential will be valid as of the provided time
    #[inline]
    pub fn until_expired_at(&self, time: UnixTime) -> DurationSecs {
        self.expire_at - time
    }
}

/// Holds the current credential, if any
///
/// Readers take lock-free snapshots. The store is written only by the
/// [`TokenAuthority`](crate::TokenAuthority) that owns it.
#[derive(Debug, Default)]
pub struct CredentialStore {
    current: ArcSwapOption<Credential>,
}

impl CredentialStore {
    /// Constructs an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets a snapshot of the current credential
    pub fn current(&self) -> Option<Arc<Credential>> {
        self.current.load_full()
    }

    /// Whether a brand new token must be obtained as of `now`
    ///
    /// True when no token is held or the held token has expired.
    pub fn needs_initial_fetch_at(&self, now: UnixTime) -> bool {
        match &*self.current.load() {
            None => true,
            Some(credential) => now >= credential.expire_at,
        }
    }

    /// Whether the held token is still usable but due for refresh as of `now`
    pub fn needs_proactive_refresh_at(&self, now: UnixTime) -> bool {
        match &*self.current.load() {
            None => false,
            Some(credential) => credential.status_at(now) == CredentialStatus::RefreshDue,
        }
    }

    /// Whether a brand new token must be obtained according to `clock`
    #[inline]
    pub fn needs_initial_fetch_with_clock<C: Clock>(&self, clock: &C) -> bool {
        self.needs_initial_fetch_at(clock.now())
    }

    /// Whether the held token is due for refresh according to `clock`
    #[inline]
    pub fn needs_proactive_refresh_with_clock<C: Clock>(&self, clock: &C) -> bool {
        self.needs_proactive_refresh_at(clock.now())
    }

    /// Replaces the held credential with `access_token`, valid for `expire_in` from `now`
    pub(crate) fn record_at(
        &self,
        access_token: AccessToken,
        expire_in: DurationSecs,
        now: UnixTime,
    ) -> Arc<Credential> {
        let credential = Arc::new(Credential::issue(access_token, expire_in, now));
        self.current.store(Some(Arc::clone(&credential)));
        credential
    }
}
