//! A token exchange that uses the APIM token service as an authority

use async_trait::async_trait;
use enos_clock::DurationSecs;
use serde::Serialize;

use super::{
    dto::{GetTokenRequest, RefreshTokenRequest, TokenResponse},
    ExchangeError, IssuedToken, TokenExchange,
};
use crate::{sign, AccessToken, AccessTokenRef, AppKey, AppSecret};

const TOKEN_GET_PATH: &str = "/apim-token-service/v2.0/token/get";
const TOKEN_REFRESH_PATH: &str = "/apim-token-service/v2.0/token/refresh";

/// Obtains and refreshes access tokens from the APIM token service
#[derive(Debug)]
pub struct ApimTokenExchange {
    client: reqwest::Client,
    get_url: String,
    refresh_url: String,
    app_key: AppKey,
    app_secret: AppSecret,
}

impl ApimTokenExchange {
    /// Constructs a new exchange against the token service at `token_server_url`
    pub fn new(
        client: reqwest::Client,
        token_server_url: &str,
        app_key: AppKey,
        app_secret: AppSecret,
    ) -> Self {
        let base = token_server_url.trim_end_matches('/');
        Self {
            client,
            get_url: format!("{}{}", base, TOKEN_GET_PATH),
            refresh_url: format!("{}{}", base, TOKEN_REFRESH_PATH),
            app_key,
            app_secret,
        }
    }

    /// The application key tokens are requested for
    pub fn app_key(&self) -> &AppKey {
        &self.app_key
    }
}

#[async_trait]
impl TokenExchange for ApimTokenExchange {
    async fn fetch(&self) -> Result<IssuedToken, ExchangeError> {
        let timestamp = sign::timestamp_millis();
        let body = GetTokenRequest {
            app_key: &self.app_key,
            encryption: sign::sign(&self.app_key, &timestamp, &self.app_secret),
            timestamp,
        };

        request_token(&self.client, &self.get_url, &body).await
    }

    async fn refresh(&self, current: &AccessTokenRef) -> Result<IssuedToken, ExchangeError> {
        let timestamp = sign::timestamp_millis();
        let body = RefreshTokenRequest {
            app_key: &self.app_key,
            encryption: sign::sign(&self.app_key, &timestamp, &self.app_secret),
            timestamp,
            access_token: current,
        };

        request_token(&self.client, &self.refresh_url, &body).await
    }
}

#[tracing::instrument(err, skip(client, body))]
async fn request_token<B: Serialize>(
    client: &reqwest::Client,
    url: &str,
    body: &B,
) -> Result<IssuedToken, ExchangeError> {
    tracing::trace!("requesting token from token service");

    let resp = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(ExchangeError::Transport)?;

    tracing::debug!(
        response.status = resp.status().as_u16(),
        "received token response from token service"
    );

    // The service reports failures in the body; the HTTP status alone is not trusted.
    let payload = resp.bytes().await.map_err(ExchangeError::Transport)?;
    let resp: TokenResponse = serde_json::from_slice(&payload).map_err(|error| {
        tracing::warn!(
            error = (&error as &dyn std::error::Error),
            "failed to decode token response"
        );
        ExchangeError::Decode(error.to_string())
    })?;

    let data = match resp.data {
        Some(data) if resp.status == 0 => data,
        data => {
            tracing::warn!(
                status = resp.status,
                msg = resp.msg.as_deref().unwrap_or_default(),
                business = resp.business.as_deref().unwrap_or_default(),
                has_data = data.is_some(),
                "token service did not issue a token"
            );
            return Err(ExchangeError::Rejected {
                status: resp.status,
                msg: resp.msg.unwrap_or_default(),
            });
        }
    };

    let token = IssuedToken {
        access_token: AccessToken::new(data.access_token),
        expire_in: DurationSecs(data.expire),
    };

    tracing::info!(
        access_token = ?token.access_token,
        expire_in = token.expire_in.0,
        "received new token"
    );

    Ok(token)
}
