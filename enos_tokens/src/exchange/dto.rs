//! Wire types for the APIM token service

use serde::{Deserialize, Serialize};

use crate::{AccessTokenRef, AppKeyRef};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct GetTokenRequest<'a> {
    pub app_key: &'a AppKeyRef,
    pub encryption: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct RefreshTokenRequest<'a> {
    pub app_key: &'a AppKeyRef,
    pub encryption: String,
    pub timestamp: String,
    pub access_token: &'a AccessTokenRef,
}

#[derive(Debug, Deserialize)]
pub(super) struct TokenResponse {
    pub status: i64,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub business: Option<String>,
    #[serde(default)]
    pub data: Option<TokenData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct TokenData {
    pub access_token: String,
    pub expire: u64,
}
