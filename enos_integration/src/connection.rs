//! A connection to the EnOS HTTP integration gateway

use std::collections::BTreeMap;

use enos_clock::DurationSecs;
use enos_tokens::{
    exchange::ApimTokenExchange, AppKey, AppSecret, AuthorityConfig, TokenAuthority,
};
use reqwest::{header, Method, Request, Url};
use serde::Deserialize;
use tokio::task::JoinHandle;

use crate::{
    dispatch::{next_request_id, ByteRange, Dispatcher, FileDownload},
    error::Error,
    form::{self, Attachment},
    message::{
        DeviceInfo, FileCategory, FileDownloadUrlResponse, FileInfoResponse, IntegrationRequest,
        IntegrationResponse, RequestAction,
    },
    middleware::{AccessTokenMiddleware, SameOrigin},
    Result,
};

const INTEGRATION_PATH: &str = "/connect-service/v2.1/integration";
const FILES_PATH: &str = "/connect-service/v2.1/files";
const FIRMWARE_FILES_PATH: &str = "/connect-service/v2.5/files";

/// Tunables for an [`HttpConnection`]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Upload attachments to pre-signed URLs instead of inside the publish request
    pub use_lark: bool,
    /// In lark mode, upload attachments right after a successful publish
    pub auto_upload: bool,
    /// Bound on establishing a connection
    pub connect_timeout: DurationSecs,
    /// Bound on each read from an established connection
    pub read_timeout: DurationSecs,
    /// Bound on waiting for another caller's token request
    pub auth_wait: DurationSecs,
    /// Bound on a whole exchange, from connecting until the response body is read
    ///
    /// Covers stalled uploads, which no per-read bound catches.
    pub timeout: Option<DurationSecs>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            use_lark: false,
            auto_upload: true,
            connect_timeout: DurationSecs(10),
            read_timeout: DurationSecs(2 * 60),
            auth_wait: DurationSecs(10),
            timeout: None,
        }
    }
}

/// Assembles an [`HttpConnection`]
#[derive(Debug)]
pub struct HttpConnectionBuilder {
    integration_broker_url: String,
    token_server_url: String,
    app_key: AppKey,
    app_secret: AppSecret,
    org_id: String,
    config: ConnectionConfig,
    client: Option<reqwest::Client>,
}

impl HttpConnectionBuilder {
    /// Replaces the whole configuration
    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets whether attachments go to pre-signed upload URLs
    pub fn with_lark(mut self, use_lark: bool) -> Self {
        self.config.use_lark = use_lark;
        self
    }

    /// Sets whether attachments are uploaded automatically in lark mode
    pub fn with_auto_upload(mut self, auto_upload: bool) -> Self {
        self.config.auto_upload = auto_upload;
        self
    }

    /// Bounds each whole exchange with the gateway
    pub fn with_timeout(mut self, timeout: DurationSecs) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    /// Uses a caller-provided HTTP client
    ///
    /// The configured timeouts are not applied to such a client.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Builds the connection without obtaining a token
    ///
    /// The first request will obtain one.
    pub fn build(self) -> Result<HttpConnection> {
        let broker_url = self.integration_broker_url.trim_end_matches('/').to_owned();
        let broker = Url::parse(&broker_url).map_err(|error| {
            Error::ClientDecode(format!("invalid integration broker url: {}", error))
        })?;

        let client = match self.client {
            Some(client) => client,
            None => {
                let mut builder = reqwest::Client::builder()
                    .connect_timeout(self.config.connect_timeout.into())
                    .read_timeout(self.config.read_timeout.into());
                if let Some(timeout) = self.config.timeout {
                    builder = builder.timeout(timeout.into());
                }
                builder.build()?
            }
        };

        let exchange = ApimTokenExchange::new(
            client.clone(),
            &self.token_server_url,
            self.app_key,
            self.app_secret,
        );
        let authority = TokenAuthority::new(
            exchange,
            AuthorityConfig::new(self.config.auth_wait.into()),
        );
        let middleware =
            AccessTokenMiddleware::new(authority.clone()).with_predicate(SameOrigin::of(&broker));

        Ok(HttpConnection {
            dispatcher: Dispatcher::new(client, middleware),
            authority,
            broker_url,
            org_id: self.org_id,
            config: self.config,
        })
    }

    /// Builds the connection and obtains the first token
    pub async fn connect(self) -> Result<HttpConnection> {
        let connection = self.build()?;
        connection.authority.ensure_valid().await?;

        tracing::info!(
            broker = %connection.broker_url,
            org_id = %connection.org_id,
            use_lark = connection.config.use_lark,
            "connected to integration gateway"
        );

        Ok(connection)
    }
}

/// Publishes device data to, and manages files on, the integration gateway
///
/// Cheap to clone; clones share the same token and HTTP connection pool.
#[derive(Clone, Debug)]
pub struct HttpConnection {
    dispatcher: Dispatcher,
    authority: TokenAuthority<ApimTokenExchange>,
    broker_url: String,
    org_id: String,
    config: ConnectionConfig,
}

impl HttpConnection {
    /// Starts building a connection
    pub fn builder(
        integration_broker_url: impl Into<String>,
        token_server_url: impl Into<String>,
        app_key: AppKey,
        app_secret: AppSecret,
        org_id: impl Into<String>,
    ) -> HttpConnectionBuilder {
        HttpConnectionBuilder {
            integration_broker_url: integration_broker_url.into(),
            token_server_url: token_server_url.into(),
            app_key,
            app_secret,
            org_id: org_id.into(),
            config: ConnectionConfig::default(),
            client: None,
        }
    }

    /// The authority keeping this connection's token valid
    pub fn authority(&self) -> &TokenAuthority<ApimTokenExchange> {
        &self.authority
    }

    /// The connection's configuration
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// The organization requests are made on behalf of
    pub fn org_id(&self) -> &str {
        &self.org_id
    }

    /// Publishes measurepoints, attributes or events along with their files
    #[tracing::instrument(
        skip(self, request),
        fields(action = %request.action(), files = request.files().len())
    )]
    pub async fn publish(&self, request: IntegrationRequest) -> Result<IntegrationResponse> {
        let id = request.id().map_or_else(next_request_id, str::to_owned);

        let mut attachments = Vec::with_capacity(request.files().len());
        for file in request.files() {
            attachments.push(Attachment::load(file).await?);
        }

        let message = request.encode(&id, &attachments).map_err(Error::decode)?;
        let form = form::integration_form(message, &attachments, !self.config.use_lark)?;

        let mut url = self.url(INTEGRATION_PATH, request.action(), &[])?;
        if self.config.use_lark {
            url.query_pairs_mut().append_pair("useLark", "true");
        }

        let http = self
            .dispatcher
            .request(Method::POST, url)
            .multipart(form)
            .build()?;

        tracing::debug!(request.id = %id, "publishing integration request");
        let mut response: IntegrationResponse = self.dispatcher.execute(http).await?;

        if self.config.use_lark && !attachments.is_empty() {
            self.upload_attachments(&attachments, &mut response).await;
        }

        Ok(response)
    }

    /// Publishes on the runtime and hands the outcome to `callback`
    pub fn publish_detached<F>(&self, request: IntegrationRequest, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<IntegrationResponse>) + Send + 'static,
    {
        let connection = self.clone();
        tokio::spawn(async move { callback(connection.publish(request).await) })
    }

    /// Deletes a file attached to a device
    pub async fn delete_file(
        &self,
        device: &DeviceInfo,
        file_uri: &str,
    ) -> Result<IntegrationResponse> {
        let request = self.delete_request(device, file_uri)?;
        self.dispatcher.execute(request).await
    }

    /// Deletes a file on the runtime and hands the outcome to `callback`
    pub fn delete_file_detached<F>(
        &self,
        device: &DeviceInfo,
        file_uri: &str,
        callback: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(Result<IntegrationResponse>) + Send + 'static,
    {
        match self.delete_request(device, file_uri) {
            Ok(request) => self.dispatcher.execute_detached(request, callback),
            Err(error) => tokio::spawn(async move { callback(Err(error)) }),
        }
    }

    /// Reads the metadata of a stored file
    pub async fn get_file_info(
        &self,
        device: &DeviceInfo,
        file_uri: &str,
        category: FileCategory,
    ) -> Result<FileInfoResponse> {
        let request = self.file_request(RequestAction::GetFileInfo, device, file_uri, category)?;
        self.dispatcher.execute(request).await
    }

    /// Downloads a stored file, or the part of it selected by `range`
    pub async fn download_file(
        &self,
        device: &DeviceInfo,
        file_uri: &str,
        category: FileCategory,
        range: ByteRange,
    ) -> Result<FileDownload> {
        let request = self.download_request(device, file_uri, category, range)?;
        self.dispatcher.download(request).await
    }

    /// Downloads a stored file on the runtime and hands the outcome to `callback`
    pub fn download_file_detached<F>(
        &self,
        device: &DeviceInfo,
        file_uri: &str,
        category: FileCategory,
        range: ByteRange,
        callback: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(Result<FileDownload>) + Send + 'static,
    {
        match self.download_request(device, file_uri, category, range) {
            Ok(request) => self.dispatcher.download_detached(request, callback),
            Err(error) => tokio::spawn(async move { callback(Err(error)) }),
        }
    }

    /// Downloads a firmware file, or the part of it selected by `range`
    pub async fn download_firmware_file(
        &self,
        firmware_id: &str,
        range: ByteRange,
    ) -> Result<FileDownload> {
        let request = self.firmware_request(firmware_id, range)?;
        self.dispatcher.download(request).await
    }

    /// Downloads a firmware file on the runtime and hands the outcome to `callback`
    pub fn download_firmware_file_detached<F>(
        &self,
        firmware_id: &str,
        range: ByteRange,
        callback: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(Result<FileDownload>) + Send + 'static,
    {
        match self.firmware_request(firmware_id, range) {
            Ok(request) => self.dispatcher.download_detached(request, callback),
            Err(error) => tokio::spawn(async move { callback(Err(error)) }),
        }
    }

    /// Obtains a URL the file can be downloaded from directly
    ///
    /// A non-zero code in the response is reported as [`Error::Remote`].
    pub async fn get_download_url(
        &self,
        device: &DeviceInfo,
        file_uri: &str,
        category: FileCategory,
    ) -> Result<String> {
        let request =
            self.file_request(RequestAction::GetDownloadUrl, device, file_uri, category)?;
        let response: FileDownloadUrlResponse = self.dispatcher.execute(request).await?;

        if response.code != 0 {
            tracing::warn!(
                code = response.code,
                msg = response.msg.as_deref().unwrap_or_default(),
                "gateway refused to provide a download url"
            );
            return Err(Error::remote(response.code, response.msg.unwrap_or_default()));
        }

        response
            .data
            .ok_or_else(|| Error::ClientDecode("download url response carried no url".into()))
    }

    fn url(&self, path: &str, action: RequestAction, params: &[(&str, &str)]) -> Result<Url> {
        let mut url = Url::parse(&format!("{}{}", self.broker_url, path)).map_err(Error::decode)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("action", action.as_str());
            query.append_pair("orgId", &self.org_id);
            for (name, value) in params {
                query.append_pair(name, value);
            }
        }
        Ok(url)
    }

    fn file_url(
        &self,
        action: RequestAction,
        device: &DeviceInfo,
        file_uri: &str,
        category: Option<FileCategory>,
    ) -> Result<Url> {
        let mut params = vec![("fileUri", file_uri)];
        if let Some(category) = category {
            params.push(("category", category.as_str()));
        }
        params.extend(device.identity());
        self.url(FILES_PATH, action, &params)
    }

    fn delete_request(&self, device: &DeviceInfo, file_uri: &str) -> Result<Request> {
        let url = self.file_url(RequestAction::Delete, device, file_uri, None)?;
        Ok(self.dispatcher.request(Method::POST, url).body("").build()?)
    }

    fn file_request(
        &self,
        action: RequestAction,
        device: &DeviceInfo,
        file_uri: &str,
        category: FileCategory,
    ) -> Result<Request> {
        let url = self.file_url(action, device, file_uri, Some(category))?;
        Ok(self.dispatcher.request(Method::GET, url).build()?)
    }

    fn download_request(
        &self,
        device: &DeviceInfo,
        file_uri: &str,
        category: FileCategory,
        range: ByteRange,
    ) -> Result<Request> {
        let url = self.file_url(RequestAction::Download, device, file_uri, Some(category))?;
        self.ranged_get(url, range)
    }

    fn firmware_request(&self, firmware_id: &str, range: ByteRange) -> Result<Request> {
        let url = self.url(
            FIRMWARE_FILES_PATH,
            RequestAction::DownloadFirmwareFile,
            &[("firmwareId", firmware_id)],
        )?;
        self.ranged_get(url, range)
    }

    fn ranged_get(&self, url: Url, range: ByteRange) -> Result<Request> {
        let mut builder = self.dispatcher.request(Method::GET, url);
        if let Some(value) = range.header_value() {
            builder = builder.header(header::RANGE, value);
        }
        Ok(builder.build()?)
    }

    /// Sends attachments to the pre-signed URLs returned by a lark-mode publish
    ///
    /// Each entry's filename is replaced with the attachment's original name.
    /// Upload failures are logged and otherwise ignored.
    async fn upload_attachments(&self, attachments: &[Attachment], response: &mut IntegrationResponse) {
        let Some(data) = response.data.as_mut() else {
            tracing::warn!("lark publish response carried no upload details");
            return;
        };

        for info in &mut data.uri_info_list {
            let Some(attachment) = attachments
                .iter()
                .find(|a| a.file().filename() == info.filename)
            else {
                tracing::warn!(filename = %info.filename, "upload details refer to an unknown file");
                continue;
            };

            info.filename = attachment.file().original_filename().to_owned();

            if !self.config.auto_upload {
                continue;
            }

            let Some(upload_url) = info.upload_url.as_deref() else {
                tracing::warn!(filename = %info.filename, "no upload url for file");
                continue;
            };

            match self.upload(upload_url, &info.headers, attachment).await {
                Ok(()) => tracing::debug!(filename = %info.filename, "uploaded file"),
                Err(error) => tracing::error!(
                    error = (&error as &dyn std::error::Error),
                    filename = %info.filename,
                    upload_url,
                    "failed to upload file"
                ),
            }
        }
    }

    async fn upload(
        &self,
        upload_url: &str,
        headers: &BTreeMap<String, String>,
        attachment: &Attachment,
    ) -> Result<()> {
        let url = Url::parse(upload_url).map_err(Error::decode)?;
        let mut builder = self
            .dispatcher
            .request(Method::PUT, url)
            .body(attachment.content().clone());
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        self.dispatcher.send(builder.build()?).await?;
        Ok(())
    }
}
