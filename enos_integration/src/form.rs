//! Multipart bodies for integration requests

use bytes::Bytes;
use md5::{Digest, Md5};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    multipart::{Form, Part},
};

use crate::{error::Error, message::UploadFile, Result};

const MESSAGE_PART: &str = "enos-message";
const FILE_PART: &str = "file";
const OCTET_STREAM: &str = "application/octet-stream";
const CONTENT_MD5: HeaderName = HeaderName::from_static("content-md5");

/// An upload file with its content read into memory
#[derive(Clone, Debug)]
pub(crate) struct Attachment {
    file: UploadFile,
    content: Bytes,
    md5: String,
}

impl Attachment {
    /// Reads the content of `file` from disk
    pub(crate) async fn load(file: &UploadFile) -> Result<Self> {
        let content = tokio::fs::read(file.path()).await.map_err(|error| {
            tracing::warn!(
                error = (&error as &dyn std::error::Error),
                path = %file.path().display(),
                "unable to read attachment"
            );
            Error::ClientDecode(format!(
                "unable to read {}: {}",
                file.path().display(),
                error
            ))
        })?;

        Ok(Self::from_parts(file.clone(), Bytes::from(content)))
    }

    pub(crate) fn from_parts(file: UploadFile, content: Bytes) -> Self {
        let md5 = format!("{:x}", Md5::digest(&content));
        Self { file, content, md5 }
    }

    pub(crate) fn file(&self) -> &UploadFile {
        &self.file
    }

    pub(crate) fn content(&self) -> &Bytes {
        &self.content
    }

    pub(crate) fn len(&self) -> u64 {
        self.content.len() as u64
    }

    /// Lowercase hex MD5 of the content
    pub(crate) fn md5(&self) -> &str {
        &self.md5
    }
}

/// Assembles the multipart body of an integration request
///
/// File parts are left out when `include_files` is false, in which case the
/// content is expected to go to pre-signed upload URLs instead.
pub(crate) fn integration_form(
    message: String,
    attachments: &[Attachment],
    include_files: bool,
) -> Result<Form> {
    let mut form = Form::new().text(MESSAGE_PART, message);

    if include_files {
        for attachment in attachments {
            form = form.part(FILE_PART, file_part(attachment)?);
        }
    }

    Ok(form)
}

fn file_part(attachment: &Attachment) -> Result<Part> {
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_MD5,
        HeaderValue::from_str(attachment.md5()).map_err(Error::decode)?,
    );

    let part = Part::bytes(attachment.content().to_vec())
        .file_name(attachment.file().filename().to_owned())
        .mime_str(OCTET_STREAM)?
        .headers(headers);

    Ok(part)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use httpmock::{Method::POST, MockServer};
    use serde_json::json;

    use super::*;
    use crate::message::{DeviceInfo, FeatureValue, MeasurepointPostRequest};

    fn upload_file(path: &std::path::Path) -> UploadFile {
        MeasurepointPostRequest::new()
            .add_measurepoints(
                DeviceInfo::asset("asset-1"),
                1,
                [("doc", FeatureValue::from(path))],
            )
            .build()
            .files()[0]
            .clone()
    }

    mod when_loading_attachments {
        use super::*;

        #[tokio::test]
        async fn content_and_digest_are_read_from_disk() {
            let mut tmp = tempfile::NamedTempFile::new().unwrap();
            tmp.write_all(b"hello").unwrap();

            let attachment = Attachment::load(&upload_file(tmp.path())).await.unwrap();

            assert_eq!(attachment.len(), 5);
            assert_eq!(attachment.md5(), "5d41402abc4b2a76b9719d911017c592");
            assert_eq!(&attachment.content()[..], b"hello");
        }

        #[tokio::test]
        async fn missing_file_is_a_client_error() {
            let dir = tempfile::tempdir().unwrap();
            let file = upload_file(&dir.path().join("absent.bin"));

            let err = Attachment::load(&file).await.unwrap_err();

            assert!(matches!(err, Error::ClientDecode(msg) if msg.contains("absent.bin")));
        }
    }

    mod when_assembling_the_form {
        use super::*;

        async fn post(form: Form, server: &MockServer) {
            reqwest::Client::new()
                .post(server.url("/integration"))
                .multipart(form)
                .send()
                .await
                .unwrap();
        }

        #[tokio::test]
        async fn message_and_files_are_separate_parts() {
            let attachment = Attachment::from_parts(
                upload_file(std::path::Path::new("/tmp/notes.txt")),
                Bytes::from_static(b"hello"),
            );
            let filename = attachment.file().filename().to_owned();

            let server = MockServer::start_async().await;
            let mock = server
                .mock_async(|when, then| {
                    when.method(POST)
                        .path("/integration")
                        .body_includes("name=\"enos-message\"")
                        .body_includes("{\"id\":\"1\"}")
                        .body_includes("name=\"file\"")
                        .body_includes(format!("filename=\"{}\"", filename))
                        .body_includes("content-md5: 5d41402abc4b2a76b9719d911017c592")
                        .body_includes("application/octet-stream")
                        .body_includes("hello");
                    then.status(200).json_body(json!({ "code": 0 }));
                })
                .await;

            let form =
                integration_form(json!({ "id": "1" }).to_string(), &[attachment], true).unwrap();
            post(form, &server).await;

            mock.assert_async().await;
        }

        #[tokio::test]
        async fn files_are_left_out_when_uploaded_elsewhere() {
            let attachment = Attachment::from_parts(
                upload_file(std::path::Path::new("/tmp/notes.txt")),
                Bytes::from_static(b"hello"),
            );

            let server = MockServer::start_async().await;
            let with_file = server
                .mock_async(|when, then| {
                    when.method(POST)
                        .path("/integration")
                        .body_includes("name=\"file\"");
                    then.status(500);
                })
                .await;
            let without_file = server
                .mock_async(|when, then| {
                    when.method(POST)
                        .path("/integration")
                        .body_includes("name=\"enos-message\"");
                    then.status(200);
                })
                .await;

            let form = integration_form("{}".to_owned(), &[attachment], false).unwrap();
            post(form, &server).await;

            assert_eq!(with_file.hits_async().await, 0);
            without_file.assert_async().await;
        }
    }
}
