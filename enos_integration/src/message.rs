//! Integration requests and the gateway's responses

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::form::Attachment;

/// Prefix marking a feature value as a reference to an attached file
pub const LOCAL_FILE_SCHEME: &str = "local://";

const PROTOCOL_VERSION: &str = "1.1";

/// Identifies a device either by asset or by product and device key
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DeviceInfo {
    /// A device known by its asset id
    Asset(String),
    /// A device known by its product key and device key
    Device {
        /// The product the device belongs to
        product_key: String,
        /// The device within its product
        device_key: String,
    },
}

impl DeviceInfo {
    /// A device identified by asset id
    pub fn asset(asset_id: impl Into<String>) -> Self {
        Self::Asset(asset_id.into())
    }

    /// A device identified by product key and device key
    pub fn device(product_key: impl Into<String>, device_key: impl Into<String>) -> Self {
        Self::Device {
            product_key: product_key.into(),
            device_key: device_key.into(),
        }
    }

    /// The identity as name/value pairs, as sent in payloads and query strings
    pub fn identity(&self) -> Vec<(&'static str, &str)> {
        match self {
            Self::Asset(asset_id) => vec![("assetId", asset_id.as_str())],
            Self::Device {
                product_key,
                device_key,
            } => vec![
                ("productKey", product_key.as_str()),
                ("deviceKey", device_key.as_str()),
            ],
        }
    }

    fn write_identity(&self, map: &mut Map<String, Value>) {
        for (name, value) in self.identity() {
            map.insert(name.to_owned(), Value::from(value));
        }
    }
}

/// The `action` query parameter selecting a gateway operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestAction {
    /// Publish measurepoints
    PostMeasurepoint,
    /// Publish attributes
    PostAttribute,
    /// Publish events
    PostEvent,
    /// Delete a file
    Delete,
    /// Read a file's metadata
    GetFileInfo,
    /// Download a file
    Download,
    /// Download a firmware file
    DownloadFirmwareFile,
    /// Obtain a direct download URL
    GetDownloadUrl,
}

impl RequestAction {
    /// The wire name of the action
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PostMeasurepoint => "postMeasurepoint",
            Self::PostAttribute => "postAttribute",
            Self::PostEvent => "postEvent",
            Self::Delete => "delete",
            Self::GetFileInfo => "getFileInfo",
            Self::Download => "download",
            Self::DownloadFirmwareFile => "downloadFirmwareFile",
            Self::GetDownloadUrl => "getDownloadUrl",
        }
    }
}

impl fmt::Display for RequestAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of feature a file was attached to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeatureType {
    /// A measurepoint value
    Measurepoint,
    /// An attribute value
    Attribute,
    /// An event output
    Event,
}

/// Where a stored file lives on the platform
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileCategory {
    /// Files attached to measurepoints, attributes or events
    Feature,
    /// Over-the-air update files
    Ota,
}

impl FileCategory {
    /// The wire name of the category
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Feature => "feature",
            Self::Ota => "ota",
        }
    }
}

/// The value of a measurepoint or attribute
#[derive(Clone, Debug, PartialEq)]
pub enum FeatureValue {
    /// A plain JSON value
    Json(Value),
    /// A local file to be uploaded
    File(PathBuf),
    /// Several local files to be uploaded
    Files(Vec<PathBuf>),
    /// A structure whose fields may be local files
    Struct(BTreeMap<String, FieldValue>),
}

/// The value of a field within a structure or event
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    /// A plain JSON value
    Json(Value),
    /// A local file to be uploaded
    File(PathBuf),
}

impl From<Value> for FeatureValue {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<PathBuf> for FeatureValue {
    fn from(path: PathBuf) -> Self {
        Self::File(path)
    }
}

impl From<&Path> for FeatureValue {
    fn from(path: &Path) -> Self {
        Self::File(path.to_owned())
    }
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<PathBuf> for FieldValue {
    fn from(path: PathBuf) -> Self {
        Self::File(path)
    }
}

impl From<&Path> for FieldValue {
    fn from(path: &Path) -> Self {
        Self::File(path.to_owned())
    }
}

/// A local file referenced by an integration request
#[derive(Clone, Debug, PartialEq)]
pub struct UploadFile {
    feature_type: FeatureType,
    feature_id: String,
    filename: String,
    original_filename: String,
    device: DeviceInfo,
    path: PathBuf,
}

impl UploadFile {
    fn new(feature_type: FeatureType, feature_id: &str, device: &DeviceInfo, path: PathBuf) -> Self {
        let original_filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let filename = format!("{}{}", Uuid::new_v4().simple(), extension_of(&original_filename));

        Self {
            feature_type,
            feature_id: feature_id.to_owned(),
            filename,
            original_filename,
            device: device.clone(),
            path,
        }
    }

    /// The kind of feature the file is attached to
    pub fn feature_type(&self) -> FeatureType {
        self.feature_type
    }

    /// The measurepoint, attribute or event the file is attached to
    pub fn feature_id(&self) -> &str {
        &self.feature_id
    }

    /// The generated name the file is sent under
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// The file's name on the local filesystem
    pub fn original_filename(&self) -> &str {
        &self.original_filename
    }

    /// The device the file belongs to
    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    /// Where the file is read from
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// The extension of `filename` including its dot, or empty if there is none
pub(crate) fn extension_of(filename: &str) -> String {
    match Path::new(filename).extension() {
        Some(ext) if !ext.is_empty() => format!(".{}", ext.to_string_lossy()),
        _ => String::new(),
    }
}

#[derive(Debug, Default)]
struct FileCollector {
    files: Vec<UploadFile>,
}

impl FileCollector {
    fn store(
        &mut self,
        feature_type: FeatureType,
        feature_id: &str,
        device: &DeviceInfo,
        path: PathBuf,
    ) -> Value {
        let file = UploadFile::new(feature_type, feature_id, device, path);
        let uri = format!("{}{}", LOCAL_FILE_SCHEME, file.filename);
        self.files.push(file);
        Value::String(uri)
    }

    fn resolve_feature(
        &mut self,
        feature_type: FeatureType,
        feature_id: &str,
        device: &DeviceInfo,
        value: FeatureValue,
    ) -> Value {
        match value {
            FeatureValue::Json(value) => value,
            FeatureValue::File(path) => self.store(feature_type, feature_id, device, path),
            FeatureValue::Files(paths) => Value::Array(
                paths
                    .into_iter()
                    .map(|path| self.store(feature_type, feature_id, device, path))
                    .collect(),
            ),
            FeatureValue::Struct(fields) => {
                self.resolve_fields(feature_type, feature_id, device, fields)
            }
        }
    }

    fn resolve_fields(
        &mut self,
        feature_type: FeatureType,
        feature_id: &str,
        device: &DeviceInfo,
        fields: BTreeMap<String, FieldValue>,
    ) -> Value {
        let resolved = fields
            .into_iter()
            .map(|(name, value)| {
                let value = match value {
                    FieldValue::Json(value) => value,
                    FieldValue::File(path) => self.store(feature_type, feature_id, device, path),
                };
                (name, value)
            })
            .collect();
        Value::Object(resolved)
    }
}

/// A request to publish features to the integration gateway
///
/// Built with [`MeasurepointPostRequest`], [`AttributePostRequest`] or
/// [`EventPostRequest`].
#[derive(Clone, Debug)]
pub struct IntegrationRequest {
    id: Option<String>,
    action: RequestAction,
    method: &'static str,
    params: Value,
    files: Vec<UploadFile>,
    realtime: bool,
}

impl IntegrationRequest {
    /// Sets an explicit request id instead of the next one from the process-wide sequence
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// The explicit request id, if one was set
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// The gateway operation publishing this request
    pub fn action(&self) -> RequestAction {
        self.action
    }

    /// The integration method name
    pub fn method(&self) -> &str {
        self.method
    }

    /// The request parameters, with files replaced by local references
    pub fn params(&self) -> &Value {
        &self.params
    }

    /// The local files referenced by the parameters
    pub fn files(&self) -> &[UploadFile] {
        &self.files
    }

    /// Whether the data is integrated in real time, rather than as history
    pub fn is_realtime(&self) -> bool {
        self.realtime
    }

    pub(crate) fn encode(&self, id: &str, attachments: &[Attachment]) -> serde_json::Result<String> {
        let mut payload = Map::new();
        payload.insert("id".into(), Value::from(id));
        payload.insert("version".into(), Value::from(PROTOCOL_VERSION));
        payload.insert("method".into(), Value::from(self.method));
        payload.insert("params".into(), self.params.clone());

        if !attachments.is_empty() {
            let files = attachments
                .iter()
                .map(|attachment| {
                    let file = attachment.file();
                    let mut disposition = Map::new();
                    disposition.insert("featureId".into(), Value::from(file.feature_id()));
                    disposition.insert("fileName".into(), Value::from(file.filename()));
                    disposition.insert(
                        "originalFilename".into(),
                        Value::from(file.original_filename()),
                    );
                    disposition.insert(
                        "fileLength".into(),
                        Value::from(attachment.len().to_string()),
                    );
                    disposition.insert("fileExt".into(), Value::from(extension_of(file.filename())));
                    disposition.insert("md5".into(), Value::from(attachment.md5()));
                    file.device().write_identity(&mut disposition);
                    (file.filename().to_owned(), Value::Object(disposition))
                })
                .collect();
            payload.insert("files".into(), Value::Object(files));
        }

        payload.insert("isRealtimeIntegration".into(), Value::from(self.realtime));
        serde_json::to_string(&payload)
    }
}

fn merge_into<K: PartialEq>(
    entries: &mut Vec<(K, Vec<(String, FeatureValue)>)>,
    key: K,
    values: Vec<(String, FeatureValue)>,
) {
    match entries.iter_mut().find(|(k, _)| *k == key) {
        Some((_, existing)) => existing.extend(values),
        None => entries.push((key, values)),
    }
}

fn collect_values<K, V, I>(values: I) -> Vec<(String, FeatureValue)>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<FeatureValue>,
{
    values
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Resolves feature values in insertion order; later values for the same id win
fn resolve_values(
    collector: &mut FileCollector,
    feature_type: FeatureType,
    device: &DeviceInfo,
    values: Vec<(String, FeatureValue)>,
) -> Value {
    let mut resolved = Map::new();
    for (id, value) in values {
        let value = collector.resolve_feature(feature_type, &id, device, value);
        resolved.insert(id, value);
    }
    Value::Object(resolved)
}

/// Builds a request publishing measurepoint values
#[derive(Debug)]
pub struct MeasurepointPostRequest {
    realtime: bool,
    entries: Vec<((DeviceInfo, i64), Vec<(String, FeatureValue)>)>,
}

impl Default for MeasurepointPostRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl MeasurepointPostRequest {
    /// Starts an empty real-time measurepoint request
    pub fn new() -> Self {
        Self {
            realtime: true,
            entries: Vec::new(),
        }
    }

    /// Whether the values are integrated in real time, rather than as history
    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    /// Adds measurepoint values for a device at a time in epoch milliseconds
    ///
    /// Values added for the same device and time are merged.
    pub fn add_measurepoints<K, V, I>(mut self, device: DeviceInfo, time: i64, values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<FeatureValue>,
    {
        merge_into(&mut self.entries, (device, time), collect_values(values));
        self
    }

    /// Finishes the request, replacing local files with references
    pub fn build(self) -> IntegrationRequest {
        let mut collector = FileCollector::default();
        let params = self
            .entries
            .into_iter()
            .map(|((device, time), values)| {
                let mut param = Map::new();
                device.write_identity(&mut param);
                param.insert("time".into(), Value::from(time));
                param.insert(
                    "measurepoints".into(),
                    resolve_values(&mut collector, FeatureType::Measurepoint, &device, values),
                );
                Value::Object(param)
            })
            .collect();

        IntegrationRequest {
            id: None,
            action: RequestAction::PostMeasurepoint,
            method: "integration.measurepoint.post",
            params: Value::Array(params),
            files: collector.files,
            realtime: self.realtime,
        }
    }
}

/// Builds a request publishing attribute values
#[derive(Debug)]
pub struct AttributePostRequest {
    realtime: bool,
    entries: Vec<(DeviceInfo, Vec<(String, FeatureValue)>)>,
}

impl Default for AttributePostRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl AttributePostRequest {
    /// Starts an empty real-time attribute request
    pub fn new() -> Self {
        Self {
            realtime: true,
            entries: Vec::new(),
        }
    }

    /// Whether the values are integrated in real time, rather than as history
    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    /// Adds attribute values for a device
    ///
    /// Values added for the same device are merged.
    pub fn add_attributes<K, V, I>(mut self, device: DeviceInfo, values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<FeatureValue>,
    {
        merge_into(&mut self.entries, device, collect_values(values));
        self
    }

    /// Finishes the request, replacing local files with references
    pub fn build(self) -> IntegrationRequest {
        let mut collector = FileCollector::default();
        let params = self
            .entries
            .into_iter()
            .map(|(device, values)| {
                let mut param = Map::new();
                device.write_identity(&mut param);
                param.insert(
                    "attributes".into(),
                    resolve_values(&mut collector, FeatureType::Attribute, &device, values),
                );
                Value::Object(param)
            })
            .collect();

        IntegrationRequest {
            id: None,
            action: RequestAction::PostAttribute,
            method: "integration.attribute.post",
            params: Value::Array(params),
            files: collector.files,
            realtime: self.realtime,
        }
    }
}

/// Builds a request publishing events
#[derive(Debug)]
pub struct EventPostRequest {
    realtime: bool,
    entries: Vec<((DeviceInfo, i64), Vec<(String, BTreeMap<String, FieldValue>)>)>,
}

impl Default for EventPostRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl EventPostRequest {
    /// Starts an empty real-time event request
    pub fn new() -> Self {
        Self {
            realtime: true,
            entries: Vec::new(),
        }
    }

    /// Whether the events are integrated in real time, rather than as history
    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    /// Adds an event with its output fields for a device at a time in epoch milliseconds
    pub fn add_event<K, V, I>(
        mut self,
        device: DeviceInfo,
        time: i64,
        event_id: impl Into<String>,
        fields: I,
    ) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<FieldValue>,
    {
        let fields = fields
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let event = (event_id.into(), fields);

        let key = (device, time);
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, events)) => events.push(event),
            None => self.entries.push((key, vec![event])),
        }
        self
    }

    /// Finishes the request, replacing local files with references
    pub fn build(self) -> IntegrationRequest {
        let mut collector = FileCollector::default();
        let params = self
            .entries
            .into_iter()
            .map(|((device, time), events)| {
                let mut resolved = Map::new();
                for (event_id, fields) in events {
                    let value =
                        collector.resolve_fields(FeatureType::Event, &event_id, &device, fields);
                    resolved.insert(event_id, value);
                }

                let mut param = Map::new();
                device.write_identity(&mut param);
                param.insert("time".into(), Value::from(time));
                param.insert("events".into(), Value::Object(resolved));
                Value::Object(param)
            })
            .collect();

        IntegrationRequest {
            id: None,
            action: RequestAction::PostEvent,
            method: "integration.event.post",
            params: Value::Array(params),
            files: collector.files,
            realtime: self.realtime,
        }
    }
}

/// The gateway's answer to a publish or delete request
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationResponse {
    /// Zero on success
    pub code: i64,
    /// A description of the outcome
    #[serde(default)]
    pub msg: Option<String>,
    /// The gateway's identifier for the request
    #[serde(default)]
    pub request_id: Option<String>,
    /// Details of files to be uploaded out of band
    #[serde(default)]
    pub data: Option<IntegrationData>,
}

impl IntegrationResponse {
    /// Whether the gateway reported success
    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

/// Upload details returned with an [`IntegrationResponse`]
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationData {
    /// One entry per attached file
    #[serde(default)]
    pub uri_info_list: Vec<UriInfo>,
}

/// Where an attached file is stored and how to upload it
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UriInfo {
    /// The platform URI of the stored file
    #[serde(default)]
    pub file_uri: String,
    /// A pre-signed URL to upload the file content to
    #[serde(default)]
    pub upload_url: Option<String>,
    /// The file's name
    #[serde(default)]
    pub filename: String,
    /// Headers to send with the upload
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// The gateway's answer to a file metadata request
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfoResponse {
    /// Zero on success
    pub code: i64,
    /// A description of the outcome
    #[serde(default)]
    pub msg: Option<String>,
    /// The gateway's identifier for the request
    #[serde(default)]
    pub request_id: Option<String>,
    /// The file's metadata
    #[serde(default)]
    pub data: Option<FileMeta>,
}

impl FileInfoResponse {
    /// Whether the gateway reported success
    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

/// Metadata of a stored file
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileMeta {
    /// The organization owning the file
    pub org_id: Option<String>,
    /// The file's category
    pub category: Option<String>,
    /// The platform URI of the file
    pub file_uri: Option<String>,
    /// The name the file was uploaded with
    pub original_filename: Option<String>,
    /// Size in bytes
    pub file_size: Option<u64>,
    /// Hex MD5 digest of the content
    pub md5: Option<String>,
    /// How the file was signed
    pub sign_method: Option<String>,
    /// The file's signature
    pub sign: Option<String>,
    /// Creation time in epoch milliseconds
    pub create_time: Option<i64>,
}

/// The gateway's answer to a download URL request
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDownloadUrlResponse {
    /// Zero on success
    pub code: i64,
    /// A description of the outcome
    #[serde(default)]
    pub msg: Option<String>,
    /// The gateway's identifier for the request
    #[serde(default)]
    pub request_id: Option<String>,
    /// The download URL
    #[serde(default)]
    pub data: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn asset() -> DeviceInfo {
        DeviceInfo::asset("asset-1")
    }

    mod device_info {
        use super::*;

        #[test]
        fn asset_id_is_the_only_identity_when_present() {
            assert_eq!(asset().identity(), vec![("assetId", "asset-1")]);
        }

        #[test]
        fn product_and_device_key_are_sent_together() {
            let device = DeviceInfo::device("pk", "dk");
            assert_eq!(
                device.identity(),
                vec![("productKey", "pk"), ("deviceKey", "dk")]
            );
        }
    }

    mod when_building_measurepoints {
        use super::*;

        #[test]
        fn values_for_the_same_device_and_time_are_merged() {
            let request = MeasurepointPostRequest::new()
                .add_measurepoints(asset(), 1000, [("temp", json!(21.5))])
                .add_measurepoints(asset(), 1000, [("humidity", json!(40))])
                .add_measurepoints(DeviceInfo::device("pk", "dk"), 2000, [("temp", json!(3))])
                .realtime(false)
                .build();

            assert_eq!(request.action(), RequestAction::PostMeasurepoint);
            assert_eq!(request.method(), "integration.measurepoint.post");
            assert!(!request.is_realtime());
            assert!(request.files().is_empty());
            assert_eq!(
                request.params(),
                &json!([
                    { "assetId": "asset-1", "time": 1000, "measurepoints": { "temp": 21.5, "humidity": 40 } },
                    { "productKey": "pk", "deviceKey": "dk", "time": 2000, "measurepoints": { "temp": 3 } },
                ])
            );
        }

        #[test]
        fn files_are_replaced_by_local_references() {
            let mut fields = BTreeMap::new();
            fields.insert("label".to_owned(), FieldValue::from(json!("front")));
            fields.insert("image".to_owned(), FieldValue::from(PathBuf::from("/tmp/cam.jpg")));

            let request = MeasurepointPostRequest::new()
                .add_measurepoints(
                    asset(),
                    1000,
                    vec![
                        ("report", FeatureValue::from(PathBuf::from("/tmp/report.pdf"))),
                        (
                            "logs",
                            FeatureValue::Files(vec!["/tmp/a.log".into(), "/tmp/b".into()]),
                        ),
                        ("snapshot", FeatureValue::Struct(fields)),
                    ],
                )
                .build();

            let files = request.files();
            assert_eq!(files.len(), 4);
            assert!(files.iter().all(|f| f.feature_type() == FeatureType::Measurepoint));

            let report = &files[0];
            assert_eq!(report.feature_id(), "report");
            assert_eq!(report.original_filename(), "report.pdf");
            assert!(report.filename().ends_with(".pdf"));
            assert_ne!(report.filename(), "report.pdf");
            assert_eq!(files[2].original_filename(), "b");
            assert_eq!(extension_of(files[2].filename()), "");

            let values = &request.params()[0]["measurepoints"];
            assert_eq!(
                values["report"],
                json!(format!("local://{}", report.filename()))
            );
            assert_eq!(
                values["logs"],
                json!([
                    format!("local://{}", files[1].filename()),
                    format!("local://{}", files[2].filename()),
                ])
            );
            assert_eq!(values["snapshot"]["label"], json!("front"));
            assert_eq!(
                values["snapshot"]["image"],
                json!(format!("local://{}", files[3].filename()))
            );
        }
    }

    mod when_building_attributes {
        use super::*;

        #[test]
        fn params_carry_attributes_without_time() {
            let request = AttributePostRequest::new()
                .add_attributes(asset(), [("name", json!("pump"))])
                .add_attributes(asset(), [("rated", json!(5))])
                .build();

            assert_eq!(request.action(), RequestAction::PostAttribute);
            assert_eq!(request.method(), "integration.attribute.post");
            assert!(request.is_realtime());
            assert_eq!(
                request.params(),
                &json!([{ "assetId": "asset-1", "attributes": { "name": "pump", "rated": 5 } }])
            );
        }
    }

    mod when_building_events {
        use super::*;

        #[test]
        fn events_group_by_device_and_time() {
            let request = EventPostRequest::new()
                .add_event(asset(), 5, "overheat", [("level", FieldValue::from(json!(3)))])
                .add_event(
                    asset(),
                    5,
                    "snapshot",
                    [("image", FieldValue::from(PathBuf::from("/data/snap.png")))],
                )
                .build();

            assert_eq!(request.action(), RequestAction::PostEvent);
            assert_eq!(request.method(), "integration.event.post");

            let files = request.files();
            assert_eq!(files.len(), 1);
            assert_eq!(files[0].feature_type(), FeatureType::Event);
            assert_eq!(files[0].feature_id(), "snapshot");

            let param = &request.params()[0];
            assert_eq!(param["time"], json!(5));
            assert_eq!(param["events"]["overheat"], json!({ "level": 3 }));
            assert_eq!(
                param["events"]["snapshot"]["image"],
                json!(format!("local://{}", files[0].filename()))
            );
        }
    }

    mod when_encoding {
        use super::*;

        #[test]
        fn payload_carries_protocol_fields() {
            let request = AttributePostRequest::new()
                .add_attributes(asset(), [("name", json!("pump"))])
                .realtime(false)
                .build();

            let payload: Value = serde_json::from_str(&request.encode("42", &[]).unwrap()).unwrap();

            assert_eq!(
                payload,
                json!({
                    "id": "42",
                    "version": "1.1",
                    "method": "integration.attribute.post",
                    "params": [{ "assetId": "asset-1", "attributes": { "name": "pump" } }],
                    "isRealtimeIntegration": false,
                })
            );
        }

        #[test]
        fn payload_describes_each_attachment() {
            let request = MeasurepointPostRequest::new()
                .add_measurepoints(
                    DeviceInfo::device("pk", "dk"),
                    1,
                    [("doc", FeatureValue::from(PathBuf::from("/tmp/notes.txt")))],
                )
                .build();
            let file = request.files()[0].clone();
            let attachment = Attachment::from_parts(file.clone(), bytes::Bytes::from_static(b"hello"));

            let payload: Value =
                serde_json::from_str(&request.encode("7", &[attachment]).unwrap()).unwrap();

            assert_eq!(
                payload["files"][file.filename()],
                json!({
                    "featureId": "doc",
                    "fileName": file.filename(),
                    "originalFilename": "notes.txt",
                    "fileLength": "5",
                    "fileExt": ".txt",
                    "md5": "5d41402abc4b2a76b9719d911017c592",
                    "productKey": "pk",
                    "deviceKey": "dk",
                })
            );
        }
    }

    mod responses {
        use super::*;

        #[test]
        fn integration_response_reads_upload_details() {
            let response: IntegrationResponse = serde_json::from_value(json!({
                "code": 0,
                "msg": "OK",
                "requestId": "r-1",
                "data": { "uriInfoList": [{
                    "fileUri": "enos-connect://abc.txt",
                    "uploadUrl": "https://bucket.example.com/abc",
                    "filename": "abc.txt",
                    "headers": { "x-amz-acl": "private" }
                }]}
            }))
            .unwrap();

            assert!(response.is_success());
            let info = &response.data.unwrap().uri_info_list[0];
            assert_eq!(info.upload_url.as_deref(), Some("https://bucket.example.com/abc"));
            assert_eq!(info.headers["x-amz-acl"], "private");
        }

        #[test]
        fn file_info_response_tolerates_missing_fields() {
            let response: FileInfoResponse = serde_json::from_value(json!({
                "code": 0,
                "data": { "fileUri": "enos-connect://x", "fileSize": 12 }
            }))
            .unwrap();

            let meta = response.data.unwrap();
            assert_eq!(meta.file_size, Some(12));
            assert_eq!(meta.md5, None);
        }

        #[test]
        fn file_category_uses_lowercase_names() {
            assert_eq!(FileCategory::Feature.as_str(), "feature");
            assert_eq!(FileCategory::Ota.as_str(), "ota");
            let parsed: FileCategory = serde_json::from_value(json!("ota")).unwrap();
            assert_eq!(parsed, FileCategory::Ota);
        }
    }
}
