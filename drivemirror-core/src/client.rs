use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use md5::Context;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com";
const PAGE_SIZE: u32 = 1000;
const RETRY_PAUSE: Duration = Duration::from_secs(2);

const FILE_FIELDS: &str = "id,name,mimeType,md5Checksum,size,modifiedTime,parents,trashed";
const CHANGE_FIELDS: &str = "nextPageToken,newStartPageToken,changes(fileId,removed,time,file(id,name,mimeType,md5Checksum,size,modifiedTime,parents,trashed))";

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("download integrity check failed: expected {expected_md5}, got {actual_md5}")]
    IntegrityMismatch {
        expected_md5: String,
        actual_md5: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

impl DriveError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DriveError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// One file record as the service reports it. Folders are recognised by the
/// mime type containing "folder"; records without a size carry no
/// downloadable content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileRecord {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub md5_checksum: Option<String>,
    #[serde(deserialize_with = "deserialize_size")]
    pub size: Option<u64>,
    pub modified_time: Option<String>,
    pub parents: Vec<String>,
    pub trashed: bool,
}

impl FileRecord {
    pub fn is_folder(&self) -> bool {
        self.mime_type.contains("folder")
    }

    pub fn has_content(&self) -> bool {
        !self.is_folder() && self.size.is_some() && self.md5_checksum.is_some()
    }
}

// The service encodes sizes as either a JSON number or a decimal string.
fn deserialize_size<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(value)) => Ok(Some(value)),
        Some(Raw::Text(value)) => value
            .parse::<u64>()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Partial record used both as the metadata body of a create and as a
/// metadata patch. Only populated fields are sent.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parents: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trashed: Option<bool>,
}

impl FilePatch {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn trash() -> Self {
        Self {
            trashed: Some(true),
            ..Self::default()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilePage {
    pub files: Vec<FileRecord>,
    pub next_page_token: Option<String>,
}

/// One entry of the incremental change feed: either a replacement record or
/// a removal marker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChangeItem {
    pub file_id: String,
    pub removed: bool,
    pub time: Option<String>,
    pub file: Option<FileRecord>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChangePage {
    pub changes: Vec<ChangeItem>,
    pub next_page_token: Option<String>,
    pub new_start_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartPageToken {
    start_page_token: String,
}

#[derive(Clone)]
pub struct DriveClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl DriveClient {
    pub fn new(token: impl Into<String>) -> Result<Self, DriveError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, DriveError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    /// Fetches one record. A 404 from the service means the record is gone
    /// (or was never visible) and maps to `None`; other failures surface.
    pub async fn get_record(&self, id: &str) -> Result<Option<FileRecord>, DriveError> {
        let mut url = self.endpoint(&format!("/drive/v3/files/{id}"))?;
        url.query_pairs_mut().append_pair("fields", FILE_FIELDS);
        let response = send_with_retry(|| async {
            Ok(self
                .http
                .get(url.clone())
                .header("Authorization", self.auth_header_value())
                .send()
                .await?)
        })
        .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::handle_response(response).await?))
    }

    pub async fn list_children(
        &self,
        parent_id: &str,
        page_token: Option<&str>,
    ) -> Result<FilePage, DriveError> {
        let mut url = self.endpoint("/drive/v3/files")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("q", &format!("trashed = false and '{parent_id}' in parents"));
            query.append_pair("pageSize", &PAGE_SIZE.to_string());
            query.append_pair("fields", &format!("nextPageToken,files({FILE_FIELDS})"));
            if let Some(token) = page_token {
                query.append_pair("pageToken", token);
            }
        }
        let response = send_with_retry(|| async {
            Ok(self
                .http
                .get(url.clone())
                .header("Authorization", self.auth_header_value())
                .send()
                .await?)
        })
        .await?;
        Self::handle_response(response).await
    }

    pub async fn list_children_all(&self, parent_id: &str) -> Result<Vec<FileRecord>, DriveError> {
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = self.list_children(parent_id, page_token.as_deref()).await?;
            files.extend(page.files);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(files)
    }

    /// Creates a record from `metadata`, then uploads `content` into it when
    /// given. The returned record reflects the uploaded content.
    pub async fn create_file(
        &self,
        metadata: &FilePatch,
        content: Option<&Path>,
    ) -> Result<FileRecord, DriveError> {
        let mut url = self.endpoint("/drive/v3/files")?;
        url.query_pairs_mut().append_pair("fields", FILE_FIELDS);
        let response = send_with_retry(|| async {
            Ok(self
                .http
                .post(url.clone())
                .header("Authorization", self.auth_header_value())
                .json(metadata)
                .send()
                .await?)
        })
        .await?;
        let record: FileRecord = Self::handle_response(response).await?;
        match content {
            Some(path) => self.update_content(&record.id, path).await,
            None => Ok(record),
        }
    }

    /// Replaces the record's content with the bytes of a local file. The
    /// stream is re-opened from the path if the transient retry kicks in.
    pub async fn update_content(&self, id: &str, content: &Path) -> Result<FileRecord, DriveError> {
        let mut url = self.endpoint(&format!("/upload/drive/v3/files/{id}"))?;
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("fields", FILE_FIELDS);
        let response = send_with_retry(|| async {
            let file = tokio::fs::File::open(content).await?;
            let stream = ReaderStream::new(file);
            Ok(self
                .http
                .patch(url.clone())
                .header("Authorization", self.auth_header_value())
                .body(reqwest::Body::wrap_stream(stream))
                .send()
                .await?)
        })
        .await?;
        Self::handle_response(response).await
    }

    pub async fn update_metadata(
        &self,
        id: &str,
        patch: &FilePatch,
    ) -> Result<FileRecord, DriveError> {
        let mut url = self.endpoint(&format!("/drive/v3/files/{id}"))?;
        url.query_pairs_mut().append_pair("fields", FILE_FIELDS);
        let response = send_with_retry(|| async {
            Ok(self
                .http
                .patch(url.clone())
                .header("Authorization", self.auth_header_value())
                .json(patch)
                .send()
                .await?)
        })
        .await?;
        Self::handle_response(response).await
    }

    pub async fn delete_record(&self, id: &str) -> Result<(), DriveError> {
        let url = self.endpoint(&format!("/drive/v3/files/{id}"))?;
        let response = send_with_retry(|| async {
            Ok(self
                .http
                .delete(url.clone())
                .header("Authorization", self.auth_header_value())
                .send()
                .await?)
        })
        .await?;
        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(DriveError::Api { status, body })
    }

    pub async fn start_page_token(&self) -> Result<String, DriveError> {
        let url = self.endpoint("/drive/v3/changes/startPageToken")?;
        let response = send_with_retry(|| async {
            Ok(self
                .http
                .get(url.clone())
                .header("Authorization", self.auth_header_value())
                .send()
                .await?)
        })
        .await?;
        let token: StartPageToken = Self::handle_response(response).await?;
        Ok(token.start_page_token)
    }

    pub async fn changes_since(
        &self,
        token: &str,
        page_token: Option<&str>,
    ) -> Result<ChangePage, DriveError> {
        let mut url = self.endpoint("/drive/v3/changes")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("pageToken", page_token.unwrap_or(token));
            query.append_pair("pageSize", &PAGE_SIZE.to_string());
            query.append_pair("corpora", "user");
            query.append_pair("spaces", "drive");
            query.append_pair("restrictToMyDrive", "true");
            query.append_pair("fields", CHANGE_FIELDS);
        }
        let response = send_with_retry(|| async {
            Ok(self
                .http
                .get(url.clone())
                .header("Authorization", self.auth_header_value())
                .send()
                .await?)
        })
        .await?;
        Self::handle_response(response).await
    }

    /// Drains every page of the change feed starting at `token`. Returns the
    /// concatenated changes and the new start token from the final page.
    pub async fn changes_since_all(
        &self,
        token: &str,
    ) -> Result<(Vec<ChangeItem>, Option<String>), DriveError> {
        let mut changes = Vec::new();
        let mut page_token: Option<String> = None;
        let mut new_start_token = None;
        loop {
            let page = self.changes_since(token, page_token.as_deref()).await?;
            changes.extend(page.changes);
            if let Some(start) = page.new_start_page_token {
                new_start_token = Some(start);
            }
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Ok((changes, new_start_token))
    }

    /// Streams the record's content into `target`, computing md5 along the
    /// way. On a checksum mismatch the partial file is removed. Returns the
    /// digest of the written bytes.
    pub async fn download_to_path(
        &self,
        id: &str,
        target: &Path,
        expected_md5: Option<&str>,
    ) -> Result<String, DriveError> {
        let mut url = self.endpoint(&format!("/drive/v3/files/{id}"))?;
        url.query_pairs_mut().append_pair("alt", "media");
        let response = send_with_retry(|| async {
            Ok(self
                .http
                .get(url.clone())
                .header("Authorization", self.auth_header_value())
                .send()
                .await?)
        })
        .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DriveError::Api { status, body });
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(target).await?;
        let mut stream = response.bytes_stream();
        let mut md5 = Context::new();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = tokio::fs::remove_file(target).await;
                    return Err(err.into());
                }
            };
            file.write_all(&chunk).await?;
            md5.consume(&chunk);
        }
        file.flush().await?;
        file.sync_all().await?;

        let actual_md5 = format!("{:x}", md5.compute());
        if let Some(expected_md5) = expected_md5
            && actual_md5 != expected_md5.to_ascii_lowercase()
        {
            let _ = tokio::fs::remove_file(target).await;
            return Err(DriveError::IntegrityMismatch {
                expected_md5: expected_md5.to_ascii_lowercase(),
                actual_md5,
            });
        }
        Ok(actual_md5)
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, DriveError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DriveError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DriveError::Api { status, body })
        }
    }
}

/// Runs `build` and, when it fails with a transient connection error,
/// retries exactly once after a fixed pause. The closure rebuilds the whole
/// request so streaming bodies re-open their source.
async fn send_with_retry<F, Fut>(build: F) -> Result<reqwest::Response, DriveError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<reqwest::Response, DriveError>>,
{
    match build().await {
        Err(DriveError::Request(err)) if is_connection_error(&err) => {
            tokio::time::sleep(RETRY_PAUSE).await;
            build().await
        }
        other => other,
    }
}

fn is_connection_error(err: &reqwest::Error) -> bool {
    if err.is_connect() || err.is_timeout() {
        return true;
    }
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            );
        }
        source = std::error::Error::source(cause);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_sentinel_is_a_substring_match() {
        let record = FileRecord {
            mime_type: "application/vnd.google-apps.folder".into(),
            ..FileRecord::default()
        };
        assert!(record.is_folder());
        assert!(!record.has_content());
    }

    #[test]
    fn size_accepts_numbers_and_strings() {
        let numeric: FileRecord =
            serde_json::from_value(serde_json::json!({"id": "a", "size": 12})).unwrap();
        assert_eq!(numeric.size, Some(12));
        let stringly: FileRecord =
            serde_json::from_value(serde_json::json!({"id": "a", "size": "12"})).unwrap();
        assert_eq!(stringly.size, Some(12));
        let absent: FileRecord = serde_json::from_value(serde_json::json!({"id": "a"})).unwrap();
        assert_eq!(absent.size, None);
    }

    #[test]
    fn patch_serializes_only_populated_fields() {
        let patch = FilePatch::trash();
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            serde_json::json!({"trashed": true})
        );
    }

    #[test]
    fn classifies_api_statuses() {
        assert_eq!(
            classify_api_status(StatusCode::UNAUTHORIZED),
            ApiErrorClass::Auth
        );
        assert_eq!(
            classify_api_status(StatusCode::TOO_MANY_REQUESTS),
            ApiErrorClass::RateLimit
        );
        assert_eq!(
            classify_api_status(StatusCode::BAD_GATEWAY),
            ApiErrorClass::Transient
        );
        assert_eq!(
            classify_api_status(StatusCode::BAD_REQUEST),
            ApiErrorClass::Permanent
        );
    }
}
