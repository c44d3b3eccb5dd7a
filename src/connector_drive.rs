//! Google Drive v3 source.
//!
//! Lists files with `files.list` (paged, trashed files excluded) or
//! `files.get` for explicit id selections, and downloads with `alt=media`.
//! Google-native documents have no binary form; they are exported to the
//! matching OOXML type so the regular extractors handle them.
//!
//! HTTP status mapping:
//! - 401 → [`SourceError::AuthExpired`] (fatal to the run)
//! - 403 with a rate-limit reason → [`SourceError::RateLimited`], otherwise
//!   [`SourceError::PermissionDenied`]
//! - 404 → [`SourceError::NotFound`]
//! - 429 and 5xx → retried with backoff

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

use crate::config::SourceConfig;
use crate::connector::{
    with_retry, DocumentSelector, DocumentSource, RetryPolicy, SourceError, SourceFile,
};

const DRIVE_API: &str = "https://www.googleapis.com/drive/v3";
const FILE_FIELDS: &str = "id,name,mimeType,modifiedTime,version,webViewLink,size";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

pub struct DriveSource {
    client: reqwest::Client,
    token: Option<String>,
    token_env: String,
    base_url: String,
    retry: RetryPolicy,
    max_file_bytes: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    mime_type: String,
    #[serde(default)]
    modified_time: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    web_view_link: Option<String>,
    #[serde(default)]
    size: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Export target for Google-native types.
fn export_mime(native: &str) -> Option<&'static str> {
    match native {
        "application/vnd.google-apps.document" => {
            Some("application/vnd.openxmlformats-officedocument.wordprocessingml.document")
        }
        "application/vnd.google-apps.spreadsheet" => {
            Some("application/vnd.openxmlformats-officedocument.spreadsheetml.sheet")
        }
        "application/vnd.google-apps.presentation" => {
            Some("application/vnd.openxmlformats-officedocument.presentationml.presentation")
        }
        _ => None,
    }
}

impl DriveFile {
    fn into_source_file(self) -> SourceFile {
        let mime_type = export_mime(&self.mime_type)
            .map(str::to_string)
            .unwrap_or(self.mime_type);
        let revision_id = match (self.version, self.modified_time) {
            (Some(v), Some(m)) => format!("{}@{}", v, m),
            (Some(v), None) => v,
            (None, Some(m)) => m,
            (None, None) => "0".to_string(),
        };
        SourceFile {
            web_url: Some(
                self.web_view_link
                    .unwrap_or_else(|| format!("https://drive.google.com/file/d/{}/view", self.id)),
            ),
            size_bytes: self.size.and_then(|s| s.parse().ok()),
            document_id: self.id,
            display_name: self.name,
            mime_type,
            revision_id,
        }
    }
}

fn classify_status(status: StatusCode, body: &str) -> SourceError {
    let detail = format!("{}: {}", status, body.chars().take(200).collect::<String>());
    match status.as_u16() {
        401 => SourceError::AuthExpired(detail),
        403 if body.contains("rateLimitExceeded") || body.contains("userRateLimitExceeded") => {
            SourceError::RateLimited(detail)
        }
        403 => SourceError::PermissionDenied(detail),
        404 => SourceError::NotFound(detail),
        429 => SourceError::RateLimited(detail),
        s if s >= 500 => SourceError::Transient(detail),
        _ => SourceError::Other(detail),
    }
}

fn transport_error(e: reqwest::Error) -> SourceError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        SourceError::Transient(e.to_string())
    } else {
        SourceError::Other(e.to_string())
    }
}

fn list_query(selector: &DocumentSelector) -> String {
    match selector {
        DocumentSelector::Folder(folder) => format!(
            "'{}' in parents and trashed = false and mimeType != '{}'",
            folder.replace('\'', "\\'"),
            FOLDER_MIME
        ),
        _ => format!("trashed = false and mimeType != '{}'", FOLDER_MIME),
    }
}

impl DriveSource {
    pub fn new(token: Option<String>, token_env: String, config: &SourceConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            token,
            token_env,
            base_url: DRIVE_API.to_string(),
            retry: RetryPolicy {
                attempts: config.download_attempts.max(1),
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(config.backoff_cap_secs),
            },
            max_file_bytes: config.max_file_bytes,
        }
    }

    fn token(&self) -> Result<&str, SourceError> {
        self.token.as_deref().ok_or_else(|| {
            SourceError::AuthExpired(format!("no access token in ${}", self.token_env))
        })
    }

    async fn get(&self, url: &str, query: &[(&str, &str)]) -> Result<reqwest::Response, SourceError> {
        let token = self.token()?;
        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify_status(status, &body))
        }
    }

    async fn list_page(&self, q: &str, page_token: Option<&str>) -> Result<FileList, SourceError> {
        let url = format!("{}/files", self.base_url);
        let fields = format!("nextPageToken,files({})", FILE_FIELDS);
        let mut query = vec![
            ("q", q),
            ("fields", fields.as_str()),
            ("pageSize", "100"),
            ("supportsAllDrives", "true"),
            ("includeItemsFromAllDrives", "true"),
        ];
        if let Some(t) = page_token {
            query.push(("pageToken", t));
        }
        let response = self.get(&url, &query).await?;
        response
            .json::<FileList>()
            .await
            .map_err(|e| SourceError::Other(format!("bad files.list response: {}", e)))
    }

    async fn get_file(&self, id: &str) -> Result<DriveFile, SourceError> {
        let url = format!("{}/files/{}", self.base_url, id);
        let response = self
            .get(&url, &[("fields", FILE_FIELDS), ("supportsAllDrives", "true")])
            .await?;
        response
            .json::<DriveFile>()
            .await
            .map_err(|e| SourceError::Other(format!("bad files.get response: {}", e)))
    }
}

#[async_trait]
impl DocumentSource for DriveSource {
    fn kind(&self) -> &'static str {
        "drive"
    }

    async fn list_files(&self, selector: &DocumentSelector) -> Result<Vec<SourceFile>, SourceError> {
        let mut files = Vec::new();

        match selector {
            DocumentSelector::Files(ids) => {
                for id in ids {
                    let file = with_retry(&self.retry, "drive files.get", move || self.get_file(id)).await;
                    match file {
                        Ok(f) => files.push(f.into_source_file()),
                        // A selected file that vanished is dropped from the corpus.
                        Err(SourceError::NotFound(_)) => {
                            tracing::warn!(file_id = %id, "selected drive file not found, skipping")
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            _ => {
                let q = list_query(selector);
                let mut page_token: Option<String> = None;
                loop {
                    let (q, token) = (q.as_str(), page_token.as_deref());
                    let page = with_retry(&self.retry, "drive files.list", move || {
                        self.list_page(q, token)
                    })
                    .await?;
                    files.extend(
                        page.files
                            .into_iter()
                            .filter(|f| f.mime_type != FOLDER_MIME)
                            .map(DriveFile::into_source_file),
                    );
                    match page.next_page_token {
                        Some(t) if !t.is_empty() => page_token = Some(t),
                        _ => break,
                    }
                }
            }
        }

        files.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        files.dedup_by(|a, b| a.document_id == b.document_id);
        Ok(files)
    }

    async fn download(&self, file: &SourceFile) -> Result<Vec<u8>, SourceError> {
        if let Some(size) = file.size_bytes {
            if size > self.max_file_bytes {
                return Err(SourceError::TooLarge {
                    size,
                    limit: self.max_file_bytes,
                });
            }
        }

        let bytes = with_retry(&self.retry, "drive download", move || async move {
            // Exported types report their OOXML mime; the native file needs /export.
            let is_export = self.get_file(&file.document_id).await.map(|f| {
                export_mime(&f.mime_type).is_some()
            })?;
            let response = if is_export {
                let url = format!("{}/files/{}/export", self.base_url, file.document_id);
                self.get(&url, &[("mimeType", file.mime_type.as_str())]).await?
            } else {
                let url = format!("{}/files/{}", self.base_url, file.document_id);
                self.get(&url, &[("alt", "media"), ("supportsAllDrives", "true")])
                    .await?
            };
            response
                .bytes()
                .await
                .map(|b| b.to_vec())
                .map_err(transport_error)
        })
        .await?;

        if bytes.len() as u64 > self.max_file_bytes {
            return Err(SourceError::TooLarge {
                size: bytes.len() as u64,
                limit: self.max_file_bytes,
            });
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_source_errors() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            SourceError::AuthExpired(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, "insufficientPermissions"),
            SourceError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, "{\"reason\":\"userRateLimitExceeded\"}"),
            SourceError::RateLimited(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, ""),
            SourceError::NotFound(_)
        ));
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_retryable());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "").is_retryable());
    }

    #[test]
    fn native_docs_are_exported_as_ooxml() {
        let f = DriveFile {
            id: "abc".into(),
            name: "Plan".into(),
            mime_type: "application/vnd.google-apps.document".into(),
            modified_time: Some("2024-01-02T00:00:00Z".into()),
            version: Some("7".into()),
            web_view_link: None,
            size: None,
        }
        .into_source_file();
        assert!(f.mime_type.ends_with("wordprocessingml.document"));
        assert_eq!(f.revision_id, "7@2024-01-02T00:00:00Z");
        assert_eq!(
            f.web_url.as_deref(),
            Some("https://drive.google.com/file/d/abc/view")
        );
    }

    #[test]
    fn folder_query_excludes_trash_and_subfolders() {
        let q = list_query(&DocumentSelector::Folder("F1".into()));
        assert!(q.starts_with("'F1' in parents"));
        assert!(q.contains("trashed = false"));
        assert!(q.contains(FOLDER_MIME));
    }

    #[tokio::test]
    async fn missing_token_is_auth_failure() {
        let s = DriveSource::new(None, "GW_TEST_TOKEN".into(), &SourceConfig::default());
        let err = s.list_files(&DocumentSelector::All).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
