//! Remote file store adapter over the Google Drive v3 API.
//!
//! Folder and file CRUD for the patient hierarchy. Every call fetches a
//! bearer token from the [`TokenProvider`] seam, and failures map onto
//! the shared taxonomy: transport errors become `RemoteUnavailable`, 401
//! becomes `AuthMissing`, any other non-2xx becomes `RemoteRejected`
//! carrying the provider-supplied message when one is present.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::auth::TokenProvider;
use crate::config::{BILANS_FOLDER_NAME, PATIENTS_FOLDER_NAME, ROOT_FOLDER_NAME, SEANCES_FOLDER_NAME};
use crate::error::SyncError;

const DRIVE_API_ROOT: &str = "https://www.googleapis.com/drive/v3";
const DRIVE_UPLOAD_ROOT: &str = "https://www.googleapis.com/upload/drive/v3";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

/// Metadata fields requested for every file the engine touches.
const FILE_FIELDS: &str = "id,name,createdTime,webViewLink,webContentLink,thumbnailLink";

/// HTTP client timeout for Drive requests
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// A file as Drive describes it. Read-only to this system apart from
/// create, rename and delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_view_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_content_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_link: Option<String>,
}

/// A folder id/name pair from a listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderRef {
    pub id: String,
    pub name: String,
}

/// The folder set created for one patient.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientFolders {
    pub patient_folder_id: String,
    pub bilans_folder_id: String,
    pub seances_folder_id: String,
    pub folder_name: String,
}

/// Upload payload: raw bytes plus the content type they carry.
#[derive(Debug, Clone)]
pub struct Photo {
    pub bytes: Vec<u8>,
    pub mime: String,
    pub extension: String,
}

impl Photo {
    pub fn jpeg(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            mime: "image/jpeg".to_string(),
            extension: "jpg".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FileList<T> {
    #[serde(default = "Vec::new")]
    files: Vec<T>,
}

/// Drive API client.
#[derive(Clone)]
pub struct DriveClient {
    http: reqwest::Client,
    token: Arc<dyn TokenProvider>,
    api_root: String,
    upload_root: String,
}

impl DriveClient {
    pub fn new(token: Arc<dyn TokenProvider>) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .connect_timeout(REQUEST_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            token,
            api_root: DRIVE_API_ROOT.to_string(),
            upload_root: DRIVE_UPLOAD_ROOT.to_string(),
        })
    }

    /// Point the client at a different endpoint (mock servers in tests).
    pub fn with_base_urls(mut self, api_root: &str, upload_root: &str) -> Result<Self, SyncError> {
        self.api_root = validate_endpoint(api_root)?;
        self.upload_root = validate_endpoint(upload_root)?;
        Ok(self)
    }

    /// Find a folder by name under a parent without creating it.
    pub async fn find_folder(
        &self,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<Option<String>, SyncError> {
        let listing = self
            .query_folders(&folder_query(Some(name), parent_id.unwrap_or("root")))
            .await?;
        Ok(listing.into_iter().next().map(|f| f.id))
    }

    /// Find a folder by name under a parent, creating it when absent.
    ///
    /// Find-then-create with no idempotency token: two clients racing here
    /// can both create, so callers must not blindly retry.
    pub async fn find_or_create_folder(
        &self,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<String, SyncError> {
        let parent = parent_id.unwrap_or("root");
        let listing = self.query_folders(&folder_query(Some(name), parent)).await?;
        if let Some(existing) = listing.first() {
            return Ok(existing.id.clone());
        }

        let mut body = serde_json::json!({
            "name": name,
            "mimeType": FOLDER_MIME,
        });
        if parent != "root" {
            body["parents"] = serde_json::json!([parent]);
        }

        let token = self.token.access_token().await?;
        let response = self
            .http
            .post(format!("{}/files", self.api_root))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?;
        let created: FolderRef = handle_response(response).await?;
        debug!(folder = %name, parent = %parent, id = %created.id, "Created Drive folder");
        Ok(created.id)
    }

    /// List the immediate subfolders of a folder.
    pub async fn list_sub_folders(&self, parent_id: &str) -> Result<Vec<FolderRef>, SyncError> {
        self.query_folders(&folder_query(None, parent_id)).await
    }

    /// List the files in a folder, newest first.
    pub async fn list_files(&self, parent_id: &str) -> Result<Vec<RemoteFile>, SyncError> {
        let query = format!("'{}' in parents and trashed=false", parent_id);
        let fields = format!("files({})", FILE_FIELDS);
        let url = format!(
            "{}/files?q={}&fields={}&orderBy=createdTime desc",
            self.api_root,
            urlencoding::encode(&query),
            urlencoding::encode(&fields),
        );
        let token = self.token.access_token().await?;
        let response = self.http.get(&url).bearer_auth(&token).send().await?;
        let listing: FileList<RemoteFile> = handle_response(response).await?;
        Ok(listing.files)
    }

    /// Upload a file into a folder under the given name.
    pub async fn upload(
        &self,
        photo: Photo,
        parent_id: &str,
        name: &str,
    ) -> Result<RemoteFile, SyncError> {
        let metadata = serde_json::json!({
            "name": name,
            "parents": [parent_id],
        });
        let metadata_part = reqwest::multipart::Part::text(metadata.to_string())
            .mime_str("application/json")?;
        let file_part = reqwest::multipart::Part::bytes(photo.bytes)
            .file_name(name.to_string())
            .mime_str(&photo.mime)?;
        let form = reqwest::multipart::Form::new()
            .part("metadata", metadata_part)
            .part("file", file_part);

        let url = format!(
            "{}/files?uploadType=multipart&fields={}",
            self.upload_root, FILE_FIELDS
        );
        let token = self.token.access_token().await?;
        let response = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .multipart(form)
            .send()
            .await?;
        let file: RemoteFile = handle_response(response).await?;
        info!(file = %file.name, id = %file.id, "Uploaded file to Drive");
        Ok(file)
    }

    /// Download a file's raw bytes.
    pub async fn download(&self, file_id: &str) -> Result<Vec<u8>, SyncError> {
        let url = format!("{}/files/{}?alt=media", self.api_root, file_id);
        let token = self.token.access_token().await?;
        let response = self.http.get(&url).bearer_auth(&token).send().await?;

        let status = response.status();
        if status.is_success() {
            Ok(response.bytes().await?.to_vec())
        } else if status == reqwest::StatusCode::UNAUTHORIZED {
            Err(SyncError::AuthMissing)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(SyncError::RemoteRejected(rejection_message(status, &body)))
        }
    }

    /// Rename a file or folder.
    pub async fn rename(&self, file_id: &str, new_name: &str) -> Result<(), SyncError> {
        let token = self.token.access_token().await?;
        let response = self
            .http
            .patch(format!("{}/files/{}", self.api_root, file_id))
            .bearer_auth(&token)
            .json(&serde_json::json!({ "name": new_name }))
            .send()
            .await?;
        let _updated: serde_json::Value = handle_response(response).await?;
        info!(id = %file_id, name = %new_name, "Renamed Drive entry");
        Ok(())
    }

    /// Delete a file, or a folder and everything beneath it.
    pub async fn delete(&self, file_id: &str) -> Result<(), SyncError> {
        let token = self.token.access_token().await?;
        let response = self
            .http
            .delete(format!("{}/files/{}", self.api_root, file_id))
            .bearer_auth(&token)
            .send()
            .await?;
        handle_empty_response(response).await?;
        info!(id = %file_id, "Deleted Drive entry");
        Ok(())
    }

    /// Resolve the `KINE_APP/Patients` folder without creating anything.
    pub async fn find_patients_root(
        &self,
        root_parent: Option<&str>,
    ) -> Result<Option<String>, SyncError> {
        let Some(app_root) = self.find_folder(ROOT_FOLDER_NAME, root_parent).await? else {
            return Ok(None);
        };
        self.find_folder(PATIENTS_FOLDER_NAME, Some(&app_root)).await
    }

    /// Ensure the full folder tree for one patient:
    /// `KINE_APP/Patients/<folder_name>/{Bilans,Seances}`.
    pub async fn create_patient_tree(
        &self,
        folder_name: &str,
        root_parent: Option<&str>,
    ) -> Result<PatientFolders, SyncError> {
        let app_root = self.find_or_create_folder(ROOT_FOLDER_NAME, root_parent).await?;
        let patients_root = self
            .find_or_create_folder(PATIENTS_FOLDER_NAME, Some(&app_root))
            .await?;
        let patient_folder_id = self
            .find_or_create_folder(folder_name, Some(&patients_root))
            .await?;
        let bilans_folder_id = self
            .find_or_create_folder(BILANS_FOLDER_NAME, Some(&patient_folder_id))
            .await?;
        let seances_folder_id = self
            .find_or_create_folder(SEANCES_FOLDER_NAME, Some(&patient_folder_id))
            .await?;

        Ok(PatientFolders {
            patient_folder_id,
            bilans_folder_id,
            seances_folder_id,
            folder_name: folder_name.to_string(),
        })
    }

    async fn query_folders(&self, query: &str) -> Result<Vec<FolderRef>, SyncError> {
        let url = format!(
            "{}/files?q={}&fields={}",
            self.api_root,
            urlencoding::encode(query),
            urlencoding::encode("files(id,name)"),
        );
        let token = self.token.access_token().await?;
        let response = self.http.get(&url).bearer_auth(&token).send().await?;
        let listing: FileList<FolderRef> = handle_response(response).await?;
        Ok(listing.files)
    }
}

/// Today's date-stamped filename for a séance photo: `DD_MM_YYYY.<ext>`.
pub fn generate_date_filename(extension: &str) -> String {
    format!("{}.{}", Local::now().format("%d_%m_%Y"), extension)
}

/// Direct browser-viewable URL for a file, independent of any listing.
pub fn file_view_url(file_id: &str) -> String {
    format!("https://drive.google.com/uc?export=view&id={}", file_id)
}

/// Check that an endpoint override is a usable http(s) URL.
pub(crate) fn validate_endpoint(raw: &str) -> Result<String, SyncError> {
    let cleaned = raw.trim_end_matches('/');
    let parsed = url::Url::parse(cleaned)
        .map_err(|e| SyncError::ValidationError(format!("invalid endpoint '{}': {}", cleaned, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(SyncError::ValidationError(format!(
            "endpoint must use http or https, got: {}",
            parsed.scheme()
        )));
    }
    Ok(cleaned.to_string())
}

fn folder_query(name: Option<&str>, parent_id: &str) -> String {
    let scope = format!(
        "'{}' in parents and mimeType='{}' and trashed=false",
        parent_id, FOLDER_MIME
    );
    match name {
        Some(name) => format!("name='{}' and {}", name, scope),
        None => scope,
    }
}

/// Map a Drive/Sheets HTTP response onto the error taxonomy and parse the body.
pub(crate) async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, SyncError> {
    let status = response.status();
    if status.is_success() {
        Ok(response.json().await?)
    } else if status == reqwest::StatusCode::UNAUTHORIZED {
        Err(SyncError::AuthMissing)
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(SyncError::RemoteRejected(rejection_message(status, &body)))
    }
}

/// Same mapping for responses whose body we do not care about.
pub(crate) async fn handle_empty_response(response: reqwest::Response) -> Result<(), SyncError> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else if status == reqwest::StatusCode::UNAUTHORIZED {
        Err(SyncError::AuthMissing)
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(SyncError::RemoteRejected(rejection_message(status, &body)))
    }
}

/// Prefer the provider's own `error.message` over the raw body.
pub(crate) fn rejection_message(status: reqwest::StatusCode, body: &str) -> String {
    let provider_message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(|s| s.to_string()));
    match provider_message {
        Some(message) => message,
        None if body.trim().is_empty() => format!("HTTP {}", status),
        None => format!("HTTP {}: {}", status, body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_query_with_name() {
        let q = folder_query(Some("Bilans"), "folder-1");
        assert_eq!(
            q,
            "name='Bilans' and 'folder-1' in parents and \
             mimeType='application/vnd.google-apps.folder' and trashed=false"
        );
    }

    #[test]
    fn test_folder_query_listing() {
        let q = folder_query(None, "root");
        assert!(q.starts_with("'root' in parents"));
        assert!(!q.contains("name="));
    }

    #[test]
    fn test_rejection_message_prefers_provider_message() {
        let body = r#"{"error": {"code": 403, "message": "Rate limit exceeded"}}"#;
        let msg = rejection_message(reqwest::StatusCode::FORBIDDEN, body);
        assert_eq!(msg, "Rate limit exceeded");
    }

    #[test]
    fn test_rejection_message_falls_back_to_body() {
        let msg = rejection_message(reqwest::StatusCode::BAD_GATEWAY, "upstream down");
        assert_eq!(msg, "HTTP 502 Bad Gateway: upstream down");

        let msg = rejection_message(reqwest::StatusCode::BAD_GATEWAY, "");
        assert_eq!(msg, "HTTP 502 Bad Gateway");
    }

    #[test]
    fn test_remote_file_deserializes_drive_shape() {
        let json = r#"{
            "id": "f1",
            "name": "07_02_2026_genou_1.jpg",
            "createdTime": "2026-02-07T09:30:00.000Z",
            "webViewLink": "https://drive.google.com/file/d/f1/view",
            "thumbnailLink": "https://lh3.googleusercontent.com/t"
        }"#;
        let file: RemoteFile = serde_json::from_str(json).unwrap();
        assert_eq!(file.id, "f1");
        assert_eq!(file.name, "07_02_2026_genou_1.jpg");
        assert!(file.created_time.is_some());
        assert!(file.web_content_link.is_none());
    }

    #[test]
    fn test_file_list_tolerates_missing_files_field() {
        let listing: FileList<FolderRef> = serde_json::from_str("{}").unwrap();
        assert!(listing.files.is_empty());
    }

    #[test]
    fn test_generate_date_filename_shape() {
        let name = generate_date_filename("jpg");
        // DD_MM_YYYY.jpg
        assert_eq!(name.len(), "00_00_0000.jpg".len());
        let (stem, ext) = name.rsplit_once('.').unwrap();
        assert_eq!(ext, "jpg");
        assert_eq!(stem.split('_').count(), 3);
        assert!(stem.chars().all(|c| c.is_ascii_digit() || c == '_'));
    }

    #[test]
    fn test_photo_jpeg() {
        let photo = Photo::jpeg(vec![1, 2, 3]);
        assert_eq!(photo.mime, "image/jpeg");
        assert_eq!(photo.extension, "jpg");
    }

    #[test]
    fn test_validate_endpoint() {
        assert_eq!(
            validate_endpoint("http://localhost:8080/").unwrap(),
            "http://localhost:8080"
        );
        assert!(validate_endpoint("not-a-url").is_err());
        assert!(validate_endpoint("ftp://example.com").is_err());
    }

    #[test]
    fn test_file_view_url() {
        assert_eq!(
            file_view_url("abc123"),
            "https://drive.google.com/uc?export=view&id=abc123"
        );
    }

    /// Integration test against a real Drive account.
    /// Run with: GOOGLE_TOKEN=... cargo test test_drive_folder_tree -- --ignored
    #[tokio::test]
    #[ignore]
    async fn test_drive_folder_tree() {
        let token = std::env::var("GOOGLE_TOKEN").expect("GOOGLE_TOKEN not set");
        let client = DriveClient::new(std::sync::Arc::new(
            crate::auth::StaticTokenProvider::new(token),
        ))
        .expect("Failed to create client");

        let folders = client
            .create_patient_tree("DUPONT_Jean_0612345678", None)
            .await
            .expect("Failed to create folder tree");

        let subs = client
            .list_sub_folders(&folders.patient_folder_id)
            .await
            .expect("Failed to list subfolders");
        let names: Vec<&str> = subs.iter().map(|f| f.name.as_str()).collect();
        assert!(names.contains(&"Bilans"));
        assert!(names.contains(&"Seances"));

        client
            .delete(&folders.patient_folder_id)
            .await
            .expect("Failed to clean up");
    }
}
