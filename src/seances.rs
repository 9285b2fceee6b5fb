//! Séance (session) records: the journal joined with the photo folder.
//!
//! A séance is one photo, a date and a free-text description. The
//! journal spreadsheet is authoritative for the list; each row is joined
//! at read time with the Drive file whose name matches its `fileName`
//! column. Rows whose file has vanished still appear, degraded.

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::CacheStore;
use crate::drive::{generate_date_filename, DriveClient, Photo, RemoteFile};
use crate::error::SyncError;
use crate::patients::Patient;
use crate::sheets::{JournalRow, SheetsClient};

/// Cache key of a patient's local photo previews.
pub fn seances_previews_key(patient_id: &str) -> String {
    format!("seances_previews_{}", patient_id)
}

/// A locally cached, downscaled preview of an uploaded photo, keyed by
/// the Drive file id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeancePreview {
    pub file_id: String,
    /// `data:` URL of the compressed image.
    pub data_url: String,
}

/// One session as presented to the caller: the journal row plus the
/// matched file's affordances, when the file was found.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Seance {
    /// Session date, `YYYY-MM-DD`.
    pub date: String,
    pub file_name: String,
    pub description: String,
    /// 1-based journal position, header excluded; the update/delete target.
    pub row_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_view_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_content_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_preview: Option<String>,
}

impl Seance {
    /// Whether the row found its photo on the remote.
    pub fn has_file(&self) -> bool {
        self.file_id.is_some()
    }
}

/// Join journal rows with the folder listing. Rows arrive most recent
/// first and keep that order; the first file with a matching name wins
/// when duplicates exist.
pub fn merge_seances(
    rows: &[JournalRow],
    files: &[RemoteFile],
    previews: &[SeancePreview],
) -> Vec<Seance> {
    rows.iter()
        .map(|row| {
            let file = files.iter().find(|f| f.name == row.file_name);
            let file_id = file.map(|f| f.id.clone());
            let local_preview = file_id.as_ref().and_then(|id| {
                previews
                    .iter()
                    .find(|p| &p.file_id == id)
                    .map(|p| p.data_url.clone())
            });
            Seance {
                date: row.date.clone(),
                file_name: row.file_name.clone(),
                description: row.description.clone(),
                row_index: row.row_index,
                file_id,
                thumbnail_link: file.and_then(|f| f.thumbnail_link.clone()),
                web_view_link: file.and_then(|f| f.web_view_link.clone()),
                web_content_link: file.and_then(|f| f.web_content_link.clone()),
                local_preview,
            }
        })
        .collect()
}

/// Séance listing and CRUD for one patient.
#[derive(Clone)]
pub struct SeanceService {
    drive: DriveClient,
    sheets: SheetsClient,
    cache: CacheStore,
}

impl SeanceService {
    pub fn new(drive: DriveClient, sheets: SheetsClient, cache: CacheStore) -> Self {
        Self {
            drive,
            sheets,
            cache,
        }
    }

    /// All séances for a patient, most recent first.
    pub async fn list_seances(&self, patient: &Patient) -> Result<Vec<Seance>, SyncError> {
        let rows = self.sheets.read_rows(&patient.journal_id).await?;
        let files = self.drive.list_files(&patient.seances_folder_id).await?;
        let previews = self.previews(&patient.id);
        Ok(merge_seances(&rows, &files, &previews))
    }

    /// Upload today's session photo and append its journal row. The
    /// optional `preview` data-URL is cached locally for offline display.
    pub async fn add_seance(
        &self,
        patient: &Patient,
        photo: Photo,
        description: &str,
        preview: Option<String>,
    ) -> Result<RemoteFile, SyncError> {
        let file_name = generate_date_filename(&photo.extension);
        let uploaded = self
            .drive
            .upload(photo, &patient.seances_folder_id, &file_name)
            .await?;

        let date = Local::now().format("%Y-%m-%d").to_string();
        self.sheets
            .append_row(&patient.journal_id, &date, &file_name, description)
            .await?;

        if let Some(data_url) = preview {
            self.save_preview(&patient.id, &uploaded.id, data_url);
        }

        info!(patient = %patient.id, file = %file_name, "Added séance");
        Ok(uploaded)
    }

    /// Edit a row's date and description in place.
    pub async fn update_seance(
        &self,
        patient: &Patient,
        seance: &Seance,
        date: &str,
        description: &str,
    ) -> Result<(), SyncError> {
        self.sheets
            .update_row(
                &patient.journal_id,
                seance.row_index,
                date,
                &seance.file_name,
                description,
            )
            .await
    }

    /// Replace a séance's photo: upload the new file, point the row at
    /// it, then best-effort delete of the old one.
    pub async fn replace_seance_photo(
        &self,
        patient: &Patient,
        seance: &Seance,
        photo: Photo,
    ) -> Result<RemoteFile, SyncError> {
        let file_name = generate_date_filename(&photo.extension);
        let uploaded = self
            .drive
            .upload(photo, &patient.seances_folder_id, &file_name)
            .await?;

        self.sheets
            .update_row(
                &patient.journal_id,
                seance.row_index,
                &seance.date,
                &uploaded.name,
                &seance.description,
            )
            .await?;

        if let Some(old_id) = &seance.file_id {
            if old_id != &uploaded.id {
                if let Err(e) = self.drive.delete(old_id).await {
                    warn!(
                        patient = %patient.id,
                        file = %old_id,
                        error = %e,
                        "Failed to delete the replaced séance photo"
                    );
                }
            }
        }

        info!(patient = %patient.id, row = seance.row_index, "Replaced séance photo");
        Ok(uploaded)
    }

    /// Delete a séance: the journal row first, then a best-effort
    /// deletion of its photo. A failed photo deletion only logs; the
    /// row is already gone.
    pub async fn delete_seance(
        &self,
        patient: &Patient,
        seance: &Seance,
    ) -> Result<(), SyncError> {
        self.sheets
            .delete_row(&patient.journal_id, seance.row_index)
            .await?;

        if let Some(file_id) = &seance.file_id {
            if let Err(e) = self.drive.delete(file_id).await {
                warn!(
                    patient = %patient.id,
                    file = %file_id,
                    error = %e,
                    "Failed to delete the séance photo; row already removed"
                );
            }
        }

        info!(patient = %patient.id, row = seance.row_index, "Deleted séance");
        Ok(())
    }

    fn previews(&self, patient_id: &str) -> Vec<SeancePreview> {
        self.cache
            .get(&seances_previews_key(patient_id))
            .unwrap_or_default()
    }

    fn save_preview(&self, patient_id: &str, file_id: &str, data_url: String) {
        let mut previews = self.previews(patient_id);
        previews.push(SeancePreview {
            file_id: file_id.to_string(),
            data_url,
        });
        if let Err(e) = self.cache.put(&seances_previews_key(patient_id), &previews) {
            warn!(patient = %patient_id, error = %e, "Failed to cache séance preview");
        }
    }
}
