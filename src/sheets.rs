//! Remote tabular journal adapter over the Google Sheets v4 API.
//!
//! Each patient owns one spreadsheet named `journal` inside their
//! `Seances` folder, with a single `Séances` tab whose rows are
//! `Date | Nom du fichier | Description`. The journal is treated as
//! append-only; row indices are 1-based positions excluding the header
//! and are only valid against the sheet state they were read from.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::auth::TokenProvider;
use crate::config::{JOURNAL_HEADER, JOURNAL_SHEET_NAME, SEANCES_TAB_TITLE};
use crate::drive::handle_response;
use crate::error::SyncError;

const SHEETS_API_ROOT: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const DRIVE_API_ROOT: &str = "https://www.googleapis.com/drive/v3";
const SPREADSHEET_MIME: &str = "application/vnd.google-apps.spreadsheet";

/// HTTP client timeout for Sheets requests
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// One journal row as read back from the sheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalRow {
    /// Session date, `YYYY-MM-DD`.
    pub date: String,
    /// Name of the photo file in the `Seances` folder.
    pub file_name: String,
    pub description: String,
    /// 1-based position in the sheet, header excluded. Only valid for
    /// update/delete until the journal is mutated again.
    pub row_index: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSpreadsheetResponse {
    spreadsheet_id: String,
}

#[derive(Debug, Deserialize)]
struct FileParents {
    #[serde(default)]
    parents: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetMeta>,
}

#[derive(Debug, Deserialize)]
struct SheetMeta {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    sheet_id: i64,
    title: String,
}

/// Sheets API client.
#[derive(Clone)]
pub struct SheetsClient {
    http: reqwest::Client,
    token: Arc<dyn TokenProvider>,
    sheets_root: String,
    drive_root: String,
}

impl SheetsClient {
    pub fn new(token: Arc<dyn TokenProvider>) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .connect_timeout(REQUEST_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            token,
            sheets_root: SHEETS_API_ROOT.to_string(),
            drive_root: DRIVE_API_ROOT.to_string(),
        })
    }

    /// Point the client at different endpoints (mock servers in tests).
    pub fn with_base_urls(mut self, sheets_root: &str, drive_root: &str) -> Result<Self, SyncError> {
        self.sheets_root = crate::drive::validate_endpoint(sheets_root)?;
        self.drive_root = crate::drive::validate_endpoint(drive_root)?;
        Ok(self)
    }

    /// Create the journal spreadsheet and move it under the patient's
    /// `Seances` folder.
    ///
    /// Two independent remote steps: if the move fails the spreadsheet
    /// exists but sits in the Drive root, and the error surfaces to the
    /// caller with the sheet already created.
    pub async fn create_journal(&self, seances_folder_id: &str) -> Result<String, SyncError> {
        let token = self.token.access_token().await?;
        let response = self
            .http
            .post(&self.sheets_root)
            .bearer_auth(&token)
            .json(&journal_create_body())
            .send()
            .await?;
        let created: CreateSpreadsheetResponse = handle_response(response).await?;
        let spreadsheet_id = created.spreadsheet_id;
        info!(journal = %spreadsheet_id, "Created journal spreadsheet");

        // Relocate: a spreadsheet is born in the Drive root, so swap parents.
        let info_url = format!(
            "{}/files/{}?fields=parents",
            self.drive_root, spreadsheet_id
        );
        let response = self.http.get(&info_url).bearer_auth(&token).send().await?;
        let file_info: FileParents = handle_response(response).await?;

        let move_url = format!(
            "{}/files/{}?addParents={}&removeParents={}",
            self.drive_root,
            spreadsheet_id,
            seances_folder_id,
            file_info.parents.join(","),
        );
        let response = self.http.patch(&move_url).bearer_auth(&token).send().await?;
        let _moved: serde_json::Value = handle_response(response).await?;

        Ok(spreadsheet_id)
    }

    /// Look up an existing journal inside a `Seances` folder.
    pub async fn find_journal(
        &self,
        seances_folder_id: &str,
    ) -> Result<Option<String>, SyncError> {
        let query = format!(
            "name='{}' and '{}' in parents and mimeType='{}' and trashed=false",
            JOURNAL_SHEET_NAME, seances_folder_id, SPREADSHEET_MIME
        );
        let url = format!(
            "{}/files?q={}&fields={}",
            self.drive_root,
            urlencoding::encode(&query),
            urlencoding::encode("files(id,name)"),
        );
        let token = self.token.access_token().await?;
        let response = self.http.get(&url).bearer_auth(&token).send().await?;

        #[derive(Deserialize)]
        struct Listing {
            #[serde(default)]
            files: Vec<FileId>,
        }
        #[derive(Deserialize)]
        struct FileId {
            id: String,
        }

        let listing: Listing = handle_response(response).await?;
        Ok(listing.files.into_iter().next().map(|f| f.id))
    }

    /// Append one session row at the bottom of the journal.
    pub async fn append_row(
        &self,
        journal_id: &str,
        date: &str,
        file_name: &str,
        description: &str,
    ) -> Result<(), SyncError> {
        let range = format!("{}!A:C", SEANCES_TAB_TITLE);
        let url = format!(
            "{}/{}/values/{}:append?valueInputOption=USER_ENTERED",
            self.sheets_root,
            journal_id,
            urlencoding::encode(&range),
        );
        let body = serde_json::json!({ "values": [[date, file_name, description]] });
        let token = self.token.access_token().await?;
        let response = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?;
        let _appended: serde_json::Value = handle_response(response).await?;
        info!(journal = %journal_id, file = %file_name, "Appended journal row");
        Ok(())
    }

    /// Read all rows, most recent first. The header row is excluded and
    /// each row carries its 1-based sheet position for later targeting.
    pub async fn read_rows(&self, journal_id: &str) -> Result<Vec<JournalRow>, SyncError> {
        let range = format!("{}!A2:C", SEANCES_TAB_TITLE);
        let url = format!(
            "{}/{}/values/{}",
            self.sheets_root,
            journal_id,
            urlencoding::encode(&range),
        );
        let token = self.token.access_token().await?;
        let response = self.http.get(&url).bearer_auth(&token).send().await?;
        let range: ValueRange = handle_response(response).await?;
        Ok(rows_from_values(range.values))
    }

    /// Overwrite one row in place.
    pub async fn update_row(
        &self,
        journal_id: &str,
        row_index: usize,
        date: &str,
        file_name: &str,
        description: &str,
    ) -> Result<(), SyncError> {
        let range = data_row_range(row_index)?;
        let url = format!(
            "{}/{}/values/{}?valueInputOption=USER_ENTERED",
            self.sheets_root,
            journal_id,
            urlencoding::encode(&range),
        );
        let body = serde_json::json!({ "values": [[date, file_name, description]] });
        let token = self.token.access_token().await?;
        let response = self
            .http
            .put(&url)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await?;
        let _updated: serde_json::Value = handle_response(response).await?;
        info!(journal = %journal_id, row = row_index, "Updated journal row");
        Ok(())
    }

    /// Remove one row. Later rows shift up, invalidating any row indices
    /// read before this call.
    pub async fn delete_row(&self, journal_id: &str, row_index: usize) -> Result<(), SyncError> {
        if row_index == 0 {
            return Err(SyncError::ValidationError(
                "journal row indices are 1-based".to_string(),
            ));
        }

        let sheet_id = self.seances_sheet_id(journal_id).await?;
        let url = format!("{}/{}:batchUpdate", self.sheets_root, journal_id);
        let token = self.token.access_token().await?;
        let response = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .json(&delete_row_body(sheet_id, row_index))
            .send()
            .await?;
        let _result: serde_json::Value = handle_response(response).await?;
        info!(journal = %journal_id, row = row_index, "Deleted journal row");
        Ok(())
    }

    /// Resolve the grid id of the `Séances` tab.
    async fn seances_sheet_id(&self, journal_id: &str) -> Result<i64, SyncError> {
        let url = format!(
            "{}/{}?fields={}",
            self.sheets_root,
            journal_id,
            urlencoding::encode("sheets.properties"),
        );
        let token = self.token.access_token().await?;
        let response = self.http.get(&url).bearer_auth(&token).send().await?;
        let meta: SpreadsheetMeta = handle_response(response).await?;
        meta.sheets
            .iter()
            .find(|s| s.properties.title == SEANCES_TAB_TITLE)
            .map(|s| s.properties.sheet_id)
            .ok_or_else(|| {
                SyncError::DataInconsistent(format!(
                    "journal {} has no '{}' tab",
                    journal_id, SEANCES_TAB_TITLE
                ))
            })
    }
}

/// Request body creating the journal: one `Séances` tab with a frozen,
/// bold header row.
fn journal_create_body() -> serde_json::Value {
    let header_cells: Vec<serde_json::Value> = JOURNAL_HEADER
        .iter()
        .map(|title| {
            serde_json::json!({
                "userEnteredValue": { "stringValue": title },
                "userEnteredFormat": { "textFormat": { "bold": true } },
            })
        })
        .collect();

    serde_json::json!({
        "properties": { "title": JOURNAL_SHEET_NAME },
        "sheets": [{
            "properties": {
                "title": SEANCES_TAB_TITLE,
                "gridProperties": { "frozenRowCount": 1 },
            },
            "data": [{
                "startRow": 0,
                "startColumn": 0,
                "rowData": [{ "values": header_cells }],
            }],
        }],
    })
}

fn delete_row_body(sheet_id: i64, row_index: usize) -> serde_json::Value {
    // Grid indices are 0-based and include the header, so data row N
    // (1-based, header excluded) is grid row N.
    serde_json::json!({
        "requests": [{
            "deleteDimension": {
                "range": {
                    "sheetId": sheet_id,
                    "dimension": "ROWS",
                    "startIndex": row_index,
                    "endIndex": row_index + 1,
                },
            },
        }],
    })
}

/// A1 range of data row N (1-based, header excluded).
fn data_row_range(row_index: usize) -> Result<String, SyncError> {
    if row_index == 0 {
        return Err(SyncError::ValidationError(
            "journal row indices are 1-based".to_string(),
        ));
    }
    let sheet_row = row_index + 1;
    Ok(format!("{}!A{}:C{}", SEANCES_TAB_TITLE, sheet_row, sheet_row))
}

/// Turn the raw value grid into rows, most recent (highest index) first.
fn rows_from_values(values: Vec<Vec<serde_json::Value>>) -> Vec<JournalRow> {
    let mut rows: Vec<JournalRow> = values
        .into_iter()
        .enumerate()
        .map(|(i, cells)| JournalRow {
            date: cell_text(cells.first()),
            file_name: cell_text(cells.get(1)),
            description: cell_text(cells.get(2)),
            row_index: i + 1,
        })
        .collect();
    rows.reverse();
    rows
}

fn cell_text(cell: Option<&serde_json::Value>) -> String {
    match cell {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) if !other.is_null() => other.to_string(),
        _ => String::new(),
    }
}
