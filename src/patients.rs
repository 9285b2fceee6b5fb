//! Patient roster and directory reconciliation.
//!
//! The locally cached roster is the source of truth; the remote folder
//! hierarchy is only a source of *new* entries. `sync_remote_patients`
//! performs a one-way merge: folders under `Patients` whose
//! `LASTNAME_Firstname[_phone]` name matches no cached patient are
//! adopted once their `Bilans`/`Seances` subfolders and journal resolve,
//! and nothing local is ever removed or overwritten.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::CacheStore;
use crate::config::{BILANS_FOLDER_NAME, SEANCES_FOLDER_NAME};
use crate::drive::{DriveClient, FolderRef, PatientFolders};
use crate::error::SyncError;
use crate::sheets::SheetsClient;

/// Cache key holding the JSON-serialized roster.
pub const PATIENTS_CACHE_KEY: &str = "patients";

/// One patient record as cached locally.
///
/// `id` is a locally generated opaque token; two devices discovering the
/// same remote folder will hold different ids for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    pub id: String,
    pub last_name: String,
    pub first_name: String,
    #[serde(default)]
    pub phone: String,
    pub patient_folder_id: String,
    pub bilans_folder_id: String,
    pub seances_folder_id: String,
    pub journal_id: String,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
}

impl Patient {
    /// The Drive folder name this patient's record maps to.
    pub fn folder_name(&self) -> String {
        patient_folder_name(&self.last_name, &self.first_name, &self.phone)
    }

    /// Case-insensitive identity used for deduplication during sync.
    /// Accented names are common here, so lowercase the Unicode way.
    pub fn matches_name(&self, last_name: &str, first_name: &str) -> bool {
        self.last_name.to_lowercase() == last_name.to_lowercase()
            && self.first_name.to_lowercase() == first_name.to_lowercase()
    }
}

/// Name tokens recovered from a patient folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFolderName {
    pub last_name: String,
    pub first_name: String,
    pub phone: Option<String>,
}

/// `LASTNAME_Firstname` or `LASTNAME_Firstname_phone`.
pub fn patient_folder_name(last_name: &str, first_name: &str, phone: &str) -> String {
    if phone.is_empty() {
        format!("{}_{}", last_name.to_uppercase(), first_name)
    } else {
        format!("{}_{}_{}", last_name.to_uppercase(), first_name, phone)
    }
}

/// Split a folder name into patient identity tokens. Names with fewer
/// than two underscore-delimited tokens are not patient folders.
pub fn parse_patient_folder_name(name: &str) -> Option<ParsedFolderName> {
    let tokens: Vec<&str> = name.split('_').collect();
    if tokens.len() < 2 || tokens[0].is_empty() || tokens[1].is_empty() {
        return None;
    }
    Some(ParsedFolderName {
        last_name: tokens[0].to_string(),
        first_name: tokens[1].to_string(),
        phone: tokens.get(2).map(|t| t.to_string()),
    })
}

/// Remote folders that are new to the given roster, with their parsed
/// identities. Unparseable names are skipped; matching is
/// case-insensitive on `(last, first)` so re-running against an
/// already-merged roster yields nothing.
pub fn new_candidates<'a>(
    roster: &[Patient],
    folders: &'a [FolderRef],
) -> Vec<(&'a FolderRef, ParsedFolderName)> {
    let mut candidates: Vec<(&FolderRef, ParsedFolderName)> = Vec::new();
    for folder in folders {
        let Some(parsed) = parse_patient_folder_name(&folder.name) else {
            debug!(folder = %folder.name, "Ignoring folder without a parseable patient name");
            continue;
        };
        let already_known = roster
            .iter()
            .any(|p| p.matches_name(&parsed.last_name, &parsed.first_name))
            || candidates.iter().any(|(_, c)| {
                c.last_name.to_lowercase() == parsed.last_name.to_lowercase()
                    && c.first_name.to_lowercase() == parsed.first_name.to_lowercase()
            });
        if !already_known {
            candidates.push((folder, parsed));
        }
    }
    candidates
}

/// Locate the `Bilans` and `Seances` subfolders a patient folder must carry.
pub(crate) fn required_subfolders(
    folder_name: &str,
    children: &[FolderRef],
) -> Result<(String, String), SyncError> {
    let bilans = children
        .iter()
        .find(|f| f.name == BILANS_FOLDER_NAME)
        .ok_or_else(|| {
            SyncError::DataInconsistent(format!(
                "'{}' has no {} subfolder",
                folder_name, BILANS_FOLDER_NAME
            ))
        })?;
    let seances = children
        .iter()
        .find(|f| f.name == SEANCES_FOLDER_NAME)
        .ok_or_else(|| {
            SyncError::DataInconsistent(format!(
                "'{}' has no {} subfolder",
                folder_name, SEANCES_FOLDER_NAME
            ))
        })?;
    Ok((bilans.id.clone(), seances.id.clone()))
}

/// Cached roster access. Last write wins, no merge.
#[derive(Debug, Clone)]
pub struct RosterStore {
    cache: CacheStore,
}

impl RosterStore {
    pub fn new(cache: CacheStore) -> Self {
        Self { cache }
    }

    /// The full roster; an unreadable cache reads as empty.
    pub fn load(&self) -> Vec<Patient> {
        self.cache.get(PATIENTS_CACHE_KEY).unwrap_or_default()
    }

    pub fn save(&self, roster: &[Patient]) -> Result<(), SyncError> {
        self.cache.put(PATIENTS_CACHE_KEY, &roster)
    }

    pub fn add(&self, patient: Patient) -> Result<(), SyncError> {
        let mut roster = self.load();
        roster.push(patient);
        self.save(&roster)
    }

    pub fn update(&self, patient: &Patient) -> Result<(), SyncError> {
        let mut roster = self.load();
        for entry in roster.iter_mut() {
            if entry.id == patient.id {
                *entry = patient.clone();
            }
        }
        self.save(&roster)
    }

    pub fn remove(&self, patient_id: &str) -> Result<(), SyncError> {
        let roster: Vec<Patient> = self
            .load()
            .into_iter()
            .filter(|p| p.id != patient_id)
            .collect();
        self.save(&roster)
    }
}

/// Creation spans two remote systems with no transaction between them;
/// the variants carry whatever already exists so a caller can recover
/// by hand.
#[derive(Debug, Error)]
pub enum CreatePatientError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("failed to create the patient folder tree: {source}")]
    FolderCreation {
        #[source]
        source: SyncError,
    },

    /// The folder tree exists but the journal does not; no rollback is
    /// attempted, so the folders are orphaned until the caller retries.
    #[error("patient folders created but journal creation failed: {source}")]
    JournalCreation {
        folders: PatientFolders,
        #[source]
        source: SyncError,
    },

    /// Remote creation fully succeeded but the roster write failed; the
    /// patient exists in Drive and is carried here for a manual retry.
    #[error("patient created remotely but the local roster write failed: {source}")]
    CacheWrite {
        patient: Patient,
        #[source]
        source: SyncError,
    },
}

/// High-level patient directory operations over Drive, Sheets and the
/// local roster.
#[derive(Clone)]
pub struct PatientDirectory {
    drive: DriveClient,
    sheets: SheetsClient,
    roster: RosterStore,
    root_parent: Option<String>,
}

impl PatientDirectory {
    pub fn new(drive: DriveClient, sheets: SheetsClient, roster: RosterStore) -> Self {
        Self {
            drive,
            sheets,
            roster,
            root_parent: None,
        }
    }

    /// Create `KINE_APP` under a specific Drive folder instead of the root.
    pub fn with_root_parent(mut self, root_parent: Option<String>) -> Self {
        self.root_parent = root_parent;
        self
    }

    pub fn roster(&self) -> &RosterStore {
        &self.roster
    }

    /// Create the remote folder tree and journal for a new patient, then
    /// cache the record locally.
    pub async fn create_patient(
        &self,
        last_name: &str,
        first_name: &str,
        phone: &str,
    ) -> Result<Patient, CreatePatientError> {
        let last_name = last_name.trim();
        let first_name = first_name.trim();
        let phone = phone.trim();
        if last_name.is_empty() || first_name.is_empty() {
            return Err(CreatePatientError::Validation(
                "last name and first name are required".to_string(),
            ));
        }

        let folder_name = patient_folder_name(last_name, first_name, phone);
        let folders = self
            .drive
            .create_patient_tree(&folder_name, self.root_parent.as_deref())
            .await
            .map_err(|source| CreatePatientError::FolderCreation { source })?;

        let journal_id = match self.sheets.create_journal(&folders.seances_folder_id).await {
            Ok(id) => id,
            Err(source) => {
                warn!(
                    folder = %folders.folder_name,
                    error = %source,
                    "Journal creation failed after the folder tree was created"
                );
                return Err(CreatePatientError::JournalCreation { folders, source });
            }
        };

        let patient = Patient {
            id: Uuid::new_v4().to_string(),
            last_name: last_name.to_string(),
            first_name: first_name.to_string(),
            phone: phone.to_string(),
            patient_folder_id: folders.patient_folder_id,
            bilans_folder_id: folders.bilans_folder_id,
            seances_folder_id: folders.seances_folder_id,
            journal_id,
            created_at: Utc::now().to_rfc3339(),
        };

        if let Err(source) = self.roster.add(patient.clone()) {
            return Err(CreatePatientError::CacheWrite { patient, source });
        }

        info!(patient = %patient.id, folder = %folder_name, "Created patient");
        Ok(patient)
    }

    /// Rename the patient's Drive folder and update the cached record.
    pub async fn rename_patient(
        &self,
        patient: &Patient,
        last_name: &str,
        first_name: &str,
        phone: &str,
    ) -> Result<Patient, SyncError> {
        let last_name = last_name.trim();
        let first_name = first_name.trim();
        let phone = phone.trim();
        if last_name.is_empty() || first_name.is_empty() {
            return Err(SyncError::ValidationError(
                "last name and first name are required".to_string(),
            ));
        }

        let new_name = patient_folder_name(last_name, first_name, phone);
        self.drive.rename(&patient.patient_folder_id, &new_name).await?;

        let updated = Patient {
            last_name: last_name.to_string(),
            first_name: first_name.to_string(),
            phone: phone.to_string(),
            ..patient.clone()
        };
        self.roster.update(&updated)?;
        Ok(updated)
    }

    /// Delete the patient's remote folder tree and evict the cached record.
    ///
    /// The remote deletion is attempted first, but its failure does not
    /// keep the local entry alive: the user must never be stuck with an
    /// undeletable patient because Drive is unreachable.
    pub async fn delete_patient(&self, patient: &Patient) -> Result<(), SyncError> {
        if let Err(e) = self.drive.delete(&patient.patient_folder_id).await {
            warn!(
                patient = %patient.id,
                error = %e,
                "Remote folder deletion failed; removing the local entry anyway"
            );
        }
        self.roster.remove(&patient.id)?;
        info!(patient = %patient.id, "Deleted patient");
        Ok(())
    }

    /// Background reconciliation: adopt remote patient folders unknown to
    /// the local roster. Never fails; any error degrades to "no new
    /// patients found".
    pub async fn sync_remote_patients(&self) -> Vec<Patient> {
        match self.try_sync().await {
            Ok(discovered) => discovered,
            Err(e) => {
                warn!(error = %e, "Background roster sync failed");
                Vec::new()
            }
        }
    }

    async fn try_sync(&self) -> Result<Vec<Patient>, SyncError> {
        let Some(patients_root) = self
            .drive
            .find_patients_root(self.root_parent.as_deref())
            .await?
        else {
            debug!("No Patients folder on the remote yet");
            return Ok(Vec::new());
        };

        let remote_folders = self.drive.list_sub_folders(&patients_root).await?;
        let local = self.roster.load();

        let mut discovered: Vec<Patient> = Vec::new();
        for (folder, parsed) in new_candidates(&local, &remote_folders) {
            match self.adopt_candidate(folder, parsed).await {
                Ok(patient) => {
                    info!(
                        patient = %patient.id,
                        folder = %folder.name,
                        "Adopted patient folder from remote"
                    );
                    discovered.push(patient);
                }
                Err(e) => {
                    // Dropped silently: surfaced in logs, never to the caller.
                    debug!(folder = %folder.name, reason = %e, "Dropping patient folder candidate");
                }
            }
        }

        if !discovered.is_empty() {
            let mut merged = local;
            merged.extend(discovered.iter().cloned());
            self.roster.save(&merged)?;
        }
        Ok(discovered)
    }

    /// A folder is only adopted once both required subfolders and the
    /// journal inside `Seances` resolve.
    async fn adopt_candidate(
        &self,
        folder: &FolderRef,
        parsed: ParsedFolderName,
    ) -> Result<Patient, SyncError> {
        let children = self.drive.list_sub_folders(&folder.id).await?;
        let (bilans_folder_id, seances_folder_id) = required_subfolders(&folder.name, &children)?;
        let journal_id = self
            .sheets
            .find_journal(&seances_folder_id)
            .await?
            .ok_or_else(|| {
                SyncError::DataInconsistent(format!("'{}' has no journal sheet", folder.name))
            })?;

        Ok(Patient {
            id: Uuid::new_v4().to_string(),
            last_name: parsed.last_name,
            first_name: parsed.first_name,
            phone: parsed.phone.unwrap_or_default(),
            patient_folder_id: folder.id.clone(),
            bilans_folder_id,
            seances_folder_id,
            journal_id,
            created_at: Utc::now().to_rfc3339(),
        })
    }
}
