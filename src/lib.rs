//! Patient-records engine for physical therapists, backed by the user's
//! own Google Drive and Sheets account instead of a dedicated server.
//!
//! Everything lives in a fixed Drive hierarchy
//! (`KINE_APP/Patients/<LASTNAME>_<Firstname>[_<phone>]/{Bilans,Seances}`)
//! plus one `journal` spreadsheet per patient; the filenames and sheet
//! schema double as the data model. This crate holds the parts with real
//! invariants: the two remote adapters, the local cache, roster
//! reconciliation, bilan grouping and the séance journal merger. Sign-in
//! and rendering belong to the host application.

pub mod auth;
pub mod bilans;
pub mod cache;
pub mod config;
pub mod drive;
pub mod error;
pub mod patients;
pub mod seances;
pub mod sheets;

pub use auth::{StaticTokenProvider, StoredTokenProvider, TokenProvider};
pub use bilans::{group_bilans, Bilan, BilanMeta, BilanService};
pub use cache::CacheStore;
pub use config::Config;
pub use drive::{DriveClient, FolderRef, PatientFolders, Photo, RemoteFile};
pub use error::SyncError;
pub use patients::{CreatePatientError, Patient, PatientDirectory, RosterStore};
pub use seances::{merge_seances, Seance, SeancePreview, SeanceService};
pub use sheets::{JournalRow, SheetsClient};
