//! Bilan (assessment) grouping and creation.
//!
//! A bilan is one or more photos plus an optional title. New bilans are
//! recorded in a side-channel meta index cached per patient; older
//! uploads carry their grouping only in their filenames
//! (`DD_MM_YYYY_<slug>_<index>.<ext>`), so listing recovers those by
//! parsing. Meta-defined claims always win over filename inference: a
//! file id never ends up in two bilans.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tracing::info;
use uuid::Uuid;

use crate::cache::CacheStore;
use crate::drive::{DriveClient, Photo, RemoteFile};
use crate::error::SyncError;
use crate::patients::Patient;

/// Cache key of a patient's bilan meta index.
pub fn bilans_meta_key(patient_id: &str) -> String {
    format!("bilans_meta_{}", patient_id)
}

/// One entry of the side-channel index: an explicit grouping of uploaded
/// files into a titled bilan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BilanMeta {
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// Ordered file ids; ids whose files have vanished are dropped at read time.
    pub file_ids: Vec<String>,
}

/// A grouped assessment as presented to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bilan {
    pub id: String,
    /// May be empty; see [`Bilan::display_title`].
    pub title: String,
    pub created_at: DateTime<Utc>,
    /// Never empty.
    pub files: Vec<RemoteFile>,
}

impl Bilan {
    /// The first (cover) photo of the bilan.
    pub fn cover(&self) -> &RemoteFile {
        &self.files[0]
    }

    /// Title to show: the recorded one, or the cover file's name for
    /// untitled bilans.
    pub fn display_title(&self) -> &str {
        if self.title.is_empty() {
            &self.cover().name
        } else {
            &self.title
        }
    }
}

/// Group a flat folder listing into bilans using the meta index first
/// and filename inference for the rest. Deterministic for identical
/// inputs; only the `created_at` of groups whose files all lack
/// timestamps depends on the clock.
pub fn group_bilans(files: &[RemoteFile], meta: &[BilanMeta]) -> Vec<Bilan> {
    group_bilans_at(files, meta, Utc::now())
}

fn group_bilans_at(files: &[RemoteFile], meta: &[BilanMeta], now: DateTime<Utc>) -> Vec<Bilan> {
    let by_id: HashMap<&str, &RemoteFile> = files.iter().map(|f| (f.id.as_str(), f)).collect();

    // 1. Meta-defined bilans claim their files, in stored order.
    let mut claimed: HashSet<&str> = HashSet::new();
    let mut bilans: Vec<Bilan> = Vec::new();
    for record in meta {
        let mut resolved: Vec<RemoteFile> = Vec::new();
        for file_id in &record.file_ids {
            if claimed.contains(file_id.as_str()) {
                continue;
            }
            if let Some(file) = by_id.get(file_id.as_str()) {
                claimed.insert(file.id.as_str());
                resolved.push((*file).clone());
            }
        }
        // A record none of whose files survive is dropped entirely.
        if resolved.is_empty() {
            continue;
        }
        let created_at = earliest_created(&resolved).unwrap_or(now);
        bilans.push(Bilan {
            id: record.id.clone(),
            title: record.title.clone(),
            created_at,
            files: resolved,
        });
    }

    // 2. Orphan files: group by the filename convention, singletons otherwise.
    let mut inferred: Vec<(InferredKey, Vec<RemoteFile>)> = Vec::new();
    for file in files {
        if claimed.contains(file.id.as_str()) {
            continue;
        }
        match parse_bilan_filename(&file.name) {
            Some(key) => match inferred.iter_mut().find(|(k, _)| *k == key) {
                Some((_, members)) => members.push(file.clone()),
                None => inferred.push((key, vec![file.clone()])),
            },
            None => {
                let title = file_stem(&file.name).to_string();
                bilans.push(Bilan {
                    id: file.id.clone(),
                    title,
                    created_at: file.created_time.unwrap_or(now),
                    files: vec![file.clone()],
                });
            }
        }
    }

    for (key, mut members) in inferred {
        members.sort_by(|a, b| natural_cmp(&a.name, &b.name));
        let created_at = earliest_created(&members).unwrap_or(now);
        bilans.push(Bilan {
            id: members[0].id.clone(),
            title: key.slug.replace('-', " "),
            created_at,
            files: members,
        });
    }

    // Newest first; the sort is stable so meta bilans keep priority on ties.
    bilans.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    bilans
}

fn earliest_created(files: &[RemoteFile]) -> Option<DateTime<Utc>> {
    files.iter().filter_map(|f| f.created_time).min()
}

/// Grouping key recovered from a legacy filename.
#[derive(Debug, Clone, PartialEq, Eq)]
struct InferredKey {
    /// `DD_MM_YYYY`, the first three tokens.
    date_key: String,
    /// The tokens between date and index, underscores intact.
    slug: String,
}

/// Parse `DD_MM_YYYY_<slug>_<index>.<ext>`. Anything with fewer than
/// four underscore-delimited tokens is not part of the convention.
fn parse_bilan_filename(name: &str) -> Option<InferredKey> {
    let stem = file_stem(name);
    let tokens: Vec<&str> = stem.split('_').collect();
    if tokens.len() < 4 {
        return None;
    }
    Some(InferredKey {
        date_key: tokens[..3].join("_"),
        slug: tokens[3..tokens.len() - 1].join("_"),
    })
}

fn file_stem(name: &str) -> &str {
    name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name)
}

/// Lexicographic comparison that orders embedded numbers by value, so
/// `x_2` sorts before `x_10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i].is_ascii_digit() && b[j].is_ascii_digit() {
            let start_a = i;
            while i < a.len() && a[i].is_ascii_digit() {
                i += 1;
            }
            let start_b = j;
            while j < b.len() && b[j].is_ascii_digit() {
                j += 1;
            }
            let digits_a = trim_leading_zeros(&a[start_a..i]);
            let digits_b = trim_leading_zeros(&b[start_b..j]);
            let ord = digits_a
                .len()
                .cmp(&digits_b.len())
                .then_with(|| digits_a.cmp(digits_b));
            if ord != Ordering::Equal {
                return ord;
            }
        } else {
            let ord = a[i].cmp(&b[j]);
            if ord != Ordering::Equal {
                return ord;
            }
            i += 1;
            j += 1;
        }
    }
    (a.len() - i).cmp(&(b.len() - j))
}

fn trim_leading_zeros(digits: &[u8]) -> &[u8] {
    let first_nonzero = digits.iter().position(|&d| d != b'0');
    match first_nonzero {
        Some(pos) => &digits[pos..],
        None => &digits[digits.len() - 1..],
    }
}

/// Reduce a free-text title to the slug embedded in filenames:
/// lowercase, whitespace collapsed to `-`, anything outside
/// `[a-z0-9_-]` dropped.
pub fn sanitize_title(title: &str) -> String {
    let slug: String = title
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
        .collect();
    if slug.is_empty() {
        "bilan".to_string()
    } else {
        slug
    }
}

/// Bilan listing and creation for one patient.
#[derive(Clone)]
pub struct BilanService {
    drive: DriveClient,
    cache: CacheStore,
}

impl BilanService {
    pub fn new(drive: DriveClient, cache: CacheStore) -> Self {
        Self { drive, cache }
    }

    /// The cached meta index for a patient; unreadable reads as empty.
    pub fn meta(&self, patient_id: &str) -> Vec<BilanMeta> {
        self.cache
            .get(&bilans_meta_key(patient_id))
            .unwrap_or_default()
    }

    /// All bilans for a patient, newest first.
    pub async fn list_bilans(&self, patient: &Patient) -> Result<Vec<Bilan>, SyncError> {
        let files = self.drive.list_files(&patient.bilans_folder_id).await?;
        Ok(group_bilans(&files, &self.meta(&patient.id)))
    }

    /// Upload a new bilan's photos and record it in the meta index.
    ///
    /// Uploads run sequentially: photos can be large and constrained
    /// devices handle one in-flight body better than a fan-out.
    pub async fn add_bilan(
        &self,
        patient: &Patient,
        title: &str,
        photos: Vec<Photo>,
    ) -> Result<BilanMeta, SyncError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(SyncError::ValidationError(
                "bilan title is required".to_string(),
            ));
        }
        if photos.is_empty() {
            return Err(SyncError::ValidationError(
                "at least one photo is required".to_string(),
            ));
        }

        let date_part = Local::now().format("%d_%m_%Y").to_string();
        let slug = sanitize_title(title);

        let mut file_ids = Vec::with_capacity(photos.len());
        for (n, photo) in photos.into_iter().enumerate() {
            let name = format!("{}_{}_{}.{}", date_part, slug, n + 1, photo.extension);
            let uploaded = self
                .drive
                .upload(photo, &patient.bilans_folder_id, &name)
                .await?;
            file_ids.push(uploaded.id);
        }

        let record = BilanMeta {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            created_at: Utc::now().to_rfc3339(),
            file_ids,
        };
        let mut meta = self.meta(&patient.id);
        meta.push(record.clone());
        self.cache.put(&bilans_meta_key(&patient.id), &meta)?;

        info!(
            patient = %patient.id,
            bilan = %record.id,
            photos = record.file_ids.len(),
            "Added bilan"
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn ts(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, day, hour, 0, 0).unwrap()
    }

    fn file(id: &str, name: &str, created: Option<DateTime<Utc>>) -> RemoteFile {
        RemoteFile {
            id: id.to_string(),
            name: name.to_string(),
            created_time: created,
            web_view_link: None,
            web_content_link: None,
            thumbnail_link: None,
        }
    }

    fn meta(id: &str, title: &str, file_ids: &[&str]) -> BilanMeta {
        BilanMeta {
            id: id.to_string(),
            title: title.to_string(),
            created_at: "2026-02-07T10:00:00Z".to_string(),
            file_ids: file_ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_meta_claims_then_inference() {
        let files = vec![
            file("f1", "photo-a.jpg", Some(ts(1, 10))),
            file("f2", "photo-b.jpg", Some(ts(1, 11))),
            file("f3", "07_02_2026_genou_1.jpg", Some(ts(7, 9))),
        ];
        let metas = vec![meta("b1", "Lombalgie", &["f1", "f2"])];

        let bilans = group_bilans(&files, &metas);
        assert_eq!(bilans.len(), 2);

        // Newest first: the inferred bilan was created Feb 7
        assert_eq!(bilans[0].title, "genou");
        assert_eq!(bilans[0].files.len(), 1);
        assert_eq!(bilans[1].id, "b1");
        assert_eq!(bilans[1].title, "Lombalgie");
        assert_eq!(bilans[1].files.len(), 2);
    }

    #[test]
    fn test_meta_claim_wins_over_inference() {
        // f1 matches the filename convention but is claimed by meta
        let files = vec![
            file("f1", "07_02_2026_genou_1.jpg", Some(ts(7, 9))),
            file("f2", "07_02_2026_genou_2.jpg", Some(ts(7, 9))),
        ];
        let metas = vec![meta("b1", "Genou droit", &["f1"])];

        let bilans = group_bilans(&files, &metas);
        assert_eq!(bilans.len(), 2);
        let claimed = bilans.iter().find(|b| b.id == "b1").unwrap();
        assert_eq!(claimed.files[0].id, "f1");
        let inferred = bilans.iter().find(|b| b.id != "b1").unwrap();
        assert_eq!(inferred.files.len(), 1);
        assert_eq!(inferred.files[0].id, "f2");
    }

    #[test]
    fn test_vanished_file_ids_dropped_and_empty_records_skipped() {
        let files = vec![file("f1", "a.jpg", Some(ts(1, 10)))];
        let metas = vec![
            meta("b1", "Gone", &["deleted-1", "deleted-2"]),
            meta("b2", "Partial", &["deleted-3", "f1"]),
        ];

        let bilans = group_bilans(&files, &metas);
        assert_eq!(bilans.len(), 1);
        assert_eq!(bilans[0].id, "b2");
        assert_eq!(bilans[0].files.len(), 1);
    }

    #[test]
    fn test_first_meta_record_wins_duplicate_claims() {
        let files = vec![file("f1", "a.jpg", Some(ts(1, 10)))];
        let metas = vec![meta("b1", "First", &["f1"]), meta("b2", "Second", &["f1"])];

        let bilans = group_bilans(&files, &metas);
        assert_eq!(bilans.len(), 1);
        assert_eq!(bilans[0].id, "b1");
    }

    #[test]
    fn test_pattern_grouping_and_numeric_order() {
        let files = vec![
            file("f10", "07_02_2026_epaule_10.jpg", Some(ts(7, 12))),
            file("f2", "07_02_2026_epaule_2.jpg", Some(ts(7, 10))),
            file("f1", "07_02_2026_epaule_1.jpg", Some(ts(7, 9))),
        ];
        let bilans = group_bilans(&files, &[]);

        assert_eq!(bilans.len(), 1);
        assert_eq!(bilans[0].title, "epaule");
        let order: Vec<&str> = bilans[0].files.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(order, ["f1", "f2", "f10"]);
        // Earliest member timestamp becomes the bilan date
        assert_eq!(bilans[0].created_at, ts(7, 9));
    }

    #[test]
    fn test_same_slug_different_dates_stay_separate() {
        let files = vec![
            file("f1", "07_02_2026_genou_1.jpg", Some(ts(7, 9))),
            file("f2", "14_02_2026_genou_1.jpg", Some(ts(14, 9))),
        ];
        let bilans = group_bilans(&files, &[]);
        assert_eq!(bilans.len(), 2);
    }

    #[test]
    fn test_hyphenated_slug_restored_to_spaces() {
        let files = vec![file("f1", "07_02_2026_genou-droit_1.jpg", Some(ts(7, 9)))];
        let bilans = group_bilans(&files, &[]);
        assert_eq!(bilans[0].title, "genou droit");
    }

    #[test]
    fn test_short_names_become_singletons() {
        let files = vec![
            file("f1", "07_02_2026.jpg", Some(ts(7, 9))),
            file("f2", "photo.jpg", Some(ts(7, 10))),
            file("f3", "07_02_2026.jpg", Some(ts(7, 11))),
        ];
        let bilans = group_bilans(&files, &[]);

        assert_eq!(bilans.len(), 3);
        for bilan in &bilans {
            assert_eq!(bilan.files.len(), 1);
            // Singleton keyed by its own file id, titled by the stem
            assert_eq!(bilan.id, bilan.files[0].id);
        }
        let titled = bilans.iter().find(|b| b.id == "f2").unwrap();
        assert_eq!(titled.title, "photo");
    }

    #[test]
    fn test_display_title_falls_back_to_cover_name() {
        let files = vec![file("f1", "a.jpg", Some(ts(1, 10)))];
        let metas = vec![meta("b1", "", &["f1"])];
        let bilans = group_bilans(&files, &metas);
        assert_eq!(bilans[0].display_title(), "a.jpg");
    }

    #[test]
    fn test_sorted_newest_first() {
        let files = vec![
            file("f1", "01_02_2026_dos_1.jpg", Some(ts(1, 9))),
            file("f2", "14_02_2026_dos_1.jpg", Some(ts(14, 9))),
            file("f3", "07_02_2026_dos_1.jpg", Some(ts(7, 9))),
        ];
        let bilans = group_bilans(&files, &[]);
        let dates: Vec<DateTime<Utc>> = bilans.iter().map(|b| b.created_at).collect();
        assert_eq!(dates, vec![ts(14, 9), ts(7, 9), ts(1, 9)]);
    }

    #[test]
    fn test_parse_bilan_filename() {
        let key = parse_bilan_filename("07_02_2026_genou_1.jpg").unwrap();
        assert_eq!(key.date_key, "07_02_2026");
        assert_eq!(key.slug, "genou");

        // Exactly four tokens: empty slug
        let key = parse_bilan_filename("07_02_2026_1.jpg").unwrap();
        assert_eq!(key.slug, "");

        // Slug containing underscores keeps them in the key
        let key = parse_bilan_filename("07_02_2026_genou_droit_1.jpg").unwrap();
        assert_eq!(key.slug, "genou_droit");

        assert!(parse_bilan_filename("07_02_2026.jpg").is_none());
        assert!(parse_bilan_filename("photo.jpg").is_none());

        // No extension
        let key = parse_bilan_filename("07_02_2026_coude_3").unwrap();
        assert_eq!(key.slug, "coude");
    }

    #[test]
    fn test_natural_cmp() {
        assert_eq!(natural_cmp("x_2", "x_10"), Ordering::Less);
        assert_eq!(natural_cmp("x_10", "x_2"), Ordering::Greater);
        assert_eq!(natural_cmp("x_2", "x_2"), Ordering::Equal);
        assert_eq!(natural_cmp("x_02", "x_2"), Ordering::Equal);
        assert_eq!(natural_cmp("a", "b"), Ordering::Less);
        assert_eq!(natural_cmp("a1b", "a1c"), Ordering::Less);
        assert_eq!(natural_cmp("a", "a1"), Ordering::Less);
        // Huge numbers must not overflow anything
        assert_eq!(
            natural_cmp("x_99999999999999999999", "x_100000000000000000000"),
            Ordering::Less
        );
    }

    #[test]
    fn test_sanitize_title() {
        assert_eq!(sanitize_title("Lombalgie"), "lombalgie");
        assert_eq!(sanitize_title("Genou droit"), "genou-droit");
        assert_eq!(sanitize_title("  Épaule gelée  "), "paule-gele");
        assert_eq!(sanitize_title("???"), "bilan");
        assert_eq!(sanitize_title(""), "bilan");
    }

    proptest! {
        /// Every file id lands in at most one bilan, whatever the meta says.
        #[test]
        fn prop_claimed_files_invariant(
            names in proptest::collection::vec("[a-z0-9_]{1,20}(\\.jpg)?", 0..12),
            claims in proptest::collection::vec(
                proptest::collection::vec(0usize..12, 0..6),
                0..4,
            ),
        ) {
            let files: Vec<RemoteFile> = names
                .iter()
                .enumerate()
                .map(|(i, name)| file(&format!("id{}", i), name, Some(ts(1, 10))))
                .collect();
            let metas: Vec<BilanMeta> = claims
                .iter()
                .enumerate()
                .map(|(i, ids)| {
                    let ids: Vec<String> =
                        ids.iter().map(|n| format!("id{}", n)).collect();
                    BilanMeta {
                        id: format!("m{}", i),
                        title: String::new(),
                        created_at: "2026-01-01T00:00:00Z".to_string(),
                        file_ids: ids,
                    }
                })
                .collect();

            let bilans = group_bilans(&files, &metas);

            let mut seen = HashSet::new();
            for bilan in &bilans {
                prop_assert!(!bilan.files.is_empty());
                for f in &bilan.files {
                    prop_assert!(seen.insert(f.id.clone()), "file {} grouped twice", f.id);
                }
            }
            // Nothing vanishes either: every input file is somewhere
            prop_assert_eq!(seen.len(), files.len());
        }

        /// Grouping is deterministic for identical inputs.
        #[test]
        fn prop_grouping_deterministic(
            names in proptest::collection::vec("[a-z0-9_]{1,20}\\.jpg", 0..10),
        ) {
            let files: Vec<RemoteFile> = names
                .iter()
                .enumerate()
                .map(|(i, name)| file(&format!("id{}", i), name, Some(ts(2, 8))))
                .collect();
            let a = group_bilans(&files, &[]);
            let b = group_bilans(&files, &[]);
            let ids_a: Vec<&str> = a.iter().map(|x| x.id.as_str()).collect();
            let ids_b: Vec<&str> = b.iter().map(|x| x.id.as_str()).collect();
            prop_assert_eq!(ids_a, ids_b);
        }
    }
}
