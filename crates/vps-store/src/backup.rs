//! Timestamped store snapshots.
//!
//! A backup sits next to the store as `<store>.backup_<YYYYMMDD_HHMMSS>`, so
//! descending name order is newest-first.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub const BACKUP_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
pub const BACKUP_PAGE_SIZE: usize = 5;

/// Suffixed backups allowed within one timestamp second.
const MAX_SAME_SECOND: u32 = 99;

fn backup_prefix(store_path: &Path) -> String {
    let file_name = store_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{file_name}.backup_")
}

/// Path of the backup that would be taken at `at`.
pub fn backup_path(store_path: &Path, at: DateTime<Local>) -> PathBuf {
    let name = format!("{}{}", backup_prefix(store_path), at.format(BACKUP_STAMP_FORMAT));
    store_path.with_file_name(name)
}

/// Copy the store to a fresh backup file. An existing backup is never
/// overwritten: a second backup within the same second gets a `_NN` suffix,
/// which still sorts after the first.
pub async fn create_backup(store_path: &Path, at: DateTime<Local>) -> std::io::Result<PathBuf> {
    let content = tokio::fs::read(store_path).await?;
    let base = backup_path(store_path, at);

    for n in 0..=MAX_SAME_SECOND {
        let target = if n == 0 {
            base.clone()
        } else {
            let mut name = base.as_os_str().to_owned();
            name.push(format!("_{n:02}"));
            PathBuf::from(name)
        };

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        };
        file.write_all(&content).await?;
        file.flush().await?;

        debug!(store = %store_path.display(), backup = %target.display(), "backup written");
        return Ok(target);
    }

    Err(std::io::Error::new(
        ErrorKind::AlreadyExists,
        format!("too many backups of {} within one second", store_path.display()),
    ))
}

/// Every backup of `store_path`, newest first. A missing directory yields
/// an empty list.
pub async fn list_backups(store_path: &Path) -> std::io::Result<Vec<PathBuf>> {
    let prefix = backup_prefix(store_path);
    let dir = match store_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut backups = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(&prefix) && entry.file_type().await?.is_file() {
            backups.push(entry.path());
        }
    }
    backups.sort_by(|a, b| b.file_name().cmp(&a.file_name()));
    Ok(backups)
}

/// File name of a backup path, for display and lookup.
pub fn backup_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

// ─── Paging ───────────────────────────────────────────────────────────────────

/// One page of a newest-first backup listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupPage {
    pub page: usize,
    pub total: usize,
    pub names: Vec<String>,
    pub has_prev: bool,
    pub has_next: bool,
}

impl BackupPage {
    /// Slice `backups` to `page` (zero-based). Pages past the end are empty.
    pub fn new(backups: &[PathBuf], page: usize) -> Self {
        let start = page.saturating_mul(BACKUP_PAGE_SIZE);
        let end = start.saturating_add(BACKUP_PAGE_SIZE).min(backups.len());
        let names = if start < backups.len() {
            backups[start..end].iter().map(|p| backup_name(p)).collect()
        } else {
            Vec::new()
        };
        Self {
            page,
            total: backups.len(),
            names,
            has_prev: page > 0,
            has_next: end < backups.len(),
        }
    }
}
