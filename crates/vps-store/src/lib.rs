//! Flat-file instance store for the VPS bot.
//!
//! Provides [`InstanceStore`], a `|`-delimited, one-record-per-line store.
//! Every mutation reads the whole file, transforms it in memory and writes it
//! back through a temp file and rename. Mutations are serialized through a
//! single writer gate and the store file is guarded by an advisory lock for as
//! long as the handle is open.

#![forbid(unsafe_code)]

pub mod backup;
pub mod migrate;
pub mod record;

use chrono::Local;
use fs4::FileExt;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub use backup::{list_backups, BackupPage};
pub use migrate::{IdentityResolver, MigrationOutcome, MigrationReport, StaticResolver};
pub use record::{InstanceRecord, RecordField, UserId};

use record::{check_value, instance_field, owner_field, FIELD_SEPARATOR};

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable at {path}: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store {0} is held by another process")]
    Locked(PathBuf),

    #[error("no record for owner {owner_id} and instance '{instance_name}'")]
    NotFound {
        owner_id: UserId,
        instance_name: String,
    },

    #[error("invalid value for {field}: {reason}")]
    InvalidField { field: RecordField, reason: String },

    #[error("refusing to remove with an empty prefix")]
    InvalidPrefix,

    #[error("no backups found")]
    NoBackups,

    #[error("unknown backup '{0}'")]
    UnknownBackup(String),
}

impl StoreError {
    pub(crate) fn unavailable(path: &Path, source: std::io::Error) -> Self {
        Self::Unavailable {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Split file content into lines without terminators. A trailing newline
/// does not produce an empty final line.
pub(crate) fn split_lines(content: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = content.split('\n').collect();
    if lines.last() == Some(&"") {
        lines.pop();
    }
    lines
}

/// Leading digits followed by the end or a field separator.
fn is_owner_prefix(prefix: &str) -> bool {
    let digits = prefix.bytes().take_while(u8::is_ascii_digit).count();
    digits > 0
        && prefix[digits..]
            .chars()
            .next()
            .is_none_or(|c| c == FIELD_SEPARATOR)
}

pub(crate) fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

// ─── Store lock ───────────────────────────────────────────────────────────────

/// Advisory lock on `<store>.lock`, released when dropped.
#[derive(Debug)]
struct StoreLock {
    _file: File,
}

impl StoreLock {
    fn acquire(store_path: &Path) -> StoreResult<Self> {
        let path = sibling(store_path, ".lock");
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StoreError::unavailable(&path, e))?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Self { _file: file }),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                Err(StoreError::Locked(store_path.to_path_buf()))
            }
            Err(e) => Err(StoreError::unavailable(&path, e)),
        }
    }
}

// ─── InstanceStore ────────────────────────────────────────────────────────────

/// Handle on an open store. The only constructor is [`InstanceStore::open`],
/// which runs the legacy-owner migration before returning, so no caller can
/// touch the store ahead of it.
#[derive(Debug)]
pub struct InstanceStore {
    path: PathBuf,
    writer: Mutex<()>,
    _lock: StoreLock,
}

impl InstanceStore {
    /// Lock the store, run the migration guard once, and hand back the open
    /// store together with the migration report.
    pub async fn open(
        path: impl Into<PathBuf>,
        resolver: &dyn IdentityResolver,
    ) -> StoreResult<(Self, MigrationReport)> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::unavailable(parent, e))?;
        }

        let lock = StoreLock::acquire(&path)?;
        let report = migrate::run(&path, resolver, Local::now()).await?;
        info!(
            path = %path.display(),
            outcome = ?report.outcome,
            migrated = report.migrated,
            "instance store open"
        );

        Ok((
            Self {
                path,
                writer: Mutex::new(()),
                _lock: lock,
            },
            report,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the store lock.
    pub async fn close(self) {
        // Wait out any in-flight writer before the lock file handle goes away.
        let _guard = self.writer.lock().await;
        info!(path = %self.path.display(), "instance store closed");
    }

    // ─── Reads ────────────────────────────────────────────────────────────

    /// Whole-file read for query paths. Missing or unreadable files read as
    /// empty.
    async fn read_content(&self) -> String {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no store file, reading as empty");
                String::new()
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "store unreadable, reading as empty");
                String::new()
            }
        }
    }

    /// Whole-file read for mutation paths. `None` when the file is missing;
    /// any other failure propagates so a rewrite never clobbers data it
    /// could not read.
    async fn read_for_write(&self) -> StoreResult<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::unavailable(&self.path, e)),
        }
    }

    /// Atomically replace the store with `lines`.
    async fn rewrite(&self, lines: &[&str]) -> StoreResult<()> {
        let temp = sibling(&self.path, ".tmp");
        let mut body = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
        for line in lines {
            body.push_str(line);
            body.push('\n');
        }
        tokio::fs::write(&temp, body)
            .await
            .map_err(|e| StoreError::unavailable(&temp, e))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| StoreError::unavailable(&self.path, e))
    }

    /// All records owned by `owner_id`, in file order.
    pub async fn list_for_owner(&self, owner_id: UserId) -> Vec<InstanceRecord> {
        let owner = owner_id.to_string();
        let content = self.read_content().await;
        split_lines(&content)
            .into_iter()
            .filter(|line| owner_field(line) == owner)
            .filter_map(InstanceRecord::parse)
            .collect()
    }

    /// First record for the pair, or the owner's first record when
    /// `instance_name` is `None`.
    pub async fn find_instance(
        &self,
        owner_id: UserId,
        instance_name: Option<&str>,
    ) -> Option<InstanceRecord> {
        let records = self.list_for_owner(owner_id).await;
        match instance_name {
            Some(name) => records.into_iter().find(|r| r.instance_name == name),
            None => records.into_iter().next(),
        }
    }

    /// Raw lines beginning with `"<owner_id>|"`, for diagnostics.
    pub async fn raw_lines_for_owner(&self, owner_id: UserId) -> Vec<String> {
        let prefix = format!("{owner_id}{FIELD_SEPARATOR}");
        let content = self.read_content().await;
        split_lines(&content)
            .into_iter()
            .map(str::trim)
            .filter(|line| line.starts_with(&prefix))
            .map(str::to_string)
            .collect()
    }

    // ─── Writes ───────────────────────────────────────────────────────────

    /// Append one record. Duplicates are not checked.
    pub async fn append(&self, record: &InstanceRecord) -> StoreResult<()> {
        let line = record.to_line()?;
        let _guard = self.writer.lock().await;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| StoreError::unavailable(&self.path, e))?;

        // Keep the previous last line intact if the file lacks a final newline.
        let len = file
            .metadata()
            .await
            .map_err(|e| StoreError::unavailable(&self.path, e))?
            .len();
        let mut buf = String::with_capacity(line.len() + 2);
        if len > 0 {
            file.seek(std::io::SeekFrom::End(-1))
                .await
                .map_err(|e| StoreError::unavailable(&self.path, e))?;
            let last = file
                .read_u8()
                .await
                .map_err(|e| StoreError::unavailable(&self.path, e))?;
            if last != b'\n' {
                buf.push('\n');
            }
        }
        buf.push_str(&line);
        buf.push('\n');

        file.write_all(buf.as_bytes())
            .await
            .map_err(|e| StoreError::unavailable(&self.path, e))?;
        file.flush()
            .await
            .map_err(|e| StoreError::unavailable(&self.path, e))?;

        debug!(owner_id = record.owner_id, instance = %record.instance_name, "record appended");
        Ok(())
    }

    /// Drop matching lines and return how many went. A prefix shaped like an
    /// owner key (`"5"`, `"5|"`, `"5|web"`) matches the raw line; anything
    /// else matches the instance-name field.
    pub async fn remove(&self, prefix: &str) -> StoreResult<usize> {
        if prefix.is_empty() {
            return Err(StoreError::InvalidPrefix);
        }
        let _guard = self.writer.lock().await;
        let Some(content) = self.read_for_write().await? else {
            return Ok(0);
        };

        let by_owner = is_owner_prefix(prefix);
        let lines = split_lines(&content);
        let kept: Vec<&str> = lines
            .iter()
            .copied()
            .filter(|line| {
                let hit = if by_owner {
                    line.starts_with(prefix)
                } else {
                    instance_field(line).is_some_and(|name| name.starts_with(prefix))
                };
                !hit
            })
            .collect();
        let removed = lines.len() - kept.len();

        if removed > 0 {
            self.rewrite(&kept).await?;
            info!(prefix, removed, "records removed");
        }
        Ok(removed)
    }

    /// Replace one field on the first line matching the owner and instance.
    pub async fn update_field(
        &self,
        owner_id: UserId,
        instance_name: &str,
        field: RecordField,
        value: &str,
    ) -> StoreResult<()> {
        check_value(field, value)?;
        if field == RecordField::OwnerId && value.parse::<UserId>().is_err() {
            return Err(StoreError::InvalidField {
                field,
                reason: "owner id must be numeric".to_string(),
            });
        }

        let not_found = || StoreError::NotFound {
            owner_id,
            instance_name: instance_name.to_string(),
        };

        let _guard = self.writer.lock().await;
        let content = self.read_for_write().await?.ok_or_else(not_found)?;
        let owner = owner_id.to_string();

        let mut lines = split_lines(&content);
        let index = lines
            .iter()
            .position(|line| {
                owner_field(line) == owner && instance_field(line) == Some(instance_name)
            })
            .ok_or_else(not_found)?;

        let mut parts: Vec<&str> = lines[index]
            .trim_end_matches('\r')
            .split(FIELD_SEPARATOR)
            .collect();
        if parts.len() <= field.index() {
            parts.resize(field.index() + 1, "");
        }
        parts[field.index()] = value;
        let updated = parts.join("|");
        lines[index] = &updated;

        self.rewrite(&lines).await?;
        debug!(owner_id, instance = %instance_name, %field, "record field updated");
        Ok(())
    }

    // ─── Backups ──────────────────────────────────────────────────────────

    /// All backups of this store, newest first.
    pub async fn backups(&self) -> StoreResult<Vec<PathBuf>> {
        list_backups(&self.path)
            .await
            .map_err(|e| StoreError::unavailable(&self.path, e))
    }

    /// Snapshot the store now.
    pub async fn backup_now(&self) -> StoreResult<PathBuf> {
        let _guard = self.writer.lock().await;
        let path = backup::create_backup(&self.path, Local::now())
            .await
            .map_err(|e| StoreError::unavailable(&self.path, e))?;
        info!(backup = %path.display(), "store backup created");
        Ok(path)
    }

    /// Replace the store with the named backup, or the newest one.
    pub async fn restore_backup(&self, name: Option<&str>) -> StoreResult<PathBuf> {
        // Choose under the gate so a concurrent backup cannot change "latest".
        let _guard = self.writer.lock().await;
        let backups = self.backups().await?;
        let chosen = match name {
            Some(name) => backups
                .into_iter()
                .find(|p| backup::backup_name(p) == name)
                .ok_or_else(|| StoreError::UnknownBackup(name.to_string()))?,
            None => backups.into_iter().next().ok_or(StoreError::NoBackups)?,
        };

        let temp = sibling(&self.path, ".tmp");
        tokio::fs::copy(&chosen, &temp)
            .await
            .map_err(|e| StoreError::unavailable(&chosen, e))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| StoreError::unavailable(&self.path, e))?;

        info!(backup = %chosen.display(), "store restored from backup");
        Ok(chosen)
    }
}
