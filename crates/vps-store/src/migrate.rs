//! Startup migration of legacy `name#discriminator` owner keys.
//!
//! Runs once from [`crate::InstanceStore::open`]: snapshot, rewrite resolvable
//! legacy owners to numeric ids, replace the store atomically if anything
//! changed.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::record::{owner_field, UserId, FIELD_SEPARATOR};
use crate::{backup, sibling, split_lines, StoreError, StoreResult};

// ─── Identity resolution ──────────────────────────────────────────────────────

/// Maps a legacy display name and discriminator to a numeric user id.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, name: &str, discriminator: &str) -> Option<UserId>;
}

/// Resolver backed by a fixed `"name#discriminator" -> id` table.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    entries: HashMap<String, UserId>,
}

impl StaticResolver {
    pub fn new(entries: HashMap<String, UserId>) -> Self {
        Self { entries }
    }

    pub fn with(mut self, legacy: &str, id: UserId) -> Self {
        self.entries.insert(legacy.to_string(), id);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl IdentityResolver for StaticResolver {
    async fn resolve(&self, name: &str, discriminator: &str) -> Option<UserId> {
        self.entries.get(&format!("{name}#{discriminator}")).copied()
    }
}

// ─── Report ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationOutcome {
    /// No store file existed.
    NoStore,
    /// Nothing to rewrite; the store was left untouched.
    AlreadyMigrated,
    /// At least one line was rewritten.
    Migrated,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub outcome: MigrationOutcome,
    pub backup: Option<PathBuf>,
    pub migrated: usize,
    /// Legacy owners the resolver did not know; retried on the next start.
    pub unresolved: Vec<String>,
}

impl MigrationReport {
    fn no_store() -> Self {
        Self {
            outcome: MigrationOutcome::NoStore,
            backup: None,
            migrated: 0,
            unresolved: Vec::new(),
        }
    }
}

// ─── Guard ────────────────────────────────────────────────────────────────────

fn is_numeric_owner(field: &str) -> bool {
    !field.is_empty() && field.bytes().all(|b| b.is_ascii_digit())
}

fn migrated_path(store_path: &Path) -> PathBuf {
    sibling(store_path, ".migrated")
}

pub(crate) async fn run(
    store_path: &Path,
    resolver: &dyn IdentityResolver,
    now: DateTime<Local>,
) -> StoreResult<MigrationReport> {
    if !tokio::fs::try_exists(store_path).await.unwrap_or(false) {
        return Ok(MigrationReport::no_store());
    }

    let backup = match backup::create_backup(store_path, now).await {
        Ok(path) => {
            info!(backup = %path.display(), "store backup created");
            Some(path)
        }
        Err(e) => {
            warn!(store = %store_path.display(), error = %e, "store backup failed");
            None
        }
    };

    let content = tokio::fs::read_to_string(store_path)
        .await
        .map_err(|e| StoreError::unavailable(store_path, e))?;

    let mut lines = Vec::new();
    let mut migrated = 0;
    let mut unresolved = Vec::new();

    for line in split_lines(&content) {
        let first = owner_field(line.trim());
        if is_numeric_owner(first) {
            lines.push(line.to_string());
            continue;
        }
        if let Some((name, discriminator)) = first.split_once('#') {
            match resolver.resolve(name, discriminator).await {
                Some(id) => {
                    let rest = line.trim().split_once(FIELD_SEPARATOR).map(|(_, r)| r);
                    let rewritten = match rest {
                        Some(rest) => format!("{id}{FIELD_SEPARATOR}{rest}"),
                        None => id.to_string(),
                    };
                    lines.push(rewritten);
                    migrated += 1;
                    continue;
                }
                None => {
                    warn!(legacy_owner = %first, "could not resolve legacy owner, leaving line as is");
                    unresolved.push(first.to_string());
                }
            }
        }
        lines.push(line.to_string());
    }

    if migrated == 0 {
        info!(store = %store_path.display(), "store already uses numeric owner ids");
        return Ok(MigrationReport {
            outcome: MigrationOutcome::AlreadyMigrated,
            backup,
            migrated,
            unresolved,
        });
    }

    let temp = migrated_path(store_path);
    let mut body = lines.join("\n");
    body.push('\n');
    tokio::fs::write(&temp, body)
        .await
        .map_err(|e| StoreError::unavailable(&temp, e))?;
    tokio::fs::rename(&temp, store_path)
        .await
        .map_err(|e| StoreError::unavailable(store_path, e))?;

    info!(store = %store_path.display(), migrated, "store migrated to numeric owner ids");
    Ok(MigrationReport {
        outcome: MigrationOutcome::Migrated,
        backup,
        migrated,
        unresolved,
    })
}
