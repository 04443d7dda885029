//! Bot configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use vps_session::HelperSettings;
use vps_store::UserId;

use crate::error::{BotError, BotResult};

/// Configuration for the vpsbot back end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Pipe-delimited instance database
    pub database_file: PathBuf,

    /// Users allowed to run admin commands (backups, record edits)
    #[serde(default)]
    pub admin_ids: Vec<UserId>,

    /// JSON map of legacy `name#discriminator` to numeric user id
    #[serde(default)]
    pub user_directory: Option<PathBuf>,

    /// Directory receiving private messages, one JSON-lines file per user
    pub outbox_dir: PathBuf,

    /// Container runtime used for status probes (docker, podman)
    #[serde(default = "default_runtime")]
    pub container_runtime: String,

    /// Session helper launch and capture settings
    #[serde(default)]
    pub helper: HelperSettings,
}

fn default_runtime() -> String {
    "docker".to_string()
}

impl BotConfig {
    pub fn load(path: &Path) -> BotResult<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| BotError::Config(format!("read {}: {e}", path.display())))?;
        serde_json::from_str(&data)
            .map_err(|e| BotError::Config(format!("parse {}: {e}", path.display())))
    }

    pub fn save(&self, path: &Path) -> BotResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Config rooted at `state_path`, everything else default.
    pub fn rooted_at(state_path: &Path) -> Self {
        Self {
            database_file: state_path.join("database.txt"),
            outbox_dir: state_path.join("outbox"),
            ..Self::default()
        }
    }

    pub fn is_admin(&self, user: UserId) -> bool {
        self.admin_ids.contains(&user)
    }
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            database_file: PathBuf::from("/var/lib/vpsbot/database.txt"),
            admin_ids: Vec::new(),
            user_directory: None,
            outbox_dir: PathBuf::from("/var/lib/vpsbot/outbox"),
            container_runtime: default_runtime(),
            helper: HelperSettings::default(),
        }
    }
}
