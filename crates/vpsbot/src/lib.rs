//! vpsbot — VPS chat-bot back end
//!
//! Serves the bot's command set over a JSON-lines channel: instance listing,
//! tmate session regeneration, admin record edits and store backups.

#![forbid(unsafe_code)]

pub mod admin_cmd;
pub mod commands;
pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod outbox;
pub mod vps_cmd;

use std::sync::Arc;
use tracing::info;
use vps_session::{MessageDelivery, ProcessRunner, SessionRegenerator, TokioProcessRunner};
use vps_store::{InstanceStore, MigrationReport, StaticResolver, UserId};

pub use config::BotConfig;
pub use error::{BotError, BotResult};

/// Shared state, passed by reference into every command handler.
pub struct SharedState {
    pub config: BotConfig,
    pub store: Arc<InstanceStore>,
    pub regenerator: SessionRegenerator,
    pub commands: Vec<String>,
}

impl SharedState {
    /// Open the store (running the startup migration) and wire the default
    /// collaborators: local helper processes and the file outbox.
    pub async fn open(config: BotConfig) -> BotResult<(Self, MigrationReport)> {
        let resolver = match &config.user_directory {
            Some(path) => directory::load(path),
            None => StaticResolver::default(),
        };
        let (store, report) = InstanceStore::open(config.database_file.clone(), &resolver).await?;
        let delivery = Arc::new(outbox::OutboxDelivery::new(config.outbox_dir.clone()));
        let state = Self::with_collaborators(config, store, Arc::new(TokioProcessRunner), delivery);
        Ok((state, report))
    }

    pub fn with_collaborators(
        config: BotConfig,
        store: InstanceStore,
        runner: Arc<dyn ProcessRunner>,
        delivery: Arc<dyn MessageDelivery>,
    ) -> Self {
        let store = Arc::new(store);
        let regenerator =
            SessionRegenerator::new(store.clone(), runner, delivery, config.helper.clone());
        let commands = commands::COMMANDS.iter().map(|c| c.to_string()).collect();
        Self {
            config,
            store,
            regenerator,
            commands,
        }
    }

    pub fn is_admin(&self, user: UserId) -> bool {
        self.config.is_admin(user)
    }

    /// Close the store if nothing else still holds it; otherwise the lock is
    /// released when the last handle drops.
    pub async fn close(self) {
        let Self {
            store, regenerator, ..
        } = self;
        drop(regenerator);
        match Arc::try_unwrap(store) {
            Ok(store) => store.close().await,
            Err(_) => info!("store still referenced, releasing on drop"),
        }
    }
}
