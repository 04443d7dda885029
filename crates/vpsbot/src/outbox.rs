//! Private message outbox
//!
//! Each recipient gets `<outbox_dir>/<user_id>.jsonl`; the chat gateway tails
//! these files and relays them as direct messages.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;
use vps_session::{DeliveryError, MessageDelivery};
use vps_store::UserId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub recipient: UserId,
    pub content: String,
    pub queued_at: DateTime<Utc>,
}

pub struct OutboxDelivery {
    dir: PathBuf,
}

impl OutboxDelivery {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn mailbox(&self, recipient: UserId) -> PathBuf {
        mailbox_path(&self.dir, recipient)
    }
}

fn mailbox_path(dir: &Path, recipient: UserId) -> PathBuf {
    dir.join(format!("{recipient}.jsonl"))
}

#[async_trait]
impl MessageDelivery for OutboxDelivery {
    async fn deliver(&self, recipient: UserId, content: &str) -> Result<(), DeliveryError> {
        let fail = |reason: String| DeliveryError { recipient, reason };

        let message = OutboxMessage {
            id: Uuid::new_v4(),
            recipient,
            content: content.to_string(),
            queued_at: Utc::now(),
        };
        let mut line = serde_json::to_string(&message).map_err(|e| fail(e.to_string()))?;
        line.push('\n');

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| fail(format!("create {}: {e}", self.dir.display())))?;
        let path = self.mailbox(recipient);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| fail(format!("open {}: {e}", path.display())))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| fail(format!("write {}: {e}", path.display())))?;

        debug!(recipient, message_id = %message.id, "message queued");
        Ok(())
    }
}

/// Messages queued for `recipient`, oldest first. Unreadable lines are
/// skipped.
pub async fn read_mailbox(dir: &Path, recipient: UserId) -> Vec<OutboxMessage> {
    let Ok(content) = tokio::fs::read_to_string(mailbox_path(dir, recipient)).await else {
        return Vec::new();
    };
    content
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}
