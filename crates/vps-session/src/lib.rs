//! tmate session regeneration for VPS containers.
//!
//! [`SessionRegenerator`] looks up an instance, runs the session helper inside
//! its container, scrapes the first connection line from the helper's output,
//! persists it on the record and hands it to the owner over a private channel.
//! Private delivery is best-effort and reported separately from the outcome.

#![forbid(unsafe_code)]

pub mod process;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use vps_store::{InstanceRecord, InstanceStore, RecordField, StoreError, UserId};

pub use process::{HelperProcess, ProcessRunner, TokioProcessRunner};

/// Placeholder in helper args replaced by the instance name.
pub const CONTAINER_PLACEHOLDER: &str = "{container}";

// ─── Settings ─────────────────────────────────────────────────────────────────

/// How the session helper is launched and scraped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelperSettings {
    /// Program to run (e.g. docker)
    #[serde(default = "default_program")]
    pub program: String,

    /// Arguments; `{container}` is replaced by the instance name
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Substrings that mark the connection line
    #[serde(default = "default_markers")]
    pub markers: Vec<String>,

    /// Upper bound on waiting for the connection line
    #[serde(default = "default_capture_timeout")]
    pub capture_timeout_secs: u64,

    /// How long to wait for a helper whose output ended without a match
    #[serde(default = "default_exit_grace")]
    pub exit_grace_secs: u64,
}

fn default_program() -> String {
    "docker".to_string()
}

fn default_args() -> Vec<String> {
    ["exec", CONTAINER_PLACEHOLDER, "tmate", "-F"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_markers() -> Vec<String> {
    vec!["ssh ".to_string(), "tmate ssh".to_string()]
}

fn default_capture_timeout() -> u64 {
    30
}

fn default_exit_grace() -> u64 {
    2
}

impl Default for HelperSettings {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            markers: default_markers(),
            capture_timeout_secs: default_capture_timeout(),
            exit_grace_secs: default_exit_grace(),
        }
    }
}

impl HelperSettings {
    pub fn args_for(&self, instance_name: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.replace(CONTAINER_PLACEHOLDER, instance_name))
            .collect()
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs)
    }

    pub fn exit_grace(&self) -> Duration {
        Duration::from_secs(self.exit_grace_secs)
    }

    /// Whether `line` carries a connection string.
    pub fn is_session_line(&self, line: &str) -> bool {
        !line.is_empty() && self.markers.iter().any(|m| line.contains(m.as_str()))
    }
}

// ─── Delivery ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
#[error("delivery to {recipient} failed: {reason}")]
pub struct DeliveryError {
    pub recipient: UserId,
    pub reason: String,
}

/// Private channel to a single user.
#[async_trait]
pub trait MessageDelivery: Send + Sync {
    async fn deliver(&self, recipient: UserId, content: &str) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Failed(String),
}

// ─── Outcome & errors ─────────────────────────────────────────────────────────

/// Result of a successful regeneration. `delivery` is secondary: the session
/// is stored whether or not the owner could be messaged.
#[derive(Debug, Clone, Serialize)]
pub struct RegenOutcome {
    pub instance_name: String,
    pub session_command: String,
    pub delivery: DeliveryStatus,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no instance '{instance_name}' found for owner {owner_id}")]
    NotFound {
        owner_id: UserId,
        instance_name: String,
        /// The owner's current records, for diagnostics.
        known: Vec<InstanceRecord>,
    },

    #[error("failed to launch {program}: {source}")]
    ProcessLaunch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no session line within {0:?}")]
    CaptureTimeout(Duration),

    #[error("helper finished without printing a session line")]
    CaptureFailed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Read helper output until a session line appears or the stream closes.
/// Read errors end the scan like a closed stream.
pub async fn capture_session_line(
    helper: &mut dyn HelperProcess,
    settings: &HelperSettings,
) -> Option<String> {
    loop {
        match helper.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if settings.is_session_line(line) {
                    return Some(line.to_string());
                }
                debug!(line, "helper output");
            }
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "helper output unreadable");
                return None;
            }
        }
    }
}

/// Message sent privately to the owner.
pub fn session_message(instance_name: &str, session_command: &str) -> String {
    format!(
        "New SSH session generated for {instance_name}.\n\
         Your SSH session has been regenerated successfully.\n\
         SSH connection command: {session_command}"
    )
}

// ─── Regenerator ──────────────────────────────────────────────────────────────

pub struct SessionRegenerator {
    store: Arc<InstanceStore>,
    runner: Arc<dyn ProcessRunner>,
    delivery: Arc<dyn MessageDelivery>,
    settings: HelperSettings,
}

impl SessionRegenerator {
    pub fn new(
        store: Arc<InstanceStore>,
        runner: Arc<dyn ProcessRunner>,
        delivery: Arc<dyn MessageDelivery>,
        settings: HelperSettings,
    ) -> Self {
        Self {
            store,
            runner,
            delivery,
            settings,
        }
    }

    pub fn settings(&self) -> &HelperSettings {
        &self.settings
    }

    /// Produce a fresh session command for `instance_name`, store it and
    /// message it to the owner.
    pub async fn regenerate_session(
        &self,
        owner_id: UserId,
        instance_name: &str,
    ) -> SessionResult<RegenOutcome> {
        let Some(record) = self.store.find_instance(owner_id, Some(instance_name)).await else {
            let known = self.store.list_for_owner(owner_id).await;
            return Err(SessionError::NotFound {
                owner_id,
                instance_name: instance_name.to_string(),
                known,
            });
        };

        let program = self.settings.program.as_str();
        let args = self.settings.args_for(&record.instance_name);
        info!(owner_id, instance = %record.instance_name, program, "regenerating session");

        let mut helper =
            self.runner
                .spawn(program, &args)
                .await
                .map_err(|source| SessionError::ProcessLaunch {
                    program: program.to_string(),
                    source,
                })?;

        let limit = self.settings.capture_timeout();
        let scan = timeout(limit, capture_session_line(helper.as_mut(), &self.settings)).await;
        let captured = match scan {
            Ok(Some(line)) => {
                helper.detach();
                line
            }
            Ok(None) => {
                self.finish(helper).await;
                warn!(owner_id, instance = %record.instance_name, "helper printed no session line");
                return Err(SessionError::CaptureFailed);
            }
            Err(_) => {
                if let Err(e) = helper.kill().await {
                    warn!(error = %e, "failed to kill timed-out helper");
                }
                warn!(owner_id, instance = %record.instance_name, ?limit, "session capture timed out");
                return Err(SessionError::CaptureTimeout(limit));
            }
        };

        self.store
            .update_field(
                owner_id,
                &record.instance_name,
                RecordField::SessionCommand,
                &captured,
            )
            .await?;

        let message = session_message(&record.instance_name, &captured);
        let delivery = match self.delivery.deliver(owner_id, &message).await {
            Ok(()) => DeliveryStatus::Delivered,
            Err(e) => {
                warn!(owner_id, error = %e, "session delivery failed");
                DeliveryStatus::Failed(e.reason)
            }
        };

        info!(owner_id, instance = %record.instance_name, ?delivery, "session regenerated");
        Ok(RegenOutcome {
            instance_name: record.instance_name,
            session_command: captured,
            delivery,
        })
    }

    /// Give a helper whose output ended a short grace period to exit, then
    /// kill it.
    async fn finish(&self, mut helper: Box<dyn HelperProcess>) {
        match timeout(self.settings.exit_grace(), helper.wait()).await {
            Ok(Ok(code)) => debug!(?code, "helper exited"),
            Ok(Err(e)) => warn!(error = %e, "failed to wait for helper"),
            Err(_) => {
                if let Err(e) = helper.kill().await {
                    warn!(error = %e, "failed to kill lingering helper");
                }
            }
        }
    }
}
