//! Instance command handlers
//!
//! Implements: vps.list, vps.regen_ssh

use crate::SharedState;
use crate::commands::{CommandError, CommandRequest, str_param};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;
use vps_session::SessionError;
use vps_store::UserId;

// ─── Container status ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Running,
    Stopped,
}

/// Ask the container runtime for the container state. Anything but a
/// successful `running` answer counts as stopped.
pub async fn container_status(runtime: &str, container: &str) -> ContainerStatus {
    let output = tokio::process::Command::new(runtime)
        .args(["inspect", "--format", "{{.State.Status}}", container])
        .stdin(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .output()
        .await;

    match output {
        Ok(o) if o.status.success() && String::from_utf8_lossy(&o.stdout).trim() == "running" => {
            ContainerStatus::Running
        }
        _ => ContainerStatus::Stopped,
    }
}

// ─── vps.list ────────────────────────────────────────────────────────────────

pub async fn handle_vps_list(state: &SharedState, actor: UserId) -> Result<Value, CommandError> {
    let records = state.store.list_for_owner(actor).await;

    if records.is_empty() {
        return Ok(json!({
            "ok": true,
            "count": 0,
            "message": "No VPS instances found.",
            "entries": state.store.raw_lines_for_owner(actor).await,
        }));
    }

    let mut instances = Vec::with_capacity(records.len());
    for record in &records {
        let status = container_status(&state.config.container_runtime, &record.instance_name).await;
        instances.push(json!({
            "instance_name": record.instance_name,
            "status": status,
            "ram_limit": record.ram_limit,
            "cpu_limit": record.cpu_limit,
            "creator_id": record.creator_id,
            "os_label": record.os_label,
            "expiry": record.expiry,
        }));
    }

    Ok(json!({
        "ok": true,
        "count": instances.len(),
        "instances": instances,
    }))
}

// ─── vps.regen_ssh ───────────────────────────────────────────────────────────

pub async fn handle_regen_ssh(
    state: &SharedState,
    request: CommandRequest,
) -> Result<Value, CommandError> {
    let name = str_param(&request.params, &["container_name", "name"])?;
    let actor = request.actor;

    match state.regenerator.regenerate_session(actor, name).await {
        Ok(outcome) => {
            info!(actor, instance = %outcome.instance_name, "ssh session regenerated");
            Ok(json!({
                "ok": true,
                "message": "SSH session regenerated. Check your DMs for details.",
                "instance_name": outcome.instance_name,
                "delivery": outcome.delivery,
            }))
        }
        Err(SessionError::NotFound { known, .. }) => Ok(json!({
            "ok": false,
            "error": "No active instance found with that name.",
            "entries": known.iter().filter_map(|r| r.to_line().ok()).collect::<Vec<_>>(),
        })),
        Err(e @ SessionError::ProcessLaunch { .. }) => Ok(json!({
            "ok": false,
            "error": format!("Failed to run tmate: {e}"),
        })),
        Err(e @ (SessionError::CaptureFailed | SessionError::CaptureTimeout(_))) => Ok(json!({
            "ok": false,
            "error": "Could not generate a new SSH session. Make sure `tmate` is installed inside the container.",
            "reason": e.to_string(),
        })),
        Err(SessionError::Store(e)) => Err(format!("vps.regen_ssh store error: {e}").into()),
    }
}
