//! Command dispatch for bot invocations
//!
//! Routes a chat command (already authenticated by the gateway, carrying the
//! invoking user as `actor`) to the instance, session and admin handlers.

use crate::SharedState;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use vps_store::UserId;

/// Every command this node answers.
pub const COMMANDS: &[&str] = &[
    "ping",
    "node.commands",
    "vps.list",
    "vps.regen_ssh",
    "instance.add",
    "instance.forget",
    "backup.list",
    "backup.create",
    "backup.restore",
];

/// Command request from the gateway
#[derive(Debug, Clone, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    pub actor: UserId,
    #[serde(default)]
    pub params: Value,
}

/// Command error type
pub type CommandError = Box<dyn std::error::Error + Send + Sync>;

/// Handle an incoming command.
pub async fn handle_command(
    state: &SharedState,
    request: CommandRequest,
) -> Result<Value, CommandError> {
    debug!(command = %request.command, actor = request.actor, "handling command");

    match request.command.as_str() {
        "ping" => Ok(serde_json::json!({ "ok": true, "message": "Pong!" })),
        "node.commands" => Ok(serde_json::json!({ "ok": true, "commands": state.commands })),

        // ── Instances ─────────────────────────────────────────────────────
        "vps.list" => crate::vps_cmd::handle_vps_list(state, request.actor).await,
        "vps.regen_ssh" => crate::vps_cmd::handle_regen_ssh(state, request).await,

        // ── Admin ─────────────────────────────────────────────────────────
        "instance.add" | "instance.forget" | "backup.list" | "backup.create"
        | "backup.restore" => crate::admin_cmd::handle_admin_command(state, request).await,

        unknown => Err(format!("unknown command: {unknown}").into()),
    }
}

/// Required string parameter, accepting any of `keys`.
pub(crate) fn str_param<'a>(params: &'a Value, keys: &[&str]) -> Result<&'a str, CommandError> {
    keys.iter()
        .find_map(|k| params.get(*k).and_then(|v| v.as_str()))
        .ok_or_else(|| format!("missing '{}'", keys[0]).into())
}
