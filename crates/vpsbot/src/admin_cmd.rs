//! Admin command handlers: record edits and store backups

use crate::SharedState;
use crate::commands::{CommandError, CommandRequest, str_param};
use serde_json::{json, Value};
use tracing::{info, warn};
use vps_store::{backup::backup_name, BackupPage, InstanceRecord, StoreError};

pub async fn handle_admin_command(
    state: &SharedState,
    request: CommandRequest,
) -> Result<Value, CommandError> {
    if !state.is_admin(request.actor) {
        warn!(actor = request.actor, command = %request.command, "admin command denied");
        return Err("Access Denied".into());
    }

    match request.command.as_str() {
        "instance.add" => {
            let params = &request.params;
            let owner_id = params
                .get("owner_id")
                .and_then(|v| v.as_u64())
                .ok_or("missing 'owner_id'")?;
            let name = str_param(params, &["instance_name", "name"])?;

            let mut record = InstanceRecord::new(owner_id, name);
            record.creator_id = request.actor.to_string();
            let optional = |key: &str| params.get(key).and_then(|v| v.as_str()).map(String::from);
            if let Some(v) = optional("session_command") {
                record.session_command = v;
            }
            if let Some(v) = optional("ram_limit") {
                record.ram_limit = v;
            }
            if let Some(v) = optional("cpu_limit") {
                record.cpu_limit = v;
            }
            if let Some(v) = optional("os_label") {
                record.os_label = v;
            }
            if let Some(v) = optional("expiry") {
                record.expiry = v;
            }

            state
                .store
                .append(&record)
                .await
                .map_err(|e| format!("instance.add error: {e}"))?;
            info!(actor = request.actor, owner_id, instance = %name, "instance record added");

            Ok(json!({ "ok": true, "record": record }))
        }

        "instance.forget" => {
            let prefix = str_param(&request.params, &["prefix", "instance_name", "name"])?;
            let removed = state
                .store
                .remove(prefix)
                .await
                .map_err(|e| format!("instance.forget error: {e}"))?;
            info!(actor = request.actor, prefix, removed, "instance records removed");

            Ok(json!({ "ok": true, "removed": removed }))
        }

        "backup.list" => {
            let page = request
                .params
                .get("page")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as usize;
            let backups = state
                .store
                .backups()
                .await
                .map_err(|e| format!("backup.list error: {e}"))?;

            if backups.is_empty() {
                return Ok(json!({ "ok": false, "error": "No backups found." }));
            }
            Ok(json!({ "ok": true, "backups": BackupPage::new(&backups, page) }))
        }

        "backup.create" => {
            let path = state
                .store
                .backup_now()
                .await
                .map_err(|e| format!("backup.create error: {e}"))?;
            Ok(json!({ "ok": true, "backup": backup_name(&path) }))
        }

        "backup.restore" => {
            let name = request.params.get("name").and_then(|v| v.as_str());
            match state.store.restore_backup(name).await {
                Ok(path) => {
                    info!(actor = request.actor, backup = %path.display(), "store restored");
                    Ok(json!({ "ok": true, "restored": backup_name(&path) }))
                }
                Err(StoreError::NoBackups) => Ok(json!({ "ok": false, "error": "No backups found." })),
                Err(e @ StoreError::UnknownBackup(_)) => {
                    Ok(json!({ "ok": false, "error": e.to_string() }))
                }
                Err(e) => Err(format!("backup.restore error: {e}").into()),
            }
        }

        other => Err(format!("unknown admin command: {other}").into()),
    }
}
