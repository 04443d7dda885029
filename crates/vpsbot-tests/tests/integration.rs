//! End-to-end tests across the store, session and bot crates.
//!
//! Helpers are scripted with [`ScriptedRunner`] so no container runtime is
//! needed; private messages land in a [`RecordingDelivery`].

use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use vps_session::{DeliveryStatus, HelperSettings, SessionError, SessionRegenerator};
use vps_store::{
    InstanceRecord, InstanceStore, MigrationOutcome, RecordField, StaticResolver, StoreError,
};
use vpsbot::commands::{handle_command, CommandRequest};
use vpsbot::{BotConfig, SharedState};
use vpsbot_tests::{RecordingDelivery, Script, ScriptedRunner};

const WEB1: &str = "5|web1|old-cmd|2048|1|5|Ubuntu 22.04|None";
const WEB2: &str = "5|web2|other-cmd|4096|2|5|Ubuntu 22.04|None";
const OTHER: &str = "7|db1|db-cmd|1024|1|1|Debian 12|2026-12-31";

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn seed(dir: &Path, lines: &[&str]) -> PathBuf {
    let path = dir.join("database.txt");
    let mut body = lines.join("\n");
    body.push('\n');
    std::fs::write(&path, body).expect("seed store");
    path
}

async fn open(path: &Path) -> InstanceStore {
    let (store, _) = InstanceStore::open(path.to_path_buf(), &StaticResolver::default())
        .await
        .expect("open store");
    store
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).expect("read store")
}

fn fast_settings() -> HelperSettings {
    HelperSettings {
        capture_timeout_secs: 1,
        exit_grace_secs: 1,
        ..HelperSettings::default()
    }
}

fn regenerator(
    store: Arc<InstanceStore>,
    runner: Arc<ScriptedRunner>,
    delivery: Arc<RecordingDelivery>,
) -> SessionRegenerator {
    SessionRegenerator::new(store, runner, delivery, fast_settings())
}

fn request(command: &str, actor: u64, params: serde_json::Value) -> CommandRequest {
    CommandRequest {
        command: command.to_string(),
        actor,
        params,
    }
}

async fn bot(dir: &Path, runner: ScriptedRunner) -> SharedState {
    let mut config = BotConfig::rooted_at(dir);
    config.admin_ids = vec![1];
    config.helper = fast_settings();
    let store = open(&config.database_file).await;
    SharedState::with_collaborators(
        config,
        store,
        Arc::new(runner),
        Arc::new(RecordingDelivery::new()),
    )
}

// ─── Test 1: Record round-trip ────────────────────────────────────────────────

#[tokio::test]
async fn test_append_then_list_preserves_every_field() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = open(&dir.path().join("database.txt")).await;

    let mut record = InstanceRecord::new(5, "web1");
    record.session_command = "ssh abc@host".to_string();
    record.ram_limit = "4096".to_string();
    record.cpu_limit = "2".to_string();
    record.creator_id = "1".to_string();
    record.os_label = "Debian 12".to_string();
    record.expiry = "2026-12-31".to_string();
    store.append(&record).await.expect("append");

    let listed = store.list_for_owner(5).await;
    assert_eq!(listed, vec![record]);
    assert!(store.list_for_owner(6).await.is_empty());
}

// ─── Test 2: Idempotent migration ─────────────────────────────────────────────

#[tokio::test]
async fn test_migration_twice_on_numeric_store_is_byte_identical() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = seed(dir.path(), &[WEB1, WEB2, OTHER]);
    let original = read(&path);

    let (store, first) = InstanceStore::open(path.clone(), &StaticResolver::default())
        .await
        .expect("first open");
    assert_eq!(first.outcome, MigrationOutcome::AlreadyMigrated);
    store.close().await;
    let after_first = read(&path);

    let (store, second) = InstanceStore::open(path.clone(), &StaticResolver::default())
        .await
        .expect("second open");
    assert_eq!(second.outcome, MigrationOutcome::AlreadyMigrated);
    store.close().await;

    assert_eq!(after_first, original);
    assert_eq!(read(&path), after_first);
}

// ─── Test 3: Removal isolation ────────────────────────────────────────────────

#[tokio::test]
async fn test_remove_by_prefix_leaves_other_lines_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let third = "5|web3|c|1|1|5|Ubuntu 22.04|None";
    let path = seed(dir.path(), &[OTHER, WEB1, "8|x|y|1|1|1|z|None", WEB2, third]);
    let store = open(&path).await;

    let removed = store.remove("5|").await.expect("remove");
    assert_eq!(removed, 3);
    assert_eq!(read(&path), format!("{OTHER}\n8|x|y|1|1|1|z|None\n"));
}

// ─── Test 4: Field update precision ───────────────────────────────────────────

#[tokio::test]
async fn test_update_changes_one_field_on_one_line() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = seed(dir.path(), &[WEB1, WEB2, OTHER]);
    let store = open(&path).await;

    store
        .update_field(5, "web2", RecordField::RamLimit, "8192")
        .await
        .expect("update");

    assert_eq!(
        read(&path),
        format!("{WEB1}\n5|web2|other-cmd|8192|2|5|Ubuntu 22.04|None\n{OTHER}\n")
    );

    let missing = store
        .update_field(5, "web9", RecordField::RamLimit, "1")
        .await;
    assert!(matches!(missing, Err(StoreError::NotFound { owner_id: 5, .. })));
}

// ─── Test 4b: Concurrent writers ──────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_lose_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let seeded: Vec<String> = (0..10)
        .map(|i| format!("5|seed{i}|old|2048|1|5|Ubuntu 22.04|None"))
        .collect();
    let refs: Vec<&str> = seeded.iter().map(String::as_str).collect();
    let path = seed(dir.path(), &refs);
    let store = Arc::new(open(&path).await);

    let mut tasks = Vec::new();
    for i in 0..10 {
        let updater = store.clone();
        tasks.push(tokio::spawn(async move {
            let name = format!("seed{i}");
            let command = format!("ssh {i}@host");
            updater
                .update_field(5, &name, RecordField::SessionCommand, &command)
                .await
        }));
        let appender = store.clone();
        tasks.push(tokio::spawn(async move {
            appender.append(&InstanceRecord::new(6, format!("new{i}"))).await
        }));
    }
    for task in tasks {
        task.await.expect("join").expect("write");
    }

    let owner5 = store.list_for_owner(5).await;
    assert_eq!(owner5.len(), 10);
    for (i, record) in owner5.iter().enumerate() {
        assert_eq!(record.instance_name, format!("seed{i}"));
        assert_eq!(record.session_command, format!("ssh {i}@host"));
    }

    let mut added: Vec<String> = store
        .list_for_owner(6)
        .await
        .into_iter()
        .map(|r| r.instance_name)
        .collect();
    added.sort();
    let mut expected: Vec<String> = (0..10).map(|i| format!("new{i}")).collect();
    expected.sort();
    assert_eq!(added, expected);
    assert_eq!(read(&path).lines().count(), 20);
}

// ─── Test 5: Lookup fallback ──────────────────────────────────────────────────

#[tokio::test]
async fn test_find_without_name_returns_first_in_file_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = seed(dir.path(), &[OTHER, WEB2, WEB1]);
    let store = open(&path).await;

    let first = store.find_instance(5, None).await.expect("first record");
    assert_eq!(first.instance_name, "web2");
    assert!(store.find_instance(9, None).await.is_none());
}

// ─── Test 6: web1 / web2 scenario ─────────────────────────────────────────────

#[tokio::test]
async fn test_find_then_remove_web1() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = seed(dir.path(), &[WEB1, WEB2]);
    let store = open(&path).await;

    let found = store.find_instance(5, Some("web2")).await.expect("web2");
    assert_eq!(found.to_line().expect("line"), WEB2);

    assert_eq!(store.remove("web1").await.expect("remove"), 1);
    assert_eq!(read(&path), format!("{WEB2}\n"));
}

// ─── Test 7: Legacy owner migration ───────────────────────────────────────────

#[tokio::test]
async fn test_legacy_owner_is_rewritten_and_backed_up() {
    let dir = tempfile::tempdir().expect("tempdir");
    let legacy = "alice#1234|web1|old-cmd|2048|1|alice#1234|Ubuntu 22.04|None";
    let path = seed(dir.path(), &[legacy, WEB2]);
    let original = read(&path);

    let resolver = StaticResolver::default().with("alice#1234", 42);
    let (store, report) = InstanceStore::open(path.clone(), &resolver)
        .await
        .expect("open");

    assert_eq!(report.outcome, MigrationOutcome::Migrated);
    assert_eq!(report.migrated, 1);
    assert!(report.unresolved.is_empty());

    let migrated = read(&path);
    let first_line = migrated.lines().next().expect("first line");
    assert_eq!(first_line.split('|').next(), Some("42"));
    assert_eq!(store.find_instance(42, Some("web1")).await.map(|r| r.owner_id), Some(42));

    let backup = report.backup.expect("backup taken");
    assert!(backup.exists());
    assert_eq!(read(&backup), original);
    assert_eq!(store.backups().await.expect("backups"), vec![backup.clone()]);

    // An immediate snapshot must not replace the pre-migration one.
    let fresh = store.backup_now().await.expect("backup now");
    assert_ne!(fresh, backup);
    assert_eq!(read(&backup), original);
    assert_eq!(read(&fresh), migrated);
    assert_eq!(store.backups().await.expect("backups").len(), 2);
}

#[tokio::test]
async fn test_unresolved_legacy_owner_is_left_for_next_start() {
    let dir = tempfile::tempdir().expect("tempdir");
    let legacy = "bob#0001|web1|old-cmd|2048|1|1|Ubuntu 22.04|None";
    let path = seed(dir.path(), &[legacy]);

    let (_store, report) = InstanceStore::open(path.clone(), &StaticResolver::default())
        .await
        .expect("open");

    assert_eq!(report.outcome, MigrationOutcome::AlreadyMigrated);
    assert_eq!(report.unresolved, vec!["bob#0001".to_string()]);
    assert_eq!(read(&path), format!("{legacy}\n"));
}

// ─── Test 8: Session capture ──────────────────────────────────────────────────

#[tokio::test]
async fn test_regenerate_stores_exact_session_line() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = seed(dir.path(), &[WEB1, WEB2]);
    let store = Arc::new(open(&path).await);
    let runner = Arc::new(ScriptedRunner::lines(&["starting...", "ssh session: ssh abc@host"]));
    let delivery = Arc::new(RecordingDelivery::new());
    let regen = regenerator(store.clone(), runner.clone(), delivery.clone());

    let outcome = regen.regenerate_session(5, "web1").await.expect("regenerate");
    assert_eq!(outcome.session_command, "ssh session: ssh abc@host");
    assert_eq!(outcome.delivery, DeliveryStatus::Delivered);

    let record = store.find_instance(5, Some("web1")).await.expect("web1");
    assert_eq!(record.session_command, "ssh session: ssh abc@host");
    assert_eq!(
        read(&path),
        format!("5|web1|ssh session: ssh abc@host|2048|1|5|Ubuntu 22.04|None\n{WEB2}\n")
    );

    let spawned = runner.spawned();
    assert_eq!(spawned.len(), 1);
    assert_eq!(spawned[0].0, "docker");
    assert_eq!(spawned[0].1, vec!["exec", "web1", "tmate", "-F"]);
    assert_eq!(runner.detached(), 1);

    let sent = delivery.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, 5);
    assert!(sent[0].1.contains("ssh session: ssh abc@host"));
}

#[tokio::test]
async fn test_helper_without_session_line_leaves_store_unchanged() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = seed(dir.path(), &[WEB1, WEB2]);
    let before = read(&path);
    let store = Arc::new(open(&path).await);
    let runner = Arc::new(ScriptedRunner::lines(&["starting...", "tmate: no server"]));
    let delivery = Arc::new(RecordingDelivery::new());
    let regen = regenerator(store, runner, delivery.clone());

    let result = regen.regenerate_session(5, "web1").await;
    assert!(matches!(result, Err(SessionError::CaptureFailed)));
    assert_eq!(read(&path), before);
    assert!(delivery.sent().is_empty());
}

// ─── Test 9: Session failure paths ────────────────────────────────────────────

#[tokio::test]
async fn test_silent_helper_times_out_and_is_killed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = seed(dir.path(), &[WEB1]);
    let before = read(&path);
    let store = Arc::new(open(&path).await);
    let runner = Arc::new(ScriptedRunner::new(Script::Hang));
    let regen = regenerator(store, runner.clone(), Arc::new(RecordingDelivery::new()));

    let result = regen.regenerate_session(5, "web1").await;
    assert!(matches!(result, Err(SessionError::CaptureTimeout(_))));
    assert_eq!(runner.killed(), 1);
    assert_eq!(read(&path), before);
}

#[tokio::test]
async fn test_launch_failure_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = seed(dir.path(), &[WEB1]);
    let store = Arc::new(open(&path).await);
    let runner = Arc::new(ScriptedRunner::new(Script::LaunchFailure));
    let regen = regenerator(store, runner, Arc::new(RecordingDelivery::new()));

    match regen.regenerate_session(5, "web1").await {
        Err(SessionError::ProcessLaunch { program, .. }) => assert_eq!(program, "docker"),
        other => panic!("expected launch failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unknown_instance_lists_known_records() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = seed(dir.path(), &[WEB1, WEB2]);
    let store = Arc::new(open(&path).await);
    let runner = Arc::new(ScriptedRunner::lines(&["ssh abc@host"]));
    let regen = regenerator(store, runner.clone(), Arc::new(RecordingDelivery::new()));

    match regen.regenerate_session(5, "web9").await {
        Err(SessionError::NotFound { known, .. }) => assert_eq!(known.len(), 2),
        other => panic!("expected not found, got {other:?}"),
    }
    assert!(runner.spawned().is_empty());
}

#[tokio::test]
async fn test_delivery_failure_keeps_stored_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = seed(dir.path(), &[WEB1]);
    let store = Arc::new(open(&path).await);
    let runner = Arc::new(ScriptedRunner::lines(&["ssh abc@host"]));
    let delivery = Arc::new(RecordingDelivery::failing("DMs closed"));
    let regen = regenerator(store.clone(), runner, delivery);

    let outcome = regen.regenerate_session(5, "web1").await.expect("regenerate");
    assert_eq!(outcome.delivery, DeliveryStatus::Failed("DMs closed".to_string()));
    let record = store.find_instance(5, Some("web1")).await.expect("web1");
    assert_eq!(record.session_command, "ssh abc@host");
}

// ─── Test 10: Bot commands ────────────────────────────────────────────────────

#[tokio::test]
async fn test_admin_commands_are_gated() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = bot(dir.path(), ScriptedRunner::lines(&[])).await;

    for command in ["instance.add", "instance.forget", "backup.list", "backup.create", "backup.restore"] {
        let err = handle_command(&state, request(command, 5, json!({})))
            .await
            .expect_err("non-admin must be denied");
        assert_eq!(err.to_string(), "Access Denied");
    }
}

#[tokio::test]
async fn test_add_regen_and_list_through_commands() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = bot(dir.path(), ScriptedRunner::lines(&["ssh new@host"])).await;

    let added = handle_command(
        &state,
        request("instance.add", 1, json!({"owner_id": 5, "instance_name": "web1"})),
    )
    .await
    .expect("add");
    assert_eq!(added["ok"], true);
    assert_eq!(added["record"]["creator_id"], "1");

    let regen = handle_command(
        &state,
        request("vps.regen_ssh", 5, json!({"container_name": "web1"})),
    )
    .await
    .expect("regen");
    assert_eq!(regen["ok"], true);
    assert_eq!(regen["delivery"]["status"], "delivered");
    assert!(regen.get("session_command").is_none());

    let missing = handle_command(
        &state,
        request("vps.regen_ssh", 5, json!({"container_name": "nope"})),
    )
    .await
    .expect("regen missing");
    assert_eq!(missing["ok"], false);
    assert_eq!(missing["entries"].as_array().map(Vec::len), Some(1));

    let record = state.store.find_instance(5, Some("web1")).await.expect("web1");
    assert_eq!(record.session_command, "ssh new@host");
}

#[tokio::test]
async fn test_backup_create_list_and_restore() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = bot(dir.path(), ScriptedRunner::lines(&[])).await;

    let empty = handle_command(&state, request("backup.list", 1, json!({})))
        .await
        .expect("list");
    assert_eq!(empty["ok"], false);
    assert_eq!(empty["error"], "No backups found.");

    state
        .store
        .append(&InstanceRecord::new(5, "web1"))
        .await
        .expect("append");
    let created = handle_command(&state, request("backup.create", 1, json!({})))
        .await
        .expect("create");
    assert_eq!(created["ok"], true);
    let name = created["backup"].as_str().expect("backup name").to_string();

    state.store.remove("web1").await.expect("remove");
    assert!(state.store.list_for_owner(5).await.is_empty());

    let listed = handle_command(&state, request("backup.list", 1, json!({"page": 0})))
        .await
        .expect("list");
    assert_eq!(listed["backups"]["total"], 1);
    assert_eq!(listed["backups"]["names"][0], name.as_str());

    let restored = handle_command(&state, request("backup.restore", 1, json!({"name": name})))
        .await
        .expect("restore");
    assert_eq!(restored["ok"], true);
    assert_eq!(state.store.list_for_owner(5).await.len(), 1);

    let unknown = handle_command(
        &state,
        request("backup.restore", 1, json!({"name": "database.txt.backup_19700101_000000"})),
    )
    .await
    .expect("restore unknown");
    assert_eq!(unknown["ok"], false);
}

#[tokio::test]
async fn test_second_open_on_same_store_is_locked() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = seed(dir.path(), &[WEB1]);
    let first = open(&path).await;

    let second = InstanceStore::open(path.clone(), &StaticResolver::default()).await;
    assert!(matches!(second, Err(StoreError::Locked(_))));

    first.close().await;
    let reopened = InstanceStore::open(path, &StaticResolver::default()).await;
    assert!(reopened.is_ok());
}
