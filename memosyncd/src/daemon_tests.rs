use std::time::Duration;

use memosync_core::{ItemStatus, SessionCookies};
use tempfile::{TempDir, tempdir};
use tokio::sync::oneshot;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;
use crate::config::ProviderKind;
use crate::provider::FolderProvider;
use crate::sync::reconciler::PassPhase;
use crate::vault::StatTimes;

fn folder_config(root: &Path, remote_dir: &Path) -> DaemonConfig {
    let data_dir = root.join("data");
    DaemonConfig {
        vault_dir: root.join("vault"),
        db_path: data_dir.join("changes.db"),
        data_dir,
        provider: ProviderKind::Folder,
        folder_name: "Notes".to_string(),
        base_url: "http://127.0.0.1:9".to_string(),
        session: None,
        remote_dir: Some(remote_dir.to_path_buf()),
        sync_interval: Duration::from_secs(300),
        debounce: Duration::from_secs(10),
        lock_settle: Duration::ZERO,
        enable_watcher: false,
    }
}

async fn remote_with_group(group: &str) -> TempDir {
    let dir = tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join(group)).unwrap();
    dir
}

#[tokio::test]
async fn local_change_reaches_a_second_vault() {
    let remote = remote_with_group("Notes").await;
    let first_root = tempdir().unwrap();
    let second_root = tempdir().unwrap();
    let first = DaemonRuntime::bootstrap(folder_config(first_root.path(), remote.path()))
        .await
        .unwrap();
    let second = DaemonRuntime::bootstrap(folder_config(second_root.path(), remote.path()))
        .await
        .unwrap();

    let file = first
        .engine()
        .vault()
        .create_binary("daily/today.md", b"# today", StatTimes { c_time: 5, m_time: 5_000 })
        .await
        .unwrap();
    first
        .engine()
        .change_log()
        .record_change(
            &Item::new("daily/today.md", ItemStatus::Created, 5, file.stat.m_time)
                .with_size(file.stat.size),
        )
        .await
        .unwrap();

    let pushed = first.sync_once().await.unwrap();
    assert_eq!(pushed.uploaded, 1);

    let pulled = second.sync_once().await.unwrap();
    assert_eq!(pulled.downloaded, 1);
    let copy = second
        .engine()
        .vault()
        .get_file_by_path("daily/today.md")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(copy.stat.m_time, 5_000);
    assert_eq!(
        second.engine().vault().read_binary(&copy).await.unwrap(),
        b"# today"
    );

    // Neither side has anything left to do.
    assert_eq!(first.sync_once().await.unwrap().mutations(), 0);
    assert_eq!(second.sync_once().await.unwrap().mutations(), 0);
}

fn scheduled_config(root: &Path, remote_dir: &Path) -> DaemonConfig {
    let mut config = folder_config(root, remote_dir);
    config.sync_interval = Duration::from_secs(3600);
    config.debounce = Duration::from_millis(50);
    config
}

async fn record_note(engine: &SyncEngine, key: &str) {
    let file = engine
        .vault()
        .create_binary(key, b"note", StatTimes { c_time: 1, m_time: 1_000 })
        .await
        .unwrap();
    engine
        .change_log()
        .record_change(&Item::new(key, ItemStatus::Created, 1, 1_000).with_size(file.stat.size))
        .await
        .unwrap();
}

/// Polls until a pass that started after `after` has pushed every pending change.
async fn synced_since(engine: &SyncEngine, after: i64) -> bool {
    for _ in 0..100 {
        let stamped = engine.change_log().last_sync_time().await.unwrap();
        if stamped.is_some_and(|time| time > after)
            && engine.change_log().pending_count().await.unwrap() == 0
            && engine.phase() == PassPhase::Done
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn spawn_until_stopped(
    runtime: DaemonRuntime,
) -> (oneshot::Sender<()>, JoinHandle<anyhow::Result<()>>) {
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(runtime.run_until(async move {
        let _ = stopped.await;
        Ok(())
    }));
    (stop, task)
}

#[tokio::test]
async fn persisted_last_sync_defers_startup_pass_until_an_edit() {
    let remote = remote_with_group("Notes").await;
    let root = tempdir().unwrap();
    let runtime = DaemonRuntime::bootstrap(scheduled_config(root.path(), remote.path()))
        .await
        .unwrap();
    let engine = Arc::clone(runtime.engine());
    let seeded = now_millis();
    engine.change_log().set_last_sync_time(seeded).await.unwrap();
    record_note(&engine, "a.md").await;
    let edits = runtime.edit_tx.clone();
    let (stop, task) = spawn_until_stopped(runtime);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(engine.change_log().pending_count().await.unwrap(), 1);
    assert_eq!(engine.change_log().last_sync_time().await.unwrap(), Some(seeded));

    edits.send(now_millis()).unwrap();
    assert!(synced_since(&engine, seeded).await);
    assert!(remote.path().join("Notes/a.md").exists());

    stop.send(()).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn edit_during_a_held_gate_runs_once_the_gate_is_free() {
    let remote = remote_with_group("Notes").await;
    let root = tempdir().unwrap();
    let runtime = DaemonRuntime::bootstrap(scheduled_config(root.path(), remote.path()))
        .await
        .unwrap();
    let engine = Arc::clone(runtime.engine());
    let seeded = now_millis();
    engine.change_log().set_last_sync_time(seeded).await.unwrap();
    record_note(&engine, "a.md").await;
    let gate = runtime.gate.clone();
    let ticket = gate.try_begin().unwrap();
    let edits = runtime.edit_tx.clone();
    let (stop, task) = spawn_until_stopped(runtime);

    edits.send(now_millis()).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(engine.change_log().pending_count().await.unwrap(), 1);

    // The due pass was refused, not forgotten: no new edit or trigger is needed.
    drop(ticket);
    assert!(synced_since(&engine, seeded).await);

    stop.send(()).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn manual_trigger_is_dropped_while_a_pass_holds_the_gate() {
    let remote = remote_with_group("Notes").await;
    let root = tempdir().unwrap();
    let runtime = DaemonRuntime::bootstrap(scheduled_config(root.path(), remote.path()))
        .await
        .unwrap();
    let engine = Arc::clone(runtime.engine());
    let seeded = now_millis();
    engine.change_log().set_last_sync_time(seeded).await.unwrap();
    record_note(&engine, "a.md").await;
    let gate = runtime.gate.clone();
    let ticket = gate.try_begin().unwrap();
    let trigger = runtime.trigger_handle();
    let (stop, task) = spawn_until_stopped(runtime);

    trigger.send(()).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(engine.change_log().pending_count().await.unwrap(), 1);
    assert_eq!(engine.change_log().last_sync_time().await.unwrap(), Some(seeded));

    drop(ticket);
    trigger.send(()).unwrap();
    assert!(synced_since(&engine, seeded).await);

    stop.send(()).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn first_run_without_history_syncs_immediately() {
    let remote = remote_with_group("Notes").await;
    let root = tempdir().unwrap();
    let runtime = DaemonRuntime::bootstrap(scheduled_config(root.path(), remote.path()))
        .await
        .unwrap();
    let engine = Arc::clone(runtime.engine());
    record_note(&engine, "a.md").await;
    let (stop, task) = spawn_until_stopped(runtime);

    assert!(synced_since(&engine, 0).await);

    stop.send(()).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn missing_folder_is_reported() {
    let remote = remote_with_group("Other").await;
    let root = tempdir().unwrap();
    let runtime = DaemonRuntime::bootstrap(folder_config(root.path(), remote.path()))
        .await
        .unwrap();

    let err = runtime.sync_once().await.unwrap_err();
    assert!(matches!(err, SyncError::FolderNotFound(name) if name == "Notes"));
}

#[tokio::test]
async fn concurrent_pass_is_refused() {
    let remote = remote_with_group("Notes").await;
    let root = tempdir().unwrap();
    let runtime = DaemonRuntime::bootstrap(folder_config(root.path(), remote.path()))
        .await
        .unwrap();

    let _ticket = runtime.gate.try_begin().unwrap();
    assert!(matches!(runtime.sync_once().await, Err(SyncError::Busy)));
}

#[tokio::test]
async fn status_lists_pending_changes() {
    let remote = remote_with_group("Notes").await;
    let root = tempdir().unwrap();
    let runtime = DaemonRuntime::bootstrap(folder_config(root.path(), remote.path()))
        .await
        .unwrap();
    runtime
        .engine()
        .change_log()
        .record_change(&Item::new("a.md", ItemStatus::Updated, 1, 2))
        .await
        .unwrap();

    let status = runtime.status().await.unwrap();
    assert_eq!(status.pending.len(), 1);
    assert_eq!(status.last_sync_time, None);
}

#[tokio::test]
async fn expired_session_skips_reconciliation() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let root = tempdir().unwrap();
    let mut config = folder_config(root.path(), root.path());
    config.provider = ProviderKind::Memo;
    config.base_url = server.uri();
    config.session = Some(SessionCookies {
        nid_aut: "aut".into(),
        nid_ses: "ses".into(),
    });
    let runtime = DaemonRuntime::bootstrap(config).await.unwrap();
    runtime
        .engine()
        .change_log()
        .record_change(&Item::new("a.md", ItemStatus::Created, 1, 2))
        .await
        .unwrap();

    let err = runtime.sync_once().await.unwrap_err();

    assert!(matches!(err, SyncError::SessionExpired));
    assert_eq!(runtime.status().await.unwrap().pending.len(), 1);
}

#[tokio::test]
async fn memo_provider_requires_cookies() {
    let root = tempdir().unwrap();
    let mut config = folder_config(root.path(), root.path());
    config.provider = ProviderKind::Memo;
    let runtime = DaemonRuntime::bootstrap(config).await.unwrap();

    let err = runtime.sync_once().await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Provider(crate::provider::ProviderError::MissingSetting(_))
    ));
}

#[tokio::test]
async fn sync_with_provider_selects_group_by_name() {
    let remote = tempdir().unwrap();
    std::fs::create_dir_all(remote.path().join("Notes")).unwrap();
    std::fs::create_dir_all(remote.path().join("Archive")).unwrap();
    let mut provider = FolderProvider::new(remote.path());
    provider.set_group_id("Archive").unwrap();
    provider
        .upload_file(&Item::new("old.md", ItemStatus::Created, 1, 100), b"archived")
        .await
        .unwrap();

    let root = tempdir().unwrap();
    let engine = SyncEngine::new(
        ChangeLog::in_memory().await.unwrap(),
        Vault::new(root.path()),
        LockSet::new(Duration::ZERO),
    );
    let mut provider = FolderProvider::new(remote.path());

    let report = sync_with_provider(&mut provider, "Notes", &engine)
        .await
        .unwrap();

    assert_eq!(report.mutations(), 0);
    assert!(engine.vault().get_file_by_path("old.md").await.unwrap().is_none());
}

#[test]
fn saved_session_replaces_configured_cookie_for_same_account() {
    let root = tempdir().unwrap();
    let mut config = folder_config(root.path(), root.path());
    std::fs::create_dir_all(&config.data_dir).unwrap();
    config.session = Some(SessionCookies {
        nid_aut: "aut".into(),
        nid_ses: "stale".into(),
    });

    let saver = session_saver(config.session_path(), config.session.clone());
    saver("fresh");
    apply_saved_session(&mut config);

    assert_eq!(config.session.as_ref().unwrap().nid_ses, "fresh");
}

#[test]
fn saved_session_for_other_account_is_ignored() {
    let root = tempdir().unwrap();
    let mut config = folder_config(root.path(), root.path());
    std::fs::create_dir_all(&config.data_dir).unwrap();
    store_session(
        &config.session_path(),
        &SavedSession {
            nid_aut: "someone-else".into(),
            nid_ses: "theirs".into(),
        },
    )
    .unwrap();
    config.session = Some(SessionCookies {
        nid_aut: "aut".into(),
        nid_ses: "mine".into(),
    });

    apply_saved_session(&mut config);

    assert_eq!(config.session.as_ref().unwrap().nid_ses, "mine");
}
