//! Persistence integration tests.
//!
//! Verifies:
//! - A room restarted over the same snapshot directory serves the last content
//! - Providers reconnect across a server restart and keep offline edits
//! - Failing snapshot storage degrades a room instead of breaking it
//! - The client-side offline mirror seeds a provider before it connects

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tempfile::tempdir;
use tokio::time::{timeout, Duration};
use trellis_collab::{
    ConnectionStatus, DocumentId, EditOp, FileLocalStore, FileSnapshotStore, Identity, LocalStore,
    MemorySnapshotStore, OfflineConfig, OfflineHandle, ProviderConfig, RoomConfig, RoomHealth,
    RoomInfo, RoomRegistry, RunningServer, ServerConfig, SharedDocument, SnapshotStore,
    StorageBackend, StoreError, SyncMessage, SyncProvider, SyncServer, TextField,
};

const WAIT: Duration = Duration::from_secs(5);

fn file_config(dir: &std::path::Path) -> ServerConfig {
    ServerConfig {
        storage: StorageBackend::Files(dir.to_path_buf()),
        ..ServerConfig::for_testing()
    }
}

fn identity(name: &str) -> Identity {
    Identity::new(name, name, "#d19a66")
}

async fn synced(provider: &SyncProvider) {
    timeout(WAIT, provider.wait_for_status(ConnectionStatus::Synced))
        .await
        .expect("provider did not sync");
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let result = timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

async fn wait_for_info(
    registry: &RoomRegistry,
    id: &DocumentId,
    what: &str,
    check: impl Fn(&RoomInfo) -> bool,
) -> RoomInfo {
    let result = timeout(WAIT, async {
        loop {
            let info = registry.info(id).await;
            if check(&info) {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    result.unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

async fn room_body(server: &RunningServer, id: &DocumentId, expected: &str) {
    let room = server.registry().get(id).await.expect("room is running");
    timeout(WAIT, async {
        while room.content().await.unwrap().body != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("room body never became {expected:?}"));
}

/// Snapshot store whose first `fail_loads` loads and `fail_saves` saves fail.
struct FlakyStore {
    inner: MemorySnapshotStore,
    fail_loads: AtomicUsize,
    fail_saves: AtomicUsize,
}

impl FlakyStore {
    fn new(fail_loads: usize, fail_saves: usize) -> Self {
        Self {
            inner: MemorySnapshotStore::new(),
            fail_loads: AtomicUsize::new(fail_loads),
            fail_saves: AtomicUsize::new(fail_saves),
        }
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
    }
}

impl SnapshotStore for FlakyStore {
    fn load(&self, id: &DocumentId) -> Result<Option<Vec<u8>>, StoreError> {
        if Self::take_failure(&self.fail_loads) {
            return Err(StoreError::Io("storage offline".into()));
        }
        self.inner.load(id)
    }

    fn save(&self, id: &DocumentId, snapshot: &[u8]) -> Result<(), StoreError> {
        if Self::take_failure(&self.fail_saves) {
            return Err(StoreError::Io("storage offline".into()));
        }
        self.inner.save(id, snapshot)
    }

    fn delete(&self, id: &DocumentId) -> Result<(), StoreError> {
        self.inner.delete(id)
    }

    fn list(&self) -> Result<Vec<DocumentId>, StoreError> {
        self.inner.list()
    }
}

fn update_frame(text: &str) -> bytes::Bytes {
    let doc = SharedDocument::open(DocumentId::new("scratch").unwrap());
    let delta = doc.apply_local_edit(&EditOp::insert(TextField::Body, 0, text)).unwrap();
    SyncMessage::update(&delta).encode_frame().unwrap()
}

// ─── Server restarts ───

#[tokio::test]
async fn test_room_restart_restores_content() {
    let dir = tempdir().unwrap();
    let id = DocumentId::new("greeting").unwrap();

    let server = SyncServer::new(file_config(dir.path())).unwrap().spawn().await.unwrap();
    let mut writer = SyncProvider::open(id.clone(), ProviderConfig::for_testing(server.url()));
    writer.connect(identity("writer"));
    synced(&writer).await;
    writer.apply_local_edit(&EditOp::insert(TextField::Body, 0, "Hello")).unwrap();

    room_body(&server, &id, "Hello").await;
    let info = wait_for_info(server.registry(), &id, "snapshot of Hello", |info| {
        !info.dirty && info.persisted_version.is_some()
    })
    .await;
    assert_eq!(info.health, RoomHealth::Ready);
    writer.disconnect().await;
    server.shutdown().await.unwrap();

    let store = FileSnapshotStore::open(dir.path()).unwrap();
    assert_eq!(store.list().unwrap(), vec![id.clone()]);

    let server = SyncServer::new(file_config(dir.path())).unwrap().spawn().await.unwrap();
    let mut reader = SyncProvider::open(id.clone(), ProviderConfig::for_testing(server.url()));
    reader.connect(identity("reader"));
    synced(&reader).await;
    assert_eq!(reader.document().text(TextField::Body), "Hello");

    reader.disconnect().await;
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_provider_survives_server_restart() {
    let dir = tempdir().unwrap();
    let id = DocumentId::new("restart").unwrap();

    let server = SyncServer::new(file_config(dir.path())).unwrap().spawn().await.unwrap();
    let addr = server.local_addr();
    let mut a = SyncProvider::open(id.clone(), ProviderConfig::for_testing(server.url()));
    a.connect(identity("a"));
    synced(&a).await;
    a.apply_local_edit(&EditOp::insert(TextField::Body, 0, "Hello")).unwrap();
    room_body(&server, &id, "Hello").await;
    wait_for_info(server.registry(), &id, "room to persist", |info| !info.dirty).await;

    server.shutdown().await.unwrap();
    timeout(WAIT, a.wait_for_status(ConnectionStatus::Disconnected)).await.unwrap();
    a.apply_local_edit(&EditOp::insert(TextField::Body, 5, " again")).unwrap();

    let config = ServerConfig { bind_addr: addr.to_string(), ..file_config(dir.path()) };
    let server = SyncServer::new(config).unwrap().spawn().await.unwrap();
    synced(&a).await;

    let mut b = SyncProvider::open(id.clone(), ProviderConfig::for_testing(server.url()));
    b.connect(identity("b"));
    synced(&b).await;
    eventually("b to see the offline edit", || {
        b.document().text(TextField::Body) == "Hello again"
    })
    .await;

    a.disconnect().await;
    b.disconnect().await;
    server.shutdown().await.unwrap();
}

// ─── Storage failures ───

#[tokio::test]
async fn test_failing_load_degrades_then_recovers() {
    let flaky = Arc::new(FlakyStore::new(6, 0));
    let store: Arc<dyn SnapshotStore> = flaky.clone();
    let registry = RoomRegistry::new(store, RoomConfig::for_testing());
    let id = DocumentId::new("flaky").unwrap();

    let mut registration = registry.connect(&id).await.unwrap();
    let info = registry.info(&id).await;
    assert_eq!(info.health, RoomHealth::Degraded);
    assert!(info.persist_failures >= 2);

    // Edits keep flowing while storage is down.
    registration.session.send(update_frame("kept")).await.unwrap();
    let sync = timeout(WAIT, registration.outbound.recv()).await.unwrap().unwrap();
    assert!(matches!(SyncMessage::decode(&sync).unwrap(), SyncMessage::Sync { .. }));

    wait_for_info(&registry, &id, "storage to recover", |info| {
        info.health == RoomHealth::Ready && !info.dirty
    })
    .await;
    let saved = flaky.inner.load(&id).unwrap().expect("snapshot written after recovery");
    assert!(!saved.is_empty());

    registration.session.release().await;
    registry.shutdown_all().await;
}

#[tokio::test]
async fn test_failing_save_retries() {
    let flaky = Arc::new(FlakyStore::new(0, 2));
    let store: Arc<dyn SnapshotStore> = flaky.clone();
    let registry = RoomRegistry::new(store, RoomConfig::for_testing());
    let id = DocumentId::new("retry").unwrap();

    let registration = registry.connect(&id).await.unwrap();
    registration.session.send(update_frame("retry me")).await.unwrap();

    let info = wait_for_info(&registry, &id, "snapshot write to succeed", |info| {
        info.updates_applied == 1 && !info.dirty
    })
    .await;
    assert_eq!(info.persist_failures, 2);
    assert_eq!(info.health, RoomHealth::Ready);
    assert!(flaky.inner.load(&id).unwrap().is_some());

    registration.session.release().await;
    registry.shutdown_all().await;
}

// ─── Client-side mirror ───

#[tokio::test]
async fn test_offline_mirror_seeds_provider_before_sync() {
    let server_dir = tempdir().unwrap();
    let local_dir = tempdir().unwrap();
    let id = DocumentId::new("mirror").unwrap();
    let local: Arc<dyn LocalStore> = Arc::new(FileLocalStore::open(local_dir.path()).unwrap());

    // First session: edit without ever reaching a server.
    {
        let document = SharedDocument::open(id.clone());
        let handle = OfflineHandle::open(document.clone(), local.clone(), OfflineConfig::default())
            .await
            .unwrap();
        let op = EditOp::insert(TextField::Body, 0, "written offline");
        document.apply_local_edit(&op).unwrap();
        handle.close().await;
    }

    // Reload: seed from the mirror, then sync.
    let server = SyncServer::new(file_config(server_dir.path())).unwrap().spawn().await.unwrap();
    let document = SharedDocument::open(id.clone());
    let handle = OfflineHandle::open(document.clone(), local.clone(), OfflineConfig::default())
        .await
        .unwrap();
    assert_eq!(document.text(TextField::Body), "written offline");

    let config = ProviderConfig::for_testing(server.url());
    let mut provider = SyncProvider::new(document.clone(), config);
    provider.connect(identity("offline-user"));
    synced(&provider).await;
    room_body(&server, &id, "written offline").await;

    handle.clear_local_data().await.unwrap();
    provider.destroy().await;
    handle.close().await;
    server.shutdown().await.unwrap();
}
