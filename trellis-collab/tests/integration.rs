//! End-to-end sync tests: a real server on an ephemeral port and real
//! providers talking to it over WebSockets.

use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use trellis_collab::{
    ConnectionStatus, DocumentId, EditOp, Identity, ProviderConfig, RoomInfo, RunningServer,
    ServerConfig, SharedDocument, SyncMessage, SyncProvider, SyncServer, TextField,
};

const WAIT: Duration = Duration::from_secs(5);

async fn start_test_server() -> RunningServer {
    SyncServer::new(ServerConfig::for_testing()).unwrap().spawn().await.unwrap()
}

fn provider(server: &RunningServer, doc: &str) -> SyncProvider {
    SyncProvider::open(DocumentId::new(doc).unwrap(), ProviderConfig::for_testing(server.url()))
}

fn identity(n: u32) -> Identity {
    Identity::new(format!("user-{n}"), format!("User {n}"), "#56b6c2")
}

async fn synced(provider: &SyncProvider) {
    timeout(WAIT, provider.wait_for_status(ConnectionStatus::Synced))
        .await
        .expect("provider did not sync");
}

/// Poll `check` until it holds.
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
    server: &RunningServer,
    id: &DocumentId,
    what: &str,
    check: impl Fn(&RoomInfo) -> bool,
) -> RoomInfo {
    let result = timeout(WAIT, async {
        loop {
            let info = server.registry().info(id).await;
            if check(&info) {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    result.unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

#[tokio::test]
async fn test_two_providers_converge() {
    let server = start_test_server().await;
    let mut a = provider(&server, "shared");
    let mut b = provider(&server, "shared");
    a.connect(identity(1));
    b.connect(identity(2));
    synced(&a).await;
    synced(&b).await;

    a.apply_local_edit(&EditOp::insert(TextField::Body, 0, "Hello")).unwrap();
    a.apply_local_edit(&EditOp::insert(TextField::Title, 0, "Greeting")).unwrap();
    eventually("b to see a's edits", || b.document().content() == a.document().content()).await;

    b.apply_local_edit(&EditOp::insert(TextField::Body, 5, ", world")).unwrap();
    eventually("a to see b's edit", || a.document().text(TextField::Body) == "Hello, world").await;

    a.disconnect().await;
    b.disconnect().await;
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_late_joiner_bootstraps_room_content() {
    let server = start_test_server().await;
    let mut writer = provider(&server, "late");
    writer.connect(identity(1));
    synced(&writer).await;
    writer.apply_local_edit(&EditOp::insert(TextField::Body, 0, "existing text")).unwrap();

    let id = DocumentId::new("late").unwrap();
    let room = server.registry().get(&id).await.unwrap();
    timeout(WAIT, async {
        while room.content().await.unwrap().body != "existing text" {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("room never applied the edit");

    let mut reader = provider(&server, "late");
    reader.connect(identity(2));
    synced(&reader).await;
    assert_eq!(reader.document().content(), room.content().await.unwrap());
    assert_eq!(reader.document().text(TextField::Body), "existing text");

    writer.disconnect().await;
    reader.disconnect().await;
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_offline_edit_merges_on_reconnect() {
    let server = start_test_server().await;
    let mut a = provider(&server, "offline");
    let mut b = provider(&server, "offline");
    a.connect(identity(1));
    b.connect(identity(2));
    synced(&a).await;
    synced(&b).await;

    a.apply_local_edit(&EditOp::insert(TextField::Body, 0, "Hello")).unwrap();
    eventually("b to receive Hello", || b.document().text(TextField::Body) == "Hello").await;

    b.disconnect().await;
    assert_eq!(b.status(), ConnectionStatus::Disconnected);
    let end = b.document().text(TextField::Body).chars().count();
    b.apply_local_edit(&EditOp::insert(TextField::Body, end, "X")).unwrap();
    a.apply_local_edit(&EditOp::insert(TextField::Title, 0, "T")).unwrap();

    b.connect(identity(2));
    synced(&b).await;
    eventually("both replicas to converge", || a.document().content() == b.document().content())
        .await;
    assert_eq!(a.document().text(TextField::Body), "HelloX");
    assert_eq!(b.document().text(TextField::Title), "T");

    a.disconnect().await;
    b.disconnect().await;
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_inserts_converge_without_interleaving() {
    let server = start_test_server().await;
    let mut a = provider(&server, "race");
    let mut b = provider(&server, "race");

    // Both edit before connecting, at the same position.
    a.apply_local_edit(&EditOp::insert(TextField::Body, 0, "aaa")).unwrap();
    b.apply_local_edit(&EditOp::insert(TextField::Body, 0, "bbb")).unwrap();

    a.connect(identity(1));
    b.connect(identity(2));
    eventually("concurrent inserts to converge", || {
        let (ta, tb) = (a.document().text(TextField::Body), b.document().text(TextField::Body));
        ta == tb && ta.len() == 6
    })
    .await;

    let text = a.document().text(TextField::Body);
    assert!(text == "aaabbb" || text == "bbbaaa", "runs interleaved: {text}");

    a.disconnect().await;
    b.disconnect().await;
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection() {
    let server = start_test_server().await;
    let url = format!("{}/rooms/robust", server.url());
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    // Bootstrap sync.
    let first = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    assert!(matches!(first, Message::Binary(_)));

    ws.send(Message::Binary(vec![0xFF, 0x00, 0x13].into())).await.unwrap();

    let doc = SharedDocument::open(DocumentId::new("robust").unwrap());
    let delta = doc.apply_local_edit(&EditOp::insert(TextField::Body, 0, "ok")).unwrap();
    ws.send(Message::Binary(SyncMessage::update(&delta).encode_frame().unwrap()))
        .await
        .unwrap();

    let id = DocumentId::new("robust").unwrap();
    let info = wait_for_info(&server, &id, "room to apply the valid update", |info| {
        info.updates_applied == 1
    })
    .await;
    assert_eq!(info.messages_dropped, 1);
    assert_eq!(info.sessions, 1);

    drop(ws);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_room_info_tracks_sessions() {
    let server = start_test_server().await;
    let id = DocumentId::new("counted").unwrap();
    let mut a = provider(&server, "counted");
    let mut b = provider(&server, "counted");
    a.connect(identity(1));
    b.connect(identity(2));
    synced(&a).await;
    synced(&b).await;
    assert_eq!(server.registry().info(&id).await.sessions, 2);

    b.disconnect().await;
    wait_for_info(&server, &id, "room to drop the closed session", |info| info.sessions == 1).await;

    a.disconnect().await;
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_status_listener_sees_full_lifecycle() {
    let server = start_test_server().await;
    let mut a = provider(&server, "status");
    let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _sub = a.on_status_change(move |s| sink.lock().push(*s));

    a.connect(identity(1));
    synced(&a).await;
    a.disconnect().await;

    assert_eq!(
        seen.lock().as_slice(),
        &[
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected,
            ConnectionStatus::Synced,
            ConnectionStatus::Disconnected,
        ]
    );
    server.shutdown().await.unwrap();
}
