//! Integration tests for presence and client state synchronization.
//!
//! These tests start a real server and connect `CollabClient`s,
//! verifying cursors, selections, permissions and reconnection through
//! the full network stack.

use codepair_collab::client::{ClientConfig, ClientEvent, ClientState, CollabClient, ConnectionState};
use codepair_collab::model::{CursorPosition, NewSession, Permission, SelectionRange, UserProfile};
use codepair_collab::protocol::FrameBody;
use codepair_collab::server::{CollabServer, ServerConfig, ServerHandle};
use codepair_collab::storage::{MemoryStore, SessionStore};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};
use uuid::Uuid;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_server(port: u16, store: Arc<dyn SessionStore>) -> ServerHandle {
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::default()
    };
    CollabServer::new(config, store).start().await.unwrap()
}

fn client_config() -> ClientConfig {
    ClientConfig {
        reconnect_initial: Duration::from_millis(50),
        reconnect_max: Duration::from_millis(200),
        max_reconnect_attempts: 0,
        ..ClientConfig::default()
    }
}

/// Connect a client, draining the initial Connected event.
async fn connect_client(
    user: &str,
    url: &str,
    session_id: Option<Uuid>,
) -> (CollabClient, mpsc::Receiver<ClientEvent>) {
    let mut client = CollabClient::new(url, UserProfile::new(user, user), client_config());
    let mut events = client.take_event_rx().unwrap();
    client.connect(session_id).await.unwrap();
    let first = timeout(Duration::from_secs(1), events.recv()).await.unwrap();
    assert_eq!(first, Some(ClientEvent::Connected));
    (client, events)
}

/// Poll the client state until `check` holds.
async fn wait_for(client: &CollabClient, check: impl Fn(&ClientState) -> bool) -> ClientState {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let state = client.state().await;
        if check(&state) {
            return state;
        }
        assert!(Instant::now() < deadline, "state condition not met: {state:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Alice creates a session, Bob joins it; both see each other.
async fn pair(url: &str) -> (CollabClient, CollabClient, Uuid) {
    let (alice, _) = connect_client("alice", url, None).await;
    alice.create_session(NewSession::named("pairing")).await.unwrap();
    let session_id = wait_for(&alice, |s| s.session.is_some())
        .await
        .session
        .unwrap()
        .id;

    let (bob, _) = connect_client("bob", url, Some(session_id)).await;
    wait_for(&bob, |s| s.users.len() == 2).await;
    wait_for(&alice, |s| s.users.contains_key("bob")).await;
    (alice, bob, session_id)
}

// ─── Presence ────────────────────────────────────────────────────

#[tokio::test]
async fn test_cursor_and_selection_reach_peer() {
    let port = free_port().await;
    let handle = start_server(port, Arc::new(MemoryStore::new())).await;
    let url = format!("ws://127.0.0.1:{port}");
    let (alice, bob, _) = pair(&url).await;

    alice.send_cursor(CursorPosition::new(3, 7)).await.unwrap();
    let range = SelectionRange::new(CursorPosition::new(1, 0), CursorPosition::new(2, 4));
    alice.send_selection(range).await.unwrap();

    let state = wait_for(&bob, |s| s.selections.contains_key("alice")).await;
    assert_eq!(state.cursors["alice"], CursorPosition::new(3, 7));
    assert_eq!(state.selections["alice"], range);
    handle.stop().await;
}

#[tokio::test]
async fn test_late_joiner_sees_existing_cursors() {
    let port = free_port().await;
    let handle = start_server(port, Arc::new(MemoryStore::new())).await;
    let url = format!("ws://127.0.0.1:{port}");
    let (alice, _bob, session_id) = pair(&url).await;

    alice.send_cursor(CursorPosition::new(9, 1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (carol, _) = connect_client("carol", &url, Some(session_id)).await;
    let state = wait_for(&carol, |s| s.session.is_some()).await;
    assert_eq!(state.cursors.get("alice"), Some(&CursorPosition::new(9, 1)));
    assert_eq!(state.users.len(), 3);
    handle.stop().await;
}

#[tokio::test]
async fn test_leave_clears_peer_presence() {
    let port = free_port().await;
    let handle = start_server(port, Arc::new(MemoryStore::new())).await;
    let url = format!("ws://127.0.0.1:{port}");
    let (alice, bob, _) = pair(&url).await;

    bob.send_cursor(CursorPosition::new(1, 1)).await.unwrap();
    wait_for(&alice, |s| s.cursors.contains_key("bob")).await;

    bob.leave_session().await.unwrap();
    let state = wait_for(&alice, |s| !s.users.contains_key("bob")).await;
    assert!(!state.cursors.contains_key("bob"));
    assert!(bob.state().await.session.is_none());
    handle.stop().await;
}

// ─── Client state ───────────────────────────────────────────────

#[tokio::test]
async fn test_code_and_language_sync() {
    let port = free_port().await;
    let handle = start_server(port, Arc::new(MemoryStore::new())).await;
    let url = format!("ws://127.0.0.1:{port}");
    let (alice, bob, _) = pair(&url).await;

    alice.send_code_update("fn main() {}").await.unwrap();
    alice.update_language("rust").await.unwrap();

    let state = wait_for(&bob, |s| {
        s.session.as_ref().is_some_and(|x| x.language == "rust")
    })
    .await;
    assert_eq!(state.session.unwrap().code, "fn main() {}");
    handle.stop().await;
}

#[tokio::test]
async fn test_permission_downgrade_reflected() {
    let port = free_port().await;
    let handle = start_server(port, Arc::new(MemoryStore::new())).await;
    let url = format!("ws://127.0.0.1:{port}");
    let (alice, bob, _) = pair(&url).await;
    assert!(bob.can_user_edit().await);

    alice.set_permission("bob", Permission::View).await.unwrap();
    wait_for(&bob, |s| !s.can_edit()).await;
    assert!(!bob.can_user_edit().await);

    bob.send_code_update("denied").await.unwrap();
    let state = wait_for(&bob, |s| s.error.is_some()).await;
    assert!(state.error.unwrap().contains("Forbidden"));
    handle.stop().await;
}

#[tokio::test]
async fn test_chat_history_in_state() {
    let port = free_port().await;
    let handle = start_server(port, Arc::new(MemoryStore::new())).await;
    let url = format!("ws://127.0.0.1:{port}");
    let (alice, bob, _) = pair(&url).await;

    alice.send_chat("ready?").await.unwrap();
    bob.send_chat("yes").await.unwrap();

    for client in [&alice, &bob] {
        let state = wait_for(client, |s| s.messages.len() == 2).await;
        assert!(state.messages.iter().any(|m| m.body == "ready?" && m.user_id == "alice"));
    }
    handle.stop().await;
}

#[tokio::test]
async fn test_version_saved_event() {
    let port = free_port().await;
    let handle = start_server(port, Arc::new(MemoryStore::new())).await;
    let url = format!("ws://127.0.0.1:{port}");

    let (alice, mut events) = connect_client("alice", &url, None).await;
    alice.create_session(NewSession::named("v")).await.unwrap();
    alice.send_code_update("v1").await.unwrap();
    alice.save_version(Some("first".into())).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, events.recv()).await.unwrap() {
            Some(ClientEvent::Frame(frame)) => {
                if let FrameBody::VersionSaved(v) = frame.body {
                    assert_eq!(v.code, "v1");
                    assert_eq!(v.description.as_deref(), Some("first"));
                    break;
                }
            }
            Some(_) => {}
            None => panic!("event stream closed"),
        }
    }
    handle.stop().await;
}

// ─── Reconnection ───────────────────────────────────────────────

#[tokio::test]
async fn test_reconnect_rejoins_and_replays_offline_edits() {
    let port = free_port().await;
    let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
    let handle = start_server(port, store.clone()).await;
    let url = format!("ws://127.0.0.1:{port}");
    let (_alice, bob, session_id) = pair(&url).await;

    handle.stop().await;
    let deadline = Instant::now() + Duration::from_secs(3);
    while bob.connection_state().await == ConnectionState::Connected {
        assert!(Instant::now() < deadline, "client never noticed the shutdown");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(bob.send_code_update("typed offline").await.unwrap());
    assert!(!bob.send_cursor(CursorPosition::new(0, 0)).await.unwrap());
    assert_eq!(bob.queued().await, 1);

    let handle = start_server(port, store.clone()).await;
    wait_for(&bob, |s| s.is_connected && s.users.contains_key("bob")).await;
    assert_eq!(bob.queued().await, 0);
    assert_eq!(bob.session_id().await, Some(session_id));

    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let session = store.get_session(session_id).await.unwrap();
        if session.code == "typed offline" {
            break;
        }
        assert!(Instant::now() < deadline, "offline edit never replayed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    handle.stop().await;
}

#[tokio::test]
async fn test_disconnect_stops_reconnecting() {
    let port = free_port().await;
    let handle = start_server(port, Arc::new(MemoryStore::new())).await;
    let url = format!("ws://127.0.0.1:{port}");

    let (mut client, _events) = connect_client("alice", &url, None).await;
    assert!(client.is_connected().await);
    client.disconnect().await;
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    handle.stop().await;
}
