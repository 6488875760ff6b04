// Integration tests for the lobby client.
//
// Each test runs a real session loop against the in-memory connector and
// scripts the server side frame by frame: connection lifecycle, roster and
// character reconciliation, sheet authorization, chat, and the action
// dispatcher's optimistic merge.

use std::time::Duration;

use partysheet_client::rest::error_from_body;
use partysheet_client::*;
use partysheet_core::*;
use reqwest::StatusCode;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// ===========================================================================
// Test helpers
// ===========================================================================

const WAIT: Duration = Duration::from_secs(2);

fn params(local: &str, piloted: Option<i64>) -> SessionParams {
    SessionParams {
        credential: Some("tok-123".into()),
        session_key: Some("AB12CD".into()),
        master_username: Some("Alice".into()),
        max_players: Some(4),
        local_username: Some(local.into()),
        piloted_character: piloted.map(CharacterId),
    }
}

fn alice() -> SessionParams {
    params("Alice", None)
}

fn bob() -> SessionParams {
    params("Bob", Some(12))
}

fn character(id: i64, name: &str, hp: i64) -> serde_json::Value {
    json!({"id": id, "name": name, "level": 3, "max_hp": 20, "current_hp": hp})
}

struct Harness {
    commands: mpsc::Sender<SessionCommand>,
    updates: mpsc::Receiver<LobbyUpdate>,
    server: MemoryServer,
    dispatcher: ActionDispatcher,
    task: JoinHandle<anyhow::Result<()>>,
}

/// Resolve `params`, then hand the session to its own task.
async fn start(params: SessionParams) -> Harness {
    let (connector, server) = memory_pair();
    let (commands, commands_rx) = mpsc::channel(64);

    let (mut session, updates) = LobbySession::create(Config::default(), connector);
    session.set_identity(&params).await;
    let dispatcher = session.dispatcher();
    let task = tokio::spawn(session.run(commands_rx));

    Harness {
        commands,
        updates,
        server,
        dispatcher,
        task,
    }
}

impl Harness {
    async fn accept(&mut self) -> MemoryPeer {
        tokio::time::timeout(WAIT, self.server.accept())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }

    async fn command(&self, command: SessionCommand) {
        self.commands.send(command).await.unwrap();
    }

    /// Skip updates until a snapshot satisfies `pred`.
    async fn snapshot_where(&mut self, pred: impl Fn(&LobbySnapshot) -> bool) -> LobbySnapshot {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let update = tokio::time::timeout_at(deadline, self.updates.recv())
                .await
                .expect("timed out waiting for snapshot")
                .expect("session loop ended");
            if let LobbyUpdate::Snapshot(snapshot) = update {
                if pred(&snapshot) {
                    return *snapshot;
                }
            }
        }
    }

    /// Skip updates until the next connection change.
    async fn connection_change(&mut self) -> Option<ConnectionView> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let update = tokio::time::timeout_at(deadline, self.updates.recv())
                .await
                .expect("timed out waiting for connection change")
                .expect("session loop ended");
            if let LobbyUpdate::ConnectionChanged(view) = update {
                return view;
            }
        }
    }

    async fn open(&mut self) -> MemoryPeer {
        let peer = self.accept().await;
        self.snapshot_where(|s| s.phase == ConnectionPhase::Open).await;
        peer
    }
}

// ===========================================================================
// Connection lifecycle
// ===========================================================================

#[tokio::test]
async fn endpoint_carries_identity_and_master_omits_character() {
    let mut master = start(alice()).await;
    let peer = master.accept().await;
    assert_eq!(peer.query("token").as_deref(), Some("tok-123"));
    assert_eq!(peer.query("session_key").as_deref(), Some("AB12CD"));
    assert_eq!(peer.query("master").as_deref(), Some("Alice"));
    assert_eq!(peer.query("max_players").as_deref(), Some("4"));
    assert_eq!(peer.query("character_id"), None);

    let mut participant = start(bob()).await;
    let peer = participant.accept().await;
    assert_eq!(peer.query("character_id").as_deref(), Some("12"));
}

#[tokio::test]
async fn incomplete_identity_closes_the_connection() {
    let mut h = start(bob()).await;
    let mut peer = h.open().await;

    h.command(SessionCommand::SetIdentity(SessionParams {
        credential: None,
        ..bob()
    }))
    .await;

    assert!(h.connection_change().await.is_none());
    let snapshot = h.snapshot_where(|s| s.phase == ConnectionPhase::Idle).await;
    assert!(snapshot.slots.is_empty());
    assert_eq!(
        tokio::time::timeout(WAIT, peer.next_outbound()).await.unwrap(),
        Some(ClientFrame::Close {
            code: 1000,
            reason: "reinitializing".into()
        })
    );
}

#[tokio::test]
async fn repeating_the_same_identity_keeps_one_connection() {
    let mut h = start(bob()).await;
    let _peer = h.open().await;
    h.command(SessionCommand::SetIdentity(bob())).await;
    h.command(SessionCommand::Reconnect).await;
    h.snapshot_where(|s| s.phase == ConnectionPhase::Open).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.server.attempted_endpoints().len(), 1);
}

#[tokio::test]
async fn abnormal_close_shows_banner_until_reconnected() {
    let mut h = start(bob()).await;
    let peer = h.open().await;

    peer.close(None, "");
    let snapshot = h
        .snapshot_where(|s| s.phase == ConnectionPhase::ClosedWithError)
        .await;
    assert_eq!(snapshot.connectivity_error.as_deref(), Some("connection lost"));

    h.command(SessionCommand::Reconnect).await;
    assert_eq!(h.connection_change().await.map(|v| v.generation()), Some(2));
    let _peer = h.accept().await;
    let snapshot = h.snapshot_where(|s| s.phase == ConnectionPhase::Open).await;
    assert_eq!(snapshot.connectivity_error, None);
}

#[tokio::test]
async fn refused_connection_reports_error() {
    let (connector, server) = memory_pair();
    server.refuse_connections(true);
    let (updates_tx, mut updates) = mpsc::channel(64);
    let (_commands, commands_rx) = mpsc::channel(8);
    let mut session = LobbySession::new(Config::default(), connector, updates_tx);
    session.set_identity(&bob()).await;
    tokio::spawn(session.run(commands_rx));

    loop {
        let update = tokio::time::timeout(WAIT, updates.recv()).await.unwrap().unwrap();
        if let LobbyUpdate::Snapshot(s) = update {
            if s.phase == ConnectionPhase::ClosedWithError {
                assert_eq!(
                    s.connectivity_error.as_deref(),
                    Some("connection error: failed to connect: connection refused")
                );
                break;
            }
        }
    }
}

#[tokio::test]
async fn shutdown_closes_cleanly() {
    let mut h = start(bob()).await;
    let mut peer = h.open().await;
    h.command(SessionCommand::Shutdown).await;

    let result = tokio::time::timeout(WAIT, h.task).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert!(matches!(
        tokio::time::timeout(WAIT, peer.next_outbound()).await.unwrap(),
        Some(ClientFrame::Close { code: 1000, .. })
    ));
}

// ===========================================================================
// Reconciliation
// ===========================================================================

#[tokio::test]
async fn master_sees_roster_in_four_player_lobby() {
    let mut h = start(alice()).await;
    let peer = h.open().await;

    peer.push_json(&json!({
        "type": "roster_update",
        "master": {"username": "Alice", "character_id": 7},
        "players": [{"username": "Bob", "character_id": 12}]
    }));

    let snapshot = h.snapshot_where(|s| s.slots.iter().any(Option::is_some)).await;
    assert_eq!(
        snapshot.slots,
        vec![
            Some(PlayerEntry {
                username: "Bob".into(),
                character_id: CharacterId(12),
            }),
            None,
            None,
        ]
    );
    assert_eq!(
        snapshot.master,
        Some(MasterRecord {
            username: "Alice".into(),
            character_id: Some(CharacterId(7)),
        })
    );
    assert!(snapshot.is_master);
}

#[tokio::test]
async fn oversized_roster_is_truncated_and_master_retained() {
    let mut h = start(alice()).await;
    let peer = h.open().await;

    peer.push_json(&json!({
        "type": "master_update",
        "master": {"username": "Alice", "character_id": 7}
    }));
    peer.push_json(&json!({
        "type": "roster_update",
        "players": [
            {"username": "Bob", "character_id": 12},
            {"username": "Cid", "character_id": 13},
            {"username": "Dee", "character_id": 14},
            {"username": "Eve", "character_id": 15}
        ]
    }));

    let snapshot = h.snapshot_where(|s| s.slots.iter().all(Option::is_some)).await;
    assert_eq!(snapshot.slots.len(), 3);
    assert_eq!(
        snapshot.master.and_then(|m| m.character_id),
        Some(CharacterId(7))
    );
}

#[tokio::test]
async fn identical_pushes_keep_cached_reference() {
    let mut h = start(bob()).await;
    let peer = h.open().await;

    let sync = json!({
        "type": "initial_characters",
        "characters": [character(12, "Mira", 20), character(13, "Tobin", 18)]
    });
    peer.push_json(&sync);
    let first = h.snapshot_where(|s| s.characters.len() == 2).await;

    peer.push_json(&sync);
    peer.push_json(&json!({"type": "character_update", "character": character(13, "Tobin", 18)}));
    peer.push_json(&json!({"type": "character_update", "character": character(13, "Tobin", 11)}));
    let last = h
        .snapshot_where(|s| s.character(CharacterId(13)).is_some_and(|c| c.current_hp == 11))
        .await;

    let mira_before = first.character(CharacterId(12)).unwrap();
    let mira_after = last.character(CharacterId(12)).unwrap();
    assert!(std::sync::Arc::ptr_eq(mira_before, mira_after));
}

#[tokio::test]
async fn superseded_connection_cannot_touch_state() {
    let mut h = start(bob()).await;
    let stale = h.open().await;

    // Instance 2 for another lobby, then instance 3 back on the first one.
    h.command(SessionCommand::SetIdentity(SessionParams {
        session_key: Some("ZZ99YY".into()),
        ..bob()
    }))
    .await;
    let _second = h.accept().await;
    h.command(SessionCommand::SetIdentity(bob())).await;
    let current = h.accept().await;
    assert_eq!(h.server.attempted_endpoints().len(), 3);
    h.snapshot_where(|s| s.generation == 3 && s.phase == ConnectionPhase::Open)
        .await;

    stale.push_json(&json!({
        "type": "roster_update",
        "master": {"username": "Mallory"},
        "players": [{"username": "Mallory", "character_id": 66}]
    }));
    stale.push_json(&json!({"type": "character_update", "character": character(66, "Imp", 1)}));
    current.push_json(&json!({"type": "character_update", "character": character(12, "Mira", 20)}));

    let snapshot = h.snapshot_where(|s| !s.characters.is_empty()).await;
    assert_eq!(snapshot.slots, vec![None, None, None]);
    assert_eq!(snapshot.master, None);
    assert!(snapshot.character(CharacterId(66)).is_none());
    assert!(snapshot.character(CharacterId(12)).is_some());
}

#[tokio::test]
async fn late_action_result_stays_with_its_own_lobby() {
    let mut h = start(bob()).await;
    let _first = h.open().await;

    h.command(SessionCommand::SetIdentity(SessionParams {
        session_key: Some("ZZ99YY".into()),
        ..bob()
    }))
    .await;
    let current = h.accept().await;
    h.snapshot_where(|s| s.generation == 2 && s.phase == ConnectionPhase::Open)
        .await;

    // Resolves after the switch, on the dispatcher taken for the first lobby.
    let late: Character = serde_json::from_value(character(66, "Imp", 1)).unwrap();
    h.dispatcher
        .dispatch(
            "Heal",
            Mutation::pending(async move { Ok(ActionOutcome::new(late)) }),
        )
        .await;
    current.push_json(&json!({"type": "character_update", "character": character(12, "Mira", 20)}));

    let snapshot = h.snapshot_where(|s| !s.characters.is_empty()).await;
    assert!(snapshot.character(CharacterId(66)).is_none());
    assert!(snapshot.character(CharacterId(12)).is_some());
}

// ===========================================================================
// Sheet authorization
// ===========================================================================

#[tokio::test]
async fn participant_may_only_expand_own_loaded_sheet() {
    let mut h = start(bob()).await;
    let peer = h.open().await;

    h.command(SessionCommand::ToggleSheet(CharacterId(12))).await;
    let denied = h
        .snapshot_where(|s| s.authorization_notice.is_some())
        .await;
    assert_eq!(
        denied.authorization_notice.as_deref(),
        Some("character 12 has not loaded yet")
    );
    assert_eq!(denied.expanded, None);

    peer.push_json(&json!({
        "type": "initial_characters",
        "characters": [character(12, "Mira", 20), character(13, "Tobin", 18)]
    }));
    h.snapshot_where(|s| s.characters.len() == 2).await;

    h.command(SessionCommand::ToggleSheet(CharacterId(13))).await;
    let denied = h
        .snapshot_where(|s| {
            s.authorization_notice.as_deref() == Some("you can only open your own character sheet")
        })
        .await;
    assert_eq!(denied.expanded, None);

    h.command(SessionCommand::ToggleSheet(CharacterId(12))).await;
    let opened = h.snapshot_where(|s| s.expanded.is_some()).await;
    assert_eq!(
        opened.expanded_character().map(|c| c.name.as_str()),
        Some("Mira")
    );

    h.command(SessionCommand::ToggleSheet(CharacterId(12))).await;
    h.snapshot_where(|s| s.expanded.is_none()).await;
}

#[tokio::test]
async fn master_expands_any_sheet() {
    let mut h = start(alice()).await;
    let peer = h.open().await;
    peer.push_json(&json!({
        "type": "initial_characters",
        "characters": [character(12, "Mira", 20), character(13, "Tobin", 18)]
    }));
    h.snapshot_where(|s| s.characters.len() == 2).await;

    h.command(SessionCommand::ToggleSheet(CharacterId(13))).await;
    let snapshot = h
        .snapshot_where(|s| s.expanded == Some(CharacterId(13)))
        .await;
    assert_eq!(snapshot.authorization_notice, None);
}

// ===========================================================================
// Chat over the shared connection
// ===========================================================================

#[tokio::test]
async fn chat_follows_the_current_connection() {
    let mut h = start(bob()).await;
    let view = h.connection_change().await;
    let mut feed = ChatFeed::from_config(&Config::default());
    feed.follow(view);
    let mut peer = h.open().await;

    peer.push_json(&json!({"type": "chat", "sender": "Alice", "text": "welcome"}));
    peer.push_json(&json!({"type": "roster_update", "players": []}));
    h.snapshot_where(|s| s.master.is_some()).await;
    let lines = feed.lines();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].sender, "Alice");
    assert_eq!(lines[0].text, "welcome");

    feed.send("hi all").unwrap();
    assert_eq!(
        tokio::time::timeout(WAIT, peer.next_outbound()).await.unwrap(),
        Some(ClientFrame::Text("hi all".into()))
    );
}

// ===========================================================================
// Action dispatch
// ===========================================================================

#[tokio::test]
async fn side_effect_response_merges_into_lobby_view() {
    let mut h = start(bob()).await;
    let peer = h.open().await;
    peer.push_json(&json!({
        "type": "initial_characters",
        "characters": [character(12, "Mira", 20)]
    }));
    h.snapshot_where(|s| s.characters.len() == 1).await;

    let wire: MutationResponse<Character> =
        serde_json::from_value(json!([character(12, "Mira", 9), "Rage"])).unwrap();
    let report = h
        .dispatcher
        .dispatch("Damage applied", Mutation::pending(async move { Ok(wire.into()) }))
        .await;

    assert_eq!(
        report,
        ActionReport::Succeeded {
            merged: true,
            side_effect: Some("Rage".into()),
        }
    );
    assert_eq!(h.dispatcher.side_effect(), Some("Rage"));
    assert_eq!(h.dispatcher.message(), Some("Damage applied"));

    // Merged outside the loop; the session republishes on the revision bump.
    let snapshot = h
        .snapshot_where(|s| s.character(CharacterId(12)).is_some_and(|c| c.current_hp == 9))
        .await;
    assert_eq!(snapshot.characters.len(), 1);
}

#[tokio::test]
async fn validation_failure_is_reported_verbatim() {
    let mut h = start(bob()).await;
    let _peer = h.open().await;

    let err = error_from_body(
        StatusCode::UNPROCESSABLE_ENTITY,
        json!({"detail": [{"msg": "must be >= 0", "loc": ["body", "quantity"]}]})
            .to_string()
            .as_bytes(),
    );
    let report = h
        .dispatcher
        .dispatch("Item used", Mutation::<Character>::pending(async move { Err(err) }))
        .await;

    assert_eq!(
        report,
        ActionReport::Failed {
            message: "validation error: must be >= 0 (field: quantity)".into()
        }
    );
    assert_eq!(
        h.dispatcher.error(),
        Some("validation error: must be >= 0 (field: quantity)")
    );
    assert_eq!(h.dispatcher.message(), None);
}

#[tokio::test]
async fn deferred_lobby_call_gets_session_key() {
    let mut h = start(alice()).await;
    let captured = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = captured.clone();

    h.dispatcher
        .dispatch(
            "Slot assigned",
            Mutation::deferred(
                move |args: Vec<serde_json::Value>| async move {
                    sink.lock().unwrap().extend(args);
                    Ok(ActionOutcome::new(()))
                },
                vec![json!(2), json!(12)],
            ),
        )
        .await;

    assert_eq!(
        *captured.lock().unwrap(),
        vec![json!(2), json!(12), json!("AB12CD")]
    );
}
