// Lobby session: the single event loop that owns the connection manager,
// the view stores and the user-facing notice channels.
//
// Transport events and host commands are multiplexed with `tokio::select!`.
// Every real change produces one `LobbyUpdate::Snapshot` for the host to
// render; nothing else in the session is shared.

use std::sync::Arc;

use anyhow::Context;
use partysheet_core::{
    parse_frame, reconcile, ActionDispatcher, AuthorizationError, Character, CharacterCache,
    CharacterId, Config, LobbyState, MasterRecord, MasterStore, NoticeSlot, PlayerEntry,
    SessionIdentity, SessionParams, SheetSelection, SheetToggle, SlotTable,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connection::{
    is_clean_close, ConnectionManager, ConnectionPhase, ConnectionView, Generation, SyncOutcome,
    TransportEvent, TransportEventKind,
};
use crate::transport::Connector;

/// Commands from the hosting UI to the session loop.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    /// The host's knowledge of the lobby changed (route, login, character
    /// pick). Incomplete parameters close any open connection.
    SetIdentity(SessionParams),
    ToggleSheet(CharacterId),
    /// Open a new connection if the current one has closed.
    Reconnect,
    Shutdown,
}

/// Updates pushed from the session loop to the host.
#[derive(Debug, Clone)]
pub enum LobbyUpdate {
    Snapshot(Box<LobbySnapshot>),
    /// A new connection instance replaced the previous one (or none is
    /// open any more). Chat and other consumers re-attach to the new view.
    ConnectionChanged(Option<ConnectionView>),
}

/// Everything the lobby screen renders.
#[derive(Debug, Clone, PartialEq)]
pub struct LobbySnapshot {
    pub phase: ConnectionPhase,
    pub generation: Generation,
    pub is_master: bool,
    pub master: Option<MasterRecord>,
    pub slots: Vec<Option<PlayerEntry>>,
    /// Cached characters in id order.
    pub characters: Vec<Arc<Character>>,
    pub expanded: Option<CharacterId>,
    /// Persistent until the next successful open.
    pub connectivity_error: Option<String>,
    /// Transient sheet-authorization denial.
    pub authorization_notice: Option<String>,
}

impl LobbySnapshot {
    pub fn character(&self, id: CharacterId) -> Option<&Arc<Character>> {
        self.characters.iter().find(|c| c.id == id)
    }

    /// The character shown in the large panel, if one is expanded.
    pub fn expanded_character(&self) -> Option<&Arc<Character>> {
        self.expanded.and_then(|id| self.character(id))
    }
}

pub struct LobbySession<C> {
    config: Config,
    connection: ConnectionManager<C>,
    events: Option<mpsc::Receiver<TransportEvent>>,
    updates: mpsc::Sender<LobbyUpdate>,
    identity: Option<SessionIdentity>,
    state: LobbyState,
    sheet: SheetSelection,
    connectivity_error: Option<String>,
    authorization: NoticeSlot,
    published_revision: u64,
}

impl<C: Connector> LobbySession<C> {
    /// A session plus the receiving end of its update channel, sized by
    /// `channels.update_capacity`.
    pub fn create(config: Config, connector: C) -> (Self, mpsc::Receiver<LobbyUpdate>) {
        let (updates_tx, updates_rx) = mpsc::channel(config.channels.update_capacity);
        (Self::new(config, connector, updates_tx), updates_rx)
    }

    pub fn new(config: Config, connector: C, updates: mpsc::Sender<LobbyUpdate>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.channels.event_capacity);
        let connection =
            ConnectionManager::new(connector, config.server.lobby_url.clone(), events_tx);
        let authorization = NoticeSlot::new(config.notices.authorization_ttl());
        LobbySession {
            config,
            connection,
            events: Some(events_rx),
            updates,
            identity: None,
            state: LobbyState {
                master: MasterStore::default(),
                slots: SlotTable::new(0),
                characters: CharacterCache::new(),
            },
            sheet: SheetSelection::default(),
            connectivity_error: None,
            authorization,
            published_revision: 0,
        }
    }

    pub fn identity(&self) -> Option<&SessionIdentity> {
        self.identity.as_ref()
    }

    pub fn state(&self) -> &LobbyState {
        &self.state
    }

    pub fn connection_phase(&self) -> ConnectionPhase {
        self.connection.phase()
    }

    pub fn connection_view(&self) -> Option<ConnectionView> {
        self.connection.view()
    }

    /// Another handle to the current session's character cache. An identity
    /// change replaces the cache, so the handle goes stale with it.
    pub fn characters(&self) -> CharacterCache {
        self.state.characters.clone()
    }

    /// A dispatcher for lobby sheet actions: it merges returned characters
    /// into this session's cache and appends the session key to deferred
    /// calls. Results arriving after an identity change land in the retired
    /// cache and are never shown.
    pub fn dispatcher(&self) -> ActionDispatcher {
        let dispatcher = ActionDispatcher::new(self.config.notices.action_ttl())
            .merging_into(self.state.characters.clone());
        match &self.identity {
            Some(identity) => dispatcher.with_scoped_arg(identity.session_key().as_str()),
            None => dispatcher,
        }
    }

    pub fn snapshot(&self) -> LobbySnapshot {
        let cache = &self.state.characters;
        LobbySnapshot {
            phase: self.connection.phase(),
            generation: self.connection.current_generation(),
            is_master: self.identity.as_ref().is_some_and(SessionIdentity::is_master),
            master: self.state.master.get().cloned(),
            slots: self.state.slots.slots().to_vec(),
            characters: cache.ids().into_iter().filter_map(|id| cache.get(id)).collect(),
            expanded: self.sheet.expanded(),
            connectivity_error: self.connectivity_error.clone(),
            authorization_notice: self.authorization.current().map(str::to_owned),
        }
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Adopt new lobby parameters. A different identity starts from fresh
    /// stores and a collapsed sheet. The connectivity banner survives until a
    /// connection opens.
    pub async fn set_identity(&mut self, params: &SessionParams) {
        let identity = match SessionIdentity::resolve(params) {
            Ok(identity) => Some(identity),
            Err(e) => {
                info!(reason = %e, "lobby parameters incomplete, staying disconnected");
                None
            }
        };

        if identity != self.identity {
            let slot_count = identity.as_ref().map_or(0, SessionIdentity::slot_count);
            self.state.reset(slot_count);
            self.sheet.clear();
            self.authorization.clear();
            self.identity = identity;
        }

        self.sync_connection().await;
        self.publish_snapshot().await;
    }

    /// React to one event from a connection instance.
    pub async fn handle_transport_event(&mut self, event: TransportEvent) {
        if !self.connection.accept(&event) {
            return;
        }
        let generation = event.generation;

        match event.kind {
            TransportEventKind::Opened => {
                info!(generation, "lobby connection established");
                self.connectivity_error = None;
                self.publish_snapshot().await;
            }
            TransportEventKind::Frame(text) => self.handle_frame(&text).await,
            TransportEventKind::Error(message) => {
                warn!(generation, error = %message, "lobby connection failed");
                self.connectivity_error = Some(format!("connection error: {message}"));
                self.publish_snapshot().await;
            }
            TransportEventKind::Closed { code, reason } => {
                if is_clean_close(code) {
                    info!(generation, ?code, reason = %reason, "lobby connection closed");
                } else {
                    warn!(generation, ?code, reason = %reason, "lobby connection lost");
                    if self.connectivity_error.is_none() {
                        self.connectivity_error = Some(match code {
                            Some(code) => format!("connection lost (code {code})"),
                            None => "connection lost".to_owned(),
                        });
                    }
                }
                self.publish_snapshot().await;
            }
        }
    }

    /// Parse, hand to listeners, then reconcile. Unreadable frames are
    /// dropped and the connection stays up.
    async fn handle_frame(&mut self, text: &str) {
        let frame = match parse_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping unreadable lobby frame");
                return;
            }
        };

        self.connection.deliver(&frame);

        let Some(identity) = &self.identity else {
            return;
        };
        let kind = frame.kind();
        let outcome = reconcile(&mut self.state, identity, frame);
        debug!(kind = kind.as_wire(), ?outcome, "lobby frame reconciled");
        if outcome.any() {
            self.publish_snapshot().await;
        }
    }

    /// Expand or collapse a character sheet. A denial shows the transient
    /// authorization notice and changes nothing else.
    pub async fn toggle_sheet(&mut self, id: CharacterId) -> Result<SheetToggle, AuthorizationError> {
        let result = match &self.identity {
            Some(identity) => self.sheet.toggle(id, identity, &self.state.characters),
            None => Err(AuthorizationError::NotLoaded(id)),
        };
        match &result {
            Ok(toggle) => debug!(?toggle, "sheet toggled"),
            Err(e) => {
                info!(character_id = %id, reason = %e, "sheet expansion denied");
                self.authorization.show(e.to_string());
            }
        }
        self.publish_snapshot().await;
        result
    }

    /// Re-run the sync for the current identity. Only opens a connection
    /// when the current one has closed.
    pub async fn reconnect(&mut self) {
        if self.connection.phase().is_live() {
            debug!("reconnect ignored, connection is still live");
            return;
        }
        self.sync_connection().await;
        self.publish_snapshot().await;
    }

    /// Close the connection and forget the identity's connection target.
    pub async fn shutdown(&mut self) {
        let had_view = self.connection.view().is_some();
        self.connection.dispose();
        if had_view {
            self.send_update(LobbyUpdate::ConnectionChanged(None)).await;
        }
        info!("lobby session shut down");
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::SetIdentity(params) => self.set_identity(&params).await,
            SessionCommand::ToggleSheet(id) => {
                // The outcome reaches the host through the snapshot.
                let _ = self.toggle_sheet(id).await;
            }
            SessionCommand::Reconnect => self.reconnect().await,
            SessionCommand::Shutdown => self.shutdown().await,
        }
    }

    async fn sync_connection(&mut self) {
        match self.connection.sync(self.identity.as_ref()) {
            SyncOutcome::Opened(generation) => {
                debug!(generation, "publishing new connection view");
                let view = self.connection.view();
                self.send_update(LobbyUpdate::ConnectionChanged(view)).await;
            }
            SyncOutcome::Closed => {
                self.send_update(LobbyUpdate::ConnectionChanged(None)).await;
            }
            SyncOutcome::Unchanged | SyncOutcome::Idle => {}
        }
    }

    async fn publish_snapshot(&mut self) {
        self.published_revision = self.state.characters.revision();
        let snapshot = self.snapshot();
        self.send_update(LobbyUpdate::Snapshot(Box::new(snapshot))).await;
    }

    async fn send_update(&self, update: LobbyUpdate) {
        if self.updates.send(update).await.is_err() {
            debug!("lobby update receiver dropped");
        }
    }

    // -----------------------------------------------------------------------
    // Event loop
    // -----------------------------------------------------------------------

    /// Run until `Shutdown` arrives or the command channel closes.
    ///
    /// Listens on four sources:
    /// 1. transport events from the current (and any stale) connection
    /// 2. host commands
    /// 3. cache revisions, so optimistic merges made by a dispatcher
    ///    outside the loop are republished
    /// 4. expiry of the authorization notice
    pub async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) -> anyhow::Result<()> {
        let mut events = self
            .events
            .take()
            .context("lobby session loop is already running")?;
        let mut watched = self.state.characters.clone();
        let mut revisions = watched.subscribe();
        info!("lobby session loop started");

        loop {
            if !watched.same_cache(&self.state.characters) {
                watched = self.state.characters.clone();
                revisions = watched.subscribe();
            }
            let notice_deadline = self.authorization.expires_at();

            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => {
                        info!("transport event channel closed, shutting down");
                        break;
                    }
                },

                command = commands.recv() => match command {
                    Some(SessionCommand::Shutdown) => {
                        info!("shutdown requested");
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        info!("command channel closed, shutting down");
                        break;
                    }
                },

                Ok(()) = revisions.changed() => {
                    if self.state.characters.revision() != self.published_revision {
                        self.publish_snapshot().await;
                    }
                }

                _ = tokio::time::sleep_until(notice_deadline.unwrap_or_else(Instant::now)),
                    if notice_deadline.is_some() =>
                {
                    if self.authorization.prune() {
                        self.publish_snapshot().await;
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }
}
