// Folds inbound frames into the lobby view stores.
//
// Each frame kind touches its own store, so master/roster updates and
// character updates never contend. Within a store the last differing value
// wins; equal values are dropped without touching anything.

use tracing::{debug, warn};

use crate::identity::SessionIdentity;
use crate::protocol::{InboundFrame, MasterRecord};
use crate::store::{CharacterCache, MasterStore, SlotTable};

/// The three stores that make up one session's lobby view.
#[derive(Debug, Clone)]
pub struct LobbyState {
    pub master: MasterStore,
    pub slots: SlotTable,
    pub characters: CharacterCache,
}

impl LobbyState {
    /// Empty state sized for `identity`, sharing `characters` with any other
    /// writer (the action dispatcher).
    pub fn new(identity: &SessionIdentity, characters: CharacterCache) -> Self {
        LobbyState {
            master: MasterStore::default(),
            slots: SlotTable::new(identity.slot_count()),
            characters,
        }
    }

    /// Drop everything learnt from the previous session and resize the seat
    /// table. The character cache is replaced, not cleared: handles taken
    /// under the previous session keep writing into the old map and never
    /// reach this one.
    pub fn reset(&mut self, slot_count: usize) {
        self.master.clear();
        self.slots = SlotTable::new(slot_count);
        self.characters = CharacterCache::new();
    }
}

/// Which stores a frame actually changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub master_changed: bool,
    pub slots_changed: bool,
    pub characters_changed: usize,
}

impl ReconcileOutcome {
    pub fn any(&self) -> bool {
        self.master_changed || self.slots_changed || self.characters_changed > 0
    }
}

/// Apply one frame to `state`.
pub fn reconcile(
    state: &mut LobbyState,
    identity: &SessionIdentity,
    frame: InboundFrame,
) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome::default();

    match frame {
        InboundFrame::MasterUpdate { master } => {
            outcome.master_changed = state.master.replace(master);
        }
        InboundFrame::RosterUpdate { master, players } => {
            outcome.master_changed = apply_roster_master(&mut state.master, identity, master);
            if let Some(players) = players {
                outcome.slots_changed = state.slots.rebuild(players);
            }
        }
        InboundFrame::CharacterUpdate { character } => {
            let id = character.id;
            if state.characters.upsert(character) {
                debug!(character_id = %id, "character detail updated");
                outcome.characters_changed = 1;
            }
        }
        InboundFrame::InitialCharacters { characters } => {
            let total = characters.len();
            outcome.characters_changed = state.characters.upsert_all(characters);
            debug!(
                total,
                changed = outcome.characters_changed,
                "initial character sync applied"
            );
        }
        InboundFrame::Chat(_) => {
            // Chat is for transport listeners only.
        }
        InboundFrame::Unrecognized { kind } => {
            warn!(kind = %kind, "ignoring lobby frame of unknown type");
        }
    }

    outcome
}

/// A roster frame that omits the master keeps whatever master is already
/// known, or seeds one from the identity. Omission is never read as the
/// master leaving.
fn apply_roster_master(
    store: &mut MasterStore,
    identity: &SessionIdentity,
    master: Option<MasterRecord>,
) -> bool {
    match master {
        Some(master) => store.replace(master),
        None => store.ensure_with(|| identity.synthesized_master()),
    }
}
