// Wire protocol for the lobby push channel.
//
// Inbound frames are JSON objects discriminated by a `type` field. Parsing is
// two-step: the discriminator is read first so an unknown kind can be reported
// by name instead of surfacing as an opaque serde error.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("frame has no string `type` discriminator")]
    MissingType,

    #[error("invalid `{kind}` payload: {source}")]
    Payload {
        kind: String,
        source: serde_json::Error,
    },
}

// ---------------------------------------------------------------------------
// Identifiers and records
// ---------------------------------------------------------------------------

/// Server-assigned character identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CharacterId(pub i64);

impl fmt::Display for CharacterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The session owner. `character_id` stays `None` until the server
/// associates a character with the master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterRecord {
    pub username: String,
    #[serde(default)]
    pub character_id: Option<CharacterId>,
}

/// A non-master participant occupying a seat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerEntry {
    pub username: String,
    pub character_id: CharacterId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub id: i64,
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ability {
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
    #[serde(default)]
    pub uses_remaining: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEffect {
    pub name: String,
    /// Remaining rounds, if the effect is timed.
    #[serde(default)]
    pub duration: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub body: String,
}

/// A full character document as pushed by the server or returned by a
/// mutation.
///
/// Only `id` is required. Modelled fields read an explicit `null` as their
/// default, and fields the client does not model are kept verbatim in
/// `extra`, so value equality always covers the whole document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub id: CharacterId,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub level: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub max_hp: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub current_hp: i64,
    /// Stat name -> value. Values are kept as sent (integers, floats or
    /// derived objects).
    #[serde(default, deserialize_with = "null_as_default")]
    pub stats: BTreeMap<String, Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub inventory: Vec<InventoryItem>,
    /// Equipment slot name -> equipped item id (`None` for an empty slot).
    #[serde(default, deserialize_with = "null_as_default")]
    pub equipped: BTreeMap<String, Option<i64>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub abilities: Vec<Ability>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub status_effects: Vec<StatusEffect>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub notes: Vec<Note>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `null` decodes as `T::default()`.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

impl Character {
    /// A document with only the identity fields set.
    pub fn new(id: CharacterId, name: impl Into<String>) -> Self {
        Character {
            id,
            name: name.into(),
            level: 1,
            max_hp: 0,
            current_hp: 0,
            stats: BTreeMap::new(),
            inventory: Vec::new(),
            equipped: BTreeMap::new(),
            abilities: Vec::new(),
            status_effects: Vec::new(),
            notes: Vec::new(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: String,
    pub text: String,
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// Discriminator of an inbound frame, used to route listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    MasterUpdate,
    RosterUpdate,
    CharacterUpdate,
    InitialCharacters,
    Chat,
    Unrecognized,
}

impl FrameKind {
    pub fn from_wire(kind: &str) -> Self {
        match kind {
            "master_update" => FrameKind::MasterUpdate,
            "roster_update" => FrameKind::RosterUpdate,
            "character_update" => FrameKind::CharacterUpdate,
            "initial_characters" => FrameKind::InitialCharacters,
            "chat" => FrameKind::Chat,
            _ => FrameKind::Unrecognized,
        }
    }

    pub fn as_wire(self) -> &'static str {
        match self {
            FrameKind::MasterUpdate => "master_update",
            FrameKind::RosterUpdate => "roster_update",
            FrameKind::CharacterUpdate => "character_update",
            FrameKind::InitialCharacters => "initial_characters",
            FrameKind::Chat => "chat",
            FrameKind::Unrecognized => "unrecognized",
        }
    }
}

/// A typed inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    MasterUpdate {
        master: MasterRecord,
    },
    /// `master` is `None` when the frame omits it (or sends `null`);
    /// `players` is `None` when the frame carries no seat list at all.
    RosterUpdate {
        master: Option<MasterRecord>,
        players: Option<Vec<Option<PlayerEntry>>>,
    },
    CharacterUpdate {
        character: Character,
    },
    InitialCharacters {
        characters: Vec<Character>,
    },
    Chat(ChatMessage),
    Unrecognized {
        kind: String,
    },
}

impl InboundFrame {
    pub fn kind(&self) -> FrameKind {
        match self {
            InboundFrame::MasterUpdate { .. } => FrameKind::MasterUpdate,
            InboundFrame::RosterUpdate { .. } => FrameKind::RosterUpdate,
            InboundFrame::CharacterUpdate { .. } => FrameKind::CharacterUpdate,
            InboundFrame::InitialCharacters { .. } => FrameKind::InitialCharacters,
            InboundFrame::Chat(_) => FrameKind::Chat,
            InboundFrame::Unrecognized { .. } => FrameKind::Unrecognized,
        }
    }
}

#[derive(Deserialize)]
struct MasterPayload {
    master: MasterRecord,
}

#[derive(Deserialize)]
struct RosterPayload {
    #[serde(default)]
    master: Option<MasterRecord>,
    #[serde(default)]
    players: Option<Vec<Option<PlayerEntry>>>,
}

#[derive(Deserialize)]
struct CharacterPayload {
    character: Character,
}

#[derive(Deserialize)]
struct BulkPayload {
    #[serde(default, deserialize_with = "null_as_default")]
    characters: Vec<Value>,
}

/// Parse one text frame into an [`InboundFrame`].
///
/// An unknown `type` is not an error: it yields
/// [`InboundFrame::Unrecognized`] so the caller can log it by name.
pub fn parse_frame(text: &str) -> Result<InboundFrame, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_owned();

    let frame = match FrameKind::from_wire(&kind) {
        FrameKind::MasterUpdate => {
            let payload: MasterPayload = decode(&kind, value)?;
            InboundFrame::MasterUpdate {
                master: payload.master,
            }
        }
        FrameKind::RosterUpdate => {
            let payload: RosterPayload = decode(&kind, value)?;
            InboundFrame::RosterUpdate {
                master: payload.master,
                players: payload.players,
            }
        }
        FrameKind::CharacterUpdate => {
            let payload: CharacterPayload = decode(&kind, value)?;
            InboundFrame::CharacterUpdate {
                character: payload.character,
            }
        }
        FrameKind::InitialCharacters => {
            let payload: BulkPayload = decode(&kind, value)?;
            InboundFrame::InitialCharacters {
                characters: decode_documents(payload.characters),
            }
        }
        FrameKind::Chat => InboundFrame::Chat(decode(&kind, value)?),
        FrameKind::Unrecognized => InboundFrame::Unrecognized { kind },
    };
    Ok(frame)
}

/// Decode bulk entries one at a time. An unreadable document is skipped so
/// the rest of the batch still lands.
fn decode_documents(entries: Vec<Value>) -> Vec<Character> {
    entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| match serde_json::from_value(entry) {
            Ok(character) => Some(character),
            Err(e) => {
                warn!(index, error = %e, "skipping unreadable character in bulk sync");
                None
            }
        })
        .collect()
}

fn decode<T: DeserializeOwned>(kind: &str, value: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|source| ProtocolError::Payload {
        kind: kind.to_owned(),
        source,
    })
}
