// Library root for the lobby session core: wire protocol, session identity,
// view stores, reconciliation, sheet authorization and action dispatch.
// Nothing in this crate performs I/O.

pub mod authorize;
pub mod config;
pub mod dispatch;
pub mod identity;
pub mod notice;
pub mod protocol;
pub mod reconcile;
pub mod store;

pub use authorize::{authorize_expand, AuthorizationError, SheetSelection, SheetToggle};
pub use config::{Config, ConfigError};
pub use dispatch::{
    ActionDispatcher, ActionOutcome, ActionReport, ApiError, CacheMerge, ErrorBody, ErrorDetail,
    Mutation, MutationResponse,
};
pub use identity::{IdentityError, Role, SessionIdentity, SessionKey, SessionParams};
pub use notice::NoticeSlot;
pub use protocol::{
    parse_frame, Character, CharacterId, ChatMessage, FrameKind, InboundFrame, MasterRecord,
    PlayerEntry, ProtocolError,
};
pub use reconcile::{reconcile, LobbyState, ReconcileOutcome};
pub use store::{CharacterCache, MasterStore, SlotTable};
