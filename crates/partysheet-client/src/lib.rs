// Library root for the networked half of the lobby client: transports, the
// connection lifecycle, the session loop, chat and the REST adapter.

pub mod chat;
pub mod connection;
pub mod memory;
pub mod rest;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use chat::{ChatError, ChatFeed, ChatLine};
pub use connection::{
    ConnectionManager, ConnectionPhase, ConnectionView, Generation, ListenerGuard, SyncOutcome,
    TransportEvent, TransportEventKind,
};
pub use memory::{memory_pair, ClientFrame, MemoryConnector, MemoryPeer, MemoryServer};
pub use rest::ApiClient;
pub use session::{LobbySession, LobbySnapshot, LobbyUpdate, SessionCommand};
pub use transport::{Connector, Transport, TransportError, TransportMessage, TungsteniteConnector};
