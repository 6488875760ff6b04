// In-memory transport: a connector whose "server" side lives in the same
// process. Used by the tests to script a lobby without opening sockets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;

use crate::transport::{Connector, Transport, TransportError, TransportMessage};

/// What the client wrote to a [`MemoryPeer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Text(String),
    Close { code: u16, reason: String },
}

/// Create a connected connector / server pair.
pub fn memory_pair() -> (MemoryConnector, MemoryServer) {
    let (peers_tx, peers_rx) = mpsc::unbounded_channel();
    let refuse = Arc::new(AtomicBool::new(false));
    let endpoints = Arc::new(Mutex::new(Vec::new()));
    (
        MemoryConnector {
            peers: peers_tx,
            refuse: refuse.clone(),
            endpoints: endpoints.clone(),
        },
        MemoryServer {
            peers: peers_rx,
            refuse,
            endpoints,
        },
    )
}

#[derive(Debug, Clone)]
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    refuse: Arc<AtomicBool>,
    endpoints: Arc<Mutex<Vec<Url>>>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, endpoint: &Url) -> Result<Box<dyn Transport>, TransportError> {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(endpoint.clone());

        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".into()));
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            endpoint: endpoint.clone(),
            inbound: inbound_tx,
            outbound: outbound_rx,
        };
        self.peers
            .send(peer)
            .map_err(|_| TransportError::Connect("memory server is gone".into()))?;

        Ok(Box::new(MemoryTransport {
            inbound: inbound_rx,
            outbound: outbound_tx,
            closed: false,
        }))
    }
}

/// Accepts the connections made through the paired [`MemoryConnector`].
#[derive(Debug)]
pub struct MemoryServer {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
    refuse: Arc<AtomicBool>,
    endpoints: Arc<Mutex<Vec<Url>>>,
}

impl MemoryServer {
    /// Wait for the next client connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }

    /// Make subsequent connection attempts fail (or succeed again).
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Every endpoint a connection was attempted against, in order.
    pub fn attempted_endpoints(&self) -> Vec<Url> {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Server half of one in-memory connection.
#[derive(Debug)]
pub struct MemoryPeer {
    endpoint: Url,
    inbound: mpsc::UnboundedSender<Result<TransportMessage, TransportError>>,
    outbound: mpsc::UnboundedReceiver<ClientFrame>,
}

impl MemoryPeer {
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Value of query parameter `key` on the connection endpoint.
    pub fn query(&self, key: &str) -> Option<String> {
        self.endpoint
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    /// Deliver a text frame. Returns false once the client side is gone.
    pub fn push_text(&self, text: impl Into<String>) -> bool {
        self.inbound
            .send(Ok(TransportMessage::Text(text.into())))
            .is_ok()
    }

    pub fn push_json(&self, value: &Value) -> bool {
        self.push_text(value.to_string())
    }

    /// Deliver a close frame.
    pub fn close(&self, code: Option<u16>, reason: &str) -> bool {
        self.inbound
            .send(Ok(TransportMessage::Close {
                code,
                reason: reason.to_owned(),
            }))
            .is_ok()
    }

    /// Deliver a receive error.
    pub fn fail(&self, message: &str) -> bool {
        self.inbound
            .send(Err(TransportError::Receive(message.to_owned())))
            .is_ok()
    }

    /// Next frame written by the client; `None` once the client dropped its
    /// transport.
    pub async fn next_outbound(&mut self) -> Option<ClientFrame> {
        self.outbound.recv().await
    }
}

struct MemoryTransport {
    inbound: mpsc::UnboundedReceiver<Result<TransportMessage, TransportError>>,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    closed: bool,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(ClientFrame::Text(text))
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<TransportMessage, TransportError>> {
        self.inbound.recv().await
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        if !self.closed {
            self.closed = true;
            // The peer may already be gone; closing is still complete.
            let _ = self.outbound.send(ClientFrame::Close {
                code,
                reason: reason.to_owned(),
            });
        }
        Ok(())
    }
}
