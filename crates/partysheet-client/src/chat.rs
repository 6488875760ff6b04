// Lobby chat: a consumer of the shared push channel.
//
// The feed never owns the connection. It attaches a `chat` listener to a
// `ConnectionView`, keeps a bounded transcript and sends plain text.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use partysheet_core::{Config, FrameKind, InboundFrame};
use thiserror::Error;
use tracing::debug;

use crate::connection::{ConnectionView, Generation, ListenerGuard};
use crate::transport::TransportError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("chat is not attached to a connection")]
    Detached,

    #[error("message is empty")]
    Empty,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    pub sender: String,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

struct Attachment {
    view: ConnectionView,
    _guard: ListenerGuard,
}

pub struct ChatFeed {
    limit: usize,
    transcript: Arc<Mutex<VecDeque<ChatLine>>>,
    attachment: Option<Attachment>,
}

impl std::fmt::Debug for ChatFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatFeed")
            .field("limit", &self.limit)
            .field("lines", &self.len())
            .field("generation", &self.generation())
            .finish()
    }
}

impl ChatFeed {
    /// A detached feed keeping at most `limit` lines.
    pub fn new(limit: usize) -> Self {
        ChatFeed {
            limit: limit.max(1),
            transcript: Arc::new(Mutex::new(VecDeque::new())),
            attachment: None,
        }
    }

    /// A detached feed sized by `chat.transcript_limit`.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.chat.transcript_limit)
    }

    /// Listen on `view`, replacing any previous attachment. The transcript
    /// is kept across re-attachment.
    pub fn attach(&mut self, view: ConnectionView) {
        let transcript = self.transcript.clone();
        let limit = self.limit;
        let guard = view.on_message(FrameKind::Chat, move |frame| {
            if let InboundFrame::Chat(message) = frame {
                let mut lines = transcript.lock().unwrap_or_else(PoisonError::into_inner);
                lines.push_back(ChatLine {
                    sender: message.sender.clone(),
                    text: message.text.clone(),
                    received_at: Utc::now(),
                });
                while lines.len() > limit {
                    lines.pop_front();
                }
            }
        });
        debug!(generation = view.generation(), "chat attached");
        // Assigning drops the old guard, which removes the old listener.
        self.attachment = Some(Attachment {
            view,
            _guard: guard,
        });
    }

    /// Follow a connection change pushed by the session.
    pub fn follow(&mut self, view: Option<ConnectionView>) {
        match view {
            Some(view) => self.attach(view),
            None => self.detach(),
        }
    }

    pub fn detach(&mut self) {
        if self.attachment.take().is_some() {
            debug!("chat detached");
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attachment.is_some()
    }

    pub fn generation(&self) -> Option<Generation> {
        self.attachment.as_ref().map(|a| a.view.generation())
    }

    /// Send one chat line as plain text.
    pub fn send(&self, text: &str) -> Result<(), ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::Empty);
        }
        let attachment = self.attachment.as_ref().ok_or(ChatError::Detached)?;
        attachment.view.send(text)?;
        Ok(())
    }

    /// Transcript, oldest first.
    pub fn lines(&self) -> Vec<ChatLine> {
        self.transcript
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.transcript
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.transcript
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
