// Who may open which character sheet in the large panel.

use thiserror::Error;

use crate::identity::SessionIdentity;
use crate::protocol::CharacterId;
use crate::store::CharacterCache;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorizationError {
    #[error("character {0} has not loaded yet")]
    NotLoaded(CharacterId),

    #[error("you can only open your own character sheet")]
    NotPermitted(CharacterId),
}

/// Check whether the local user may expand `id`.
///
/// The character must already be cached, and the user must be the master or
/// be piloting `id`. The piloted id comes from the identity captured at
/// session start, never from server pushes.
pub fn authorize_expand(
    identity: &SessionIdentity,
    cache: &CharacterCache,
    id: CharacterId,
) -> Result<(), AuthorizationError> {
    if !cache.contains(id) {
        return Err(AuthorizationError::NotLoaded(id));
    }
    if identity.is_master() || identity.piloted_character() == Some(id) {
        Ok(())
    } else {
        Err(AuthorizationError::NotPermitted(id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SheetToggle {
    Expanded(CharacterId),
    /// Back to the default (chat) panel.
    Collapsed,
}

/// Which character sheet, if any, replaces the chat panel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SheetSelection {
    expanded: Option<CharacterId>,
}

impl SheetSelection {
    pub fn expanded(&self) -> Option<CharacterId> {
        self.expanded
    }

    /// Toggle `id`: collapse if it is already open, otherwise expand it once
    /// authorized. A denied request leaves the selection untouched.
    pub fn toggle(
        &mut self,
        id: CharacterId,
        identity: &SessionIdentity,
        cache: &CharacterCache,
    ) -> Result<SheetToggle, AuthorizationError> {
        if self.expanded == Some(id) {
            self.expanded = None;
            return Ok(SheetToggle::Collapsed);
        }
        authorize_expand(identity, cache, id)?;
        self.expanded = Some(id);
        Ok(SheetToggle::Expanded(id))
    }

    pub fn clear(&mut self) {
        self.expanded = None;
    }
}
