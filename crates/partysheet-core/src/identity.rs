// Session identity: who is joining which lobby, and where its push channel lives.

use std::fmt;

use thiserror::Error;
use url::Url;

use crate::protocol::{CharacterId, MasterRecord};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("missing session parameter `{0}`")]
    Missing(&'static str),

    #[error("invalid session key `{0}`: expected 6 alphanumeric characters")]
    InvalidSessionKey(String),

    #[error("invalid max player count {0}")]
    InvalidMaxPlayers(u32),

    #[error("participant `{0}` has no piloted character for this session")]
    NoPilotedCharacter(String),
}

/// The 6-character lobby code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey(String);

impl SessionKey {
    pub const LEN: usize = 6;

    pub fn parse(raw: &str) -> Result<Self, IdentityError> {
        let trimmed = raw.trim();
        if trimmed.len() == Self::LEN && trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
            Ok(SessionKey(trimmed.to_owned()))
        } else {
            Err(IdentityError::InvalidSessionKey(raw.to_owned()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authentication token. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Credential(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// The local user's role in the session, fixed when the identity is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Participant { piloted: CharacterId },
}

/// Raw lobby parameters as the host knows them. Any field may still be
/// unknown (route not parsed yet, login pending, character not picked).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionParams {
    pub credential: Option<String>,
    pub session_key: Option<String>,
    pub master_username: Option<String>,
    pub max_players: Option<u32>,
    pub local_username: Option<String>,
    pub piloted_character: Option<CharacterId>,
}

/// A complete, validated identity. Two identities that differ in any field
/// are distinct sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    session_key: SessionKey,
    master_username: String,
    max_players: u32,
    credential: Credential,
    local_username: Option<String>,
    role: Role,
}

impl SessionIdentity {
    /// Validate `params` and derive the local role.
    ///
    /// The local user is the master when their username matches the master
    /// username; anyone else must bring a piloted character id.
    pub fn resolve(params: &SessionParams) -> Result<Self, IdentityError> {
        let credential = params
            .credential
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or(IdentityError::Missing("credential"))?;
        let session_key = params
            .session_key
            .as_deref()
            .ok_or(IdentityError::Missing("session_key"))
            .and_then(SessionKey::parse)?;
        let master_username = params
            .master_username
            .as_deref()
            .filter(|m| !m.is_empty())
            .ok_or(IdentityError::Missing("master_username"))?;
        let max_players = params
            .max_players
            .ok_or(IdentityError::Missing("max_players"))?;
        if max_players == 0 {
            return Err(IdentityError::InvalidMaxPlayers(max_players));
        }

        let is_master = params.local_username.as_deref() == Some(master_username);
        let role = if is_master {
            Role::Master
        } else {
            match params.piloted_character {
                Some(piloted) => Role::Participant { piloted },
                None => {
                    return Err(IdentityError::NoPilotedCharacter(
                        params.local_username.clone().unwrap_or_default(),
                    ))
                }
            }
        };

        Ok(SessionIdentity {
            session_key,
            master_username: master_username.to_owned(),
            max_players,
            credential: Credential::new(credential),
            local_username: params.local_username.clone(),
            role,
        })
    }

    pub fn session_key(&self) -> &SessionKey {
        &self.session_key
    }

    pub fn master_username(&self) -> &str {
        &self.master_username
    }

    pub fn max_players(&self) -> u32 {
        self.max_players
    }

    pub fn local_username(&self) -> Option<&str> {
        self.local_username.as_deref()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_master(&self) -> bool {
        self.role == Role::Master
    }

    /// The character this participant pilots, captured at session start.
    pub fn piloted_character(&self) -> Option<CharacterId> {
        match self.role {
            Role::Master => None,
            Role::Participant { piloted } => Some(piloted),
        }
    }

    /// Number of non-master seats.
    pub fn slot_count(&self) -> usize {
        self.max_players.saturating_sub(1) as usize
    }

    /// Minimal master record used until the server reports one.
    pub fn synthesized_master(&self) -> MasterRecord {
        MasterRecord {
            username: self.master_username.clone(),
            character_id: None,
        }
    }

    /// The push-channel endpoint for this identity.
    ///
    /// Every identity parameter travels as a query parameter; the master
    /// omits `character_id` entirely.
    pub fn endpoint(&self, base: &Url) -> Url {
        let mut url = base.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("token", self.credential.expose())
                .append_pair("session_key", self.session_key.as_str())
                .append_pair("master", &self.master_username)
                .append_pair("max_players", &self.max_players.to_string());
            if let Some(piloted) = self.piloted_character() {
                query.append_pair("character_id", &piloted.to_string());
            }
        }
        url
    }
}

/// Render an endpoint for logs with the credential removed.
pub fn redacted_endpoint(url: &Url) -> String {
    let mut redacted = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "token")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    redacted.set_query(None);
    if !pairs.is_empty() {
        redacted.query_pairs_mut().extend_pairs(pairs);
    }
    redacted.to_string()
}
