// Action dispatch: one execution contract for every mutating user action.
//
// A mutation either arrives already running (`Mutation::Pending`) or as a
// callable plus positional arguments (`Mutation::Deferred`) so that
// session-scoped arguments can be appended before it is invoked. Success
// either refreshes authoritative state through a callback or merges the
// returned character into the shared cache. Failure is turned into a stored
// message and never escapes to the caller.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::notice::NoticeSlot;
use crate::protocol::Character;
use crate::store::CharacterCache;

// ---------------------------------------------------------------------------
// Error shape of the REST boundary
// ---------------------------------------------------------------------------

/// Request-location markers that prefix a validation `loc` and are not part
/// of the field path shown to the user.
const LOCATION_MARKERS: &[&str] = &["body", "query", "path", "header", "cookie"];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum LocSegment {
    Field(String),
    Index(u64),
}

impl fmt::Display for LocSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocSegment::Field(name) => f.write_str(name),
            LocSegment::Index(i) => write!(f, "{i}"),
        }
    }
}

/// One entry of a structured validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ValidationIssue {
    pub msg: String,
    #[serde(default)]
    pub loc: Vec<LocSegment>,
}

impl ValidationIssue {
    /// Dotted field path with the leading request-location marker removed.
    pub fn field_path(&self) -> String {
        let segments = match self.loc.split_first() {
            Some((LocSegment::Field(first), rest))
                if LOCATION_MARKERS.contains(&first.as_str()) && !rest.is_empty() =>
            {
                rest
            }
            _ => &self.loc[..],
        };
        segments
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(".")
    }
}

/// The `detail` member of an error response body.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ErrorDetail {
    Validation(Vec<ValidationIssue>),
    Message(String),
    Other(Value),
}

/// Error response body: `{ "detail": ... }`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub detail: Option<ErrorDetail>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApiError {
    /// The server answered with a non-success status.
    #[error("{message}")]
    Response {
        status: u16,
        detail: Option<ErrorDetail>,
        message: String,
    },

    /// The request never produced a usable response.
    #[error("{0}")]
    Transport(String),
}

impl ApiError {
    pub fn response(status: u16, detail: Option<ErrorDetail>) -> Self {
        ApiError::Response {
            status,
            detail,
            message: format!("request failed with status code {status}"),
        }
    }

    /// The single human-readable line shown for this failure.
    ///
    /// Precedence: first validation issue, then a plain string detail, then
    /// the raw error message.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Response {
                detail: Some(ErrorDetail::Validation(issues)),
                ..
            } if !issues.is_empty() => {
                let issue = &issues[0];
                format!(
                    "validation error: {} (field: {})",
                    issue.msg,
                    issue.field_path()
                )
            }
            ApiError::Response {
                detail: Some(ErrorDetail::Message(text)),
                ..
            } => text.clone(),
            other => other.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of a successful mutation: the updated entity plus an optional
/// secondary effect it triggered (e.g. `"Rage"`).
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome<T> {
    pub entity: T,
    pub side_effect: Option<String>,
}

impl<T> ActionOutcome<T> {
    pub fn new(entity: T) -> Self {
        ActionOutcome {
            entity,
            side_effect: None,
        }
    }

    pub fn with_side_effect(mut self, effect: impl Into<String>) -> Self {
        self.side_effect = Some(effect.into());
        self
    }
}

/// Wire shape of a mutation response: either the bare entity or an
/// `[entity, effect]` pair.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum MutationResponse<T> {
    WithSideEffect(T, Option<String>),
    Entity(T),
}

impl<T> From<MutationResponse<T>> for ActionOutcome<T> {
    fn from(response: MutationResponse<T>) -> Self {
        match response {
            MutationResponse::WithSideEffect(entity, side_effect) => ActionOutcome {
                entity,
                side_effect,
            },
            MutationResponse::Entity(entity) => ActionOutcome::new(entity),
        }
    }
}

/// Extracts the character, if any, that a mutation's entity carries.
pub trait CacheMerge {
    fn into_character(self) -> Option<Character>;
}

impl CacheMerge for Character {
    fn into_character(self) -> Option<Character> {
        Some(self)
    }
}

impl CacheMerge for Option<Character> {
    fn into_character(self) -> Option<Character> {
        self
    }
}

impl CacheMerge for () {
    fn into_character(self) -> Option<Character> {
        None
    }
}

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

pub type MutationFuture<'a, T> = BoxFuture<'a, Result<ActionOutcome<T>, ApiError>>;
pub type DeferredCall<'a, T> = Box<dyn FnOnce(Vec<Value>) -> MutationFuture<'a, T> + Send + 'a>;
pub type RefreshFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

pub enum Mutation<'a, T> {
    /// An already-invoked operation.
    Pending(MutationFuture<'a, T>),
    /// A callable invoked with `args` followed by the dispatcher's
    /// session-scoped arguments.
    Deferred {
        call: DeferredCall<'a, T>,
        args: Vec<Value>,
    },
}

impl<'a, T: 'a> Mutation<'a, T> {
    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = Result<ActionOutcome<T>, ApiError>> + Send + 'a,
    {
        Mutation::Pending(Box::pin(future))
    }

    pub fn deferred<C, F>(call: C, args: Vec<Value>) -> Self
    where
        C: FnOnce(Vec<Value>) -> F + Send + 'a,
        F: Future<Output = Result<ActionOutcome<T>, ApiError>> + Send + 'a,
    {
        Mutation::Deferred {
            call: Box::new(move |args: Vec<Value>| -> MutationFuture<'a, T> {
                Box::pin(call(args))
            }),
            args,
        }
    }
}

/// What one dispatch did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionReport {
    Succeeded {
        /// Whether the returned character changed the cache.
        merged: bool,
        side_effect: Option<String>,
    },
    Failed {
        message: String,
    },
}

// ---------------------------------------------------------------------------
// ActionDispatcher
// ---------------------------------------------------------------------------

/// Runs mutations and owns the transient action-result channels.
///
/// A detail page configures a refresh callback; a lobby sheet configures the
/// shared cache and the session key as a scoped argument instead.
pub struct ActionDispatcher {
    cache: Option<CharacterCache>,
    refresh: Option<RefreshFn>,
    scoped_args: Vec<Value>,
    message: NoticeSlot,
    error: NoticeSlot,
    side_effect: NoticeSlot,
}

impl fmt::Debug for ActionDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDispatcher")
            .field("merges", &self.cache.is_some())
            .field("refreshes", &self.refresh.is_some())
            .field("scoped_args", &self.scoped_args)
            .finish()
    }
}

impl ActionDispatcher {
    /// A dispatcher that neither refreshes nor merges; messages live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        ActionDispatcher {
            cache: None,
            refresh: None,
            scoped_args: Vec::new(),
            message: NoticeSlot::new(ttl),
            error: NoticeSlot::new(ttl),
            side_effect: NoticeSlot::new(ttl),
        }
    }

    /// Merge returned characters into `cache` when no refresh is configured.
    pub fn merging_into(mut self, cache: CharacterCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Pull authoritative state after every successful action.
    pub fn refreshing_with<F, Fut>(mut self, refresh: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.refresh = Some(Arc::new(move || -> BoxFuture<'static, ()> {
            Box::pin(refresh())
        }));
        self
    }

    /// Append `arg` to the arguments of every deferred mutation.
    pub fn with_scoped_arg(mut self, arg: impl Into<Value>) -> Self {
        self.scoped_args.push(arg.into());
        self
    }

    /// Run `mutation`. `label` becomes the success message.
    ///
    /// Never fails: errors are formatted and stored in [`Self::error`].
    pub async fn dispatch<'a, T>(&mut self, label: &str, mutation: Mutation<'a, T>) -> ActionReport
    where
        T: CacheMerge + Send + 'a,
    {
        self.message.clear();
        self.error.clear();

        let pending = match mutation {
            Mutation::Pending(future) => future,
            Mutation::Deferred { call, mut args } => {
                args.extend(self.scoped_args.iter().cloned());
                call(args)
            }
        };

        match pending.await {
            Ok(ActionOutcome {
                entity,
                side_effect,
            }) => {
                let merged = match (self.refresh.clone(), &self.cache) {
                    (Some(refresh), _) => {
                        refresh().await;
                        false
                    }
                    (None, Some(cache)) => entity
                        .into_character()
                        .is_some_and(|character| cache.upsert(character)),
                    (None, None) => false,
                };
                if let Some(effect) = &side_effect {
                    self.side_effect.show(effect.clone());
                }
                self.message.show(label);
                debug!(action = label, merged, "action succeeded");
                ActionReport::Succeeded {
                    merged,
                    side_effect,
                }
            }
            Err(err) => {
                let message = err.user_message();
                warn!(action = label, error = %message, "action failed");
                self.error.show(message.clone());
                ActionReport::Failed { message }
            }
        }
    }

    /// Transient success message of the last action.
    pub fn message(&self) -> Option<&str> {
        self.message.current()
    }

    /// Transient error message of the last action.
    pub fn error(&self) -> Option<&str> {
        self.error.current()
    }

    /// Transient secondary-effect notification, cleared independently.
    pub fn side_effect(&self) -> Option<&str> {
        self.side_effect.current()
    }

    pub fn clear_side_effect(&mut self) {
        self.side_effect.clear();
    }
}
