// REST adapter for character and lobby mutations.
//
// Produces `ActionOutcome`s and `ApiError`s in the shapes the action
// dispatcher consumes; the endpoints themselves belong to the server.

use std::fmt;

use partysheet_core::{
    ActionOutcome, ApiError, Character, CharacterId, Config, ErrorBody, Mutation,
    MutationResponse,
};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("base", &self.base.as_str())
            .field("authenticated", &self.token.is_some())
            .finish()
    }
}

impl ApiClient {
    /// `base` should end in `/` so relative paths join below it.
    pub fn new(base: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            base,
            token: None,
        }
    }

    /// Client for `server.api_url`.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.server.api_url.clone())
    }

    /// Attach a bearer token to every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Absolute URL for `path` relative to the base.
    pub fn url(&self, path: &str) -> Result<Url, ApiError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| ApiError::Transport(format!("invalid request path `{path}`: {e}")))
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send::<(), T>(Method::GET, path, None).await
    }

    /// Run a mutation whose response is either the entity or an
    /// `[entity, side_effect]` pair.
    pub async fn mutate<B, T>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<ActionOutcome<T>, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response: MutationResponse<T> = self.send(method, path, Some(body)).await?;
        Ok(response.into())
    }

    /// `POST characters/{id}/{action}` with `body`.
    pub async fn character_action(
        &self,
        id: CharacterId,
        action: &str,
        body: &Value,
    ) -> Result<ActionOutcome<Character>, ApiError> {
        self.mutate(Method::POST, &format!("characters/{id}/{action}"), body)
            .await
    }

    pub async fn character(&self, id: CharacterId) -> Result<Character, ApiError> {
        self.get(&format!("characters/{id}")).await
    }

    /// A deferred lobby mutation. The dispatcher appends its scoped
    /// arguments (the session key), and the full argument list is posted
    /// as a JSON array to `path`.
    pub fn deferred<'a, T>(&'a self, path: &'a str, args: Vec<Value>) -> Mutation<'a, T>
    where
        T: DeserializeOwned + Send + 'a,
    {
        Mutation::deferred(
            move |args: Vec<Value>| async move {
                self.mutate::<_, T>(Method::POST, path, &Value::Array(args))
                    .await
            },
            args,
        )
    }

    async fn send<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path)?;
        debug!(method = %method, url = %url, "api request");

        let mut request = self.http.request(method, url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(error_from_body(status, &bytes));
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| ApiError::Transport(format!("invalid response body: {e}")))
    }
}

/// Map a non-success response to an [`ApiError`]. A body that is not the
/// `{ "detail": ... }` shape simply carries no detail.
pub fn error_from_body(status: StatusCode, body: &[u8]) -> ApiError {
    let detail = serde_json::from_slice::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.detail);
    ApiError::response(status.as_u16(), detail)
}
