//! Session token provider.
//!
//! The application backend exchanges its own credential for a short-lived
//! session secret. The secret is the only artifact handed to `connect`.

use crate::config::{CallConfig, Voice};
use crate::error::{CallError, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::Instrument;

/// Body of the token request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRequest {
    pub prompt: String,
    pub voice: Voice,
}

impl SessionRequest {
    pub fn new(prompt: impl Into<String>, voice: Voice) -> Self {
        Self { prompt: prompt.into(), voice }
    }

    /// Request using the configured prompt and voice.
    pub fn from_config(config: &CallConfig) -> Self {
        Self::new(config.prompt.clone(), config.voice)
    }
}

/// Single-use bearer credential for one handshake attempt.
///
/// Not `Clone`: `connect` takes it by value, so a retry always needs a fresh one.
pub struct SessionCredential {
    secret: SecretString,
    expires_at: Option<u64>,
    session_id: Option<String>,
}

impl SessionCredential {
    /// Wrap a secret. Empty values are rejected.
    pub fn new(secret: impl Into<String>) -> Result<Self> {
        let secret = secret.into();
        if secret.trim().is_empty() {
            return Err(CallError::envelope("session credential is empty"));
        }
        Ok(Self { secret: SecretString::from(secret), expires_at: None, session_id: None })
    }

    /// Set the expiry (epoch seconds).
    pub fn with_expires_at(mut self, expires_at: u64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Set the provider session id.
    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn expose_secret(&self) -> &str {
        self.secret.expose_secret()
    }

    pub fn expires_at(&self) -> Option<u64> {
        self.expires_at
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

impl fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredential")
            .field("secret", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// Source of session credentials.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Obtain a fresh credential. Never cached.
    async fn create_session(&self, request: &SessionRequest) -> Result<SessionCredential>;
}

// ── Envelope ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "errorCode")]
    error_code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    result: Option<SessionResult>,
}

#[derive(Debug, Deserialize)]
struct SessionResult {
    #[serde(default)]
    client_secret: Option<ClientSecret>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClientSecret {
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    expires_at: Option<u64>,
}

/// Validate a token envelope and pull out the credential.
///
/// Both checks matter: `errorCode != 0` is a failure even on HTTP success, and a
/// missing secret is a failure even with `errorCode == 0`.
pub fn extract_credential(body: &str) -> Result<SessionCredential> {
    let envelope: Envelope = serde_json::from_str(body)
        .map_err(|e| CallError::envelope(format!("unparsable token envelope: {e}")))?;

    if envelope.error_code != 0 {
        return Err(CallError::SessionRejected {
            code: envelope.error_code,
            message: envelope.message,
        });
    }

    let result = envelope.result.unwrap_or(SessionResult { client_secret: None, id: None, model: None });
    let secret = result
        .client_secret
        .as_ref()
        .and_then(|s| s.value.as_deref())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| CallError::envelope("missing result.client_secret.value"))?;

    let mut credential = SessionCredential::new(secret)?;
    if let Some(expires_at) = result.client_secret.as_ref().and_then(|s| s.expires_at) {
        credential = credential.with_expires_at(expires_at);
    }
    if let Some(id) = result.id {
        credential = credential.with_session_id(id);
    }
    if let Some(model) = result.model.as_deref() {
        tracing::debug!(model, "token service selected model");
    }
    Ok(credential)
}

// ── HTTP provider ───────────────────────────────────────────────────────

/// Token provider backed by the application's session endpoint.
#[derive(Debug, Clone)]
pub struct HttpTokenProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTokenProvider {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint)
    }

    /// Share an existing HTTP client.
    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self { client, endpoint: endpoint.into() }
    }

    pub fn from_config(config: &CallConfig) -> Self {
        Self::new(config.session_url.clone())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn create_session(&self, request: &SessionRequest) -> Result<SessionCredential> {
        let span = callkit_telemetry::token_request_span(&self.endpoint);
        async {
            let response = self
                .client
                .post(&self.endpoint)
                .json(request)
                .send()
                .await
                .map_err(|e| CallError::network(format!("token request failed: {e}")))?;

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|e| CallError::network(format!("failed to read token response: {e}")))?;

            if !status.is_success() {
                tracing::warn!(http.status = status.as_u16(), "token request rejected");
                return Err(CallError::signaling(status.as_u16(), body));
            }

            let credential = extract_credential(&body)?;
            tracing::debug!(expires_at = ?credential.expires_at(), "obtained session credential");
            Ok(credential)
        }
        .instrument(span)
        .await
    }
}
