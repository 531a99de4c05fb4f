//! Configuration for voice calls.
//!
//! Runtime behaviour is controlled only by defaults that the host environment can
//! override; there is no configuration file.

use crate::error::{CallError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Token session endpoint on the application backend.
pub const DEFAULT_SESSION_URL: &str = "https://apiceritain.indonesiacore.com/api/realtime/session";

/// Realtime speech provider SDP endpoint.
pub const DEFAULT_REALTIME_URL: &str = "https://api.openai.com/v1/realtime";

/// Default realtime model.
pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview-2024-12-17";

/// Default behaviour prompt.
pub const DEFAULT_PROMPT: &str = "jadi seorang psikolog yang membantu menyelesaikan masalah user";

/// Public STUN server used as the rendezvous hint.
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Label of the event side-channel expected by the provider.
pub const SIDE_CHANNEL_LABEL: &str = "oai-events";

/// Beta feature header sent with the SDP offer.
pub const BETA_HEADER: (&str, &str) = ("OpenAI-Beta", "realtime=v1");

/// Level sampling cadence: one display frame at 60 Hz.
pub const DEFAULT_LEVEL_INTERVAL: Duration = Duration::from_millis(16);

/// Environment variable names.
pub mod env {
    /// Overrides [`super::DEFAULT_SESSION_URL`].
    pub const SESSION_URL: &str = "CALLKIT_SESSION_URL";
    /// Overrides [`super::DEFAULT_REALTIME_URL`].
    pub const REALTIME_URL: &str = "CALLKIT_REALTIME_URL";
    /// Overrides [`super::DEFAULT_MODEL`].
    pub const MODEL: &str = "CALLKIT_REALTIME_MODEL";
    /// Overrides the default voice.
    pub const VOICE: &str = "CALLKIT_DEFAULT_VOICE";
    /// Overrides [`super::DEFAULT_PROMPT`].
    pub const PROMPT: &str = "CALLKIT_SYSTEM_PROMPT";
}

/// Voices accepted by the token service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Voice {
    #[default]
    Alloy,
    Echo,
    Fable,
    Onyx,
    Nova,
    Shimmer,
}

impl Voice {
    /// Every supported voice, in declaration order.
    pub const ALL: [Voice; 6] =
        [Voice::Alloy, Voice::Echo, Voice::Fable, Voice::Onyx, Voice::Nova, Voice::Shimmer];

    /// Wire name of the voice.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alloy => "alloy",
            Self::Echo => "echo",
            Self::Fable => "fable",
            Self::Onyx => "onyx",
            Self::Nova => "nova",
            Self::Shimmer => "shimmer",
        }
    }
}

impl fmt::Display for Voice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Voice {
    type Err = CallError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == wanted)
            .ok_or_else(|| CallError::config(format!("unknown voice '{s}'")))
    }
}

/// Configuration for a voice call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// Endpoint that exchanges the app credential for a session token.
    pub session_url: String,

    /// Provider endpoint receiving the SDP offer.
    pub realtime_url: String,

    /// Realtime model id, sent as the `model` query parameter.
    pub model: String,

    /// Voice requested for the remote party.
    pub voice: Voice,

    /// Behaviour prompt sent with the token request.
    pub prompt: String,

    /// ICE server URLs (`stun:` / `turn:`).
    pub ice_servers: Vec<String>,

    /// Interval between audio level samples.
    #[serde(with = "duration_millis")]
    pub level_interval: Duration,

    /// Feature header sent with the SDP offer, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub beta_header: Option<(String, String)>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            session_url: DEFAULT_SESSION_URL.to_string(),
            realtime_url: DEFAULT_REALTIME_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            voice: Voice::default(),
            prompt: DEFAULT_PROMPT.to_string(),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            level_interval: DEFAULT_LEVEL_INTERVAL,
            beta_header: Some((BETA_HEADER.0.to_string(), BETA_HEADER.1.to_string())),
        }
    }
}

impl CallConfig {
    /// Create a configuration with built-in defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(url) = get(env::SESSION_URL) {
            config.session_url = url;
        }
        if let Some(url) = get(env::REALTIME_URL) {
            config.realtime_url = url;
        }
        if let Some(model) = get(env::MODEL) {
            config.model = model;
        }
        if let Some(voice) = get(env::VOICE) {
            config.voice = voice.parse()?;
        }
        if let Some(prompt) = get(env::PROMPT) {
            config.prompt = prompt;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that both endpoints are absolute http(s) URLs.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("session_url", &self.session_url), ("realtime_url", &self.realtime_url)]
        {
            let parsed = url::Url::parse(value)
                .map_err(|e| CallError::config(format!("{name} '{value}' is not a URL: {e}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(CallError::config(format!("{name} must use http or https")));
            }
        }
        if self.model.trim().is_empty() {
            return Err(CallError::config("model must not be empty"));
        }
        if self.level_interval.is_zero() {
            return Err(CallError::config("level_interval must be positive"));
        }
        Ok(())
    }

    /// Set the token session endpoint.
    pub fn with_session_url(mut self, url: impl Into<String>) -> Self {
        self.session_url = url.into();
        self
    }

    /// Set the provider SDP endpoint.
    pub fn with_realtime_url(mut self, url: impl Into<String>) -> Self {
        self.realtime_url = url.into();
        self
    }

    /// Set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the voice.
    pub fn with_voice(mut self, voice: Voice) -> Self {
        self.voice = voice;
        self
    }

    /// Set the behaviour prompt.
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Replace the ICE server list.
    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        self.ice_servers = servers;
        self
    }

    /// Set the level sampling interval.
    pub fn with_level_interval(mut self, interval: Duration) -> Self {
        self.level_interval = interval;
        self
    }

    /// Drop the beta feature header.
    pub fn without_beta_header(mut self) -> Self {
        self.beta_header = None;
        self
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = CallConfig::default();
        assert_eq!(config.session_url, DEFAULT_SESSION_URL);
        assert_eq!(config.realtime_url, DEFAULT_REALTIME_URL);
        assert_eq!(config.voice, Voice::Alloy);
        assert_eq!(config.ice_servers, vec![DEFAULT_STUN_SERVER.to_string()]);
        assert_eq!(config.level_interval, Duration::from_millis(16));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lookup_overrides() {
        let config = CallConfig::from_lookup(lookup(&[
            (env::SESSION_URL, "http://localhost:8080/session"),
            (env::VOICE, "Shimmer"),
            (env::PROMPT, "be brief"),
            (env::MODEL, "  "),
        ]))
        .unwrap();

        assert_eq!(config.session_url, "http://localhost:8080/session");
        assert_eq!(config.voice, Voice::Shimmer);
        assert_eq!(config.prompt, "be brief");
        // blank values are ignored
        assert_eq!(config.model, DEFAULT_MODEL);
    }

    #[test]
    fn test_unknown_voice_is_config_error() {
        let err = CallConfig::from_lookup(lookup(&[(env::VOICE, "baritone")])).unwrap_err();
        assert!(matches!(err, CallError::Config(_)));
    }

    #[test]
    fn test_invalid_url_rejected() {
        let err = CallConfig::from_lookup(lookup(&[(env::REALTIME_URL, "ftp://example.com")]))
            .unwrap_err();
        assert!(matches!(err, CallError::Config(_)));
    }

    #[test]
    fn test_voice_round_trips_through_str() {
        for voice in Voice::ALL {
            assert_eq!(voice.as_str().parse::<Voice>().unwrap(), voice);
            assert_eq!(serde_json::to_value(voice).unwrap(), serde_json::json!(voice.as_str()));
        }
    }
}
