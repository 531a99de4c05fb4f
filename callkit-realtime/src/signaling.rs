//! Offer/answer exchange with the realtime provider.

use crate::config::CallConfig;
use crate::error::{CallError, Result};
use crate::token::SessionCredential;
use crate::transport::SessionDescription;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::Instrument;

/// One-shot signaling exchange: the full offer out, the full answer back.
#[async_trait]
pub trait SignalingClient: Send + Sync {
    async fn exchange(
        &self,
        credential: &SessionCredential,
        offer: &SessionDescription,
    ) -> Result<SessionDescription>;
}

/// JSON form of an SDP answer.
#[derive(Debug, Deserialize)]
struct SdpExchangeResponse {
    sdp: String,
}

/// Signaling over a single HTTP POST.
#[derive(Debug, Clone)]
pub struct HttpSignaling {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    beta_header: Option<(String, String)>,
}

impl HttpSignaling {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            beta_header: None,
        }
    }

    pub fn from_config(config: &CallConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: config.realtime_url.clone(),
            model: config.model.clone(),
            beta_header: config.beta_header.clone(),
        }
    }

    /// Share an existing HTTP client.
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Send an extra feature header with every offer.
    pub fn with_beta_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.beta_header = Some((name.into(), value.into()));
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn url(&self) -> Result<url::Url> {
        let mut url = url::Url::parse(&self.endpoint)
            .map_err(|e| CallError::config(format!("invalid realtime endpoint: {e}")))?;
        url.query_pairs_mut().append_pair("model", &self.model);
        Ok(url)
    }
}

#[async_trait]
impl SignalingClient for HttpSignaling {
    async fn exchange(
        &self,
        credential: &SessionCredential,
        offer: &SessionDescription,
    ) -> Result<SessionDescription> {
        let url = self.url()?;
        let span = callkit_telemetry::handshake_span(&self.model);

        async {
            let mut request = self
                .client
                .post(url)
                .bearer_auth(credential.expose_secret())
                .header(reqwest::header::CONTENT_TYPE, "application/sdp")
                .body(offer.sdp.clone());
            if let Some((name, value)) = &self.beta_header {
                request = request.header(name.as_str(), value.as_str());
            }

            let response = request
                .send()
                .await
                .map_err(|e| CallError::network(format!("SDP exchange request failed: {e}")))?;

            let status = response.status();
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let body = response
                .text()
                .await
                .map_err(|e| CallError::network(format!("failed to read SDP answer body: {e}")))?;

            if !status.is_success() {
                tracing::warn!(http.status = status.as_u16(), "SDP exchange rejected");
                return Err(CallError::signaling(status.as_u16(), body));
            }

            let sdp = if content_type.contains("json") {
                serde_json::from_str::<SdpExchangeResponse>(&body)
                    .map_err(|e| CallError::transport(format!("unparsable SDP answer: {e}")))?
                    .sdp
            } else {
                body
            };
            if sdp.trim().is_empty() {
                return Err(CallError::transport("empty SDP answer"));
            }

            tracing::debug!(answer.len = sdp.len(), "received SDP answer");
            Ok(SessionDescription::answer(sdp))
        }
        .instrument(span)
        .await
    }
}
