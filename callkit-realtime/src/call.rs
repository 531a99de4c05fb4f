//! Headless call surface: the actions a call screen offers, on top of a
//! [`Negotiator`].

use crate::negotiator::Negotiator;
use crate::state::{ConnectionState, ConnectionStatus};
use crate::token::{SessionRequest, TokenProvider};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;

/// One call as seen by its surface.
pub struct CallSession {
    negotiator: Negotiator,
    provider: Arc<dyn TokenProvider>,
    request: SessionRequest,
    retrying: AtomicBool,
}

impl CallSession {
    pub fn new(
        negotiator: Negotiator,
        provider: impl TokenProvider + 'static,
        request: SessionRequest,
    ) -> Self {
        Self { negotiator, provider: Arc::new(provider), request, retrying: AtomicBool::new(false) }
    }

    pub fn negotiator(&self) -> &Negotiator {
        &self.negotiator
    }

    /// Mount: fetch a credential and connect.
    pub async fn start(&self) -> ConnectionStatus {
        tracing::info!(voice = %self.request.voice, "starting call");
        self.negotiator.connect_with(self.provider.as_ref(), &self.request).await
    }

    /// Run the full connect sequence again with a fresh credential. A retry
    /// issued while another is running returns the current status.
    pub async fn retry(&self) -> ConnectionStatus {
        if self.retrying.swap(true, Ordering::AcqRel) {
            tracing::debug!("retry already in progress");
            return self.negotiator.status();
        }
        let _reset = RetryReset(&self.retrying);
        tracing::info!("retrying call");
        self.negotiator.connect_with(self.provider.as_ref(), &self.request).await
    }

    /// Hang up.
    pub fn end_call(&self) {
        tracing::info!(elapsed = ?self.elapsed(), "ending call");
        self.negotiator.disconnect();
    }

    pub fn toggle_mute(&self) -> Option<bool> {
        self.negotiator.toggle_mute()
    }

    pub fn state(&self) -> ConnectionState {
        self.negotiator.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.negotiator.subscribe()
    }

    /// Time since the side-channel opened; zero when not connected.
    pub fn elapsed(&self) -> Duration {
        self.negotiator.state().connected_at.map(|t| t.elapsed()).unwrap_or_default()
    }

    /// `elapsed` as `mm:ss`.
    pub fn duration_label(&self) -> String {
        format_call_duration(self.elapsed().as_secs())
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        // unmount
        self.negotiator.disconnect();
    }
}

/// Clears the in-flight retry flag, also when the retry future is dropped.
struct RetryReset<'a>(&'a AtomicBool);

impl Drop for RetryReset<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Format whole seconds as zero-padded `mm:ss`. Minutes keep growing past 59.
pub fn format_call_duration(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}
