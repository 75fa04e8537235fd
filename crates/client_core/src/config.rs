use std::time::Duration;

use server_api::AdminSuccession;
use tracing::warn;

/// Tunables for a [`ChatEngine`](crate::ChatEngine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL of the RPC server, e.g. `http://127.0.0.1:8443`.
    pub server_url: String,
    /// Backing store used by the direct fallback transport. `None` disables it.
    pub database_url: Option<String>,
    pub probe_timeout: Duration,
    pub request_timeout: Duration,
    /// Quiet period after the last keystroke before typing is cleared.
    pub typing_idle: Duration,
    pub call_poll_interval: Duration,
    /// Outgoing calls still ringing after this long are marked missed.
    pub ring_timeout: Duration,
    /// Page length for the `recent` history loads.
    pub message_page_size: u32,
    /// Applied by the direct transport, which runs procedures in-process.
    pub admin_succession: AdminSuccession,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            database_url: Some("sqlite://./data/peerchat.db".into()),
            probe_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(10),
            typing_idle: Duration::from_secs(2),
            call_poll_interval: Duration::from_secs(2),
            ring_timeout: Duration::from_secs(45),
            message_page_size: 50,
            admin_succession: AdminSuccession::Block,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `PEERCHAT_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    pub(crate) fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("PEERCHAT_SERVER_URL") {
            self.server_url = url.trim_end_matches('/').to_string();
        }
        if let Some(url) = lookup("PEERCHAT_DATABASE_URL") {
            let url = url.trim();
            self.database_url = (!url.is_empty()).then(|| url.to_string());
        }
        if let Some(raw) = lookup("PEERCHAT_CALL_POLL_MS") {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => self.call_poll_interval = Duration::from_millis(ms),
                _ => warn!(value = %raw, "config: ignoring invalid PEERCHAT_CALL_POLL_MS"),
            }
        }
    }
}
