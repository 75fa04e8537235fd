//! Media plumbing for calls lives outside the engine. The engine only tells
//! the media layer when a call starts ringing, is picked up, or is over.

use async_trait::async_trait;
use shared::domain::CallSession;
use tracing::debug;

#[async_trait]
pub trait MediaSession: Send + Sync {
    /// The local user placed `call` and it is now ringing.
    async fn initiate(&self, call: &CallSession) -> anyhow::Result<()>;
    /// The local user picked up `call`.
    async fn accept(&self, call: &CallSession) -> anyhow::Result<()>;
    /// `call` reached a terminal state; release devices and connections.
    async fn close(&self, call: &CallSession) -> anyhow::Result<()>;
}

/// Media layer that does nothing. Calls still run through their whole lifecycle.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMediaSession;

#[async_trait]
impl MediaSession for NoopMediaSession {
    async fn initiate(&self, call: &CallSession) -> anyhow::Result<()> {
        debug!(call_id = call.call_id.0, "media: initiate (noop)");
        Ok(())
    }

    async fn accept(&self, call: &CallSession) -> anyhow::Result<()> {
        debug!(call_id = call.call_id.0, "media: accept (noop)");
        Ok(())
    }

    async fn close(&self, call: &CallSession) -> anyhow::Result<()> {
        debug!(call_id = call.call_id.0, "media: close (noop)");
        Ok(())
    }
}
