use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex as StdMutex, Weak},
};

use chrono::Utc;
use media_session::MediaSession;
use shared::{
    domain::{CallId, CallKind, CallSession, CallStatus, CallTarget, GroupId, ParticipantStatus, UserId},
    error::ErrorCode,
};
use tokio::{sync::Mutex, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{error::EngineError, transport::TransportError, ClientEvent, Session};

/// Voice and video call sessions seen by the local user.
///
/// Transitions are checked against the local copy before anything is sent,
/// and the server checks them again. Calls placed or answered elsewhere show
/// up through [`CallManager::refresh_calls`], which the poller runs on an
/// interval.
pub struct CallManager {
    inner: Arc<CallInner>,
}

struct CallInner {
    session: Arc<Session>,
    media: Arc<dyn MediaSession>,
    state: Mutex<CallState>,
    poller: StdMutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct CallState {
    calls: HashMap<CallId, CallSession>,
    /// Incoming calls already announced through `ClientEvent::IncomingCall`.
    announced: HashSet<CallId>,
    /// Calls placed or answered here whose media has not been closed.
    engaged: HashSet<CallId>,
}

impl Drop for CallInner {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.poller.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

impl CallManager {
    pub(crate) fn new(session: Arc<Session>, media: Arc<dyn MediaSession>) -> Self {
        Self {
            inner: Arc::new(CallInner {
                session,
                media,
                state: Mutex::new(CallState::default()),
                poller: StdMutex::new(None),
            }),
        }
    }

    /// Places a call to exactly one of `receiver_id` or `group_id`.
    pub async fn start_call(
        &self,
        receiver_id: Option<UserId>,
        group_id: Option<GroupId>,
        call_type: CallKind,
    ) -> Result<CallSession, EngineError> {
        let target = CallTarget::from_parts(receiver_id, group_id)
            .map_err(|err| EngineError::Validation(err.to_string()))?;
        let me = self.inner.session.user_id;
        if target.receiver_id() == Some(me) {
            return Err(EngineError::Validation("cannot call yourself".into()));
        }

        let call = self
            .inner
            .session
            .remote
            .create_call(receiver_id, group_id, call_type)
            .await?;
        info!(
            call_id = call.call_id.0,
            call_type = call.call_type.as_str(),
            group = call.is_group_call(),
            "call: started"
        );

        if let Err(err) = self.inner.media.initiate(&call).await {
            warn!(call_id = call.call_id.0, "call: media initiate failed: {err:#}");
        }
        self.inner.state.lock().await.engaged.insert(call.call_id);
        self.inner.store(call.clone()).await;
        Ok(call)
    }

    /// `calling → answered`. Invited members of a group call that is already
    /// answered join it.
    pub async fn answer_call(&self, call_id: CallId) -> Result<CallSession, EngineError> {
        let me = self.inner.session.user_id;
        let local = self.inner.local(call_id).await?;
        let joins_group_call = local.status == CallStatus::Answered
            && local.is_group_call()
            && local
                .participants
                .iter()
                .any(|p| p.user_id == me && p.status == ParticipantStatus::Invited);
        if !joins_group_call {
            ensure_transition(local.status, CallStatus::Answered)?;
        }

        let call = self.inner.transition(&local, CallStatus::Answered).await?;
        self.inner.state.lock().await.engaged.insert(call_id);
        if let Err(err) = self.inner.media.accept(&call).await {
            warn!(call_id = call_id.0, "call: media accept failed: {err:#}");
        }
        Ok(call)
    }

    /// `calling → declined`. In a group call this only declines for the local
    /// user until every invited member has declined.
    pub async fn decline_call(&self, call_id: CallId) -> Result<CallSession, EngineError> {
        let local = self.inner.local(call_id).await?;
        ensure_transition(local.status, CallStatus::Declined)?;
        self.inner.transition(&local, CallStatus::Declined).await
    }

    /// `calling | answered → ended`; the duration is recorded when the call
    /// was connected.
    pub async fn end_call(&self, call_id: CallId) -> Result<CallSession, EngineError> {
        let local = self.inner.local(call_id).await?;
        ensure_transition(local.status, CallStatus::Ended)?;
        self.inner.transition(&local, CallStatus::Ended).await
    }

    /// `calling → missed` for a call nobody picked up.
    pub async fn mark_missed(&self, call_id: CallId) -> Result<CallSession, EngineError> {
        self.inner.mark_missed(call_id).await
    }

    /// Re-fetches the call list and applies transitions made elsewhere. On
    /// failure the local list is returned unchanged.
    pub async fn refresh_calls(&self) -> Vec<CallSession> {
        self.inner.refresh().await;
        self.calls().await
    }

    /// Calls currently ringing for the local user.
    pub async fn incoming_calls(&self) -> Vec<CallSession> {
        let me = self.inner.session.user_id;
        let state = self.inner.state.lock().await;
        let mut calls: Vec<CallSession> = state
            .calls
            .values()
            .filter(|call| call.is_incoming_for(me))
            .cloned()
            .collect();
        calls.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        calls
    }

    pub async fn call(&self, call_id: CallId) -> Option<CallSession> {
        self.inner.state.lock().await.calls.get(&call_id).cloned()
    }

    /// Newest first.
    pub async fn calls(&self) -> Vec<CallSession> {
        let state = self.inner.state.lock().await;
        let mut calls: Vec<CallSession> = state.calls.values().cloned().collect();
        calls.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        calls
    }

    /// Starts the background refresh loop. A running poller is kept.
    pub fn spawn_poller(&self) {
        let Ok(mut slot) = self.inner.poller.lock() else {
            return;
        };
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let interval = self.inner.session.config.call_poll_interval;
        let weak: Weak<CallInner> = Arc::downgrade(&self.inner);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.refresh().await;
            }
        }));
        debug!(interval_ms = interval.as_millis() as u64, "call: poller started");
    }

    pub fn stop_polling(&self) {
        if let Ok(mut slot) = self.inner.poller.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
                debug!("call: poller stopped");
            }
        }
    }

    pub fn is_polling(&self) -> bool {
        self.inner
            .poller
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }
}

fn ensure_transition(from: CallStatus, to: CallStatus) -> Result<(), EngineError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(EngineError::IllegalTransition { from, to })
    }
}

impl CallInner {
    async fn local(&self, call_id: CallId) -> Result<CallSession, EngineError> {
        self.state
            .lock()
            .await
            .calls
            .get(&call_id)
            .cloned()
            .ok_or_else(|| EngineError::NotLoaded(format!("call {call_id}")))
    }

    async fn store(&self, call: CallSession) {
        self.state
            .lock()
            .await
            .calls
            .insert(call.call_id, call.clone());
        self.session.emit(ClientEvent::CallUpdated(call));
    }

    /// Closes media once a call placed or answered here is over, however it
    /// got there.
    async fn release_media(&self, call: &CallSession) {
        if !call.status.is_terminal() || !self.state.lock().await.engaged.remove(&call.call_id) {
            return;
        }
        match self.media.close(call).await {
            Ok(()) => debug!(call_id = call.call_id.0, status = call.status.as_str(), "call: media closed"),
            Err(err) => warn!(call_id = call.call_id.0, "call: media close failed: {err:#}"),
        }
    }

    /// Sends the transition; a server-side conflict is reported against the
    /// local status.
    async fn transition(
        &self,
        local: &CallSession,
        to: CallStatus,
    ) -> Result<CallSession, EngineError> {
        let call = match self
            .session
            .remote
            .update_call_status(local.call_id, to)
            .await
        {
            Ok(call) => call,
            Err(TransportError::Api(err)) if err.code == ErrorCode::Conflict => {
                debug!(call_id = local.call_id.0, "call: server refused transition: {}", err.message);
                return Err(EngineError::IllegalTransition {
                    from: local.status,
                    to,
                });
            }
            Err(err) => return Err(err.into()),
        };
        info!(
            call_id = call.call_id.0,
            from = local.status.as_str(),
            to = call.status.as_str(),
            "call: status changed"
        );
        self.store(call.clone()).await;
        self.release_media(&call).await;
        Ok(call)
    }

    async fn mark_missed(&self, call_id: CallId) -> Result<CallSession, EngineError> {
        let local = self.local(call_id).await?;
        ensure_transition(local.status, CallStatus::Missed)?;
        self.transition(&local, CallStatus::Missed).await
    }

    async fn refresh(&self) {
        let fetched = match self.session.remote.get_calls().await {
            Ok(calls) => calls,
            Err(err) => {
                debug!("call: refresh failed, keeping local calls: {err}");
                return;
            }
        };

        let me = self.session.user_id;
        let mut changed = Vec::new();
        let mut incoming = Vec::new();
        {
            let mut state = self.state.lock().await;
            for call in fetched {
                match state.calls.get_mut(&call.call_id) {
                    Some(local) if local.status == call.status => {
                        if *local != call {
                            *local = call.clone();
                            changed.push(call.clone());
                        }
                    }
                    Some(local) if local.status.can_transition_to(call.status) => {
                        debug!(
                            call_id = call.call_id.0,
                            from = local.status.as_str(),
                            to = call.status.as_str(),
                            "call: applying remote transition"
                        );
                        *local = call.clone();
                        changed.push(call.clone());
                    }
                    Some(local) => {
                        debug!(
                            call_id = call.call_id.0,
                            local = local.status.as_str(),
                            remote = call.status.as_str(),
                            "call: ignoring stale remote status"
                        );
                    }
                    None => {
                        state.calls.insert(call.call_id, call.clone());
                        changed.push(call.clone());
                    }
                }
                if call.is_incoming_for(me) && state.announced.insert(call.call_id) {
                    incoming.push(call);
                }
            }
        }

        for call in changed {
            self.release_media(&call).await;
            self.session.emit(ClientEvent::CallUpdated(call));
        }
        for call in incoming {
            info!(call_id = call.call_id.0, caller_id = call.caller_id.0, "call: incoming");
            self.session.emit(ClientEvent::IncomingCall(call));
        }
        self.expire_unanswered().await;
    }

    /// Outgoing calls ringing past the ring timeout become missed.
    async fn expire_unanswered(&self) {
        let me = self.session.user_id;
        let Ok(ring_timeout) = chrono::Duration::from_std(self.session.config.ring_timeout) else {
            return;
        };
        let now = Utc::now();
        let expired: Vec<CallId> = self
            .state
            .lock()
            .await
            .calls
            .values()
            .filter(|call| {
                call.caller_id == me
                    && call.status == CallStatus::Calling
                    && now - call.created_at >= ring_timeout
            })
            .map(|call| call.call_id)
            .collect();

        for call_id in expired {
            match self.mark_missed(call_id).await {
                Ok(_) => info!(call_id = call_id.0, "call: unanswered, marked missed"),
                Err(err) => debug!(call_id = call_id.0, "call: could not mark missed: {err}"),
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/calls_tests.rs"]
mod tests;
