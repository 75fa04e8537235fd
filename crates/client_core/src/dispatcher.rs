use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use chrono::Utc;
use shared::{
    domain::{ConversationRef, MessageKind, MessageRef, MessageStatus, UserId},
    error::ApiError,
    protocol::MessagePayload,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    conversations::{not_loaded, ConversationInner},
    error::EngineError,
    presence::AutoReply,
    transport::TransportError,
    types::{local_key, Message},
    ClientEvent,
};

/// Outcome of the background remote send.
enum Delivery {
    Persisted(MessagePayload),
    /// Conversation still provisional, or no transport reached a server.
    LocalOnly(Option<TransportError>),
    Rejected(ApiError),
}

/// Optimistic send path for one-to-one messages.
///
/// The message is appended locally as `sending` before any remote work, then
/// persisted in the background. Receipts and, when nothing was reached,
/// simulated replies are timers owned by the conversation entry.
pub(crate) struct MessageDispatcher {
    inner: Arc<ConversationInner>,
}

impl MessageDispatcher {
    pub(crate) fn new(inner: Arc<ConversationInner>) -> Self {
        Self { inner }
    }

    pub(crate) async fn send(
        &self,
        id: &ConversationRef,
        content: &str,
        kind: MessageKind,
        media_url: Option<&str>,
    ) -> Result<Message, EngineError> {
        if content.trim().is_empty() && media_url.is_none() {
            return Err(EngineError::Validation("message content is empty".into()));
        }

        let now = Utc::now();
        let (message, revision) = {
            let mut state = self.inner.state.lock().await;
            let key = state.resolve(id);
            let revision = state.next_revision();
            let entry = state.entries.get_mut(&key).ok_or_else(|| not_loaded(&key))?;
            let client_key = local_key();
            let message = Message {
                client_key: client_key.clone(),
                id: MessageRef::Provisional(client_key),
                conversation_id: key.clone(),
                sender_id: self.inner.session.user_id,
                content: content.to_string(),
                kind,
                media_url: media_url.map(str::to_string),
                status: MessageStatus::Sending,
                created_at: now,
            };
            entry.transcript.push(message.clone());
            entry.revision = revision;

            if let Some(schedule) = self.inner.presence.receipts() {
                let weak = Arc::downgrade(&self.inner);
                entry.timers.push(spawn_receipt(
                    weak.clone(),
                    key.clone(),
                    message.client_key.clone(),
                    schedule.delivered_after,
                    MessageStatus::Delivered,
                ));
                entry.timers.push(spawn_receipt(
                    weak,
                    key.clone(),
                    message.client_key.clone(),
                    schedule.read_after,
                    MessageStatus::Read,
                ));
            }
            (message, revision)
        };

        self.inner.session.emit(ClientEvent::MessageAppended(message.clone()));
        self.inner
            .set_last_message(
                &message.conversation_id,
                content,
                kind,
                now,
                Some(&message.client_key),
            )
            .await?;

        tokio::spawn(persist_message(self.inner.clone(), message.clone(), revision));
        Ok(message)
    }

    /// Remote page merged into the transcript. Provisional conversations
    /// and remote failures yield an empty page.
    pub(crate) async fn get_messages(
        &self,
        id: &ConversationRef,
        limit: u32,
        offset: u32,
    ) -> Vec<Message> {
        let key = self.inner.state.lock().await.resolve(id);
        let Some(chat_id) = key.remote_id() else {
            return Vec::new();
        };

        match self.inner.session.remote.get_messages(chat_id, limit, offset).await {
            Ok(payloads) => {
                let fetched: Vec<Message> = payloads
                    .into_iter()
                    .map(|payload| Message::from_payload(payload, key.clone()))
                    .collect();
                self.inner.merge_history(&key, fetched).await
            }
            Err(err) => {
                warn!(conversation_id = chat_id.0, "chat: history fetch failed: {err}");
                Vec::new()
            }
        }
    }
}

impl ConversationInner {
    /// Folds fetched messages into the transcript, keeping the further status
    /// when both copies exist. Returns the merged copies in fetch order.
    async fn merge_history(&self, key: &ConversationRef, fetched: Vec<Message>) -> Vec<Message> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.entries.get_mut(key) else {
            return fetched;
        };

        let mut merged = Vec::with_capacity(fetched.len());
        for message in fetched {
            match entry.transcript.iter_mut().find(|m| m.id == message.id) {
                Some(local) => {
                    local.status.advance(message.status);
                    merged.push(local.clone());
                }
                None => {
                    entry.transcript.push(message.clone());
                    merged.push(message);
                }
            }
        }
        entry.transcript.sort_by_key(|m| m.created_at);
        merged
    }

    /// Moves one message forward; returns whether it moved.
    async fn advance_message(
        &self,
        id: &ConversationRef,
        client_key: &str,
        status: MessageStatus,
    ) -> bool {
        let (key, advanced) = {
            let mut state = self.state.lock().await;
            let key = state.resolve(id);
            let advanced = state
                .entries
                .get_mut(&key)
                .and_then(|entry| {
                    entry
                        .transcript
                        .iter_mut()
                        .find(|m| m.client_key == client_key)
                })
                .is_some_and(|message| message.status.advance(status));
            (key, advanced)
        };
        if advanced {
            self.session.emit(ClientEvent::MessageStatusChanged {
                conversation_id: key,
                client_key: client_key.to_string(),
                status,
            });
        }
        advanced
    }

    /// Attaches the server id to a pending message. A copy already pulled in
    /// by a history fetch is folded into it.
    async fn confirm_message(&self, id: &ConversationRef, client_key: &str, payload: MessagePayload) {
        let message_id = payload.message_id;
        {
            let mut state = self.state.lock().await;
            let key = state.resolve(id);
            let Some(entry) = state.entries.get_mut(&key) else {
                return;
            };

            let remote = MessageRef::Remote(message_id);
            let mut fetched_status = payload.status;
            if let Some(pos) = entry
                .transcript
                .iter()
                .position(|m| m.id == remote && m.client_key != client_key)
            {
                let duplicate = entry.transcript.remove(pos);
                fetched_status = fetched_status.max(duplicate.status);
            }

            let Some(message) = entry
                .transcript
                .iter_mut()
                .find(|m| m.client_key == client_key)
            else {
                return;
            };
            message.id = remote;
            message.created_at = payload.created_at;
            message.status.advance(MessageStatus::Sent);
            message.status.advance(fetched_status);
            entry.transcript.sort_by_key(|m| m.created_at);
        }

        debug!(message_id = message_id.0, "chat: message persisted");
        self.session.emit(ClientEvent::MessageConfirmed {
            conversation_id: ConversationRef::Remote(payload.conversation_id),
            client_key: client_key.to_string(),
            message_id,
        });
    }

    /// Schedules a simulated reply unless the conversation was torn down
    /// after `sent_at`.
    async fn start_auto_reply(self: &Arc<Self>, id: &ConversationRef, content: &str, sent_at: u64) {
        let Some(reply) = self.presence.auto_reply(content) else {
            return;
        };
        let me = self.session.user_id;
        let mut state = self.state.lock().await;
        let key = state.resolve(id);
        let Some(entry) = state.entries.get_mut(&key) else {
            return;
        };
        if entry.torn_down_since(sent_at) {
            debug!(conversation = %key, "chat: torn down, no simulated reply");
            return;
        }
        let Some(counterpart) = entry.conversation.participants.other(me) else {
            return;
        };
        entry.timers.push(tokio::spawn(run_auto_reply(
            Arc::downgrade(self),
            key,
            counterpart,
            reply,
        )));
    }

    async fn set_peer_typing(&self, id: &ConversationRef, is_typing: bool) -> bool {
        let key = {
            let mut state = self.state.lock().await;
            let key = state.resolve(id);
            match state.entries.get_mut(&key) {
                Some(entry) => entry.conversation.peer_typing = is_typing,
                None => return false,
            }
            key
        };
        self.session.emit(ClientEvent::PeerTyping {
            conversation_id: key,
            is_typing,
        });
        true
    }

    async fn append_reply(&self, id: &ConversationRef, from: UserId, content: &str) -> bool {
        let message = {
            let mut state = self.state.lock().await;
            let key = state.resolve(id);
            let Some(entry) = state.entries.get_mut(&key) else {
                return false;
            };
            let client_key = local_key();
            let message = Message {
                client_key: client_key.clone(),
                id: MessageRef::Provisional(client_key),
                conversation_id: key,
                sender_id: from,
                content: content.to_string(),
                kind: MessageKind::Text,
                media_url: None,
                status: MessageStatus::Delivered,
                created_at: Utc::now(),
            };
            entry.transcript.push(message.clone());
            entry.conversation.unread_count += 1;
            message
        };
        self.session.emit(ClientEvent::MessageAppended(message));
        true
    }
}

fn spawn_receipt(
    inner: Weak<ConversationInner>,
    id: ConversationRef,
    client_key: String,
    after: Duration,
    status: MessageStatus,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !inner.advance_message(&id, &client_key, status).await {
            return;
        }
        let Ok((key, true)) = inner
            .advance_conversation_status(&id, status, Some(&client_key))
            .await
        else {
            return;
        };
        if let Some(chat_id) = key.remote_id() {
            if let Err(err) = inner
                .session
                .remote
                .update_message_status(chat_id, status)
                .await
            {
                debug!(conversation_id = chat_id.0, %status, "chat: receipt not persisted: {err}");
            }
        }
    })
}

async fn persist_message(inner: Arc<ConversationInner>, message: Message, sent_at: u64) {
    let id = message.conversation_id.clone();
    let remote_id = inner.state.lock().await.resolve(&id).remote_id();

    let delivery = match remote_id {
        Some(chat_id) => match inner
            .session
            .remote
            .send_message(
                chat_id,
                &message.content,
                message.kind,
                message.media_url.as_deref(),
            )
            .await
        {
            Ok(payload) => Delivery::Persisted(payload),
            Err(TransportError::Api(err)) => Delivery::Rejected(err),
            Err(err) => Delivery::LocalOnly(Some(err)),
        },
        None => Delivery::LocalOnly(None),
    };

    match delivery {
        Delivery::Persisted(payload) => {
            inner.confirm_message(&id, &message.client_key, payload).await;
        }
        Delivery::LocalOnly(reason) => {
            match reason {
                Some(err) => warn!(conversation = %id, "chat: message kept local: {err}"),
                None => debug!(conversation = %id, "chat: conversation not synced, message kept local"),
            }
            inner
                .advance_message(&id, &message.client_key, MessageStatus::Sent)
                .await;
            inner
                .start_auto_reply(&id, &message.content, sent_at)
                .await;
        }
        Delivery::Rejected(err) => {
            warn!(conversation = %id, code = ?err.code, "chat: message rejected: {}", err.message);
            inner
                .session
                .emit(ClientEvent::Error(EngineError::from(err).user_message()));
        }
    }
}

async fn run_auto_reply(
    inner: Weak<ConversationInner>,
    id: ConversationRef,
    from: UserId,
    reply: AutoReply,
) {
    {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !inner.set_peer_typing(&id, true).await {
            return;
        }
    }

    tokio::time::sleep(reply.delay).await;

    let Some(inner) = inner.upgrade() else {
        return;
    };
    inner.set_peer_typing(&id, false).await;
    if !inner.append_reply(&id, from, &reply.content).await {
        return;
    }
    info!(conversation = %id, "chat: simulated reply delivered");
    if let Err(err) = inner
        .update_last_message(&id, &reply.content, MessageKind::Text)
        .await
    {
        debug!(conversation = %id, "chat: reply preview not updated: {err}");
    }
}
