use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use shared::{
    domain::{
        ConversationId, ConversationRef, LastMessage, MessageKind, MessageStatus,
        ParticipantPair, TypingStatus, UserId, UserProfile,
    },
    protocol::ConversationSummary,
};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    dispatcher::MessageDispatcher,
    error::EngineError,
    presence::PresenceSimulator,
    types::{Conversation, Message},
    typing::{TypingCoordinator, TypingTarget},
    ClientEvent, Session,
};

/// One-to-one conversations, their transcripts and optimistic lifecycle.
///
/// A conversation created while the server is unreachable keeps a
/// provisional id until the pair is persisted. Afterwards the provisional id
/// stays resolvable through an alias table, so handles given out earlier
/// keep working.
pub struct ConversationStore {
    inner: Arc<ConversationInner>,
    dispatcher: MessageDispatcher,
}

pub(crate) struct ConversationInner {
    pub(crate) session: Arc<Session>,
    pub(crate) typing: TypingCoordinator,
    pub(crate) presence: Arc<dyn PresenceSimulator>,
    pub(crate) state: Mutex<ConversationState>,
}

#[derive(Default)]
pub(crate) struct ConversationState {
    pub(crate) entries: HashMap<ConversationRef, ConversationEntry>,
    aliases: HashMap<String, ConversationId>,
    revision: u64,
}

pub(crate) struct ConversationEntry {
    pub(crate) conversation: Conversation,
    /// Value of the store-wide revision counter at the last local mutation.
    pub(crate) revision: u64,
    pub(crate) transcript: Vec<Message>,
    pub(crate) timers: Vec<JoinHandle<()>>,
    /// Client key of the local message behind `conversation.last_message`.
    pub(crate) last_message_key: Option<String>,
    /// Revision of the last teardown. Work started before it is stale.
    pub(crate) torn_down_at: u64,
}

impl ConversationEntry {
    fn new(conversation: Conversation, revision: u64) -> Self {
        Self {
            conversation,
            revision,
            transcript: Vec::new(),
            timers: Vec::new(),
            last_message_key: None,
            torn_down_at: 0,
        }
    }

    fn apply_summary(&mut self, summary: ConversationSummary) {
        let conversation = &mut self.conversation;
        let same_last_message = conversation.last_message == summary.last_message;
        conversation.other_participant = summary.other_participant;
        conversation.last_message = summary.last_message;
        if !same_last_message {
            self.last_message_key = None;
        }
        match (same_last_message, conversation.message_status, summary.message_status) {
            (true, Some(mut current), Some(remote)) => {
                if current.advance(remote) {
                    conversation.message_status = Some(current);
                    conversation.message_status_at = summary.message_status_at;
                }
            }
            _ => {
                conversation.message_status = summary.message_status;
                conversation.message_status_at = summary.message_status_at;
            }
        }
        conversation.unread_count = summary.unread_count;
        conversation.created_at = summary.created_at;
        conversation.updated_at = summary.updated_at;
    }

    fn abort_timers(&mut self, revision: u64) {
        for timer in self.timers.drain(..) {
            timer.abort();
        }
        self.torn_down_at = revision;
    }

    /// Whether a teardown happened after `revision`.
    pub(crate) fn torn_down_since(&self, revision: u64) -> bool {
        self.torn_down_at >= revision
    }
}

impl ConversationState {
    /// Follows the alias table for provisional ids that have been synced.
    pub(crate) fn resolve(&self, id: &ConversationRef) -> ConversationRef {
        match id {
            ConversationRef::Provisional(key) => self
                .aliases
                .get(key)
                .map(|remote| ConversationRef::Remote(*remote))
                .unwrap_or_else(|| id.clone()),
            ConversationRef::Remote(_) => id.clone(),
        }
    }

    pub(crate) fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn find_by_pair(&self, pair: ParticipantPair) -> Option<&ConversationEntry> {
        self.entries
            .values()
            .find(|entry| entry.conversation.participants == pair)
    }
}

pub(crate) fn not_loaded(id: &ConversationRef) -> EngineError {
    EngineError::NotLoaded(format!("conversation {id}"))
}

impl ConversationStore {
    pub(crate) fn new(
        session: Arc<Session>,
        typing: TypingCoordinator,
        presence: Arc<dyn PresenceSimulator>,
    ) -> Self {
        let inner = Arc::new(ConversationInner {
            session,
            typing,
            presence,
            state: Mutex::new(ConversationState::default()),
        });
        Self {
            dispatcher: MessageDispatcher::new(inner.clone()),
            inner,
        }
    }

    /// Refreshes from the remote side and returns the merged list. Failures
    /// leave the local list untouched.
    pub async fn list_conversations(&self) -> Vec<Conversation> {
        let started_at = self.inner.state.lock().await.revision;
        match self.inner.session.remote.get_chats().await {
            Ok(summaries) => {
                let count = summaries.len();
                self.inner.merge_remote(summaries, started_at).await;
                debug!(count, "chat: conversation list refreshed");
                self.inner.session.emit(ClientEvent::ConversationsUpdated);
            }
            Err(err) => warn!("chat: conversation refresh failed, keeping local list: {err}"),
        }
        self.conversations().await
    }

    /// Returns the conversation with `other_user_id`, creating a provisional
    /// one right away if none is known. Persisting happens in the background.
    pub async fn create_or_get_conversation(
        &self,
        other_user_id: UserId,
    ) -> Result<ConversationRef, EngineError> {
        let me = self.inner.session.user_id;
        let pair = ParticipantPair::new(me, other_user_id).ok_or_else(|| {
            EngineError::Validation("cannot start a conversation with yourself".into())
        })?;

        let id = {
            let mut state = self.inner.state.lock().await;
            if let Some(existing) = state.find_by_pair(pair) {
                return Ok(existing.conversation.id.clone());
            }
            let now = Utc::now();
            let id = ConversationRef::provisional(pair, now);
            let revision = state.next_revision();
            let conversation = Conversation::provisional(
                id.clone(),
                pair,
                UserProfile::placeholder(other_user_id),
                now,
            );
            state
                .entries
                .insert(id.clone(), ConversationEntry::new(conversation, revision));
            id
        };

        info!(conversation = %id, other_user_id = other_user_id.0, "chat: conversation opened locally");
        self.inner.session.emit(ClientEvent::ConversationsUpdated);
        tokio::spawn(sync_new_conversation(
            self.inner.clone(),
            id.clone(),
            other_user_id,
        ));
        Ok(id)
    }

    pub async fn update_last_message(
        &self,
        id: &ConversationRef,
        content: &str,
        kind: MessageKind,
    ) -> Result<(), EngineError> {
        self.inner.update_last_message(id, content, kind).await
    }

    /// Moves the conversation's status forward. Returns `false` when the
    /// status is already at or past `status`.
    pub async fn update_message_status(
        &self,
        id: &ConversationRef,
        status: MessageStatus,
    ) -> Result<bool, EngineError> {
        if status == MessageStatus::Sending {
            return Err(EngineError::Validation(
                "conversation status must be sent, delivered or read".into(),
            ));
        }
        let (key, advanced) = self
            .inner
            .advance_conversation_status(id, status, None)
            .await?;
        if advanced {
            if let Some(chat_id) = key.remote_id() {
                let session = self.inner.session.clone();
                tokio::spawn(async move {
                    if let Err(err) = session.remote.update_message_status(chat_id, status).await {
                        warn!(conversation_id = chat_id.0, "chat: status not persisted: {err}");
                    }
                });
            }
        }
        Ok(advanced)
    }

    pub async fn set_typing_status(
        &self,
        id: &ConversationRef,
        is_typing: bool,
    ) -> Result<(), EngineError> {
        let state = self.inner.state.lock().await;
        let key = state.resolve(id);
        if !state.entries.contains_key(&key) {
            return Err(not_loaded(&key));
        }
        self.inner
            .typing
            .set_typing(TypingTarget::Conversation(key), is_typing)
            .await;
        Ok(())
    }

    pub async fn mark_as_read(&self, id: &ConversationRef) -> Result<(), EngineError> {
        let me = self.inner.session.user_id;
        let key = {
            let mut state = self.inner.state.lock().await;
            let key = state.resolve(id);
            let revision = state.next_revision();
            let entry = state.entries.get_mut(&key).ok_or_else(|| not_loaded(&key))?;
            entry.revision = revision;
            entry.conversation.unread_count = 0;
            for message in entry
                .transcript
                .iter_mut()
                .filter(|message| message.sender_id != me)
            {
                message.status.advance(MessageStatus::Read);
            }
            key
        };
        self.inner.session.emit(ClientEvent::ConversationUpdated {
            conversation_id: key.clone(),
        });

        if let Some(chat_id) = key.remote_id() {
            let session = self.inner.session.clone();
            tokio::spawn(async move {
                if let Err(err) = session.remote.mark_as_read(chat_id).await {
                    warn!(conversation_id = chat_id.0, "chat: read marker not persisted: {err}");
                }
            });
        }
        Ok(())
    }

    pub async fn conversation(&self, id: &ConversationRef) -> Option<Conversation> {
        let state = self.inner.state.lock().await;
        let key = state.resolve(id);
        let mut conversation = state.entries.get(&key)?.conversation.clone();
        conversation.is_typing = self
            .inner
            .typing
            .is_typing(&TypingTarget::Conversation(key))
            .await;
        Some(conversation)
    }

    /// Snapshot of every known conversation, most recently updated first.
    pub async fn conversations(&self) -> Vec<Conversation> {
        let state = self.inner.state.lock().await;
        let mut conversations = Vec::with_capacity(state.entries.len());
        for (key, entry) in &state.entries {
            let mut conversation = entry.conversation.clone();
            conversation.is_typing = self
                .inner
                .typing
                .is_typing(&TypingTarget::Conversation(key.clone()))
                .await;
            conversations.push(conversation);
        }
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        conversations
    }

    pub async fn resolve(&self, id: &ConversationRef) -> ConversationRef {
        self.inner.state.lock().await.resolve(id)
    }

    pub async fn send_message(
        &self,
        id: &ConversationRef,
        content: &str,
        kind: MessageKind,
        media_url: Option<&str>,
    ) -> Result<Message, EngineError> {
        self.dispatcher.send(id, content, kind, media_url).await
    }

    /// Local transcript, oldest first.
    pub async fn messages(&self, id: &ConversationRef) -> Vec<Message> {
        let state = self.inner.state.lock().await;
        let key = state.resolve(id);
        state
            .entries
            .get(&key)
            .map(|entry| entry.transcript.clone())
            .unwrap_or_default()
    }

    /// Fetches a page of history and merges it into the local transcript.
    pub async fn load_messages(
        &self,
        id: &ConversationRef,
        limit: u32,
        offset: u32,
    ) -> Vec<Message> {
        self.dispatcher.get_messages(id, limit, offset).await
    }

    /// Newest page of history, `message_page_size` long.
    pub async fn load_recent_messages(&self, id: &ConversationRef) -> Vec<Message> {
        let limit = self.inner.session.config.message_page_size;
        self.load_messages(id, limit, 0).await
    }

    pub async fn remote_typing_users(&self, id: &ConversationRef) -> Vec<TypingStatus> {
        let key = self.resolve(id).await;
        self.inner
            .typing
            .remote_typing_users(&TypingTarget::Conversation(key))
            .await
    }

    /// Stops receipt, reply and typing timers owned by the conversation.
    pub async fn teardown(&self, id: &ConversationRef) {
        let mut state = self.inner.state.lock().await;
        let key = state.resolve(id);
        let revision = state.next_revision();
        if let Some(entry) = state.entries.get_mut(&key) {
            entry.abort_timers(revision);
        }
        self.inner
            .typing
            .teardown(&TypingTarget::Conversation(key))
            .await;
    }

    pub(crate) async fn teardown_all(&self) {
        let mut state = self.inner.state.lock().await;
        let revision = state.next_revision();
        for entry in state.entries.values_mut() {
            entry.abort_timers(revision);
        }
    }
}

impl ConversationInner {
    async fn merge_remote(&self, summaries: Vec<ConversationSummary>, started_at: u64) {
        let mut state = self.state.lock().await;
        for summary in summaries {
            let key = ConversationRef::Remote(summary.conversation_id);
            if !state.entries.contains_key(&key) {
                let pending = state
                    .entries
                    .iter()
                    .find(|(id, entry)| {
                        id.is_provisional() && entry.conversation.participants == summary.participants
                    })
                    .and_then(|(id, _)| match id {
                        ConversationRef::Provisional(raw) => Some(raw.clone()),
                        ConversationRef::Remote(_) => None,
                    });
                if let Some(provisional) = pending {
                    self.remap_locked(&mut state, &provisional, summary.conversation_id)
                        .await;
                }
            }

            match state.entries.get_mut(&key) {
                Some(entry) if entry.revision > started_at => {
                    debug!(
                        conversation_id = summary.conversation_id.0,
                        "chat: keeping conversation mutated during refresh"
                    );
                }
                Some(entry) => entry.apply_summary(summary),
                None => {
                    let conversation = Conversation::from_summary(summary);
                    state.entries.insert(key, ConversationEntry::new(conversation, 0));
                }
            }
        }
    }

    /// Replaces a provisional id with the server id. Idempotent.
    pub(crate) async fn remap_locked(
        &self,
        state: &mut ConversationState,
        provisional: &str,
        remote_id: ConversationId,
    ) -> bool {
        if state.aliases.contains_key(provisional) {
            return false;
        }
        let old_key = ConversationRef::Provisional(provisional.to_string());
        let Some(mut entry) = state.entries.remove(&old_key) else {
            return false;
        };

        let new_key = ConversationRef::Remote(remote_id);
        entry.conversation.id = new_key.clone();
        for message in &mut entry.transcript {
            message.conversation_id = new_key.clone();
        }

        if let Some(existing) = state.entries.get_mut(&new_key) {
            for message in entry.transcript {
                let known = existing
                    .transcript
                    .iter()
                    .any(|m| m.client_key == message.client_key);
                if !known {
                    existing.transcript.push(message);
                }
            }
            existing.transcript.sort_by_key(|m| m.created_at);
            existing.timers.extend(entry.timers);
            existing.torn_down_at = existing.torn_down_at.max(entry.torn_down_at);
            if entry.last_message_key.is_some() {
                existing.last_message_key = entry.last_message_key;
            }
        } else {
            state.entries.insert(new_key.clone(), entry);
        }
        state.aliases.insert(provisional.to_string(), remote_id);

        self.typing
            .rekey(
                &TypingTarget::Conversation(old_key),
                TypingTarget::Conversation(new_key),
            )
            .await;
        info!(
            provisional,
            conversation_id = remote_id.0,
            "chat: provisional conversation synced"
        );
        self.session.emit(ClientEvent::ConversationRemapped {
            provisional: provisional.to_string(),
            conversation_id: remote_id,
        });
        true
    }

    /// Local last-message projection; returns the resolved id. `client_key`
    /// names the local message it came from, if any.
    pub(crate) async fn set_last_message(
        &self,
        id: &ConversationRef,
        content: &str,
        kind: MessageKind,
        at: DateTime<Utc>,
        client_key: Option<&str>,
    ) -> Result<ConversationRef, EngineError> {
        let key = {
            let mut state = self.state.lock().await;
            let key = state.resolve(id);
            let revision = state.next_revision();
            let entry = state.entries.get_mut(&key).ok_or_else(|| not_loaded(&key))?;
            entry.revision = revision;
            entry.last_message_key = client_key.map(str::to_string);
            let conversation = &mut entry.conversation;
            conversation.last_message = Some(LastMessage {
                content: content.to_string(),
                kind,
                timestamp: at,
            });
            conversation.message_status = Some(MessageStatus::Sent);
            conversation.message_status_at = Some(at);
            conversation.updated_at = at;
            key
        };
        self.session.emit(ClientEvent::ConversationUpdated {
            conversation_id: key.clone(),
        });
        Ok(key)
    }

    /// Local projection plus best-effort persistence.
    pub(crate) async fn update_last_message(
        &self,
        id: &ConversationRef,
        content: &str,
        kind: MessageKind,
    ) -> Result<(), EngineError> {
        let key = self
            .set_last_message(id, content, kind, Utc::now(), None)
            .await?;
        if let Some(chat_id) = key.remote_id() {
            let session = self.session.clone();
            let content = content.to_string();
            tokio::spawn(async move {
                if let Err(err) = session
                    .remote
                    .update_last_message(chat_id, &content, kind)
                    .await
                {
                    warn!(conversation_id = chat_id.0, "chat: last message not persisted: {err}");
                }
            });
        }
        Ok(())
    }

    /// Moves the conversation status forward. With `client_key`, only when
    /// that message is still the last one.
    pub(crate) async fn advance_conversation_status(
        &self,
        id: &ConversationRef,
        status: MessageStatus,
        client_key: Option<&str>,
    ) -> Result<(ConversationRef, bool), EngineError> {
        let (key, advanced) = {
            let mut state = self.state.lock().await;
            let key = state.resolve(id);
            let revision = state.next_revision();
            let entry = state.entries.get_mut(&key).ok_or_else(|| not_loaded(&key))?;
            if client_key.is_some() && entry.last_message_key.as_deref() != client_key {
                return Ok((key, false));
            }
            let conversation = &mut entry.conversation;
            let advanced = match conversation.message_status.as_mut() {
                Some(current) => current.advance(status),
                None => {
                    conversation.message_status = Some(status);
                    true
                }
            };
            if advanced {
                entry.revision = revision;
                conversation.message_status_at = Some(Utc::now());
            }
            (key, advanced)
        };
        if advanced {
            self.session.emit(ClientEvent::ConversationUpdated {
                conversation_id: key.clone(),
            });
        }
        Ok((key, advanced))
    }
}

async fn sync_new_conversation(
    inner: Arc<ConversationInner>,
    id: ConversationRef,
    other_user_id: UserId,
) {
    match inner.session.remote.get_profile(other_user_id).await {
        Ok(profile) => {
            let mut state = inner.state.lock().await;
            let key = state.resolve(&id);
            if let Some(entry) = state.entries.get_mut(&key) {
                entry.conversation.other_participant = profile;
            }
        }
        Err(err) => debug!(
            other_user_id = other_user_id.0,
            "chat: profile lookup failed, keeping placeholder: {err}"
        ),
    }

    let ConversationRef::Provisional(provisional) = &id else {
        return;
    };
    match inner.session.remote.create_chat(other_user_id).await {
        Ok(remote_id) => {
            let mut state = inner.state.lock().await;
            inner.remap_locked(&mut state, provisional, remote_id).await;
        }
        Err(err) => warn!(
            provisional = %provisional,
            "chat: conversation not persisted, staying local: {err}"
        ),
    }
}

#[cfg(test)]
#[path = "tests/conversations_tests.rs"]
mod tests;
