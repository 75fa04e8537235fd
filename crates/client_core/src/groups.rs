use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use shared::{
    domain::{
        GroupId, GroupMessageId, GroupRole, LastMessage, MessageKind, MessageRef, MessageStatus,
        TypingStatus, UserId,
    },
    protocol::{GroupMemberSummary, GroupSummary},
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::EngineError,
    types::{local_key, GroupMessage},
    typing::{TypingCoordinator, TypingTarget},
    ClientEvent, Session,
};

/// Group conversations the local user belongs to.
///
/// Unlike one-to-one chats nothing here is local-only: creation and member
/// management wait for the remote side, and a group message that cannot be
/// persisted is dropped again.
pub struct GroupStore {
    inner: Arc<GroupInner>,
}

struct GroupInner {
    session: Arc<Session>,
    typing: TypingCoordinator,
    state: Mutex<GroupState>,
}

#[derive(Default)]
struct GroupState {
    entries: HashMap<GroupId, GroupEntry>,
    revision: u64,
}

struct GroupEntry {
    summary: GroupSummary,
    revision: u64,
    members: Vec<GroupMemberSummary>,
    transcript: Vec<GroupMessage>,
}

impl GroupEntry {
    fn new(summary: GroupSummary) -> Self {
        Self {
            summary,
            revision: 0,
            members: Vec::new(),
            transcript: Vec::new(),
        }
    }
}

fn not_loaded(group_id: GroupId) -> EngineError {
    EngineError::NotLoaded(format!("group {group_id}"))
}

impl GroupStore {
    pub(crate) fn new(session: Arc<Session>, typing: TypingCoordinator) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                session,
                typing,
                state: Mutex::new(GroupState::default()),
            }),
        }
    }

    /// Refreshes from the remote side. Never fails; on error the local list
    /// is returned unchanged.
    pub async fn list_groups(&self) -> Vec<GroupSummary> {
        let started_at = self.inner.state.lock().await.revision;
        match self.inner.session.remote.get_group_chats().await {
            Ok(summaries) => {
                let mut state = self.inner.state.lock().await;
                let listed: Vec<GroupId> = summaries.iter().map(|g| g.group_id).collect();
                state
                    .entries
                    .retain(|id, entry| listed.contains(id) || entry.revision > started_at);
                for summary in summaries {
                    match state.entries.get_mut(&summary.group_id) {
                        Some(entry) if entry.revision > started_at => {
                            debug!(group_id = summary.group_id.0, "group: keeping group mutated during refresh");
                        }
                        Some(entry) => entry.summary = summary,
                        None => {
                            state
                                .entries
                                .insert(summary.group_id, GroupEntry::new(summary));
                        }
                    }
                }
                drop(state);
                self.inner.session.emit(ClientEvent::GroupsUpdated);
            }
            Err(err) => warn!("group: list refresh failed, keeping local list: {err}"),
        }
        self.groups().await
    }

    /// Creates the group with the local user as admin. `member_ids` may
    /// contain the creator and duplicates; both are ignored.
    pub async fn create_group(
        &self,
        name: &str,
        description: Option<&str>,
        member_ids: Vec<UserId>,
    ) -> Result<GroupSummary, EngineError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::Validation("group name is required".into()));
        }
        let me = self.inner.session.user_id;
        let mut invited = Vec::with_capacity(member_ids.len());
        for id in member_ids {
            if id != me && !invited.contains(&id) {
                invited.push(id);
            }
        }

        let (summary, members) = self
            .inner
            .session
            .remote
            .create_group_chat(name, description, invited)
            .await?;

        info!(
            group_id = summary.group_id.0,
            members = members.len(),
            "group: created"
        );
        {
            let mut state = self.inner.state.lock().await;
            let revision = state.next_revision();
            let mut entry = GroupEntry::new(summary.clone());
            entry.revision = revision;
            entry.members = members;
            state.entries.insert(summary.group_id, entry);
        }
        self.inner.session.emit(ClientEvent::GroupsUpdated);
        Ok(summary)
    }

    pub async fn add_members(
        &self,
        group_id: GroupId,
        member_ids: Vec<UserId>,
    ) -> Result<Vec<GroupMemberSummary>, EngineError> {
        let members = self
            .inner
            .session
            .remote
            .add_group_members(group_id, member_ids)
            .await?;
        self.inner.store_members(group_id, members.clone()).await;
        Ok(members)
    }

    /// Removing yourself is the same as leaving.
    pub async fn remove_member(
        &self,
        group_id: GroupId,
        user_id: UserId,
    ) -> Result<Vec<GroupMemberSummary>, EngineError> {
        let members = self
            .inner
            .session
            .remote
            .remove_group_member(group_id, user_id)
            .await?;
        if user_id == self.inner.session.user_id {
            self.inner.forget(group_id).await;
        } else {
            self.inner.store_members(group_id, members.clone()).await;
        }
        Ok(members)
    }

    pub async fn update_member_role(
        &self,
        group_id: GroupId,
        user_id: UserId,
        role: GroupRole,
    ) -> Result<Vec<GroupMemberSummary>, EngineError> {
        let members = self
            .inner
            .session
            .remote
            .update_member_role(group_id, user_id, role)
            .await?;
        self.inner.store_members(group_id, members.clone()).await;
        Ok(members)
    }

    pub async fn leave_group(&self, group_id: GroupId) -> Result<(), EngineError> {
        self.inner.session.remote.leave_group(group_id).await?;
        info!(group_id = group_id.0, "group: left");
        self.inner.forget(group_id).await;
        Ok(())
    }

    /// Appends the message as `sending`, then waits for the remote side. On
    /// failure the message is removed again and the error returned.
    pub async fn send_group_message(
        &self,
        group_id: GroupId,
        content: &str,
        kind: MessageKind,
        media_url: Option<&str>,
        reply_to_id: Option<GroupMessageId>,
    ) -> Result<GroupMessage, EngineError> {
        if content.trim().is_empty() && media_url.is_none() {
            return Err(EngineError::Validation("message content is empty".into()));
        }

        let pending = {
            let mut state = self.inner.state.lock().await;
            let entry = state
                .entries
                .get_mut(&group_id)
                .ok_or_else(|| not_loaded(group_id))?;
            let client_key = local_key();
            let message = GroupMessage {
                client_key: client_key.clone(),
                id: MessageRef::Provisional(client_key),
                group_id,
                sender_id: self.inner.session.user_id,
                sender_name: None,
                content: content.to_string(),
                kind,
                media_url: media_url.map(str::to_string),
                reply_to_id,
                reply_preview: None,
                status: MessageStatus::Sending,
                created_at: Utc::now(),
            };
            entry.transcript.push(message.clone());
            message
        };
        self.inner
            .session
            .emit(ClientEvent::GroupMessageAppended(pending.clone()));

        let sent = self
            .inner
            .session
            .remote
            .send_group_message(group_id, content, kind, media_url, reply_to_id)
            .await;

        let mut state = self.inner.state.lock().await;
        let revision = state.next_revision();
        let Some(entry) = state.entries.get_mut(&group_id) else {
            return Err(not_loaded(group_id));
        };
        match sent {
            Ok(payload) => {
                let mut confirmed = GroupMessage::from_payload(payload);
                confirmed.client_key = pending.client_key.clone();
                match entry
                    .transcript
                    .iter_mut()
                    .find(|m| m.client_key == pending.client_key)
                {
                    Some(slot) => *slot = confirmed.clone(),
                    None => entry.transcript.push(confirmed.clone()),
                }
                entry
                    .transcript
                    .retain(|m| m.id != confirmed.id || m.client_key == confirmed.client_key);
                entry.revision = revision;
                entry.summary.last_message = Some(LastMessage {
                    content: confirmed.content.clone(),
                    kind: confirmed.kind,
                    timestamp: confirmed.created_at,
                });
                entry.summary.updated_at = confirmed.created_at;
                drop(state);

                if let MessageRef::Remote(message_id) = confirmed.id {
                    self.inner.session.emit(ClientEvent::GroupMessageConfirmed {
                        group_id,
                        client_key: confirmed.client_key.clone(),
                        message_id,
                    });
                }
                Ok(confirmed)
            }
            Err(err) => {
                entry
                    .transcript
                    .retain(|m| m.client_key != pending.client_key);
                drop(state);

                let err = EngineError::from(err);
                warn!(group_id = group_id.0, "group: message not sent: {err}");
                self.inner.session.emit(ClientEvent::GroupMessageFailed {
                    group_id,
                    client_key: pending.client_key,
                    reason: err.user_message(),
                });
                Err(err)
            }
        }
    }

    /// Newest page of history, `message_page_size` long.
    pub async fn recent_group_messages(&self, group_id: GroupId) -> Vec<GroupMessage> {
        let limit = self.inner.session.config.message_page_size;
        self.get_group_messages(group_id, limit, 0).await
    }

    /// Fetches a page of history. Empty on failure.
    pub async fn get_group_messages(
        &self,
        group_id: GroupId,
        limit: u32,
        offset: u32,
    ) -> Vec<GroupMessage> {
        let payloads = match self
            .inner
            .session
            .remote
            .get_group_messages(group_id, limit, offset)
            .await
        {
            Ok(payloads) => payloads,
            Err(err) => {
                warn!(group_id = group_id.0, "group: history fetch failed: {err}");
                return Vec::new();
            }
        };

        let fetched: Vec<GroupMessage> =
            payloads.into_iter().map(GroupMessage::from_payload).collect();
        let mut state = self.inner.state.lock().await;
        if let Some(entry) = state.entries.get_mut(&group_id) {
            for message in &fetched {
                if !entry.transcript.iter().any(|m| m.id == message.id) {
                    entry.transcript.push(message.clone());
                }
            }
            entry.transcript.sort_by_key(|m| m.created_at);
        }
        fetched
    }

    /// Local transcript, oldest first.
    pub async fn messages(&self, group_id: GroupId) -> Vec<GroupMessage> {
        self.inner
            .state
            .lock()
            .await
            .entries
            .get(&group_id)
            .map(|entry| entry.transcript.clone())
            .unwrap_or_default()
    }

    pub async fn set_typing(&self, group_id: GroupId, is_typing: bool) -> Result<(), EngineError> {
        if !self.inner.state.lock().await.entries.contains_key(&group_id) {
            return Err(not_loaded(group_id));
        }
        self.inner
            .typing
            .set_typing(TypingTarget::Group(group_id), is_typing)
            .await;
        Ok(())
    }

    pub async fn is_typing(&self, group_id: GroupId) -> bool {
        self.inner
            .typing
            .is_typing(&TypingTarget::Group(group_id))
            .await
    }

    pub async fn remote_typing_users(&self, group_id: GroupId) -> Vec<TypingStatus> {
        self.inner
            .typing
            .remote_typing_users(&TypingTarget::Group(group_id))
            .await
    }

    /// Zeroes the unread count; the remote marker is best effort.
    pub async fn mark_group_read(&self, group_id: GroupId) -> Result<(), EngineError> {
        {
            let mut state = self.inner.state.lock().await;
            let revision = state.next_revision();
            let entry = state
                .entries
                .get_mut(&group_id)
                .ok_or_else(|| not_loaded(group_id))?;
            entry.summary.unread_count = 0;
            entry.revision = revision;
        }
        if let Err(err) = self.inner.session.remote.mark_group_read(group_id).await {
            warn!(group_id = group_id.0, "group: read marker not persisted: {err}");
        }
        self.inner.session.emit(ClientEvent::GroupsUpdated);
        Ok(())
    }

    /// Cached member list.
    pub async fn members(&self, group_id: GroupId) -> Vec<GroupMemberSummary> {
        self.inner
            .state
            .lock()
            .await
            .entries
            .get(&group_id)
            .map(|entry| entry.members.clone())
            .unwrap_or_default()
    }

    pub async fn load_members(
        &self,
        group_id: GroupId,
    ) -> Result<Vec<GroupMemberSummary>, EngineError> {
        let members = self
            .inner
            .session
            .remote
            .get_group_members(group_id)
            .await?;
        self.inner.store_members(group_id, members.clone()).await;
        Ok(members)
    }

    pub async fn group(&self, group_id: GroupId) -> Option<GroupSummary> {
        self.inner
            .state
            .lock()
            .await
            .entries
            .get(&group_id)
            .map(|entry| entry.summary.clone())
    }

    /// Snapshot, most recently active first.
    pub async fn groups(&self) -> Vec<GroupSummary> {
        let state = self.inner.state.lock().await;
        let mut groups: Vec<GroupSummary> =
            state.entries.values().map(|e| e.summary.clone()).collect();
        groups.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        groups
    }
}

impl GroupState {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }
}

impl GroupInner {
    async fn store_members(&self, group_id: GroupId, members: Vec<GroupMemberSummary>) {
        {
            let mut state = self.state.lock().await;
            let revision = state.next_revision();
            if let Some(entry) = state.entries.get_mut(&group_id) {
                entry.summary.member_count = members.len() as u32;
                entry.members = members.clone();
                entry.revision = revision;
            }
        }
        self.session
            .emit(ClientEvent::GroupMembersUpdated { group_id, members });
    }

    async fn forget(&self, group_id: GroupId) {
        self.state.lock().await.entries.remove(&group_id);
        self.typing.teardown(&TypingTarget::Group(group_id)).await;
        self.session.emit(ClientEvent::GroupsUpdated);
    }
}

#[cfg(test)]
#[path = "tests/groups_tests.rs"]
mod tests;
