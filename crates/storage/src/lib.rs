use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{
    CallId, CallKind, CallParticipant, CallSession, CallStatus, CallTarget, ConversationId,
    GroupId, GroupMessageId, GroupRole, LastMessage, MessageId, MessageKind, MessageStatus,
    ParticipantPair, ParticipantStatus, TypingScope, TypingStatus, UnknownVariant, UserId,
    UserProfile,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone)]
pub struct StoredConversation {
    pub conversation_id: ConversationId,
    pub participants: ParticipantPair,
    pub last_message: Option<LastMessage>,
    pub message_status: Option<MessageStatus>,
    pub message_status_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub media_url: Option<String>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredGroup {
    pub group_id: GroupId,
    pub name: String,
    pub description: Option<String>,
    pub avatar_url: Option<String>,
    pub creator_id: UserId,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredGroupMember {
    pub group_id: GroupId,
    pub user_id: UserId,
    pub username: String,
    pub display_name: Option<String>,
    pub role: GroupRole,
    pub joined_at: DateTime<Utc>,
    pub muted: bool,
    pub last_read_message_id: Option<GroupMessageId>,
}

#[derive(Debug, Clone)]
pub struct StoredGroupMessage {
    pub message_id: GroupMessageId,
    pub group_id: GroupId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub media_url: Option<String>,
    pub reply_to_id: Option<GroupMessageId>,
    pub created_at: DateTime<Utc>,
}

/// Column values written by a call status change.
#[derive(Debug, Clone)]
pub struct CallStatusUpdate {
    pub status: CallStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, username: &str, display_name: Option<&str>) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username, display_name, created_at) VALUES (?, ?, ?)
             ON CONFLICT(username) DO UPDATE SET
                display_name = COALESCE(excluded.display_name, users.display_name)
             RETURNING id",
        )
        .bind(username)
        .bind(display_name)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn user_profile(&self, user_id: UserId) -> Result<Option<UserProfile>> {
        let row = sqlx::query(
            "SELECT id, username, display_name, avatar_url FROM users WHERE id = ?",
        )
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            Ok(UserProfile {
                user_id: UserId(r.try_get("id")?),
                username: r.try_get("username")?,
                display_name: r.try_get("display_name")?,
                avatar_url: r.try_get("avatar_url")?,
            })
        })
        .transpose()
    }

    pub async fn user_exists(&self, user_id: UserId) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    /// Inserts the pair if absent and returns the id either way.
    pub async fn create_conversation(&self, pair: ParticipantPair) -> Result<ConversationId> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO conversations (participant_low, participant_high, created_at, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(participant_low, participant_high) DO NOTHING",
        )
        .bind(pair.low().0)
        .bind(pair.high().0)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to insert conversation")?;

        self.find_conversation_by_pair(pair)
            .await?
            .map(|c| c.conversation_id)
            .ok_or_else(|| anyhow!("conversation for pair vanished after insert"))
    }

    pub async fn find_conversation_by_pair(
        &self,
        pair: ParticipantPair,
    ) -> Result<Option<StoredConversation>> {
        let row = sqlx::query(
            "SELECT * FROM conversations WHERE participant_low = ? AND participant_high = ?",
        )
        .bind(pair.low().0)
        .bind(pair.high().0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    pub async fn conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<StoredConversation>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(conversation_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    pub async fn list_conversations_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<StoredConversation>> {
        let rows = sqlx::query(
            "SELECT * FROM conversations
             WHERE participant_low = ?1 OR participant_high = ?1
             ORDER BY updated_at DESC, id DESC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(conversation_from_row).collect()
    }

    /// Sets the preview and resets the projected status to `sent`.
    pub async fn update_last_message(
        &self,
        conversation_id: ConversationId,
        content: &str,
        kind: MessageKind,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE conversations
             SET last_message_content = ?, last_message_kind = ?, last_message_at = ?,
                 message_status = ?, message_status_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(content)
        .bind(kind.as_str())
        .bind(at)
        .bind(MessageStatus::Sent.as_str())
        .bind(at)
        .bind(at)
        .bind(conversation_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Writes the projected status only if it moves forward. Returns whether it did.
    pub async fn advance_conversation_status(
        &self,
        conversation_id: ConversationId,
        status: MessageStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let current: Option<Option<String>> =
            sqlx::query_scalar("SELECT message_status FROM conversations WHERE id = ?")
                .bind(conversation_id.0)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(current) = current else {
            return Err(anyhow!("conversation {conversation_id} not found"));
        };
        let current = current
            .as_deref()
            .map(MessageStatus::from_str)
            .transpose()
            .map_err(unknown_variant)?;
        if current.is_some_and(|current| current >= status) {
            return Ok(false);
        }

        sqlx::query(
            "UPDATE conversations SET message_status = ?, message_status_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(at)
        .bind(at)
        .bind(conversation_id.0)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    pub async fn insert_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
        kind: MessageKind,
        media_url: Option<&str>,
    ) -> Result<StoredMessage> {
        let created_at = Utc::now();
        let rec = sqlx::query(
            "INSERT INTO messages (conversation_id, sender_id, content, kind, media_url, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(conversation_id.0)
        .bind(sender_id.0)
        .bind(content)
        .bind(kind.as_str())
        .bind(media_url)
        .bind(MessageStatus::Sent.as_str())
        .bind(created_at)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert message")?;

        Ok(StoredMessage {
            message_id: MessageId(rec.get::<i64, _>(0)),
            conversation_id,
            sender_id,
            content: content.to_string(),
            kind,
            media_url: media_url.map(str::to_string),
            status: MessageStatus::Sent,
            created_at,
        })
    }

    /// Page of messages, oldest first; `offset` counts back from the newest.
    pub async fn list_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE conversation_id = ?
             ORDER BY id DESC LIMIT ? OFFSET ?",
        )
        .bind(conversation_id.0)
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;
        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    pub async fn unread_count(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
    ) -> Result<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages
             WHERE conversation_id = ? AND sender_id <> ? AND status <> 'read'",
        )
        .bind(conversation_id.0)
        .bind(reader_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    /// Marks every message the reader received as read.
    pub async fn mark_conversation_read(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
    ) -> Result<u64> {
        let affected = sqlx::query(
            "UPDATE messages SET status = 'read'
             WHERE conversation_id = ? AND sender_id <> ? AND status <> 'read'",
        )
        .bind(conversation_id.0)
        .bind(reader_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected)
    }

    pub async fn upsert_typing(
        &self,
        scope: TypingScope,
        user_id: UserId,
        is_typing: bool,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO typing_status (scope_kind, scope_id, user_id, is_typing, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(scope_kind, scope_id, user_id) DO UPDATE SET
                is_typing = excluded.is_typing,
                updated_at = excluded.updated_at",
        )
        .bind(scope.kind_str())
        .bind(scope.raw_id())
        .bind(user_id.0)
        .bind(is_typing)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_typing(&self, scope: TypingScope) -> Result<Vec<TypingStatus>> {
        let rows = sqlx::query(
            "SELECT user_id, is_typing, updated_at FROM typing_status
             WHERE scope_kind = ? AND scope_id = ?",
        )
        .bind(scope.kind_str())
        .bind(scope.raw_id())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                Ok(TypingStatus {
                    scope,
                    user_id: UserId(r.try_get("user_id")?),
                    is_typing: r.try_get("is_typing")?,
                    updated_at: r.try_get("updated_at")?,
                })
            })
            .collect()
    }

    pub async fn create_group(
        &self,
        name: &str,
        description: Option<&str>,
        creator_id: UserId,
    ) -> Result<GroupId> {
        let now = Utc::now();
        let rec = sqlx::query(
            "INSERT INTO chat_groups (name, description, creator_id, is_active, created_at, updated_at)
             VALUES (?, ?, ?, 1, ?, ?) RETURNING id",
        )
        .bind(name)
        .bind(description)
        .bind(creator_id.0)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert group")?;
        Ok(GroupId(rec.get::<i64, _>(0)))
    }

    pub async fn delete_group(&self, group_id: GroupId) -> Result<()> {
        sqlx::query("DELETE FROM chat_groups WHERE id = ?")
            .bind(group_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn group(&self, group_id: GroupId) -> Result<Option<StoredGroup>> {
        let row = sqlx::query("SELECT * FROM chat_groups WHERE id = ?")
            .bind(group_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(group_from_row).transpose()
    }

    pub async fn set_group_active(&self, group_id: GroupId, is_active: bool) -> Result<()> {
        sqlx::query("UPDATE chat_groups SET is_active = ?, updated_at = ? WHERE id = ?")
            .bind(is_active)
            .bind(Utc::now())
            .bind(group_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_groups_for_user(&self, user_id: UserId) -> Result<Vec<StoredGroup>> {
        let rows = sqlx::query(
            "SELECT g.* FROM chat_groups g
             JOIN group_members m ON m.group_id = g.id
             WHERE m.user_id = ? AND g.is_active = 1
             ORDER BY g.updated_at DESC, g.id DESC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(group_from_row).collect()
    }

    pub async fn add_group_member(
        &self,
        group_id: GroupId,
        user_id: UserId,
        role: GroupRole,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO group_members (group_id, user_id, role, joined_at, muted)
             VALUES (?, ?, ?, ?, 0)",
        )
        .bind(group_id.0)
        .bind(user_id.0)
        .bind(role.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to add user {user_id} to group {group_id}"))?;
        Ok(())
    }

    pub async fn remove_group_member(&self, group_id: GroupId, user_id: UserId) -> Result<bool> {
        let affected = sqlx::query("DELETE FROM group_members WHERE group_id = ? AND user_id = ?")
            .bind(group_id.0)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    pub async fn update_group_member_role(
        &self,
        group_id: GroupId,
        user_id: UserId,
        role: GroupRole,
    ) -> Result<bool> {
        let affected =
            sqlx::query("UPDATE group_members SET role = ? WHERE group_id = ? AND user_id = ?")
                .bind(role.as_str())
                .bind(group_id.0)
                .bind(user_id.0)
                .execute(&self.pool)
                .await?
                .rows_affected();
        Ok(affected > 0)
    }

    pub async fn group_member(
        &self,
        group_id: GroupId,
        user_id: UserId,
    ) -> Result<Option<StoredGroupMember>> {
        let row = sqlx::query(
            "SELECT m.*, u.username, u.display_name FROM group_members m
             JOIN users u ON u.id = m.user_id
             WHERE m.group_id = ? AND m.user_id = ?",
        )
        .bind(group_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(member_from_row).transpose()
    }

    /// Members in join order.
    pub async fn list_group_members(&self, group_id: GroupId) -> Result<Vec<StoredGroupMember>> {
        let rows = sqlx::query(
            "SELECT m.*, u.username, u.display_name FROM group_members m
             JOIN users u ON u.id = m.user_id
             WHERE m.group_id = ?
             ORDER BY m.joined_at ASC, m.rowid ASC",
        )
        .bind(group_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(member_from_row).collect()
    }

    pub async fn insert_group_message(
        &self,
        group_id: GroupId,
        sender_id: UserId,
        content: &str,
        kind: MessageKind,
        media_url: Option<&str>,
        reply_to_id: Option<GroupMessageId>,
    ) -> Result<StoredGroupMessage> {
        let created_at = Utc::now();
        let rec = sqlx::query(
            "INSERT INTO group_messages (group_id, sender_id, content, kind, media_url, reply_to_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(group_id.0)
        .bind(sender_id.0)
        .bind(content)
        .bind(kind.as_str())
        .bind(media_url)
        .bind(reply_to_id.map(|id| id.0))
        .bind(created_at)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert group message")?;

        sqlx::query("UPDATE chat_groups SET updated_at = ? WHERE id = ?")
            .bind(created_at)
            .bind(group_id.0)
            .execute(&self.pool)
            .await?;

        Ok(StoredGroupMessage {
            message_id: GroupMessageId(rec.get::<i64, _>(0)),
            group_id,
            sender_id,
            content: content.to_string(),
            kind,
            media_url: media_url.map(str::to_string),
            reply_to_id,
            created_at,
        })
    }

    pub async fn group_message(
        &self,
        message_id: GroupMessageId,
    ) -> Result<Option<StoredGroupMessage>> {
        let row = sqlx::query("SELECT * FROM group_messages WHERE id = ?")
            .bind(message_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(group_message_from_row).transpose()
    }

    /// Page of group messages, oldest first; `offset` counts back from the newest.
    pub async fn list_group_messages(
        &self,
        group_id: GroupId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<StoredGroupMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM group_messages WHERE group_id = ?
             ORDER BY id DESC LIMIT ? OFFSET ?",
        )
        .bind(group_id.0)
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;
        let mut messages = rows
            .iter()
            .map(group_message_from_row)
            .collect::<Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    pub async fn latest_group_message(
        &self,
        group_id: GroupId,
    ) -> Result<Option<StoredGroupMessage>> {
        let row = sqlx::query(
            "SELECT * FROM group_messages WHERE group_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(group_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(group_message_from_row).transpose()
    }

    pub async fn group_unread_count(&self, group_id: GroupId, reader_id: UserId) -> Result<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM group_messages gm
             JOIN group_members m ON m.group_id = gm.group_id AND m.user_id = ?2
             WHERE gm.group_id = ?1 AND gm.sender_id <> ?2
               AND gm.id > COALESCE(m.last_read_message_id, 0)",
        )
        .bind(group_id.0)
        .bind(reader_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    pub async fn mark_group_read(&self, group_id: GroupId, reader_id: UserId) -> Result<()> {
        sqlx::query(
            "UPDATE group_members
             SET last_read_message_id = (SELECT MAX(id) FROM group_messages WHERE group_id = ?1)
             WHERE group_id = ?1 AND user_id = ?2",
        )
        .bind(group_id.0)
        .bind(reader_id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn create_call(
        &self,
        caller_id: UserId,
        target: CallTarget,
        call_type: CallKind,
    ) -> Result<CallId> {
        let rec = sqlx::query(
            "INSERT INTO calls (caller_id, receiver_id, group_id, call_type, is_group_call, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(caller_id.0)
        .bind(target.receiver_id().map(|id| id.0))
        .bind(target.group_id().map(|id| id.0))
        .bind(call_type.as_str())
        .bind(target.is_group())
        .bind(CallStatus::Calling.as_str())
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .context("failed to insert call")?;
        Ok(CallId(rec.get::<i64, _>(0)))
    }

    pub async fn insert_call_participant(
        &self,
        call_id: CallId,
        user_id: UserId,
        status: ParticipantStatus,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO call_participants (call_id, user_id, status, updated_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(call_id.0)
        .bind(user_id.0)
        .bind(status.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_call_participant(
        &self,
        call_id: CallId,
        user_id: UserId,
        status: ParticipantStatus,
    ) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE call_participants SET status = ?, updated_at = ?
             WHERE call_id = ? AND user_id = ?",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(call_id.0)
        .bind(user_id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    pub async fn list_call_participants(&self, call_id: CallId) -> Result<Vec<CallParticipant>> {
        let rows = sqlx::query(
            "SELECT call_id, user_id, status FROM call_participants
             WHERE call_id = ? ORDER BY user_id",
        )
        .bind(call_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                Ok(CallParticipant {
                    call_id: CallId(r.try_get("call_id")?),
                    user_id: UserId(r.try_get("user_id")?),
                    status: parse_text(r, "status")?,
                })
            })
            .collect()
    }

    pub async fn call(&self, call_id: CallId) -> Result<Option<CallSession>> {
        let row = sqlx::query("SELECT * FROM calls WHERE id = ?")
            .bind(call_id.0)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut call = call_from_row(&row)?;
        call.participants = self.list_call_participants(call_id).await?;
        Ok(Some(call))
    }

    /// Applies a status change guarded by the status the caller observed.
    /// Returns `false` if the row moved on in the meantime.
    pub async fn update_call_status(
        &self,
        call_id: CallId,
        expected: CallStatus,
        update: &CallStatusUpdate,
    ) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE calls
             SET status = ?, started_at = COALESCE(?, started_at),
                 ended_at = COALESCE(?, ended_at), duration_seconds = COALESCE(?, duration_seconds)
             WHERE id = ? AND status = ?",
        )
        .bind(update.status.as_str())
        .bind(update.started_at)
        .bind(update.ended_at)
        .bind(update.duration_seconds)
        .bind(call_id.0)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    /// Calls the user placed, received, or was invited to; newest first.
    pub async fn list_calls_for_user(&self, user_id: UserId, limit: u32) -> Result<Vec<CallSession>> {
        let rows = sqlx::query(
            "SELECT DISTINCT c.* FROM calls c
             LEFT JOIN call_participants p ON p.call_id = c.id
             WHERE c.caller_id = ?1 OR c.receiver_id = ?1 OR p.user_id = ?1
             ORDER BY c.id DESC LIMIT ?2",
        )
        .bind(user_id.0)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut calls = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut call = call_from_row(row)?;
            if call.is_group_call() {
                call.participants = self.list_call_participants(call.call_id).await?;
            }
            calls.push(call);
        }
        Ok(calls)
    }
}

fn unknown_variant(err: UnknownVariant) -> anyhow::Error {
    anyhow!("corrupt row: {err}")
}

fn parse_text<T>(row: &SqliteRow, column: &str) -> Result<T>
where
    T: FromStr<Err = UnknownVariant>,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>().map_err(unknown_variant)
}

fn parse_optional_text<T>(row: &SqliteRow, column: &str) -> Result<Option<T>>
where
    T: FromStr<Err = UnknownVariant>,
{
    let raw: Option<String> = row.try_get(column)?;
    raw.as_deref()
        .map(T::from_str)
        .transpose()
        .map_err(unknown_variant)
}

fn conversation_from_row(row: &SqliteRow) -> Result<StoredConversation> {
    let low = UserId(row.try_get("participant_low")?);
    let high = UserId(row.try_get("participant_high")?);
    let participants = ParticipantPair::new(low, high)
        .ok_or_else(|| anyhow!("corrupt row: conversation with identical participants"))?;

    let content: Option<String> = row.try_get("last_message_content")?;
    let kind: Option<MessageKind> = parse_optional_text(row, "last_message_kind")?;
    let at: Option<DateTime<Utc>> = row.try_get("last_message_at")?;
    let last_message = match (content, kind, at) {
        (Some(content), Some(kind), Some(timestamp)) => Some(LastMessage {
            content,
            kind,
            timestamp,
        }),
        _ => None,
    };

    Ok(StoredConversation {
        conversation_id: ConversationId(row.try_get("id")?),
        participants,
        last_message,
        message_status: parse_optional_text(row, "message_status")?,
        message_status_at: row.try_get("message_status_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<StoredMessage> {
    Ok(StoredMessage {
        message_id: MessageId(row.try_get("id")?),
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        sender_id: UserId(row.try_get("sender_id")?),
        content: row.try_get("content")?,
        kind: parse_text(row, "kind")?,
        media_url: row.try_get("media_url")?,
        status: parse_text(row, "status")?,
        created_at: row.try_get("created_at")?,
    })
}

fn group_from_row(row: &SqliteRow) -> Result<StoredGroup> {
    Ok(StoredGroup {
        group_id: GroupId(row.try_get("id")?),
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        avatar_url: row.try_get("avatar_url")?,
        creator_id: UserId(row.try_get("creator_id")?),
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn member_from_row(row: &SqliteRow) -> Result<StoredGroupMember> {
    Ok(StoredGroupMember {
        group_id: GroupId(row.try_get("group_id")?),
        user_id: UserId(row.try_get("user_id")?),
        username: row.try_get("username")?,
        display_name: row.try_get("display_name")?,
        role: parse_text(row, "role")?,
        joined_at: row.try_get("joined_at")?,
        muted: row.try_get("muted")?,
        last_read_message_id: row
            .try_get::<Option<i64>, _>("last_read_message_id")?
            .map(GroupMessageId),
    })
}

fn group_message_from_row(row: &SqliteRow) -> Result<StoredGroupMessage> {
    Ok(StoredGroupMessage {
        message_id: GroupMessageId(row.try_get("id")?),
        group_id: GroupId(row.try_get("group_id")?),
        sender_id: UserId(row.try_get("sender_id")?),
        content: row.try_get("content")?,
        kind: parse_text(row, "kind")?,
        media_url: row.try_get("media_url")?,
        reply_to_id: row
            .try_get::<Option<i64>, _>("reply_to_id")?
            .map(GroupMessageId),
        created_at: row.try_get("created_at")?,
    })
}

fn call_from_row(row: &SqliteRow) -> Result<CallSession> {
    let receiver_id = row.try_get::<Option<i64>, _>("receiver_id")?.map(UserId);
    let group_id = row.try_get::<Option<i64>, _>("group_id")?.map(GroupId);
    let target = CallTarget::from_parts(receiver_id, group_id)
        .map_err(|err| anyhow!("corrupt call row: {err}"))?;

    Ok(CallSession {
        call_id: CallId(row.try_get("id")?),
        caller_id: UserId(row.try_get("caller_id")?),
        target,
        call_type: parse_text(row, "call_type")?,
        status: parse_text(row, "status")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        duration_seconds: row.try_get("duration_seconds")?,
        created_at: row.try_get("created_at")?,
        participants: Vec::new(),
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
