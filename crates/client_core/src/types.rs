use chrono::{DateTime, Utc};
use shared::{
    domain::{
        ConversationRef, GroupId, GroupMessageId, LastMessage, MessageId, MessageKind,
        MessageRef, MessageStatus, ParticipantPair, UserId, UserProfile,
    },
    protocol::{ConversationSummary, GroupMessagePayload, MessagePayload, ReplyPreview},
};

/// Local view of a one-to-one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationRef,
    pub participants: ParticipantPair,
    pub other_participant: UserProfile,
    pub last_message: Option<LastMessage>,
    pub message_status: Option<MessageStatus>,
    pub message_status_at: Option<DateTime<Utc>>,
    pub unread_count: u32,
    /// The local user's own typing flag.
    pub is_typing: bool,
    /// The counterpart is shown as typing.
    pub peer_typing: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub(crate) fn provisional(
        id: ConversationRef,
        participants: ParticipantPair,
        other_participant: UserProfile,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            participants,
            other_participant,
            last_message: None,
            message_status: None,
            message_status_at: None,
            unread_count: 0,
            is_typing: false,
            peer_typing: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn from_summary(summary: ConversationSummary) -> Self {
        Self {
            id: ConversationRef::Remote(summary.conversation_id),
            participants: summary.participants,
            other_participant: summary.other_participant,
            last_message: summary.last_message,
            message_status: summary.message_status,
            message_status_at: summary.message_status_at,
            unread_count: summary.unread_count,
            is_typing: false,
            peer_typing: false,
            created_at: summary.created_at,
            updated_at: summary.updated_at,
        }
    }

    /// Not yet persisted remotely.
    pub fn is_local_pending(&self) -> bool {
        self.id.is_provisional()
    }

    pub fn other_participant_name(&self) -> &str {
        self.other_participant.label()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Stable for the lifetime of the message, across the id remap.
    pub client_key: String,
    pub id: MessageRef<MessageId>,
    pub conversation_id: ConversationRef,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub media_url: Option<String>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub(crate) fn from_payload(payload: MessagePayload, conversation_id: ConversationRef) -> Self {
        Self {
            client_key: remote_key(payload.message_id.0),
            id: MessageRef::Remote(payload.message_id),
            conversation_id,
            sender_id: payload.sender_id,
            content: payload.content,
            kind: payload.kind,
            media_url: payload.media_url,
            status: payload.status,
            created_at: payload.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMessage {
    pub client_key: String,
    pub id: MessageRef<GroupMessageId>,
    pub group_id: GroupId,
    pub sender_id: UserId,
    pub sender_name: Option<String>,
    pub content: String,
    pub kind: MessageKind,
    pub media_url: Option<String>,
    pub reply_to_id: Option<GroupMessageId>,
    pub reply_preview: Option<ReplyPreview>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

impl GroupMessage {
    pub(crate) fn from_payload(payload: GroupMessagePayload) -> Self {
        Self {
            client_key: remote_key(payload.message_id.0),
            id: MessageRef::Remote(payload.message_id),
            group_id: payload.group_id,
            sender_id: payload.sender_id,
            sender_name: payload.sender_name,
            content: payload.content,
            kind: payload.kind,
            media_url: payload.media_url,
            reply_to_id: payload.reply_to_id,
            reply_preview: payload.reply_preview,
            status: MessageStatus::Sent,
            created_at: payload.created_at,
        }
    }
}

pub(crate) fn local_key() -> String {
    format!("local-{}", uuid::Uuid::new_v4())
}

fn remote_key(id: i64) -> String {
    format!("remote-{id}")
}
