use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    CallId, CallKind, CallSession, CallStatus, ConversationId, GroupId, GroupMessageId, GroupRole,
    LastMessage, MessageId, MessageKind, MessageStatus, ParticipantPair, TypingScope,
    TypingStatus, UserId, UserProfile,
};

/// Body of `POST /rpc`. The caller identity travels beside the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcEnvelope {
    pub user_id: UserId,
    pub request: RpcRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum RpcRequest {
    #[serde(rename = "chat.create")]
    CreateChat { other_user_id: UserId },
    #[serde(rename = "chat.getChats")]
    GetChats,
    #[serde(rename = "chat.getMessages")]
    GetMessages {
        chat_id: ConversationId,
        limit: u32,
        offset: u32,
    },
    #[serde(rename = "chat.sendMessage")]
    SendMessage {
        chat_id: ConversationId,
        content: String,
        kind: MessageKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_url: Option<String>,
    },
    #[serde(rename = "chat.updateLastMessage")]
    UpdateLastMessage {
        chat_id: ConversationId,
        content: String,
        kind: MessageKind,
    },
    #[serde(rename = "chat.updateMessageStatus")]
    UpdateMessageStatus {
        chat_id: ConversationId,
        status: MessageStatus,
    },
    #[serde(rename = "chat.markAsRead")]
    MarkAsRead { chat_id: ConversationId },
    #[serde(rename = "chat.setTypingStatus")]
    SetTypingStatus { scope: TypingScope, is_typing: bool },
    #[serde(rename = "chat.getTypingStatus")]
    GetTypingStatus { scope: TypingScope },
    #[serde(rename = "user.getProfile")]
    GetProfile { user_id: UserId },
    #[serde(rename = "group.getGroupChats")]
    GetGroupChats,
    #[serde(rename = "group.createGroupChat")]
    CreateGroupChat {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        member_ids: Vec<UserId>,
    },
    #[serde(rename = "group.getGroupMessages")]
    GetGroupMessages {
        group_id: GroupId,
        limit: u32,
        offset: u32,
    },
    #[serde(rename = "group.sendGroupMessage")]
    SendGroupMessage {
        group_id: GroupId,
        content: String,
        kind: MessageKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to_id: Option<GroupMessageId>,
    },
    #[serde(rename = "group.getMembers")]
    GetGroupMembers { group_id: GroupId },
    #[serde(rename = "group.addMembers")]
    AddGroupMembers {
        group_id: GroupId,
        member_ids: Vec<UserId>,
    },
    #[serde(rename = "group.removeMember")]
    RemoveGroupMember { group_id: GroupId, user_id: UserId },
    #[serde(rename = "group.updateMemberRole")]
    UpdateMemberRole {
        group_id: GroupId,
        user_id: UserId,
        role: GroupRole,
    },
    #[serde(rename = "group.leaveGroup")]
    LeaveGroup { group_id: GroupId },
    #[serde(rename = "group.markAsRead")]
    MarkGroupRead { group_id: GroupId },
    #[serde(rename = "callRoutes.create")]
    CreateCall {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receiver_id: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<GroupId>,
        call_type: CallKind,
        is_group_call: bool,
    },
    #[serde(rename = "callRoutes.updateStatus")]
    UpdateCallStatus {
        call_id: CallId,
        status: CallStatus,
    },
    #[serde(rename = "callRoutes.getCalls")]
    GetCalls,
}

impl RpcRequest {
    pub fn method(&self) -> &'static str {
        match self {
            Self::CreateChat { .. } => "chat.create",
            Self::GetChats => "chat.getChats",
            Self::GetMessages { .. } => "chat.getMessages",
            Self::SendMessage { .. } => "chat.sendMessage",
            Self::UpdateLastMessage { .. } => "chat.updateLastMessage",
            Self::UpdateMessageStatus { .. } => "chat.updateMessageStatus",
            Self::MarkAsRead { .. } => "chat.markAsRead",
            Self::SetTypingStatus { .. } => "chat.setTypingStatus",
            Self::GetTypingStatus { .. } => "chat.getTypingStatus",
            Self::GetProfile { .. } => "user.getProfile",
            Self::GetGroupChats => "group.getGroupChats",
            Self::CreateGroupChat { .. } => "group.createGroupChat",
            Self::GetGroupMessages { .. } => "group.getGroupMessages",
            Self::SendGroupMessage { .. } => "group.sendGroupMessage",
            Self::GetGroupMembers { .. } => "group.getMembers",
            Self::AddGroupMembers { .. } => "group.addMembers",
            Self::RemoveGroupMember { .. } => "group.removeMember",
            Self::UpdateMemberRole { .. } => "group.updateMemberRole",
            Self::LeaveGroup { .. } => "group.leaveGroup",
            Self::MarkGroupRead { .. } => "group.markAsRead",
            Self::CreateCall { .. } => "callRoutes.create",
            Self::UpdateCallStatus { .. } => "callRoutes.updateStatus",
            Self::GetCalls => "callRoutes.getCalls",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum RpcResponse {
    ChatCreated { chat_id: ConversationId },
    Chats { chats: Vec<ConversationSummary> },
    Messages { messages: Vec<MessagePayload> },
    Message { message: MessagePayload },
    Ack { success: bool },
    TypingUsers { typing_users: Vec<TypingStatus> },
    Profile { profile: UserProfile },
    Groups { groups: Vec<GroupSummary> },
    GroupCreated {
        group: GroupSummary,
        members: Vec<GroupMemberSummary>,
    },
    GroupMessages { messages: Vec<GroupMessagePayload> },
    GroupMessage { message: GroupMessagePayload },
    Members { members: Vec<GroupMemberSummary> },
    Call { call: CallSession },
    Calls { calls: Vec<CallSession> },
}

impl RpcResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChatCreated { .. } => "chat_created",
            Self::Chats { .. } => "chats",
            Self::Messages { .. } => "messages",
            Self::Message { .. } => "message",
            Self::Ack { .. } => "ack",
            Self::TypingUsers { .. } => "typing_users",
            Self::Profile { .. } => "profile",
            Self::Groups { .. } => "groups",
            Self::GroupCreated { .. } => "group_created",
            Self::GroupMessages { .. } => "group_messages",
            Self::GroupMessage { .. } => "group_message",
            Self::Members { .. } => "members",
            Self::Call { .. } => "call",
            Self::Calls { .. } => "calls",
        }
    }
}

/// A conversation as seen by the requesting user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub participants: ParticipantPair,
    pub other_participant: UserProfile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_status: Option<MessageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_status_at: Option<DateTime<Utc>>,
    pub unread_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSummary {
    pub group_id: GroupId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub creator_id: UserId,
    pub is_active: bool,
    pub member_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessage>,
    pub unread_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMemberSummary {
    pub group_id: GroupId,
    pub user_id: UserId,
    pub display_name: String,
    pub role: GroupRole,
    pub joined_at: DateTime<Utc>,
    pub muted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyPreview {
    pub message_id: GroupMessageId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMessagePayload {
    pub message_id: GroupMessageId,
    pub group_id: GroupId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub content: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<GroupMessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_preview: Option<ReplyPreview>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user_id: UserId,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
