//! Remote access for the engine.
//!
//! Every remote operation goes through [`Transports`], which tries the RPC
//! transport while the gate reports it reachable and falls back to the
//! direct-store transport when the attempt fails for transport reasons. An
//! [`ApiError`] from either side is authoritative and is returned as is.

use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    domain::{
        CallId, CallKind, CallSession, CallStatus, ConversationId, GroupId, GroupMessageId,
        GroupRole, MessageKind, MessageStatus, TypingScope, TypingStatus, UserId, UserProfile,
    },
    error::ApiError,
    protocol::{
        ConversationSummary, GroupMemberSummary, GroupMessagePayload, GroupSummary,
        MessagePayload, RpcRequest, RpcResponse,
    },
};
use thiserror::Error;
use tracing::debug;

use crate::gate::TransportGate;

mod direct;
mod rpc;

pub use direct::DirectStoreTransport;
pub use rpc::RpcTransport;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Timeout, network failure, non-2xx without an error body, or a payload
    /// of the wrong shape. The next transport is tried.
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("request rejected ({:?}): {}", .0.code, .0.message)]
    Api(ApiError),
}

impl TransportError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable(reason.into())
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    async fn call(&self, user_id: UserId, request: RpcRequest)
        -> Result<RpcResponse, TransportError>;
    /// Cheap reachability check used by the gate.
    async fn health(&self) -> Result<(), TransportError>;
}

/// Stand-in for a transport that could not be constructed.
pub struct MissingTransport {
    reason: String,
}

impl MissingTransport {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Transport for MissingTransport {
    fn name(&self) -> &'static str {
        "missing"
    }

    async fn call(
        &self,
        _user_id: UserId,
        _request: RpcRequest,
    ) -> Result<RpcResponse, TransportError> {
        Err(TransportError::unavailable(self.reason.clone()))
    }

    async fn health(&self) -> Result<(), TransportError> {
        Err(TransportError::unavailable(self.reason.clone()))
    }
}

type Extract<T> = fn(RpcResponse) -> Result<T, RpcResponse>;

/// Typed remote API bound to one user, with primary/secondary fallback.
pub struct Transports {
    user_id: UserId,
    gate: Arc<TransportGate>,
    primary: Arc<dyn Transport>,
    secondary: Arc<dyn Transport>,
}

impl Transports {
    pub fn new(
        user_id: UserId,
        gate: Arc<TransportGate>,
        primary: Arc<dyn Transport>,
        secondary: Arc<dyn Transport>,
    ) -> Self {
        Self {
            user_id,
            gate,
            primary,
            secondary,
        }
    }

    pub fn gate(&self) -> &Arc<TransportGate> {
        &self.gate
    }

    pub fn primary(&self) -> &Arc<dyn Transport> {
        &self.primary
    }

    async fn request<T>(&self, request: RpcRequest, extract: Extract<T>) -> Result<T, TransportError> {
        let method = request.method();
        if self.gate.is_available() {
            match attempt(self.primary.as_ref(), self.user_id, request.clone(), extract).await {
                Ok(value) => return Ok(value),
                Err(err @ TransportError::Api(_)) => return Err(err),
                Err(TransportError::Unavailable(reason)) => {
                    debug!(
                        method,
                        transport = self.primary.name(),
                        %reason,
                        "transport: primary attempt failed, falling back"
                    );
                }
            }
        }
        attempt(self.secondary.as_ref(), self.user_id, request, extract).await
    }

    pub async fn create_chat(&self, other_user_id: UserId) -> Result<ConversationId, TransportError> {
        self.request(RpcRequest::CreateChat { other_user_id }, |r| match r {
            RpcResponse::ChatCreated { chat_id } => Ok(chat_id),
            other => Err(other),
        })
        .await
    }

    pub async fn get_chats(&self) -> Result<Vec<ConversationSummary>, TransportError> {
        self.request(RpcRequest::GetChats, |r| match r {
            RpcResponse::Chats { chats } => Ok(chats),
            other => Err(other),
        })
        .await
    }

    pub async fn get_messages(
        &self,
        chat_id: ConversationId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<MessagePayload>, TransportError> {
        self.request(
            RpcRequest::GetMessages {
                chat_id,
                limit,
                offset,
            },
            |r| match r {
                RpcResponse::Messages { messages } => Ok(messages),
                other => Err(other),
            },
        )
        .await
    }

    pub async fn send_message(
        &self,
        chat_id: ConversationId,
        content: &str,
        kind: MessageKind,
        media_url: Option<&str>,
    ) -> Result<MessagePayload, TransportError> {
        self.request(
            RpcRequest::SendMessage {
                chat_id,
                content: content.to_string(),
                kind,
                media_url: media_url.map(str::to_string),
            },
            |r| match r {
                RpcResponse::Message { message } => Ok(message),
                other => Err(other),
            },
        )
        .await
    }

    pub async fn update_last_message(
        &self,
        chat_id: ConversationId,
        content: &str,
        kind: MessageKind,
    ) -> Result<(), TransportError> {
        self.request(
            RpcRequest::UpdateLastMessage {
                chat_id,
                content: content.to_string(),
                kind,
            },
            ack,
        )
        .await
        .map(drop)
    }

    pub async fn update_message_status(
        &self,
        chat_id: ConversationId,
        status: MessageStatus,
    ) -> Result<bool, TransportError> {
        self.request(RpcRequest::UpdateMessageStatus { chat_id, status }, ack)
            .await
    }

    pub async fn mark_as_read(&self, chat_id: ConversationId) -> Result<(), TransportError> {
        self.request(RpcRequest::MarkAsRead { chat_id }, ack)
            .await
            .map(drop)
    }

    pub async fn set_typing(&self, scope: TypingScope, is_typing: bool) -> Result<(), TransportError> {
        self.request(RpcRequest::SetTypingStatus { scope, is_typing }, ack)
            .await
            .map(drop)
    }

    pub async fn get_typing(&self, scope: TypingScope) -> Result<Vec<TypingStatus>, TransportError> {
        self.request(RpcRequest::GetTypingStatus { scope }, |r| match r {
            RpcResponse::TypingUsers { typing_users } => Ok(typing_users),
            other => Err(other),
        })
        .await
    }

    pub async fn get_profile(&self, user_id: UserId) -> Result<UserProfile, TransportError> {
        self.request(RpcRequest::GetProfile { user_id }, |r| match r {
            RpcResponse::Profile { profile } => Ok(profile),
            other => Err(other),
        })
        .await
    }

    pub async fn get_group_chats(&self) -> Result<Vec<GroupSummary>, TransportError> {
        self.request(RpcRequest::GetGroupChats, |r| match r {
            RpcResponse::Groups { groups } => Ok(groups),
            other => Err(other),
        })
        .await
    }

    pub async fn create_group_chat(
        &self,
        name: &str,
        description: Option<&str>,
        member_ids: Vec<UserId>,
    ) -> Result<(GroupSummary, Vec<GroupMemberSummary>), TransportError> {
        self.request(
            RpcRequest::CreateGroupChat {
                name: name.to_string(),
                description: description.map(str::to_string),
                member_ids,
            },
            |r| match r {
                RpcResponse::GroupCreated { group, members } => Ok((group, members)),
                other => Err(other),
            },
        )
        .await
    }

    pub async fn get_group_messages(
        &self,
        group_id: GroupId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<GroupMessagePayload>, TransportError> {
        self.request(
            RpcRequest::GetGroupMessages {
                group_id,
                limit,
                offset,
            },
            |r| match r {
                RpcResponse::GroupMessages { messages } => Ok(messages),
                other => Err(other),
            },
        )
        .await
    }

    pub async fn send_group_message(
        &self,
        group_id: GroupId,
        content: &str,
        kind: MessageKind,
        media_url: Option<&str>,
        reply_to_id: Option<GroupMessageId>,
    ) -> Result<GroupMessagePayload, TransportError> {
        self.request(
            RpcRequest::SendGroupMessage {
                group_id,
                content: content.to_string(),
                kind,
                media_url: media_url.map(str::to_string),
                reply_to_id,
            },
            |r| match r {
                RpcResponse::GroupMessage { message } => Ok(message),
                other => Err(other),
            },
        )
        .await
    }

    pub async fn get_group_members(
        &self,
        group_id: GroupId,
    ) -> Result<Vec<GroupMemberSummary>, TransportError> {
        self.request(RpcRequest::GetGroupMembers { group_id }, members)
            .await
    }

    pub async fn add_group_members(
        &self,
        group_id: GroupId,
        member_ids: Vec<UserId>,
    ) -> Result<Vec<GroupMemberSummary>, TransportError> {
        self.request(
            RpcRequest::AddGroupMembers {
                group_id,
                member_ids,
            },
            members,
        )
        .await
    }

    pub async fn remove_group_member(
        &self,
        group_id: GroupId,
        user_id: UserId,
    ) -> Result<Vec<GroupMemberSummary>, TransportError> {
        self.request(RpcRequest::RemoveGroupMember { group_id, user_id }, members)
            .await
    }

    pub async fn update_member_role(
        &self,
        group_id: GroupId,
        user_id: UserId,
        role: GroupRole,
    ) -> Result<Vec<GroupMemberSummary>, TransportError> {
        self.request(
            RpcRequest::UpdateMemberRole {
                group_id,
                user_id,
                role,
            },
            members,
        )
        .await
    }

    pub async fn leave_group(&self, group_id: GroupId) -> Result<(), TransportError> {
        self.request(RpcRequest::LeaveGroup { group_id }, ack)
            .await
            .map(drop)
    }

    pub async fn mark_group_read(&self, group_id: GroupId) -> Result<(), TransportError> {
        self.request(RpcRequest::MarkGroupRead { group_id }, ack)
            .await
            .map(drop)
    }

    pub async fn create_call(
        &self,
        receiver_id: Option<UserId>,
        group_id: Option<GroupId>,
        call_type: CallKind,
    ) -> Result<CallSession, TransportError> {
        self.request(
            RpcRequest::CreateCall {
                receiver_id,
                group_id,
                call_type,
                is_group_call: group_id.is_some(),
            },
            call,
        )
        .await
    }

    pub async fn update_call_status(
        &self,
        call_id: CallId,
        status: CallStatus,
    ) -> Result<CallSession, TransportError> {
        self.request(RpcRequest::UpdateCallStatus { call_id, status }, call)
            .await
    }

    pub async fn get_calls(&self) -> Result<Vec<CallSession>, TransportError> {
        self.request(RpcRequest::GetCalls, |r| match r {
            RpcResponse::Calls { calls } => Ok(calls),
            other => Err(other),
        })
        .await
    }
}

async fn attempt<T>(
    transport: &dyn Transport,
    user_id: UserId,
    request: RpcRequest,
    extract: Extract<T>,
) -> Result<T, TransportError> {
    let method = request.method();
    let response = transport.call(user_id, request).await?;
    extract(response).map_err(|other| {
        TransportError::unavailable(format!(
            "unexpected response '{}' to {method} from {}",
            other.kind(),
            transport.name()
        ))
    })
}

fn ack(response: RpcResponse) -> Result<bool, RpcResponse> {
    match response {
        RpcResponse::Ack { success } => Ok(success),
        other => Err(other),
    }
}

fn members(response: RpcResponse) -> Result<Vec<GroupMemberSummary>, RpcResponse> {
    match response {
        RpcResponse::Members { members } => Ok(members),
        other => Err(other),
    }
}

fn call(response: RpcResponse) -> Result<CallSession, RpcResponse> {
    match response {
        RpcResponse::Call { call } => Ok(call),
        other => Err(other),
    }
}
