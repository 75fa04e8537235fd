use std::collections::HashSet;

use chrono::Utc;
use serde::Deserialize;
use shared::{
    domain::{
        call_duration_seconds, CallId, CallKind, CallSession, CallStatus, CallTarget,
        ConversationId, GroupId, GroupMessageId, GroupRole, LastMessage, MessageKind,
        MessageStatus, ParticipantPair, ParticipantStatus, TypingScope, TypingStatus, UserId,
        UserProfile,
    },
    error::{ApiError, ErrorCode},
    protocol::{
        ConversationSummary, GroupMemberSummary, GroupMessagePayload, GroupSummary,
        MessagePayload, ReplyPreview, RpcRequest, RpcResponse,
    },
};
use storage::{
    CallStatusUpdate, Storage, StoredConversation, StoredGroup, StoredGroupMember,
    StoredGroupMessage, StoredMessage,
};
use tracing::{info, warn};

pub const MAX_PAGE_SIZE: u32 = 200;
pub const MAX_CONTENT_BYTES: usize = 4096;
pub const MAX_GROUP_NAME_BYTES: usize = 80;
const CALL_HISTORY_LIMIT: u32 = 50;

/// What happens when the last admin of a group leaves while others remain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminSuccession {
    /// Refuse the departure until another member has been made admin.
    #[default]
    Block,
    /// Promote the longest-standing remaining member.
    PromoteOldestMember,
}

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub admin_succession: AdminSuccession,
}

impl ApiContext {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            admin_succession: AdminSuccession::default(),
        }
    }
}

/// Routes a decoded request to its procedure on behalf of `user_id`.
pub async fn dispatch(
    ctx: &ApiContext,
    user_id: UserId,
    request: RpcRequest,
) -> Result<RpcResponse, ApiError> {
    match request {
        RpcRequest::CreateChat { other_user_id } => {
            let chat_id = create_chat(ctx, user_id, other_user_id).await?;
            Ok(RpcResponse::ChatCreated { chat_id })
        }
        RpcRequest::GetChats => Ok(RpcResponse::Chats {
            chats: list_chats(ctx, user_id).await?,
        }),
        RpcRequest::GetMessages {
            chat_id,
            limit,
            offset,
        } => Ok(RpcResponse::Messages {
            messages: list_messages(ctx, user_id, chat_id, limit, offset).await?,
        }),
        RpcRequest::SendMessage {
            chat_id,
            content,
            kind,
            media_url,
        } => Ok(RpcResponse::Message {
            message: send_message(ctx, user_id, chat_id, &content, kind, media_url.as_deref())
                .await?,
        }),
        RpcRequest::UpdateLastMessage {
            chat_id,
            content,
            kind,
        } => {
            update_last_message(ctx, user_id, chat_id, &content, kind).await?;
            Ok(RpcResponse::Ack { success: true })
        }
        RpcRequest::UpdateMessageStatus { chat_id, status } => Ok(RpcResponse::Ack {
            success: update_message_status(ctx, user_id, chat_id, status).await?,
        }),
        RpcRequest::MarkAsRead { chat_id } => {
            mark_as_read(ctx, user_id, chat_id).await?;
            Ok(RpcResponse::Ack { success: true })
        }
        RpcRequest::SetTypingStatus { scope, is_typing } => {
            set_typing_status(ctx, user_id, scope, is_typing).await?;
            Ok(RpcResponse::Ack { success: true })
        }
        RpcRequest::GetTypingStatus { scope } => Ok(RpcResponse::TypingUsers {
            typing_users: get_typing_status(ctx, user_id, scope).await?,
        }),
        RpcRequest::GetProfile { user_id: target } => Ok(RpcResponse::Profile {
            profile: get_profile(ctx, target).await?,
        }),
        RpcRequest::GetGroupChats => Ok(RpcResponse::Groups {
            groups: list_groups(ctx, user_id).await?,
        }),
        RpcRequest::CreateGroupChat {
            name,
            description,
            member_ids,
        } => {
            let (group, members) =
                create_group(ctx, user_id, &name, description.as_deref(), &member_ids).await?;
            Ok(RpcResponse::GroupCreated { group, members })
        }
        RpcRequest::GetGroupMessages {
            group_id,
            limit,
            offset,
        } => Ok(RpcResponse::GroupMessages {
            messages: list_group_messages(ctx, user_id, group_id, limit, offset).await?,
        }),
        RpcRequest::SendGroupMessage {
            group_id,
            content,
            kind,
            media_url,
            reply_to_id,
        } => Ok(RpcResponse::GroupMessage {
            message: send_group_message(
                ctx,
                user_id,
                group_id,
                &content,
                kind,
                media_url.as_deref(),
                reply_to_id,
            )
            .await?,
        }),
        RpcRequest::GetGroupMembers { group_id } => Ok(RpcResponse::Members {
            members: list_group_members(ctx, user_id, group_id).await?,
        }),
        RpcRequest::AddGroupMembers {
            group_id,
            member_ids,
        } => Ok(RpcResponse::Members {
            members: add_group_members(ctx, user_id, group_id, &member_ids).await?,
        }),
        RpcRequest::RemoveGroupMember {
            group_id,
            user_id: target,
        } => Ok(RpcResponse::Members {
            members: remove_group_member(ctx, user_id, group_id, target).await?,
        }),
        RpcRequest::UpdateMemberRole {
            group_id,
            user_id: target,
            role,
        } => Ok(RpcResponse::Members {
            members: update_member_role(ctx, user_id, group_id, target, role).await?,
        }),
        RpcRequest::LeaveGroup { group_id } => {
            leave_group(ctx, user_id, group_id).await?;
            Ok(RpcResponse::Ack { success: true })
        }
        RpcRequest::MarkGroupRead { group_id } => {
            mark_group_read(ctx, user_id, group_id).await?;
            Ok(RpcResponse::Ack { success: true })
        }
        RpcRequest::CreateCall {
            receiver_id,
            group_id,
            call_type,
            is_group_call,
        } => Ok(RpcResponse::Call {
            call: create_call(ctx, user_id, receiver_id, group_id, call_type, is_group_call)
                .await?,
        }),
        RpcRequest::UpdateCallStatus { call_id, status } => Ok(RpcResponse::Call {
            call: update_call_status(ctx, user_id, call_id, status).await?,
        }),
        RpcRequest::GetCalls => Ok(RpcResponse::Calls {
            calls: list_calls(ctx, user_id).await?,
        }),
    }
}

pub async fn create_chat(
    ctx: &ApiContext,
    user_id: UserId,
    other_user_id: UserId,
) -> Result<ConversationId, ApiError> {
    let pair = ParticipantPair::new(user_id, other_user_id)
        .ok_or_else(|| ApiError::validation("cannot start a conversation with yourself"))?;
    ensure_user_exists(ctx, user_id).await?;
    ensure_user_exists(ctx, other_user_id).await?;
    ctx.storage.create_conversation(pair).await.map_err(internal)
}

pub async fn list_chats(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<Vec<ConversationSummary>, ApiError> {
    let conversations = ctx
        .storage
        .list_conversations_for_user(user_id)
        .await
        .map_err(internal)?;

    let mut summaries = Vec::with_capacity(conversations.len());
    for conversation in conversations {
        summaries.push(conversation_summary(ctx, user_id, conversation).await?);
    }
    Ok(summaries)
}

pub async fn list_messages(
    ctx: &ApiContext,
    user_id: UserId,
    chat_id: ConversationId,
    limit: u32,
    offset: u32,
) -> Result<Vec<MessagePayload>, ApiError> {
    ensure_conversation_participant(ctx, chat_id, user_id).await?;
    let messages = ctx
        .storage
        .list_messages(chat_id, clamp_page(limit), offset)
        .await
        .map_err(internal)?;
    Ok(messages.into_iter().map(message_payload).collect())
}

pub async fn send_message(
    ctx: &ApiContext,
    user_id: UserId,
    chat_id: ConversationId,
    content: &str,
    kind: MessageKind,
    media_url: Option<&str>,
) -> Result<MessagePayload, ApiError> {
    ensure_conversation_participant(ctx, chat_id, user_id).await?;
    validate_content(content, media_url)?;

    let message = ctx
        .storage
        .insert_message(chat_id, user_id, content, kind, media_url)
        .await
        .map_err(internal)?;
    ctx.storage
        .update_last_message(chat_id, content, kind, message.created_at)
        .await
        .map_err(internal)?;
    Ok(message_payload(message))
}

pub async fn update_last_message(
    ctx: &ApiContext,
    user_id: UserId,
    chat_id: ConversationId,
    content: &str,
    kind: MessageKind,
) -> Result<(), ApiError> {
    ensure_conversation_participant(ctx, chat_id, user_id).await?;
    validate_content(content, None)?;
    ctx.storage
        .update_last_message(chat_id, content, kind, Utc::now())
        .await
        .map_err(internal)
}

pub async fn update_message_status(
    ctx: &ApiContext,
    user_id: UserId,
    chat_id: ConversationId,
    status: MessageStatus,
) -> Result<bool, ApiError> {
    ensure_conversation_participant(ctx, chat_id, user_id).await?;
    if status == MessageStatus::Sending {
        return Err(ApiError::validation(
            "conversation status must be sent, delivered or read",
        ));
    }
    ctx.storage
        .advance_conversation_status(chat_id, status, Utc::now())
        .await
        .map_err(internal)
}

pub async fn mark_as_read(
    ctx: &ApiContext,
    user_id: UserId,
    chat_id: ConversationId,
) -> Result<(), ApiError> {
    ensure_conversation_participant(ctx, chat_id, user_id).await?;
    ctx.storage
        .mark_conversation_read(chat_id, user_id)
        .await
        .map_err(internal)?;
    Ok(())
}

pub async fn set_typing_status(
    ctx: &ApiContext,
    user_id: UserId,
    scope: TypingScope,
    is_typing: bool,
) -> Result<(), ApiError> {
    ensure_scope_access(ctx, scope, user_id).await?;
    ctx.storage
        .upsert_typing(scope, user_id, is_typing, Utc::now())
        .await
        .map_err(internal)
}

/// Other users currently typing in `scope`; stale records are dropped.
pub async fn get_typing_status(
    ctx: &ApiContext,
    user_id: UserId,
    scope: TypingScope,
) -> Result<Vec<TypingStatus>, ApiError> {
    ensure_scope_access(ctx, scope, user_id).await?;
    let now = Utc::now();
    let records = ctx.storage.list_typing(scope).await.map_err(internal)?;
    Ok(records
        .into_iter()
        .filter(|record| record.user_id != user_id && record.is_typing_at(now))
        .collect())
}

pub async fn get_profile(ctx: &ApiContext, user_id: UserId) -> Result<UserProfile, ApiError> {
    ctx.storage
        .user_profile(user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("user not found"))
}

pub async fn list_groups(ctx: &ApiContext, user_id: UserId) -> Result<Vec<GroupSummary>, ApiError> {
    let groups = ctx
        .storage
        .list_groups_for_user(user_id)
        .await
        .map_err(internal)?;
    let mut summaries = Vec::with_capacity(groups.len());
    for group in groups {
        summaries.push(group_summary(ctx, user_id, group).await?);
    }
    Ok(summaries)
}

/// Creates the group, then the creator as admin, then the other members.
///
/// The group row is deleted again if the creator cannot be added. Other
/// members are added best-effort; failures are logged and skipped.
pub async fn create_group(
    ctx: &ApiContext,
    user_id: UserId,
    name: &str,
    description: Option<&str>,
    member_ids: &[UserId],
) -> Result<(GroupSummary, Vec<GroupMemberSummary>), ApiError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::validation("group name must not be empty"));
    }
    if name.len() > MAX_GROUP_NAME_BYTES {
        return Err(ApiError::validation("group name is too long"));
    }
    let description = description.map(str::trim).filter(|d| !d.is_empty());

    let group_id = ctx
        .storage
        .create_group(name, description, user_id)
        .await
        .map_err(internal)?;

    if let Err(err) = ctx
        .storage
        .add_group_member(group_id, user_id, GroupRole::Admin)
        .await
    {
        warn!(
            group_id = group_id.0,
            creator_id = user_id.0,
            "group: creator insert failed, deleting group row: {err:#}"
        );
        if let Err(cleanup) = ctx.storage.delete_group(group_id).await {
            warn!(group_id = group_id.0, "group: compensating delete failed: {cleanup:#}");
        }
        return Err(internal(err));
    }

    let mut seen = HashSet::from([user_id]);
    for member_id in member_ids {
        if !seen.insert(*member_id) {
            continue;
        }
        if let Err(err) = ctx
            .storage
            .add_group_member(group_id, *member_id, GroupRole::Member)
            .await
        {
            warn!(
                group_id = group_id.0,
                member_id = member_id.0,
                "group: member insert failed during creation: {err:#}"
            );
        }
    }

    let group = ctx
        .storage
        .group(group_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::Internal, "group vanished after creation"))?;
    let members = members_for(ctx, group_id).await?;
    info!(
        group_id = group_id.0,
        member_count = members.len(),
        "group: created"
    );
    Ok((group_summary(ctx, user_id, group).await?, members))
}

pub async fn list_group_messages(
    ctx: &ApiContext,
    user_id: UserId,
    group_id: GroupId,
    limit: u32,
    offset: u32,
) -> Result<Vec<GroupMessagePayload>, ApiError> {
    ensure_group_member(ctx, group_id, user_id).await?;
    let messages = ctx
        .storage
        .list_group_messages(group_id, clamp_page(limit), offset)
        .await
        .map_err(internal)?;
    let members = ctx
        .storage
        .list_group_members(group_id)
        .await
        .map_err(internal)?;

    let mut payloads = Vec::with_capacity(messages.len());
    for message in messages {
        let reply_preview = match message.reply_to_id {
            Some(reply_to_id) => reply_preview(ctx, group_id, reply_to_id).await?,
            None => None,
        };
        let sender_name = members
            .iter()
            .find(|m| m.user_id == message.sender_id)
            .map(member_label);
        payloads.push(group_message_payload(message, sender_name, reply_preview));
    }
    Ok(payloads)
}

pub async fn send_group_message(
    ctx: &ApiContext,
    user_id: UserId,
    group_id: GroupId,
    content: &str,
    kind: MessageKind,
    media_url: Option<&str>,
    reply_to_id: Option<GroupMessageId>,
) -> Result<GroupMessagePayload, ApiError> {
    let member = ensure_group_member(ctx, group_id, user_id).await?;
    if member.muted {
        return Err(ApiError::forbidden("member is muted"));
    }
    validate_content(content, media_url)?;

    let preview = match reply_to_id {
        Some(reply_to_id) => Some(
            reply_preview(ctx, group_id, reply_to_id)
                .await?
                .ok_or_else(|| {
                    ApiError::validation("reply target is not a message in this group")
                })?,
        ),
        None => None,
    };

    let message = ctx
        .storage
        .insert_group_message(group_id, user_id, content, kind, media_url, reply_to_id)
        .await
        .map_err(internal)?;
    Ok(group_message_payload(
        message,
        Some(member_label(&member)),
        preview,
    ))
}

pub async fn list_group_members(
    ctx: &ApiContext,
    user_id: UserId,
    group_id: GroupId,
) -> Result<Vec<GroupMemberSummary>, ApiError> {
    ensure_group_member(ctx, group_id, user_id).await?;
    members_for(ctx, group_id).await
}

pub async fn add_group_members(
    ctx: &ApiContext,
    user_id: UserId,
    group_id: GroupId,
    member_ids: &[UserId],
) -> Result<Vec<GroupMemberSummary>, ApiError> {
    let actor = ensure_group_member(ctx, group_id, user_id).await?;
    if !actor.role.is_elevated() {
        return Err(ApiError::forbidden("only admins and moderators can add members"));
    }
    for member_id in member_ids {
        ensure_user_exists(ctx, *member_id).await?;
    }

    for member_id in member_ids {
        let existing = ctx
            .storage
            .group_member(group_id, *member_id)
            .await
            .map_err(internal)?;
        if existing.is_some() {
            continue;
        }
        ctx.storage
            .add_group_member(group_id, *member_id, GroupRole::Member)
            .await
            .map_err(internal)?;
    }
    members_for(ctx, group_id).await
}

pub async fn remove_group_member(
    ctx: &ApiContext,
    user_id: UserId,
    group_id: GroupId,
    target_id: UserId,
) -> Result<Vec<GroupMemberSummary>, ApiError> {
    if target_id == user_id {
        leave_group(ctx, user_id, group_id).await?;
        return Ok(Vec::new());
    }

    let actor = ensure_group_member(ctx, group_id, user_id).await?;
    let target = ctx
        .storage
        .group_member(group_id, target_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("user is not a member of this group"))?;

    let allowed = match actor.role {
        GroupRole::Admin => true,
        GroupRole::Moderator => target.role == GroupRole::Member,
        GroupRole::Member => false,
    };
    if !allowed {
        return Err(ApiError::forbidden("insufficient role to remove this member"));
    }

    ctx.storage
        .remove_group_member(group_id, target_id)
        .await
        .map_err(internal)?;
    members_for(ctx, group_id).await
}

pub async fn update_member_role(
    ctx: &ApiContext,
    user_id: UserId,
    group_id: GroupId,
    target_id: UserId,
    role: GroupRole,
) -> Result<Vec<GroupMemberSummary>, ApiError> {
    let actor = ensure_group_member(ctx, group_id, user_id).await?;
    if actor.role != GroupRole::Admin {
        return Err(ApiError::forbidden("only admins can change roles"));
    }
    let target = ctx
        .storage
        .group_member(group_id, target_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("user is not a member of this group"))?;

    if target.role == GroupRole::Admin && role != GroupRole::Admin {
        let members = ctx
            .storage
            .list_group_members(group_id)
            .await
            .map_err(internal)?;
        let admins = members.iter().filter(|m| m.role == GroupRole::Admin).count();
        if admins <= 1 {
            return Err(ApiError::conflict("a group needs at least one admin"));
        }
    }

    ctx.storage
        .update_group_member_role(group_id, target_id, role)
        .await
        .map_err(internal)?;
    members_for(ctx, group_id).await
}

pub async fn leave_group(
    ctx: &ApiContext,
    user_id: UserId,
    group_id: GroupId,
) -> Result<(), ApiError> {
    let member = ensure_group_member(ctx, group_id, user_id).await?;
    let members = ctx
        .storage
        .list_group_members(group_id)
        .await
        .map_err(internal)?;
    let remaining: Vec<&StoredGroupMember> =
        members.iter().filter(|m| m.user_id != user_id).collect();

    if remaining.is_empty() {
        ctx.storage
            .remove_group_member(group_id, user_id)
            .await
            .map_err(internal)?;
        ctx.storage
            .set_group_active(group_id, false)
            .await
            .map_err(internal)?;
        info!(group_id = group_id.0, "group: last member left, group deactivated");
        return Ok(());
    }

    let other_admin = remaining.iter().any(|m| m.role == GroupRole::Admin);
    if member.role == GroupRole::Admin && !other_admin {
        match ctx.admin_succession {
            AdminSuccession::Block => {
                return Err(ApiError::conflict(
                    "promote another member to admin before leaving",
                ));
            }
            AdminSuccession::PromoteOldestMember => {
                let successor = remaining[0].user_id;
                ctx.storage
                    .update_group_member_role(group_id, successor, GroupRole::Admin)
                    .await
                    .map_err(internal)?;
                info!(
                    group_id = group_id.0,
                    successor_id = successor.0,
                    "group: admin role passed on"
                );
            }
        }
    }

    ctx.storage
        .remove_group_member(group_id, user_id)
        .await
        .map_err(internal)?;
    Ok(())
}

pub async fn mark_group_read(
    ctx: &ApiContext,
    user_id: UserId,
    group_id: GroupId,
) -> Result<(), ApiError> {
    ensure_group_member(ctx, group_id, user_id).await?;
    ctx.storage
        .mark_group_read(group_id, user_id)
        .await
        .map_err(internal)
}

pub async fn create_call(
    ctx: &ApiContext,
    user_id: UserId,
    receiver_id: Option<UserId>,
    group_id: Option<GroupId>,
    call_type: CallKind,
    is_group_call: bool,
) -> Result<CallSession, ApiError> {
    let target = CallTarget::from_parts(receiver_id, group_id)
        .map_err(|err| ApiError::validation(err.to_string()))?;
    if target.is_group() != is_group_call {
        return Err(ApiError::validation(
            "is_group_call does not match the call target",
        ));
    }

    let invitees = match target {
        CallTarget::Direct { receiver_id } => {
            if receiver_id == user_id {
                return Err(ApiError::validation("cannot call yourself"));
            }
            ensure_user_exists(ctx, user_id).await?;
            ensure_user_exists(ctx, receiver_id).await?;
            Vec::new()
        }
        CallTarget::Group { group_id } => {
            let group = ensure_active_group(ctx, group_id).await?;
            ensure_group_member(ctx, group.group_id, user_id).await?;
            ctx.storage
                .list_group_members(group_id)
                .await
                .map_err(internal)?
                .into_iter()
                .map(|m| m.user_id)
                .filter(|member_id| *member_id != user_id)
                .collect()
        }
    };

    let call_id = ctx
        .storage
        .create_call(user_id, target, call_type)
        .await
        .map_err(internal)?;
    for invitee in invitees {
        ctx.storage
            .insert_call_participant(call_id, invitee, ParticipantStatus::Invited)
            .await
            .map_err(internal)?;
    }
    info!(
        call_id = call_id.0,
        caller_id = user_id.0,
        group_call = is_group_call,
        "call: created"
    );
    load_call(ctx, call_id).await
}

/// Applies a status change requested by a party to the call.
///
/// Only the called side answers or declines; the caller may end the call or
/// mark it missed. Group participants answer or decline for themselves; the session only
/// leaves `calling` on the first join, or once every invitee has declined.
pub async fn update_call_status(
    ctx: &ApiContext,
    user_id: UserId,
    call_id: CallId,
    status: CallStatus,
) -> Result<CallSession, ApiError> {
    let call = load_call(ctx, call_id).await?;
    if !call.involves(user_id) {
        return Err(ApiError::forbidden("not a party to this call"));
    }
    let is_caller = call.caller_id == user_id;
    if is_caller && matches!(status, CallStatus::Answered | CallStatus::Declined) {
        return Err(ApiError::forbidden(format!(
            "the caller cannot mark the call {}",
            status.as_str()
        )));
    }

    let is_participant = call.is_group_call() && !is_caller;
    if is_participant {
        match status {
            CallStatus::Answered => {
                if call.status == CallStatus::Answered {
                    set_participant_status(ctx, call_id, user_id, ParticipantStatus::Joined)
                        .await?;
                    return load_call(ctx, call_id).await;
                }
                ensure_transition(call.status, status)?;
                set_participant_status(ctx, call_id, user_id, ParticipantStatus::Joined).await?;
            }
            CallStatus::Declined => {
                ensure_transition(call.status, status)?;
                set_participant_status(ctx, call_id, user_id, ParticipantStatus::Declined)
                    .await?;
                let refreshed = load_call(ctx, call_id).await?;
                let everyone_declined = refreshed
                    .participants
                    .iter()
                    .all(|p| p.status == ParticipantStatus::Declined);
                if !everyone_declined {
                    return Ok(refreshed);
                }
            }
            _ => ensure_transition(call.status, status)?,
        }
    } else {
        ensure_transition(call.status, status)?;
    }

    let now = Utc::now();
    let update = match status {
        CallStatus::Answered => CallStatusUpdate {
            status,
            started_at: Some(now),
            ended_at: None,
            duration_seconds: None,
        },
        CallStatus::Ended => CallStatusUpdate {
            status,
            started_at: None,
            ended_at: Some(now),
            duration_seconds: call
                .started_at
                .map(|started_at| call_duration_seconds(started_at, now)),
        },
        _ => CallStatusUpdate {
            status,
            started_at: None,
            ended_at: Some(now),
            duration_seconds: None,
        },
    };

    let applied = ctx
        .storage
        .update_call_status(call_id, call.status, &update)
        .await
        .map_err(internal)?;
    if !applied {
        return Err(ApiError::conflict("call changed state concurrently"));
    }
    info!(
        call_id = call_id.0,
        from = call.status.as_str(),
        to = status.as_str(),
        "call: status updated"
    );
    load_call(ctx, call_id).await
}

pub async fn list_calls(ctx: &ApiContext, user_id: UserId) -> Result<Vec<CallSession>, ApiError> {
    ctx.storage
        .list_calls_for_user(user_id, CALL_HISTORY_LIMIT)
        .await
        .map_err(internal)
}

fn ensure_transition(from: CallStatus, to: CallStatus) -> Result<(), ApiError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(ApiError::conflict(format!(
            "illegal call transition {} -> {}",
            from.as_str(),
            to.as_str()
        )))
    }
}

async fn set_participant_status(
    ctx: &ApiContext,
    call_id: CallId,
    user_id: UserId,
    status: ParticipantStatus,
) -> Result<(), ApiError> {
    let updated = ctx
        .storage
        .update_call_participant(call_id, user_id, status)
        .await
        .map_err(internal)?;
    if updated {
        Ok(())
    } else {
        Err(ApiError::forbidden("not invited to this call"))
    }
}

async fn load_call(ctx: &ApiContext, call_id: CallId) -> Result<CallSession, ApiError> {
    ctx.storage
        .call(call_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("call not found"))
}

async fn ensure_user_exists(ctx: &ApiContext, user_id: UserId) -> Result<(), ApiError> {
    if ctx.storage.user_exists(user_id).await.map_err(internal)? {
        Ok(())
    } else {
        Err(ApiError::not_found(format!("user {} not found", user_id.0)))
    }
}

async fn ensure_conversation_participant(
    ctx: &ApiContext,
    chat_id: ConversationId,
    user_id: UserId,
) -> Result<StoredConversation, ApiError> {
    let conversation = ctx
        .storage
        .conversation(chat_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("conversation not found"))?;
    if !conversation.participants.contains(user_id) {
        return Err(ApiError::forbidden("not a participant in this conversation"));
    }
    Ok(conversation)
}

async fn ensure_active_group(ctx: &ApiContext, group_id: GroupId) -> Result<StoredGroup, ApiError> {
    let group = ctx
        .storage
        .group(group_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("group not found"))?;
    if !group.is_active {
        return Err(ApiError::not_found("group not found"));
    }
    Ok(group)
}

async fn ensure_group_member(
    ctx: &ApiContext,
    group_id: GroupId,
    user_id: UserId,
) -> Result<StoredGroupMember, ApiError> {
    ensure_active_group(ctx, group_id).await?;
    ctx.storage
        .group_member(group_id, user_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::forbidden("user is not a member of this group"))
}

async fn ensure_scope_access(
    ctx: &ApiContext,
    scope: TypingScope,
    user_id: UserId,
) -> Result<(), ApiError> {
    match scope {
        TypingScope::Conversation(chat_id) => {
            ensure_conversation_participant(ctx, chat_id, user_id).await?;
        }
        TypingScope::Group(group_id) => {
            ensure_group_member(ctx, group_id, user_id).await?;
        }
    }
    Ok(())
}

async fn conversation_summary(
    ctx: &ApiContext,
    user_id: UserId,
    conversation: StoredConversation,
) -> Result<ConversationSummary, ApiError> {
    let other_id = conversation
        .participants
        .other(user_id)
        .ok_or_else(|| ApiError::forbidden("not a participant in this conversation"))?;
    let other_participant = ctx
        .storage
        .user_profile(other_id)
        .await
        .map_err(internal)?
        .unwrap_or_else(|| UserProfile::placeholder(other_id));
    let unread_count = ctx
        .storage
        .unread_count(conversation.conversation_id, user_id)
        .await
        .map_err(internal)?;

    Ok(ConversationSummary {
        conversation_id: conversation.conversation_id,
        participants: conversation.participants,
        other_participant,
        last_message: conversation.last_message,
        message_status: conversation.message_status,
        message_status_at: conversation.message_status_at,
        unread_count,
        created_at: conversation.created_at,
        updated_at: conversation.updated_at,
    })
}

async fn group_summary(
    ctx: &ApiContext,
    user_id: UserId,
    group: StoredGroup,
) -> Result<GroupSummary, ApiError> {
    let members = ctx
        .storage
        .list_group_members(group.group_id)
        .await
        .map_err(internal)?;
    let last_message = ctx
        .storage
        .latest_group_message(group.group_id)
        .await
        .map_err(internal)?
        .map(|m| LastMessage {
            content: m.content,
            kind: m.kind,
            timestamp: m.created_at,
        });
    let unread_count = ctx
        .storage
        .group_unread_count(group.group_id, user_id)
        .await
        .map_err(internal)?;

    Ok(GroupSummary {
        group_id: group.group_id,
        name: group.name,
        description: group.description,
        avatar_url: group.avatar_url,
        creator_id: group.creator_id,
        is_active: group.is_active,
        member_count: u32::try_from(members.len()).unwrap_or(u32::MAX),
        last_message,
        unread_count,
        created_at: group.created_at,
        updated_at: group.updated_at,
    })
}

async fn members_for(
    ctx: &ApiContext,
    group_id: GroupId,
) -> Result<Vec<GroupMemberSummary>, ApiError> {
    let members = ctx
        .storage
        .list_group_members(group_id)
        .await
        .map_err(internal)?;
    Ok(members
        .into_iter()
        .map(|member| GroupMemberSummary {
            display_name: member_label(&member),
            group_id: member.group_id,
            user_id: member.user_id,
            role: member.role,
            joined_at: member.joined_at,
            muted: member.muted,
        })
        .collect())
}

async fn reply_preview(
    ctx: &ApiContext,
    group_id: GroupId,
    reply_to_id: GroupMessageId,
) -> Result<Option<ReplyPreview>, ApiError> {
    let original = ctx
        .storage
        .group_message(reply_to_id)
        .await
        .map_err(internal)?;
    Ok(original
        .filter(|m| m.group_id == group_id)
        .map(|m| ReplyPreview {
            message_id: m.message_id,
            sender_id: m.sender_id,
            content: m.content,
            kind: m.kind,
        }))
}

fn member_label(member: &StoredGroupMember) -> String {
    member
        .display_name
        .clone()
        .unwrap_or_else(|| member.username.clone())
}

fn message_payload(message: StoredMessage) -> MessagePayload {
    MessagePayload {
        message_id: message.message_id,
        conversation_id: message.conversation_id,
        sender_id: message.sender_id,
        content: message.content,
        kind: message.kind,
        media_url: message.media_url,
        status: message.status,
        created_at: message.created_at,
    }
}

fn group_message_payload(
    message: StoredGroupMessage,
    sender_name: Option<String>,
    reply_preview: Option<ReplyPreview>,
) -> GroupMessagePayload {
    GroupMessagePayload {
        message_id: message.message_id,
        group_id: message.group_id,
        sender_id: message.sender_id,
        sender_name,
        content: message.content,
        kind: message.kind,
        media_url: message.media_url,
        reply_to_id: message.reply_to_id,
        reply_preview,
        created_at: message.created_at,
    }
}

fn validate_content(content: &str, media_url: Option<&str>) -> Result<(), ApiError> {
    if content.trim().is_empty() && media_url.is_none() {
        return Err(ApiError::validation("message content must not be empty"));
    }
    if content.len() > MAX_CONTENT_BYTES {
        return Err(ApiError::validation("message content is too long"));
    }
    Ok(())
}

fn clamp_page(limit: u32) -> u32 {
    limit.clamp(1, MAX_PAGE_SIZE)
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
