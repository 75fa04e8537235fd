use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use shared::{
    domain::{MessageId, MessageRef, TypingScope},
    error::ApiError,
    protocol::{MessagePayload, RpcRequest, RpcResponse},
};
use tokio::sync::Notify;

use super::*;
use crate::{
    test_support::{
        next_event, offline_engine, scripted_engine, test_config, FixedPresence, ScriptedTransport,
    },
    transport::{Transport, TransportError},
    ChatEngine, EngineConfig, NoPresence,
};

const ME: UserId = UserId(1);
const PEER: UserId = UserId(2);

fn pair() -> ParticipantPair {
    ParticipantPair::new(ME, PEER).expect("pair")
}

fn summary(chat_id: i64, participants: ParticipantPair, last: Option<&str>) -> ConversationSummary {
    let now = Utc::now();
    ConversationSummary {
        conversation_id: ConversationId(chat_id),
        participants,
        other_participant: UserProfile {
            user_id: participants.other(ME).expect("member"),
            username: "bob".into(),
            display_name: Some("Bob".into()),
            avatar_url: None,
        },
        last_message: last.map(|content| LastMessage {
            content: content.into(),
            kind: MessageKind::Text,
            timestamp: now,
        }),
        message_status: last.map(|_| MessageStatus::Sent),
        message_status_at: last.map(|_| now),
        unread_count: 3,
        created_at: now,
        updated_at: now,
    }
}

fn payload(id: i64, chat_id: i64, sender: UserId, content: &str, status: MessageStatus) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(id),
        conversation_id: ConversationId(chat_id),
        sender_id: sender,
        content: content.into(),
        kind: MessageKind::Text,
        media_url: None,
        status,
        created_at: Utc::now(),
    }
}

/// Remote that knows conversation 42 with the peer.
fn chat_remote(
    on_send: impl Fn() -> Result<RpcResponse, TransportError> + Send + Sync + 'static,
) -> Arc<ScriptedTransport> {
    ScriptedTransport::new("direct", move |request| match request {
        RpcRequest::CreateChat { .. } => Ok(RpcResponse::ChatCreated {
            chat_id: ConversationId(42),
        }),
        RpcRequest::SendMessage { .. } => on_send(),
        RpcRequest::GetMessages { .. } => Ok(RpcResponse::Messages {
            messages: vec![
                payload(7, 42, PEER, "first", MessageStatus::Delivered),
                payload(8, 42, ME, "second", MessageStatus::Read),
            ],
        }),
        RpcRequest::UpdateMessageStatus { .. }
        | RpcRequest::UpdateLastMessage { .. }
        | RpcRequest::MarkAsRead { .. }
        | RpcRequest::SetTypingStatus { .. } => Ok(RpcResponse::Ack { success: true }),
        other => Err(TransportError::unavailable(format!("unscripted {}", other.method()))),
    })
}

async fn synced(engine: &ChatEngine) -> ConversationRef {
    let mut events = engine.subscribe_events();
    let id = engine
        .conversations()
        .create_or_get_conversation(PEER)
        .await
        .expect("conversation");
    next_event(&mut events, |event| match event {
        ClientEvent::ConversationRemapped { .. } => Some(()),
        _ => None,
    })
    .await;
    assert_eq!(
        engine.conversations().resolve(&id).await,
        ConversationRef::Remote(ConversationId(42))
    );
    id
}

#[tokio::test]
async fn opening_a_conversation_twice_reuses_it() {
    let engine = offline_engine(ME, Arc::new(NoPresence)).await;
    let store = engine.conversations();

    let first = store.create_or_get_conversation(PEER).await.expect("first");
    let second = store.create_or_get_conversation(PEER).await.expect("second");
    assert_eq!(first, second);
    assert_eq!(store.conversations().await.len(), 1);

    let err = store.create_or_get_conversation(ME).await.expect_err("self");
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn offline_conversation_stays_provisional_with_placeholder() {
    let engine = offline_engine(ME, Arc::new(NoPresence)).await;
    let id = engine
        .conversations()
        .create_or_get_conversation(PEER)
        .await
        .expect("conversation");
    tokio::time::sleep(Duration::from_millis(20)).await;

    let conversation = engine.conversations().conversation(&id).await.expect("loaded");
    assert!(conversation.is_local_pending());
    assert_eq!(conversation.participants, pair());
    assert_eq!(conversation.other_participant_name(), "User 2");
    assert!(engine.conversations().load_messages(&id, 50, 0).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn offline_send_advances_and_gets_a_reply() {
    let engine = offline_engine(ME, Arc::new(FixedPresence::standard())).await;
    let store = engine.conversations();
    let id = store.create_or_get_conversation(PEER).await.expect("conversation");

    let sent = store
        .send_message(&id, "hello", MessageKind::Text, None)
        .await
        .expect("send");
    assert_eq!(sent.status, MessageStatus::Sending);
    assert!(sent.id.is_provisional());
    assert!(sent.client_key.starts_with("local-"));
    let conversation = store.conversation(&id).await.expect("loaded");
    assert_eq!(
        conversation.last_message.map(|m| m.content),
        Some("hello".to_string())
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.messages(&id).await[0].status, MessageStatus::Sent);
    assert!(store.conversation(&id).await.expect("loaded").peer_typing);

    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(store.messages(&id).await[0].status, MessageStatus::Delivered);

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    let messages = store.messages(&id).await;
    assert_eq!(messages[0].status, MessageStatus::Read);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].sender_id, PEER);
    assert_eq!(messages[1].content, "Hey! How's it going?");

    let conversation = store.conversation(&id).await.expect("loaded");
    assert!(!conversation.peer_typing);
    assert_eq!(conversation.unread_count, 1);
    assert_eq!(
        conversation.last_message.as_ref().map(|m| m.content.as_str()),
        Some("Hey! How's it going?")
    );
    assert!(conversation.is_local_pending());
}

#[tokio::test(start_paused = true)]
async fn teardown_cancels_receipts_and_replies() {
    let engine = offline_engine(ME, Arc::new(FixedPresence::standard())).await;
    let store = engine.conversations();
    let id = store.create_or_get_conversation(PEER).await.expect("conversation");
    store
        .send_message(&id, "hello", MessageKind::Text, None)
        .await
        .expect("send");

    tokio::time::sleep(Duration::from_millis(100)).await;
    store.teardown(&id).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    let messages = store.messages(&id).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].status, MessageStatus::Sent);
}

#[tokio::test(start_paused = true)]
async fn teardown_right_after_send_drops_the_pending_reply() {
    let engine = offline_engine(ME, Arc::new(FixedPresence::standard())).await;
    let store = engine.conversations();
    let id = store.create_or_get_conversation(PEER).await.expect("conversation");
    store
        .send_message(&id, "hello", MessageKind::Text, None)
        .await
        .expect("send");
    store.teardown(&id).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    let messages = store.messages(&id).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].sender_id, ME);
    let conversation = store.conversation(&id).await.expect("loaded");
    assert!(!conversation.peer_typing);
    assert_eq!(conversation.unread_count, 0);

    // A later send in the same conversation still gets its reply.
    store
        .send_message(&id, "again", MessageKind::Text, None)
        .await
        .expect("send");
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(store.messages(&id).await.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn receipts_for_older_messages_leave_the_conversation_status() {
    let engine = offline_engine(
        ME,
        Arc::new(FixedPresence {
            receipts: FixedPresence::standard().receipts,
            reply: None,
        }),
    )
    .await;
    let store = engine.conversations();
    let id = store.create_or_get_conversation(PEER).await.expect("conversation");

    store
        .send_message(&id, "first", MessageKind::Text, None)
        .await
        .expect("first");
    tokio::time::sleep(Duration::from_millis(1_900)).await;
    store
        .send_message(&id, "second", MessageKind::Text, None)
        .await
        .expect("second");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let messages = store.messages(&id).await;
    assert_eq!(messages[0].status, MessageStatus::Read);
    assert_eq!(messages[1].status, MessageStatus::Sent);
    let conversation = store.conversation(&id).await.expect("loaded");
    assert_eq!(
        conversation.last_message.as_ref().map(|m| m.content.as_str()),
        Some("second")
    );
    assert_eq!(conversation.message_status, Some(MessageStatus::Sent));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        store.conversation(&id).await.expect("loaded").message_status,
        Some(MessageStatus::Read)
    );
}

#[tokio::test]
async fn empty_message_is_rejected() {
    let engine = offline_engine(ME, Arc::new(NoPresence)).await;
    let id = engine
        .conversations()
        .create_or_get_conversation(PEER)
        .await
        .expect("conversation");
    let err = engine
        .conversations()
        .send_message(&id, "   ", MessageKind::Text, None)
        .await
        .expect_err("empty");
    assert!(matches!(err, EngineError::Validation(_)));
    assert!(engine.conversations().messages(&id).await.is_empty());
}

#[tokio::test]
async fn unknown_conversation_is_not_loaded() {
    let engine = offline_engine(ME, Arc::new(NoPresence)).await;
    let err = engine
        .conversations()
        .mark_as_read(&ConversationRef::Remote(ConversationId(77)))
        .await
        .expect_err("unknown");
    assert!(matches!(err, EngineError::NotLoaded(_)));
}

#[tokio::test]
async fn conversation_status_never_regresses() {
    let engine = offline_engine(ME, Arc::new(NoPresence)).await;
    let store = engine.conversations();
    let id = store.create_or_get_conversation(PEER).await.expect("conversation");

    assert!(store
        .update_message_status(&id, MessageStatus::Read)
        .await
        .expect("read"));
    assert!(!store
        .update_message_status(&id, MessageStatus::Delivered)
        .await
        .expect("delivered"));
    let err = store
        .update_message_status(&id, MessageStatus::Sending)
        .await
        .expect_err("sending");
    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(
        store.conversation(&id).await.expect("loaded").message_status,
        Some(MessageStatus::Read)
    );
}

#[tokio::test]
async fn refresh_remaps_pending_conversation_with_transcript_and_typing() {
    let online = Arc::new(AtomicBool::new(false));
    let flag = online.clone();
    let remote = ScriptedTransport::new("direct", move |request| {
        if !flag.load(Ordering::SeqCst) {
            return Err(TransportError::unavailable("offline"));
        }
        match request {
            RpcRequest::GetChats => Ok(RpcResponse::Chats {
                chats: vec![summary(42, pair(), Some("from server"))],
            }),
            RpcRequest::SetTypingStatus { .. } => Ok(RpcResponse::Ack { success: true }),
            other => Err(TransportError::unavailable(format!("unscripted {}", other.method()))),
        }
    });
    let engine = scripted_engine(ME, ScriptedTransport::down("rpc"), remote.clone()).await;
    let store = engine.conversations();

    let id = store.create_or_get_conversation(PEER).await.expect("conversation");
    store
        .send_message(&id, "written offline", MessageKind::Text, None)
        .await
        .expect("send");
    store.set_typing_status(&id, true).await.expect("typing");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(remote.count("chat.setTypingStatus"), 0);

    online.store(true, Ordering::SeqCst);
    let listed = store.list_conversations().await;
    assert_eq!(listed.len(), 1);
    let remote_id = ConversationRef::Remote(ConversationId(42));
    assert_eq!(listed[0].id, remote_id);
    assert_eq!(store.resolve(&id).await, remote_id);

    let messages = store.messages(&id).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].conversation_id, remote_id);
    assert!(store.conversation(&id).await.expect("loaded").is_typing);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let typing: Vec<_> = remote
        .requests()
        .into_iter()
        .filter_map(|request| match request {
            RpcRequest::SetTypingStatus { scope, is_typing } => Some((scope, is_typing)),
            _ => None,
        })
        .collect();
    assert_eq!(
        typing,
        vec![(TypingScope::Conversation(ConversationId(42)), true)]
    );

    // A second refresh finds nothing left to remap.
    assert_eq!(store.list_conversations().await.len(), 1);
    assert_eq!(store.resolve(&id).await, remote_id);
}

#[tokio::test]
async fn failed_refresh_keeps_local_list() {
    let engine = offline_engine(ME, Arc::new(NoPresence)).await;
    engine
        .conversations()
        .create_or_get_conversation(PEER)
        .await
        .expect("conversation");
    assert_eq!(engine.conversations().list_conversations().await.len(), 1);
}

/// Holds `chat.getChats` until released so a local edit can land meanwhile.
struct SlowChats {
    arrived: Notify,
    release: Notify,
}

#[async_trait]
impl Transport for SlowChats {
    fn name(&self) -> &'static str {
        "slow"
    }

    async fn call(&self, _user_id: UserId, request: RpcRequest) -> Result<RpcResponse, TransportError> {
        match request {
            RpcRequest::GetChats => {
                self.arrived.notify_one();
                self.release.notified().await;
                Ok(RpcResponse::Chats {
                    chats: vec![
                        summary(42, pair(), Some("stale server copy")),
                        summary(43, ParticipantPair::new(ME, UserId(3)).expect("pair"), None),
                    ],
                })
            }
            RpcRequest::CreateChat { .. } => Ok(RpcResponse::ChatCreated {
                chat_id: ConversationId(42),
            }),
            RpcRequest::UpdateLastMessage { .. } => Ok(RpcResponse::Ack { success: true }),
            other => Err(TransportError::unavailable(format!("unscripted {}", other.method()))),
        }
    }

    async fn health(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[tokio::test]
async fn refresh_does_not_overwrite_newer_local_edits() {
    let slow = Arc::new(SlowChats {
        arrived: Notify::new(),
        release: Notify::new(),
    });
    let engine = Arc::new(
        ChatEngine::builder(test_config(), ME)
            .primary(ScriptedTransport::down("rpc"))
            .secondary(slow.clone())
            .presence(Arc::new(NoPresence))
            .build()
            .await
            .expect("engine"),
    );
    let id = synced(&engine).await;

    let refresh = tokio::spawn({
        let engine = engine.clone();
        async move { engine.conversations().list_conversations().await }
    });
    slow.arrived.notified().await;
    engine
        .conversations()
        .update_last_message(&id, "local edit", MessageKind::Text)
        .await
        .expect("edit");
    slow.release.notify_one();

    let listed = refresh.await.expect("refresh");
    assert_eq!(listed.len(), 2);
    let mine = engine.conversations().conversation(&id).await.expect("loaded");
    assert_eq!(
        mine.last_message.map(|m| m.content),
        Some("local edit".to_string())
    );
    let other = engine
        .conversations()
        .conversation(&ConversationRef::Remote(ConversationId(43)))
        .await
        .expect("inserted");
    assert_eq!(other.unread_count, 3);
}

#[tokio::test]
async fn persisted_message_takes_the_server_id() {
    let remote = chat_remote(|| {
        Ok(RpcResponse::Message {
            message: payload(100, 42, ME, "hi", MessageStatus::Sent),
        })
    });
    let engine = scripted_engine(ME, ScriptedTransport::down("rpc"), remote.clone()).await;
    let id = synced(&engine).await;
    let mut events = engine.subscribe_events();

    let sent = engine
        .conversations()
        .send_message(&id, "hi", MessageKind::Text, None)
        .await
        .expect("send");
    let message_id = next_event(&mut events, |event| match event {
        ClientEvent::MessageConfirmed { message_id, .. } => Some(message_id),
        _ => None,
    })
    .await;
    assert_eq!(message_id, MessageId(100));

    let messages = engine.conversations().messages(&id).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].client_key, sent.client_key);
    assert_eq!(messages[0].id, MessageRef::Remote(MessageId(100)));
    assert_eq!(messages[0].status, MessageStatus::Sent);
}

#[tokio::test(start_paused = true)]
async fn rejected_send_reports_error_without_reply() {
    let remote = chat_remote(|| Err(TransportError::Api(ApiError::forbidden("not a participant"))));
    let engine = ChatEngine::builder(test_config(), ME)
        .primary(ScriptedTransport::down("rpc"))
        .secondary(remote.clone())
        .presence(Arc::new(FixedPresence {
            receipts: None,
            reply: FixedPresence::standard().reply,
        }))
        .build()
        .await
        .expect("engine");
    let id = synced(&engine).await;
    let mut events = engine.subscribe_events();

    engine
        .conversations()
        .send_message(&id, "hi", MessageKind::Text, None)
        .await
        .expect("send");
    let message = next_event(&mut events, |event| match event {
        ClientEvent::Error(message) => Some(message),
        _ => None,
    })
    .await;
    assert!(message.contains("access"));

    tokio::time::sleep(Duration::from_secs(5)).await;
    let messages = engine.conversations().messages(&id).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].status, MessageStatus::Sending);
}

#[tokio::test]
async fn history_merges_without_duplicates() {
    let remote = chat_remote(|| Err(TransportError::unavailable("unused")));
    let engine = scripted_engine(ME, ScriptedTransport::down("rpc"), remote.clone()).await;
    let id = synced(&engine).await;
    let store = engine.conversations();

    let page = store.load_messages(&id, 50, 0).await;
    assert_eq!(page.len(), 2);
    store.load_messages(&id, 50, 0).await;
    let messages = store.messages(&id).await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].status, MessageStatus::Read);
    assert_eq!(remote.count("chat.getMessages"), 2);
}

#[tokio::test]
async fn recent_history_uses_the_configured_page_size() {
    let remote = chat_remote(|| Err(TransportError::unavailable("unused")));
    let engine = ChatEngine::builder(
        EngineConfig {
            message_page_size: 20,
            ..test_config()
        },
        ME,
    )
    .primary(ScriptedTransport::down("rpc"))
    .secondary(remote.clone())
    .presence(Arc::new(NoPresence))
    .build()
    .await
    .expect("engine");
    let id = synced(&engine).await;

    assert_eq!(engine.conversations().load_recent_messages(&id).await.len(), 2);
    let pages: Vec<_> = remote
        .requests()
        .into_iter()
        .filter_map(|request| match request {
            RpcRequest::GetMessages { limit, offset, .. } => Some((limit, offset)),
            _ => None,
        })
        .collect();
    assert_eq!(pages, vec![(20, 0)]);
}

#[tokio::test]
async fn mark_as_read_clears_unread_and_persists() {
    let remote = ScriptedTransport::new("direct", |request| match request {
        RpcRequest::GetChats => Ok(RpcResponse::Chats {
            chats: vec![summary(42, pair(), Some("unread"))],
        }),
        RpcRequest::MarkAsRead { .. } => Ok(RpcResponse::Ack { success: true }),
        other => Err(TransportError::unavailable(format!("unscripted {}", other.method()))),
    });
    let engine = scripted_engine(ME, ScriptedTransport::down("rpc"), remote.clone()).await;
    let listed = engine.conversations().list_conversations().await;
    assert_eq!(listed[0].unread_count, 3);

    let id = ConversationRef::Remote(ConversationId(42));
    engine.conversations().mark_as_read(&id).await.expect("read");
    assert_eq!(
        engine
            .conversations()
            .conversation(&id)
            .await
            .expect("loaded")
            .unread_count,
        0
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(remote.count("chat.markAsRead"), 1);
}
