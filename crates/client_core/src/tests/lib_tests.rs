use super::*;
use crate::{
    test_support::{next_event, offline_engine, scripted_engine, test_config, ScriptedTransport},
    transport::TransportError,
};
use shared::{
    domain::{GroupId, MessageKind},
    error::ApiError,
    protocol::{RpcRequest, RpcResponse},
};
use storage::Storage;
use tokio::net::TcpListener;

fn members_response(request: &RpcRequest) -> Result<RpcResponse, TransportError> {
    match request {
        RpcRequest::GetGroupMembers { .. } => Ok(RpcResponse::Members {
            members: Vec::new(),
        }),
        other => Err(TransportError::unavailable(format!(
            "unscripted {}",
            other.method()
        ))),
    }
}

#[tokio::test]
async fn api_error_from_primary_is_not_retried() {
    let primary = ScriptedTransport::new("rpc", |_| {
        Err(TransportError::Api(ApiError::forbidden("not a member")))
    });
    let secondary = ScriptedTransport::new("direct", members_response);
    let engine = scripted_engine(UserId(1), primary.clone(), secondary.clone()).await;
    assert!(engine.probe().await);

    let err = engine
        .groups()
        .load_members(GroupId(4))
        .await
        .expect_err("forbidden");
    assert!(matches!(err, EngineError::AccessDenied(_)));
    assert_eq!(primary.count("group.getMembers"), 1);
    assert!(secondary.requests().is_empty());
}

#[tokio::test]
async fn unavailable_primary_falls_back_to_secondary() {
    let primary = ScriptedTransport::new("rpc", |_| Err(TransportError::unavailable("timed out")));
    let secondary = ScriptedTransport::new("direct", members_response);
    let engine = scripted_engine(UserId(1), primary.clone(), secondary.clone()).await;
    assert!(engine.probe().await);

    let members = engine.groups().load_members(GroupId(4)).await.expect("members");
    assert!(members.is_empty());
    assert_eq!(primary.count("group.getMembers"), 1);
    assert_eq!(secondary.count("group.getMembers"), 1);
}

#[tokio::test]
async fn response_of_wrong_variant_counts_as_unavailable() {
    let primary = ScriptedTransport::new("rpc", |_| Ok(RpcResponse::Ack { success: true }));
    let secondary = ScriptedTransport::new("direct", members_response);
    let engine = scripted_engine(UserId(1), primary.clone(), secondary.clone()).await;
    assert!(engine.probe().await);

    engine.groups().load_members(GroupId(4)).await.expect("members");
    assert_eq!(secondary.count("group.getMembers"), 1);
}

#[tokio::test]
async fn closed_gate_skips_primary() {
    let primary = ScriptedTransport::new("rpc", members_response);
    let secondary = ScriptedTransport::new("direct", members_response);
    let engine = scripted_engine(UserId(1), primary.clone(), secondary.clone()).await;

    assert!(!engine.gate().is_available());
    engine.groups().load_members(GroupId(4)).await.expect("members");
    assert!(primary.requests().is_empty());
    assert_eq!(secondary.count("group.getMembers"), 1);
}

#[tokio::test]
async fn total_failure_surfaces_transport_error() {
    let engine = offline_engine(UserId(1), Arc::new(NoPresence)).await;
    let err = engine
        .groups()
        .load_members(GroupId(4))
        .await
        .expect_err("offline");
    assert!(matches!(err, EngineError::Transport(_)));
    assert!(!err.user_message().contains("connection refused"));
}

#[tokio::test]
async fn gate_probe_reports_changes_once() {
    let primary = ScriptedTransport::new("rpc", members_response);
    let secondary = ScriptedTransport::down("direct");
    let engine = scripted_engine(UserId(1), primary.clone(), secondary).await;
    let mut events = engine.subscribe_events();

    assert!(engine.probe().await);
    let available = next_event(&mut events, |event| match event {
        ClientEvent::GateChanged { available } => Some(available),
        _ => None,
    })
    .await;
    assert!(available);

    // A second successful probe is not a change.
    assert!(engine.probe().await);
    primary.set_healthy(false);
    assert!(!engine.probe().await);
    let available = next_event(&mut events, |event| match event {
        ClientEvent::GateChanged { available } => Some(available),
        _ => None,
    })
    .await;
    assert!(!available);
    assert!(!engine.gate().is_available());
}

#[tokio::test]
async fn connect_works_without_any_server() {
    let engine = offline_engine(UserId(1), Arc::new(NoPresence)).await;
    assert!(!engine.connect().await);
    assert!(engine.calls().is_polling());

    engine.shutdown().await;
    assert!(!engine.calls().is_polling());
}

#[tokio::test]
async fn unreachable_direct_store_is_replaced_not_fatal() {
    let mut config = test_config();
    config.database_url = Some("sqlite:///nonexistent-root-dir/\0/peerchat.db".into());
    let engine = ChatEngine::builder(config, UserId(1))
        .primary(ScriptedTransport::down("rpc"))
        .presence(Arc::new(NoPresence))
        .build()
        .await
        .expect("engine");

    let groups = engine.groups().list_groups().await;
    assert!(groups.is_empty());
}

#[test]
fn config_env_overrides_defaults() {
    let mut config = EngineConfig::default();
    config.apply_env(|key| match key {
        "PEERCHAT_SERVER_URL" => Some("http://chat.local:9000/".into()),
        "PEERCHAT_DATABASE_URL" => Some("  ".into()),
        "PEERCHAT_CALL_POLL_MS" => Some("500".into()),
        _ => None,
    });
    assert_eq!(config.server_url, "http://chat.local:9000");
    assert_eq!(config.database_url, None);
    assert_eq!(config.call_poll_interval, std::time::Duration::from_millis(500));

    config.apply_env(|key| (key == "PEERCHAT_CALL_POLL_MS").then(|| "zero".to_string()));
    assert_eq!(config.call_poll_interval, std::time::Duration::from_millis(500));
}

#[test]
fn api_errors_map_to_engine_errors() {
    assert!(matches!(
        EngineError::from(ApiError::validation("blank")),
        EngineError::Validation(_)
    ));
    assert!(matches!(
        EngineError::from(ApiError::forbidden("nope")),
        EngineError::AccessDenied(_)
    ));
    assert!(matches!(
        EngineError::from(ApiError::not_found("gone")),
        EngineError::NotFound(_)
    ));
    let illegal = EngineError::IllegalTransition {
        from: shared::domain::CallStatus::Ended,
        to: shared::domain::CallStatus::Answered,
    };
    assert_eq!(illegal.to_string(), "illegal call transition ended -> answered");
}

async fn spawn_server() -> (String, Storage) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let state = Arc::new(server::AppState::new(server_api::ApiContext::new(
        storage.clone(),
    )));
    let app = server::build_router(state, &server::config::Settings::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (format!("http://{addr}"), storage)
}

async fn rpc_engine(server_url: &str, user_id: UserId) -> ChatEngine {
    let config = EngineConfig {
        server_url: server_url.to_string(),
        ..test_config()
    };
    ChatEngine::builder(config, user_id)
        .presence(Arc::new(NoPresence))
        .build()
        .await
        .expect("engine")
}

#[tokio::test]
async fn conversation_round_trip_over_rpc() {
    let (server_url, _storage) = spawn_server().await;
    let alice = login(&server_url, "alice", Some("Alice")).await.expect("alice");
    let bob = login(&server_url, "bob", None).await.expect("bob");
    assert_eq!(login(&server_url, "alice", None).await.expect("again"), alice);

    let engine = rpc_engine(&server_url, alice).await;
    assert!(engine.connect().await);
    let mut events = engine.subscribe_events();

    let provisional = engine
        .conversations()
        .create_or_get_conversation(bob)
        .await
        .expect("conversation");
    assert!(provisional.is_provisional());
    let chat_id = next_event(&mut events, |event| match event {
        ClientEvent::ConversationRemapped {
            conversation_id, ..
        } => Some(conversation_id),
        _ => None,
    })
    .await;
    assert_eq!(
        engine.conversations().resolve(&provisional).await,
        ConversationRef::Remote(chat_id)
    );

    let sent = engine
        .conversations()
        .send_message(&provisional, "hello bob", MessageKind::Text, None)
        .await
        .expect("send");
    let confirmed = next_event(&mut events, |event| match event {
        ClientEvent::MessageConfirmed {
            client_key,
            message_id,
            ..
        } if client_key == sent.client_key => Some(message_id),
        _ => None,
    })
    .await;

    let bob_engine = rpc_engine(&server_url, bob).await;
    assert!(bob_engine.connect().await);
    let listed = bob_engine.conversations().list_conversations().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].unread_count, 1);
    assert_eq!(listed[0].other_participant_name(), "Alice");

    let history = bob_engine
        .conversations()
        .load_messages(&ConversationRef::Remote(chat_id), 50, 0)
        .await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].content, "hello bob");
    assert_eq!(history[0].id.remote_id(), Some(confirmed));

    engine.shutdown().await;
    bob_engine.shutdown().await;
}

#[tokio::test]
async fn rpc_api_errors_reach_the_caller() {
    let (server_url, _storage) = spawn_server().await;
    let alice = login(&server_url, "alice", None).await.expect("alice");
    let engine = rpc_engine(&server_url, alice).await;
    assert!(engine.connect().await);

    let err = engine
        .calls()
        .start_call(Some(UserId(9_999)), None, shared::domain::CallKind::Voice)
        .await
        .expect_err("unknown receiver");
    assert!(matches!(err, EngineError::NotFound(_)));
    engine.shutdown().await;
}
