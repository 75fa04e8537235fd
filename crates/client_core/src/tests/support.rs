//! Fakes and fixtures shared by the engine tests.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use server_api::AdminSuccession;
use shared::{
    domain::UserId,
    protocol::{RpcRequest, RpcResponse},
};
use storage::Storage;
use tokio::sync::broadcast;

use crate::{
    presence::{AutoReply, PresenceSimulator, ReceiptSchedule},
    transport::{DirectStoreTransport, Transport, TransportError, Transports},
    ChatEngine, ClientEvent, EngineConfig, NoPresence, Session, TransportGate,
};

type Handler = dyn Fn(&RpcRequest) -> Result<RpcResponse, TransportError> + Send + Sync;

/// Transport answering from a closure and recording every request.
pub(crate) struct ScriptedTransport {
    name: &'static str,
    healthy: AtomicBool,
    requests: Mutex<Vec<RpcRequest>>,
    handler: Box<Handler>,
}

impl ScriptedTransport {
    pub(crate) fn new(
        name: &'static str,
        handler: impl Fn(&RpcRequest) -> Result<RpcResponse, TransportError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            healthy: AtomicBool::new(true),
            requests: Mutex::new(Vec::new()),
            handler: Box::new(handler),
        })
    }

    /// Every call and health check fails as unreachable.
    pub(crate) fn down(name: &'static str) -> Arc<Self> {
        let transport = Self::new(name, |_| Err(TransportError::unavailable("connection refused")));
        transport.set_healthy(false);
        transport
    }

    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub(crate) fn requests(&self) -> Vec<RpcRequest> {
        self.requests.lock().expect("requests").clone()
    }

    pub(crate) fn methods(&self) -> Vec<&'static str> {
        self.requests().iter().map(RpcRequest::method).collect()
    }

    pub(crate) fn count(&self, method: &str) -> usize {
        self.methods().into_iter().filter(|m| *m == method).count()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn call(&self, _user_id: UserId, request: RpcRequest) -> Result<RpcResponse, TransportError> {
        self.requests.lock().expect("requests").push(request.clone());
        (self.handler)(&request)
    }

    async fn health(&self) -> Result<(), TransportError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::unavailable("health check refused"))
        }
    }
}

/// Receipts and replies with fixed timing.
pub(crate) struct FixedPresence {
    pub(crate) receipts: Option<ReceiptSchedule>,
    pub(crate) reply: Option<AutoReply>,
}

impl FixedPresence {
    pub(crate) fn standard() -> Self {
        Self {
            receipts: Some(ReceiptSchedule {
                delivered_after: Duration::from_millis(800),
                read_after: Duration::from_millis(2_000),
            }),
            reply: Some(AutoReply {
                delay: Duration::from_millis(1_500),
                content: "Hey! How's it going?".into(),
            }),
        }
    }
}

impl PresenceSimulator for FixedPresence {
    fn receipts(&self) -> Option<ReceiptSchedule> {
        self.receipts
    }

    fn auto_reply(&self, _message: &str) -> Option<AutoReply> {
        self.reply.clone()
    }
}

pub(crate) fn test_config() -> EngineConfig {
    EngineConfig {
        server_url: "http://127.0.0.1:9".into(),
        database_url: None,
        probe_timeout: Duration::from_millis(200),
        ..EngineConfig::default()
    }
}

/// Engine for `user_id` with both transports scripted and no presence.
pub(crate) async fn scripted_engine(
    user_id: UserId,
    primary: Arc<ScriptedTransport>,
    secondary: Arc<ScriptedTransport>,
) -> ChatEngine {
    ChatEngine::builder(test_config(), user_id)
        .primary(primary)
        .secondary(secondary)
        .presence(Arc::new(NoPresence))
        .build()
        .await
        .expect("engine")
}

/// Bare session for exercising a single component. The primary is down and
/// the gate closed, so every request lands on `secondary`.
pub(crate) fn scripted_session(user_id: UserId, secondary: Arc<ScriptedTransport>) -> Arc<Session> {
    let (events, _) = broadcast::channel(256);
    let config = test_config();
    let gate = Arc::new(TransportGate::new(config.probe_timeout, events.clone()));
    Arc::new(Session {
        user_id,
        remote: Transports::new(user_id, gate, ScriptedTransport::down("rpc"), secondary),
        config,
        events,
    })
}

/// Engine with no reachable transport at all.
pub(crate) async fn offline_engine(user_id: UserId, presence: Arc<dyn PresenceSimulator>) -> ChatEngine {
    ChatEngine::builder(test_config(), user_id)
        .primary(ScriptedTransport::down("rpc"))
        .secondary(ScriptedTransport::down("direct"))
        .presence(presence)
        .build()
        .await
        .expect("engine")
}

/// Seeded store with three users; engines talk to it through the direct
/// transport while the primary is down.
pub(crate) struct StoreFixture {
    pub(crate) storage: Storage,
    pub(crate) alice: UserId,
    pub(crate) bob: UserId,
    pub(crate) carol: UserId,
}

impl StoreFixture {
    pub(crate) async fn new() -> Self {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let alice = storage.create_user("alice", Some("Alice")).await.expect("alice");
        let bob = storage.create_user("bob", Some("Bob")).await.expect("bob");
        let carol = storage.create_user("carol", None).await.expect("carol");
        Self {
            storage,
            alice,
            bob,
            carol,
        }
    }

    pub(crate) fn direct(&self) -> Arc<DirectStoreTransport> {
        Arc::new(DirectStoreTransport::new(
            self.storage.clone(),
            AdminSuccession::Block,
        ))
    }

    pub(crate) async fn engine_for(&self, user_id: UserId) -> ChatEngine {
        self.engine_with(user_id, test_config()).await
    }

    pub(crate) async fn engine_with(&self, user_id: UserId, config: EngineConfig) -> ChatEngine {
        ChatEngine::builder(config, user_id)
            .primary(ScriptedTransport::down("rpc"))
            .secondary(self.direct())
            .presence(Arc::new(NoPresence))
            .build()
            .await
            .expect("engine")
    }
}

/// Next event matching `pick`, skipping everything else.
pub(crate) async fn next_event<T>(
    events: &mut broadcast::Receiver<ClientEvent>,
    mut pick: impl FnMut(ClientEvent) -> Option<T>,
) -> T {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(event) {
                        return found;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .expect("event did not arrive")
}
