//! Client-side synchronization engine for one-to-one chats, group chats and
//! calls.
//!
//! A [`ChatEngine`] is bound to one signed-in user. Every store applies its
//! change locally first and then reconciles with the server through
//! [`transport::Transports`], which falls back from the RPC server to the
//! backing store and finally to local-only state.

use std::sync::Arc;

use anyhow::{Context, Result};
use media_session::{MediaSession, NoopMediaSession};
use reqwest::Client;
use shared::{
    domain::{
        CallSession, ConversationId, ConversationRef, GroupId, GroupMessageId, MessageId,
        MessageStatus, UserId,
    },
    protocol::{GroupMemberSummary, LoginRequest, LoginResponse},
};
use tokio::sync::broadcast;
use tracing::{info, warn};

pub mod calls;
pub mod config;
pub mod conversations;
mod dispatcher;
pub mod error;
pub mod gate;
pub mod groups;
pub mod presence;
pub mod transport;
pub mod types;
mod typing;

pub use calls::CallManager;
pub use config::EngineConfig;
pub use conversations::ConversationStore;
pub use error::EngineError;
pub use gate::TransportGate;
pub use groups::GroupStore;
pub use presence::{NoPresence, PresenceSimulator, SimulatedPresence};
pub use types::{Conversation, GroupMessage, Message};
pub use typing::TypingTarget;

use transport::{DirectStoreTransport, MissingTransport, RpcTransport, Transport, Transports};
use typing::TypingCoordinator;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    GateChanged {
        available: bool,
    },
    ConversationsUpdated,
    ConversationUpdated {
        conversation_id: ConversationRef,
    },
    ConversationRemapped {
        provisional: String,
        conversation_id: ConversationId,
    },
    MessageAppended(Message),
    MessageConfirmed {
        conversation_id: ConversationRef,
        client_key: String,
        message_id: MessageId,
    },
    MessageStatusChanged {
        conversation_id: ConversationRef,
        client_key: String,
        status: MessageStatus,
    },
    PeerTyping {
        conversation_id: ConversationRef,
        is_typing: bool,
    },
    TypingChanged {
        target: TypingTarget,
        is_typing: bool,
    },
    GroupsUpdated,
    GroupMessageAppended(GroupMessage),
    GroupMessageConfirmed {
        group_id: GroupId,
        client_key: String,
        message_id: GroupMessageId,
    },
    GroupMessageFailed {
        group_id: GroupId,
        client_key: String,
        reason: String,
    },
    GroupMembersUpdated {
        group_id: GroupId,
        members: Vec<GroupMemberSummary>,
    },
    CallUpdated(CallSession),
    IncomingCall(CallSession),
    Error(String),
}

/// Shared by every store of one engine.
pub(crate) struct Session {
    pub(crate) user_id: UserId,
    pub(crate) remote: Transports,
    pub(crate) config: EngineConfig,
    events: broadcast::Sender<ClientEvent>,
}

impl Session {
    pub(crate) fn emit(&self, event: ClientEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Signs in by username and returns the user id. Creates the account on
/// first use.
pub async fn login(server_url: &str, username: &str, display_name: Option<&str>) -> Result<UserId> {
    let response = Client::new()
        .post(format!("{}/login", server_url.trim_end_matches('/')))
        .json(&LoginRequest {
            username: username.to_string(),
            display_name: display_name.map(str::to_string),
        })
        .send()
        .await
        .context("login request failed")?
        .error_for_status()
        .context("login rejected")?
        .json::<LoginResponse>()
        .await
        .context("invalid login response")?;
    Ok(response.user_id)
}

pub struct ChatEngine {
    session: Arc<Session>,
    conversations: ConversationStore,
    groups: GroupStore,
    calls: CallManager,
    typing: TypingCoordinator,
}

pub struct ChatEngineBuilder {
    config: EngineConfig,
    user_id: UserId,
    primary: Option<Arc<dyn Transport>>,
    secondary: Option<Arc<dyn Transport>>,
    presence: Option<Arc<dyn PresenceSimulator>>,
    media: Option<Arc<dyn MediaSession>>,
}

impl ChatEngineBuilder {
    pub fn primary(mut self, transport: Arc<dyn Transport>) -> Self {
        self.primary = Some(transport);
        self
    }

    pub fn secondary(mut self, transport: Arc<dyn Transport>) -> Self {
        self.secondary = Some(transport);
        self
    }

    pub fn presence(mut self, presence: Arc<dyn PresenceSimulator>) -> Self {
        self.presence = Some(presence);
        self
    }

    pub fn media(mut self, media: Arc<dyn MediaSession>) -> Self {
        self.media = Some(media);
        self
    }

    /// Missing transports default to the RPC server from the config and the
    /// direct store at `database_url`. A direct store that cannot be opened
    /// is replaced by a transport that always reports unavailable.
    pub async fn build(self) -> Result<ChatEngine> {
        let config = self.config;
        let (events, _) = broadcast::channel(1024);
        let gate = Arc::new(TransportGate::new(config.probe_timeout, events.clone()));

        let primary: Arc<dyn Transport> = match self.primary {
            Some(transport) => transport,
            None => Arc::new(
                RpcTransport::new(config.server_url.clone(), config.request_timeout)
                    .context("failed to build rpc transport")?,
            ),
        };
        let secondary: Arc<dyn Transport> = match self.secondary {
            Some(transport) => transport,
            None => match config.database_url.as_deref() {
                Some(url) => match DirectStoreTransport::open(url, config.admin_succession).await {
                    Ok(transport) => Arc::new(transport),
                    Err(err) => {
                        warn!("engine: direct store unavailable, running without it: {err:#}");
                        Arc::new(MissingTransport::new(format!("direct store not opened: {err}")))
                    }
                },
                None => Arc::new(MissingTransport::new("direct store disabled")),
            },
        };

        let session = Arc::new(Session {
            user_id: self.user_id,
            remote: Transports::new(self.user_id, gate, primary, secondary),
            config,
            events,
        });
        let typing = TypingCoordinator::new(session.clone());
        let presence = self
            .presence
            .unwrap_or_else(|| Arc::new(SimulatedPresence::new()));
        let media = self.media.unwrap_or_else(|| Arc::new(NoopMediaSession));

        Ok(ChatEngine {
            conversations: ConversationStore::new(session.clone(), typing.clone(), presence),
            groups: GroupStore::new(session.clone(), typing.clone()),
            calls: CallManager::new(session.clone(), media),
            typing,
            session,
        })
    }
}

impl ChatEngine {
    pub fn builder(config: EngineConfig, user_id: UserId) -> ChatEngineBuilder {
        ChatEngineBuilder {
            config,
            user_id,
            primary: None,
            secondary: None,
            presence: None,
            media: None,
        }
    }

    /// Probes the primary transport and starts call polling. Returns whether
    /// the primary is reachable; the engine works either way.
    pub async fn connect(&self) -> bool {
        let available = self.probe().await;
        self.calls.spawn_poller();
        info!(
            user_id = self.session.user_id.0,
            primary_available = available,
            "engine: connected"
        );
        available
    }

    /// Re-checks the primary transport.
    pub async fn probe(&self) -> bool {
        let remote = &self.session.remote;
        remote.gate().probe(remote.primary().as_ref()).await
    }

    /// Stops polling and every timer owned by the engine.
    pub async fn shutdown(&self) {
        self.calls.stop_polling();
        self.conversations.teardown_all().await;
        self.typing.teardown_all().await;
        info!(user_id = self.session.user_id.0, "engine: shut down");
    }

    pub fn user_id(&self) -> UserId {
        self.session.user_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.session.config
    }

    pub fn gate(&self) -> &Arc<TransportGate> {
        self.session.remote.gate()
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    pub fn groups(&self) -> &GroupStore {
        &self.groups
    }

    pub fn calls(&self) -> &CallManager {
        &self.calls
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.session.events.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
