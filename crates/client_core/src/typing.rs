use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use shared::domain::{ConversationRef, GroupId, TypingScope, TypingStatus};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, warn};

use crate::{ClientEvent, Session};

/// Where a local typing flag applies. Provisional conversations have no
/// remote scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypingTarget {
    Conversation(ConversationRef),
    Group(GroupId),
}

impl TypingTarget {
    fn remote_scope(&self) -> Option<TypingScope> {
        match self {
            Self::Conversation(ConversationRef::Remote(id)) => {
                Some(TypingScope::Conversation(*id))
            }
            Self::Conversation(ConversationRef::Provisional(_)) => None,
            Self::Group(id) => Some(TypingScope::Group(*id)),
        }
    }
}

#[derive(Default)]
struct TypingEntry {
    is_typing: bool,
    propagated: bool,
    generation: u64,
    idle_timer: Option<JoinHandle<()>>,
}

/// Debounces the local user's typing signal and expires it after an idle
/// window.
#[derive(Clone)]
pub(crate) struct TypingCoordinator {
    inner: Arc<TypingInner>,
}

struct TypingInner {
    session: Arc<Session>,
    entries: Mutex<HashMap<TypingTarget, TypingEntry>>,
}

impl TypingCoordinator {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self {
            inner: Arc::new(TypingInner {
                session,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub(crate) async fn set_typing(&self, key: TypingTarget, is_typing: bool) {
        let mut entries = self.inner.entries.lock().await;
        let entry = entries.entry(key.clone()).or_default();
        entry.is_typing = is_typing;

        if is_typing {
            let first = entry.idle_timer.is_none();
            self.restart_idle_timer(&key, entry);
            if first && !entry.propagated {
                if let Some(scope) = key.remote_scope() {
                    entry.propagated = true;
                    self.propagate(scope, true);
                }
            }
        } else {
            if let Some(timer) = entry.idle_timer.take() {
                timer.abort();
            }
            entry.generation += 1;
            if entry.propagated {
                entry.propagated = false;
                if let Some(scope) = key.remote_scope() {
                    self.propagate(scope, false);
                }
            }
        }
        drop(entries);
        self.inner.session.emit(ClientEvent::TypingChanged {
            target: key,
            is_typing,
        });
    }

    pub(crate) async fn is_typing(&self, key: &TypingTarget) -> bool {
        self.inner
            .entries
            .lock()
            .await
            .get(key)
            .is_some_and(|entry| entry.is_typing)
    }

    /// Moves typing state from a provisional conversation to its remote id.
    pub(crate) async fn rekey(&self, from: &TypingTarget, to: TypingTarget) {
        let mut entries = self.inner.entries.lock().await;
        let Some(mut old) = entries.remove(from) else {
            return;
        };
        if let Some(timer) = old.idle_timer.take() {
            timer.abort();
        }
        if !old.is_typing {
            return;
        }

        let mut entry = TypingEntry {
            is_typing: true,
            ..TypingEntry::default()
        };
        self.restart_idle_timer(&to, &mut entry);
        if let Some(scope) = to.remote_scope() {
            entry.propagated = true;
            self.propagate(scope, true);
        }
        entries.insert(to, entry);
    }

    pub(crate) async fn teardown(&self, key: &TypingTarget) {
        if let Some(mut entry) = self.inner.entries.lock().await.remove(key) {
            if let Some(timer) = entry.idle_timer.take() {
                timer.abort();
            }
        }
    }

    pub(crate) async fn teardown_all(&self) {
        let mut entries = self.inner.entries.lock().await;
        for (_, mut entry) in entries.drain() {
            if let Some(timer) = entry.idle_timer.take() {
                timer.abort();
            }
        }
    }

    /// Other users currently typing in `key`, with stale records dropped.
    pub(crate) async fn remote_typing_users(&self, key: &TypingTarget) -> Vec<TypingStatus> {
        let Some(scope) = key.remote_scope() else {
            return Vec::new();
        };
        match self.inner.session.remote.get_typing(scope).await {
            Ok(records) => {
                let now = Utc::now();
                let me = self.inner.session.user_id;
                records
                    .into_iter()
                    .filter(|record| record.user_id != me && record.is_typing_at(now))
                    .collect()
            }
            Err(err) => {
                warn!(scope = ?scope, "typing: remote read failed: {err}");
                Vec::new()
            }
        }
    }

    fn restart_idle_timer(&self, key: &TypingTarget, entry: &mut TypingEntry) {
        if let Some(timer) = entry.idle_timer.take() {
            timer.abort();
        }
        entry.generation += 1;
        let generation = entry.generation;
        let idle = self.inner.session.config.typing_idle;
        let inner = Arc::downgrade(&self.inner);
        let key = key.clone();
        entry.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let coordinator = TypingCoordinator { inner };
            coordinator.expire(&key, generation).await;
        }));
    }

    async fn expire(&self, key: &TypingTarget, generation: u64) {
        let mut entries = self.inner.entries.lock().await;
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        if entry.generation != generation {
            return;
        }
        entry.is_typing = false;
        entry.idle_timer = None;
        if entry.propagated {
            entry.propagated = false;
            if let Some(scope) = key.remote_scope() {
                self.propagate(scope, false);
            }
        }
        drop(entries);
        debug!(key = ?key, "typing: idle window elapsed");
        self.inner.session.emit(ClientEvent::TypingChanged {
            target: key.clone(),
            is_typing: false,
        });
    }

    fn propagate(&self, scope: TypingScope, is_typing: bool) {
        let session = self.inner.session.clone();
        tokio::spawn(async move {
            if let Err(err) = session.remote.set_typing(scope, is_typing).await {
                debug!(scope = ?scope, is_typing, "typing: propagation failed: {err}");
            }
        });
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
