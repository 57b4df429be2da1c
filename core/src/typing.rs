/// Typing indicators: debounced local start/stop, self-healing remote flag
use crate::channel::{OutboundEvent, SocketSyncChannel};
use crate::messenger_types::ClientUpdate;
use crate::state::{Notifier, SharedState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

struct TypingInner {
    channel: SocketSyncChannel,
    state: SharedState,
    notifier: Notifier,
    local_user_id: String,
    quiet_period: Duration,
    decay: Duration,
    generation: AtomicU64,
    /// conversation -> quiet-period timer while we are "typing"
    local: Mutex<HashMap<String, Timer>>,
    /// conversation -> decay timer while the peer is "typing"
    remote: Mutex<HashMap<String, Timer>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TypingInner {
    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed)
    }

    fn emit(&self, event: OutboundEvent) {
        let name = event.name();
        if let Err(e) = self.channel.emit(event) {
            debug!("{} not sent: {}", name, e);
        }
    }

    fn finish_local(&self, conversation_id: &str, generation: u64) {
        let mut local = lock(&self.local);
        if local.get(conversation_id).map(|t| t.generation) != Some(generation) {
            return;
        }
        local.remove(conversation_id);
        self.emit(OutboundEvent::TypingStop {
            conversation_id: conversation_id.to_string(),
        });
    }

    async fn expire_remote(&self, conversation_id: &str, generation: u64) {
        let mut state = self.state.write().await;
        {
            let mut remote = lock(&self.remote);
            if remote.get(conversation_id).map(|t| t.generation) != Some(generation) {
                return;
            }
            remote.remove(conversation_id);
        }
        if state.threads.set_typing(conversation_id, false) {
            drop(state);
            debug!("Typing flag for {} decayed", conversation_id);
            self.notifier.notify(ClientUpdate::TypingChanged {
                conversation_id: conversation_id.to_string(),
                typing: false,
            });
        }
    }
}

#[derive(Clone)]
pub struct TypingIndicatorCoordinator {
    inner: Arc<TypingInner>,
}

impl TypingIndicatorCoordinator {
    pub fn new(
        channel: SocketSyncChannel,
        state: SharedState,
        notifier: Notifier,
        local_user_id: String,
        quiet_period: Duration,
        decay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(TypingInner {
                channel,
                state,
                notifier,
                local_user_id,
                quiet_period,
                decay,
                generation: AtomicU64::new(0),
                local: Mutex::new(HashMap::new()),
                remote: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Keystroke in the composer. `typing-start` goes out once per burst;
    /// `typing-stop` follows after the quiet period without input.
    pub fn on_local_input_change(&self, conversation_id: &str) {
        let generation = self.inner.next_generation();
        let mut local = lock(&self.inner.local);

        match local.remove(conversation_id) {
            Some(previous) => previous.handle.abort(),
            None => self.inner.emit(OutboundEvent::TypingStart {
                conversation_id: conversation_id.to_string(),
            }),
        }

        let inner = self.inner.clone();
        let id = conversation_id.to_string();
        let handle = tokio::spawn(async move {
            sleep(inner.quiet_period).await;
            inner.finish_local(&id, generation);
        });
        local.insert(
            conversation_id.to_string(),
            Timer { generation, handle },
        );
    }

    /// Message submitted: stop immediately. Returns true if a stop was emitted.
    pub fn on_local_send(&self, conversation_id: &str) -> bool {
        let Some(timer) = lock(&self.inner.local).remove(conversation_id) else {
            return false;
        };
        timer.handle.abort();
        self.inner.emit(OutboundEvent::TypingStop {
            conversation_id: conversation_id.to_string(),
        });
        true
    }

    pub fn is_local_typing(&self, conversation_id: &str) -> bool {
        lock(&self.inner.local).contains_key(conversation_id)
    }

    /// Peer typing signal. Only the focused conversation shows the flag; a
    /// lost `false` is covered by the decay timer.
    pub async fn on_remote_typing_event(&self, conversation_id: &str, user_id: &str, is_typing: bool) {
        if user_id == self.inner.local_user_id {
            return;
        }
        if !is_typing {
            self.clear_remote(conversation_id).await;
            return;
        }

        let mut state = self.inner.state.write().await;
        if !state.conversations.is_focused(conversation_id) {
            return;
        }
        let changed = state.threads.set_typing(conversation_id, true);

        let generation = self.inner.next_generation();
        let inner = self.inner.clone();
        let id = conversation_id.to_string();
        let handle = tokio::spawn(async move {
            sleep(inner.decay).await;
            inner.expire_remote(&id, generation).await;
        });
        if let Some(previous) = lock(&self.inner.remote).insert(
            conversation_id.to_string(),
            Timer { generation, handle },
        ) {
            previous.handle.abort();
        }
        drop(state);

        if changed {
            self.inner.notifier.notify(ClientUpdate::TypingChanged {
                conversation_id: conversation_id.to_string(),
                typing: true,
            });
        }
    }

    /// Drop the peer flag now (explicit stop, peer message arrived, focus moved)
    pub async fn clear_remote(&self, conversation_id: &str) {
        let mut state = self.inner.state.write().await;
        if let Some(timer) = lock(&self.inner.remote).remove(conversation_id) {
            timer.handle.abort();
        }
        let changed = state.threads.set_typing(conversation_id, false);
        drop(state);

        if changed {
            self.inner.notifier.notify(ClientUpdate::TypingChanged {
                conversation_id: conversation_id.to_string(),
                typing: false,
            });
        }
    }

    pub async fn is_peer_typing(&self, conversation_id: &str) -> bool {
        self.inner.state.read().await.threads.is_typing(conversation_id)
    }
}
