/// Shared chat state: both stores behind one lock
use crate::conversation_store::ConversationStore;
use crate::messenger_types::ClientUpdate;
use crate::thread_store::MessageThreadStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};

/// Everything the UI renders from. Mutations take the write lock once, so a
/// reader never observes one store updated and the other not.
#[derive(Debug, Clone, Default)]
pub struct ChatState {
    pub conversations: ConversationStore,
    pub threads: MessageThreadStore,
}

impl ChatState {
    pub fn new(reconcile_window: Duration) -> Self {
        Self {
            conversations: ConversationStore::new(),
            threads: MessageThreadStore::new(reconcile_window),
        }
    }
}

pub type SharedState = Arc<RwLock<ChatState>>;

/// Best-effort fan-out of `ClientUpdate`s
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<ClientUpdate>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn notify(&self, update: ClientUpdate) {
        // Nobody listening is fine
        let _ = self.tx.send(update);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientUpdate> {
        self.tx.subscribe()
    }
}
