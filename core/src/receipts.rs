/// Read receipts in both directions
use crate::channel::{OutboundEvent, SocketSyncChannel};
use crate::error::Result;
use crate::messenger_types::{ClientUpdate, ReadScope};
use crate::state::{Notifier, SharedState};
use tracing::debug;

#[derive(Clone)]
pub struct ReadReceiptTracker {
    channel: SocketSyncChannel,
    state: SharedState,
    notifier: Notifier,
    local_user_id: String,
}

impl ReadReceiptTracker {
    pub fn new(
        channel: SocketSyncChannel,
        state: SharedState,
        notifier: Notifier,
        local_user_id: String,
    ) -> Self {
        Self {
            channel,
            state,
            notifier,
            local_user_id,
        }
    }

    /// Clear unread locally and tell the server. The local reset happens even
    /// when the emit fails; the error is returned for the caller to log.
    pub async fn mark_conversation_read(&self, conversation_id: &str) -> Result<()> {
        let cleared = self
            .state
            .write()
            .await
            .conversations
            .reset_unread(conversation_id);
        if cleared > 0 {
            debug!("Cleared {} unread in {}", cleared, conversation_id);
            self.notifier.notify(ClientUpdate::ConversationsChanged);
        }

        self.channel.emit(OutboundEvent::MarkRead {
            conversation_id: conversation_id.to_string(),
        })
    }

    /// `messages-read` from the server. Returns how many local messages flipped.
    /// Only sent messages are covered; group conversations carry no per-message
    /// read state, so receipts there are ignored.
    pub async fn on_peer_read_receipt(&self, conversation_id: &str, reader_id: &str) -> usize {
        let mut state = self.state.write().await;

        if reader_id == self.local_user_id {
            // Read on another device of ours
            let cleared = state.conversations.reset_unread(conversation_id);
            drop(state);
            if cleared > 0 {
                self.notifier.notify(ClientUpdate::ConversationsChanged);
            }
            return 0;
        }

        if state
            .conversations
            .get(conversation_id)
            .is_some_and(|c| c.is_group)
        {
            debug!("Ignoring receipt from {} in group {}", reader_id, conversation_id);
            return 0;
        }

        let flipped = state.threads.mark_read(
            conversation_id,
            &ReadScope::AuthoredBy(self.local_user_id.clone()),
        );
        drop(state);

        if flipped > 0 {
            debug!("{} read {} messages in {}", reader_id, flipped, conversation_id);
            self.notifier.notify(ClientUpdate::ThreadUpdated {
                conversation_id: conversation_id.to_string(),
            });
        }
        flipped
    }
}
