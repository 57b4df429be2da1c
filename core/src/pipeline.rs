/// Optimistic sends: `Composing -> Pending -> {Sent | Failed}`
///
/// The pending entry, the preview update, the typing stop and the
/// `send-message` emission all happen under one state write lock, so frames
/// leave in submission order. The ack wait runs in its own task; dropping the
/// caller's future does not strand an entry in `Pending`.
use crate::channel::{Ack, OutboundEvent, PendingRequest, SendAck, SocketSyncChannel};
use crate::error::{Result, SyncError};
use crate::messenger_types::{
    Applied, ClientUpdate, DeliveryState, Draft, MessageKey, MessageKind, MessagePayload,
};
use crate::state::{Notifier, SharedState};
use crate::typing::TypingIndicatorCoordinator;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Outcome of a successful send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub conversation_id: String,
    pub local_key: String,
    pub message_id: String,
}

#[derive(Clone)]
pub struct OptimisticSendPipeline {
    channel: SocketSyncChannel,
    state: SharedState,
    notifier: Notifier,
    typing: TypingIndicatorCoordinator,
    local_user_id: String,
    ack_timeout: Duration,
}

impl OptimisticSendPipeline {
    pub fn new(
        channel: SocketSyncChannel,
        state: SharedState,
        notifier: Notifier,
        typing: TypingIndicatorCoordinator,
        local_user_id: String,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            state,
            notifier,
            typing,
            local_user_id,
            ack_timeout,
        }
    }

    /// Send a message. Resolves once the entry is `Sent` or `Failed`.
    pub async fn submit(
        &self,
        conversation_id: &str,
        content: &str,
        kind: MessageKind,
    ) -> Result<SentMessage> {
        let (local_key, settling) = self.start(conversation_id, content, kind, None).await?;
        join_settled(local_key, settling).await
    }

    /// Send the content of a failed entry again under a fresh key. The failed
    /// entry is replaced, not revived.
    pub async fn resubmit(&self, conversation_id: &str, failed_key: &str) -> Result<SentMessage> {
        let (content, kind) = {
            let state = self.state.read().await;
            match state.threads.by_local_key(conversation_id, failed_key) {
                Some(m) if m.state == DeliveryState::Failed => (m.content.clone(), m.kind),
                _ => {
                    return Err(SyncError::Validation(format!(
                        "no failed message {} in {}",
                        failed_key, conversation_id
                    )))
                }
            }
        };
        let (local_key, settling) = self
            .start(conversation_id, &content, kind, Some(failed_key))
            .await?;
        join_settled(local_key, settling).await
    }

    async fn start(
        &self,
        conversation_id: &str,
        content: &str,
        kind: MessageKind,
        replaces: Option<&str>,
    ) -> Result<(String, JoinHandle<Result<SentMessage>>)> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SyncError::Validation("message content is empty".to_string()));
        }
        if !self.channel.is_connected() {
            return Err(SyncError::Disconnected(
                "cannot send while the channel is down".to_string(),
            ));
        }

        let mut state = self.state.write().await;
        if let Some(old) = replaces {
            state
                .threads
                .remove_message(conversation_id, MessageKey::Local(old));
        }
        let local_key = state.threads.append_pending(
            conversation_id,
            Draft {
                sender_id: self.local_user_id.clone(),
                content: content.to_string(),
                kind,
            },
        );
        let created_at = state
            .threads
            .by_local_key(conversation_id, &local_key)
            .map(|m| m.created_at)
            .unwrap_or_else(chrono::Utc::now);
        state
            .conversations
            .on_local_send(conversation_id, content, created_at);
        self.typing.on_local_send(conversation_id);

        let sent = self.channel.send_request(OutboundEvent::SendMessage {
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
            kind,
            temp_id: local_key.clone(),
        });
        let pending = match sent {
            Ok(pending) => pending,
            Err(e) => {
                // Link went away between the check and the emit
                state.threads.mark_failed(conversation_id, &local_key);
                drop(state);
                warn!("send-message for {} not emitted: {}", local_key, e);
                self.notify_failed(conversation_id, &local_key, &e.to_string());
                return Err(SyncError::Interrupted { local_key });
            }
        };
        // No await between the emit and this spawn
        let worker = self.clone();
        let id = conversation_id.to_string();
        let key = local_key.clone();
        let settling = tokio::spawn(async move { worker.settle(&id, &key, pending).await });
        drop(state);

        debug!("Pending {} in {}", local_key, conversation_id);
        self.notifier.notify(ClientUpdate::ThreadUpdated {
            conversation_id: conversation_id.to_string(),
        });
        self.notifier.notify(ClientUpdate::ConversationsChanged);
        Ok((local_key, settling))
    }

    async fn settle(
        &self,
        conversation_id: &str,
        local_key: &str,
        pending: PendingRequest,
    ) -> Result<SentMessage> {
        let outcome = match pending.wait(self.ack_timeout).await {
            Ok(ack) => parse_send_ack(ack, local_key),
            Err(SyncError::Timeout(_)) => Err(SyncError::AckTimeout {
                local_key: local_key.to_string(),
            }),
            Err(SyncError::Disconnected(_)) => Err(SyncError::Interrupted {
                local_key: local_key.to_string(),
            }),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(message) => Ok(self.confirm(conversation_id, local_key, &message).await),
            Err(err) => self.fail(conversation_id, local_key, err).await,
        }
    }

    async fn confirm(
        &self,
        conversation_id: &str,
        local_key: &str,
        message: &MessagePayload,
    ) -> SentMessage {
        let mut state = self.state.write().await;
        let applied = state.threads.reconcile(conversation_id, local_key, message);
        if applied == Applied::Inserted {
            // Late ack for an entry that already failed; the confirmed copy stands alone
            let confirmed = state
                .threads
                .find(conversation_id, MessageKey::Server(&message.id))
                .cloned();
            if let Some(confirmed) = confirmed {
                state.conversations.on_inbound_message(
                    conversation_id,
                    &confirmed,
                    true,
                    &message.hint(),
                );
            }
        }
        drop(state);

        debug!("{} confirmed as {} ({:?})", local_key, message.id, applied);
        if applied != Applied::Duplicate {
            self.notifier.notify(ClientUpdate::ThreadUpdated {
                conversation_id: conversation_id.to_string(),
            });
        }
        SentMessage {
            conversation_id: conversation_id.to_string(),
            local_key: local_key.to_string(),
            message_id: message.id.clone(),
        }
    }

    async fn fail(&self, conversation_id: &str, local_key: &str, err: SyncError) -> Result<SentMessage> {
        let mut state = self.state.write().await;
        if state.threads.mark_failed(conversation_id, local_key) {
            drop(state);
            warn!("Send {} in {} failed: {}", local_key, conversation_id, err);
            self.notify_failed(conversation_id, local_key, &err.to_string());
            return Err(err);
        }

        // The echo may have confirmed the entry while we waited
        let confirmed = state
            .threads
            .by_local_key(conversation_id, local_key)
            .and_then(|m| m.id.clone());
        match confirmed {
            Some(message_id) => {
                debug!("{} already confirmed by echo; ignoring {}", local_key, err);
                Ok(SentMessage {
                    conversation_id: conversation_id.to_string(),
                    local_key: local_key.to_string(),
                    message_id,
                })
            }
            None => Err(err),
        }
    }

    fn notify_failed(&self, conversation_id: &str, local_key: &str, reason: &str) {
        self.notifier.notify(ClientUpdate::SendFailed {
            conversation_id: conversation_id.to_string(),
            local_key: local_key.to_string(),
            reason: reason.to_string(),
        });
    }
}

async fn join_settled(
    local_key: String,
    settling: JoinHandle<Result<SentMessage>>,
) -> Result<SentMessage> {
    match settling.await {
        Ok(result) => result,
        Err(e) => {
            warn!("Ack task for {} ended abnormally: {}", local_key, e);
            Err(SyncError::Interrupted { local_key })
        }
    }
}

/// The fixed ack contract: `ok` with `{tempId, message}` in `data`
fn parse_send_ack(ack: Ack, local_key: &str) -> Result<MessagePayload> {
    let rejected = |reason: String| SyncError::Rejected {
        local_key: local_key.to_string(),
        reason,
    };
    if !ack.ok {
        return Err(rejected(
            ack.error.unwrap_or_else(|| "rejected without reason".to_string()),
        ));
    }
    let data = ack
        .data
        .ok_or_else(|| rejected("ack carried no message".to_string()))?;
    let send_ack: SendAck =
        serde_json::from_value(data).map_err(|e| rejected(format!("malformed ack: {}", e)))?;
    if send_ack.temp_id != local_key {
        warn!(
            "Ack for {} echoed temp id {}; trusting the sequence number",
            local_key, send_ack.temp_id
        );
    }
    Ok(send_ack.message)
}
