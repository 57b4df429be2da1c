/// Chat client: owns the shared state and wires the components together
use crate::channel::{InboundEvent, Link, OutboundEvent, SocketSyncChannel};
use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::history::HistorySource;
use crate::messenger_types::{
    Applied, ChatMessage, ClientUpdate, ConversationFilter, ConversationSort, ConversationSummary,
    DeliveryState, MessageKey, MessageKind, MessagePayload, PageInfo,
};
use crate::pipeline::{OptimisticSendPipeline, SentMessage};
use crate::receipts::ReadReceiptTracker;
use crate::session::Session;
use crate::state::{ChatState, Notifier, SharedState};
use crate::typing::TypingIndicatorCoordinator;
use futures_util::StreamExt;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Result of a history page load
#[derive(Debug, Clone)]
pub struct HistoryLoad {
    /// The whole thread after the merge
    pub messages: Vec<ChatMessage>,
    pub page_info: PageInfo,
    /// The conversation lost focus while the page was in flight
    pub stale: bool,
}

/// Client facade
pub struct ChatClient<H> {
    config: Config,
    session: Session,
    channel: SocketSyncChannel,
    history: Arc<H>,
    state: SharedState,
    notifier: Notifier,
    typing: TypingIndicatorCoordinator,
    receipts: ReadReceiptTracker,
    pipeline: OptimisticSendPipeline,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<H: HistorySource> ChatClient<H> {
    /// Create a client; nothing touches the network until `start`
    pub fn new(config: Config, session: Session, channel: SocketSyncChannel, history: H) -> Self {
        let state: SharedState = Arc::new(RwLock::new(ChatState::new(config.reconcile_window)));
        let notifier = Notifier::new(config.event_capacity);
        let local_user_id = session.user_id.clone();

        let typing = TypingIndicatorCoordinator::new(
            channel.clone(),
            state.clone(),
            notifier.clone(),
            local_user_id.clone(),
            config.typing_quiet_period,
            config.typing_decay,
        );
        let receipts = ReadReceiptTracker::new(
            channel.clone(),
            state.clone(),
            notifier.clone(),
            local_user_id.clone(),
        );
        let pipeline = OptimisticSendPipeline::new(
            channel.clone(),
            state.clone(),
            notifier.clone(),
            typing.clone(),
            local_user_id,
            config.ack_timeout,
        );

        info!("Created chat client for {}", session.user_id);

        Self {
            config,
            session,
            channel,
            history: Arc::new(history),
            state,
            notifier,
            typing,
            receipts,
            pipeline,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Attach a transport link and start dispatching inbound events.
    /// Calling it again with a new link reconnects; the dispatcher is reused.
    pub fn start(&self, link: Link) -> Result<()> {
        {
            let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
            if tasks.is_empty() {
                tasks.push(self.spawn_dispatcher());
                tasks.push(self.spawn_connection_watch());
            }
        }
        self.channel.connect(link)
    }

    /// Stop background tasks and drop the link
    pub fn shutdown(&self) {
        for task in self.tasks.lock().unwrap_or_else(|p| p.into_inner()).drain(..) {
            task.abort();
        }
        self.channel.disconnect();
        info!("Chat client for {} stopped", self.session.user_id);
    }

    fn spawn_dispatcher(&self) -> JoinHandle<()> {
        let dispatcher = InboundDispatcher {
            state: self.state.clone(),
            notifier: self.notifier.clone(),
            typing: self.typing.clone(),
            receipts: self.receipts.clone(),
            local_user_id: self.session.user_id.clone(),
        };
        // Subscribe now so nothing sent right after connect is missed
        let events = self.channel.events();
        tokio::spawn(async move {
            let mut events = std::pin::pin!(events);
            while let Some(event) = events.next().await {
                dispatcher.handle_event(event).await;
            }
            debug!("Inbound dispatcher finished");
        })
    }

    fn spawn_connection_watch(&self) -> JoinHandle<()> {
        let mut rx = self.channel.connection_state();
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let connected = *rx.borrow_and_update();
                if connected {
                    info!("Realtime channel up");
                } else {
                    warn!("Realtime channel down");
                }
                notifier.notify(ClientUpdate::ConnectionChanged { connected });
            }
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn channel(&self) -> &SocketSyncChannel {
        &self.channel
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    /// Change notifications for the UI layer
    pub fn updates(&self) -> broadcast::Receiver<ClientUpdate> {
        self.notifier.subscribe()
    }

    /// Seed the conversation list from REST. Returns how many were fetched.
    pub async fn sync_conversations(&self) -> Result<usize> {
        let list = self.history.fetch_conversations(&self.session).await?;
        let count = list.len();
        self.state.write().await.conversations.upsert_from_history(list);
        info!("Synced {} conversations", count);
        self.notifier.notify(ClientUpdate::ConversationsChanged);
        Ok(count)
    }

    /// Focus a conversation: clears its unread badge, joins its room, marks
    /// it read on the server and loads the newest history page.
    pub async fn open_conversation(&self, conversation_id: &str) -> Result<HistoryLoad> {
        let previous = self
            .state
            .write()
            .await
            .conversations
            .set_focused(Some(conversation_id));

        if let Some(prev) = previous.filter(|p| p != conversation_id) {
            self.leave_focus(&prev).await;
        }
        if let Err(e) = self.channel.join_room(conversation_id) {
            warn!("Could not join {}: {}", conversation_id, e);
        }
        if let Err(e) = self.receipts.mark_conversation_read(conversation_id).await {
            debug!("mark-read for {} not sent: {}", conversation_id, e);
        }
        self.notifier.notify(ClientUpdate::ConversationsChanged);

        self.load_history(conversation_id, 1).await
    }

    /// Drop focus without opening another conversation
    pub async fn close_conversation(&self) {
        let previous = self.state.write().await.conversations.set_focused(None);
        if let Some(prev) = previous {
            self.leave_focus(&prev).await;
        }
    }

    async fn leave_focus(&self, conversation_id: &str) {
        self.typing.clear_remote(conversation_id).await;
        if let Err(e) = self.channel.leave_room(conversation_id) {
            debug!("Could not leave {}: {}", conversation_id, e);
        }
    }

    /// Fetch one history page and merge it. A page that lands after the user
    /// moved on is still merged but comes back flagged `stale`.
    pub async fn load_history(&self, conversation_id: &str, page: u32) -> Result<HistoryLoad> {
        let fetched = self
            .history
            .fetch_messages(&self.session, conversation_id, page, self.config.page_size)
            .await?;

        let mut state = self.state.write().await;
        state.threads.load_history(conversation_id, &fetched.messages);

        let page_info = match state.threads.page_info(conversation_id) {
            Some(known) if known.page > fetched.pagination.page => PageInfo {
                page: known.page,
                total_pages: fetched.pagination.total_pages,
            },
            _ => fetched.pagination,
        };
        state.threads.set_page_info(conversation_id, page_info);

        let stale = !state.conversations.is_focused(conversation_id);
        let messages = state.threads.messages(conversation_id).to_vec();
        drop(state);

        if stale {
            debug!(
                "History page {} for {} arrived after focus moved",
                page, conversation_id
            );
        } else {
            self.notifier.notify(ClientUpdate::ThreadUpdated {
                conversation_id: conversation_id.to_string(),
            });
        }
        Ok(HistoryLoad {
            messages,
            page_info,
            stale,
        })
    }

    /// Load the page after the last one seen. `None` when there is nothing older.
    pub async fn load_older(&self, conversation_id: &str) -> Result<Option<HistoryLoad>> {
        let next = match self.state.read().await.threads.page_info(conversation_id) {
            Some(info) if !info.has_more() => return Ok(None),
            Some(info) => info.page + 1,
            None => 1,
        };
        self.load_history(conversation_id, next).await.map(Some)
    }

    pub async fn has_older(&self, conversation_id: &str) -> bool {
        self.state
            .read()
            .await
            .threads
            .page_info(conversation_id)
            .is_some_and(|info| info.has_more())
    }

    /// Send a text message
    pub async fn send(&self, conversation_id: &str, content: &str) -> Result<SentMessage> {
        self.pipeline
            .submit(conversation_id, content, MessageKind::Text)
            .await
    }

    pub async fn send_kind(
        &self,
        conversation_id: &str,
        content: &str,
        kind: MessageKind,
    ) -> Result<SentMessage> {
        self.pipeline.submit(conversation_id, content, kind).await
    }

    /// Retry a failed send under a new key
    pub async fn retry(&self, conversation_id: &str, failed_key: &str) -> Result<SentMessage> {
        self.pipeline.resubmit(conversation_id, failed_key).await
    }

    /// Composer input changed
    pub fn input_changed(&self, conversation_id: &str) {
        self.typing.on_local_input_change(conversation_id);
    }

    /// Edit a confirmed message; applied locally once the server agrees
    pub async fn edit_message(&self, conversation_id: &str, message_id: &str, content: &str) -> Result<()> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SyncError::Validation("edited content is empty".to_string()));
        }
        let ack = self
            .channel
            .request(
                OutboundEvent::EditMessage {
                    conversation_id: conversation_id.to_string(),
                    message_id: message_id.to_string(),
                    content: content.to_string(),
                },
                self.config.ack_timeout,
            )
            .await?;
        if !ack.ok {
            return Err(SyncError::Protocol(format!(
                "edit of {} refused: {}",
                message_id,
                ack.error.unwrap_or_default()
            )));
        }

        let changed = self
            .state
            .write()
            .await
            .threads
            .edit_content(conversation_id, message_id, content);
        if changed {
            self.notifier.notify(ClientUpdate::ThreadUpdated {
                conversation_id: conversation_id.to_string(),
            });
        }
        Ok(())
    }

    /// Delete a message. Failed local entries never reached the server and
    /// are dropped locally; confirmed ones go through `delete-message`.
    pub async fn delete_message(&self, conversation_id: &str, key: MessageKey<'_>) -> Result<()> {
        let message_id = match key {
            MessageKey::Server(id) => id.to_string(),
            MessageKey::Local(local_key) => {
                let mut state = self.state.write().await;
                let entry = state.threads.by_local_key(conversation_id, local_key);
                match entry.map(|m| (m.state, m.id.clone())) {
                    Some((DeliveryState::Failed, _)) => {
                        state.threads.remove_message(conversation_id, key);
                        drop(state);
                        self.notifier.notify(ClientUpdate::ThreadUpdated {
                            conversation_id: conversation_id.to_string(),
                        });
                        return Ok(());
                    }
                    Some((DeliveryState::Sent, Some(id))) => id,
                    _ => {
                        return Err(SyncError::Validation(format!(
                            "{} cannot be deleted yet",
                            local_key
                        )))
                    }
                }
            }
        };

        let ack = self
            .channel
            .request(
                OutboundEvent::DeleteMessage {
                    conversation_id: conversation_id.to_string(),
                    message_id: message_id.clone(),
                },
                self.config.ack_timeout,
            )
            .await?;
        if !ack.ok {
            return Err(SyncError::Protocol(format!(
                "delete of {} refused: {}",
                message_id,
                ack.error.unwrap_or_default()
            )));
        }

        let removed = self
            .state
            .write()
            .await
            .threads
            .remove_message(conversation_id, MessageKey::Server(&message_id));
        if removed.is_some() {
            self.notifier.notify(ClientUpdate::ThreadUpdated {
                conversation_id: conversation_id.to_string(),
            });
        }
        Ok(())
    }

    /// Remove a conversation and its thread, and leave its room
    pub async fn leave_conversation(&self, conversation_id: &str) -> Result<()> {
        self.typing.clear_remote(conversation_id).await;
        {
            let mut state = self.state.write().await;
            state.conversations.remove(conversation_id);
            state.threads.remove_thread(conversation_id);
        }
        info!("Left conversation {}", conversation_id);
        self.notifier.notify(ClientUpdate::ConversationsChanged);
        self.channel.leave_room(conversation_id)
    }

    pub async fn set_favorite(&self, conversation_id: &str, favorite: bool) -> bool {
        let changed = self
            .state
            .write()
            .await
            .conversations
            .set_favorite(conversation_id, favorite);
        if changed {
            self.notifier.notify(ClientUpdate::ConversationsChanged);
        }
        changed
    }

    pub async fn conversations(
        &self,
        filter: ConversationFilter,
        sort: ConversationSort,
    ) -> Vec<ConversationSummary> {
        self.state.read().await.conversations.list(filter, sort)
    }

    pub async fn unread_count(&self, conversation_id: &str) -> u32 {
        self.state
            .read()
            .await
            .conversations
            .get(conversation_id)
            .map_or(0, |c| c.unread_count)
    }

    pub async fn total_unread(&self) -> u32 {
        self.state.read().await.conversations.total_unread()
    }

    /// Snapshot of a thread in display order
    pub async fn thread(&self, conversation_id: &str) -> Vec<ChatMessage> {
        self.state.read().await.threads.messages(conversation_id).to_vec()
    }

    pub async fn focused(&self) -> Option<String> {
        self.state
            .read()
            .await
            .conversations
            .focused()
            .map(str::to_string)
    }

    pub async fn is_peer_typing(&self, conversation_id: &str) -> bool {
        self.typing.is_peer_typing(conversation_id).await
    }
}

impl<H> Drop for ChatClient<H> {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap_or_else(|p| p.into_inner()).drain(..) {
            task.abort();
        }
    }
}

/// Applies inbound channel events to the shared state
#[derive(Clone)]
struct InboundDispatcher {
    state: SharedState,
    notifier: Notifier,
    typing: TypingIndicatorCoordinator,
    receipts: ReadReceiptTracker,
    local_user_id: String,
}

impl InboundDispatcher {
    async fn handle_event(&self, event: InboundEvent) {
        match event {
            InboundEvent::NewMessage { message } => self.apply_message(message, None).await,
            InboundEvent::MessageSent { temp_id, message } => {
                self.apply_message(message, Some(temp_id)).await
            }
            InboundEvent::UserTyping {
                user_id,
                conversation_id,
                is_typing,
            } => {
                let conversation_id = conversation_id.unwrap_or_else(|| user_id.clone());
                self.typing
                    .on_remote_typing_event(&conversation_id, &user_id, is_typing)
                    .await;
            }
            InboundEvent::MessagesRead {
                reader_id,
                conversation_id,
            } => {
                let conversation_id = conversation_id.unwrap_or_else(|| reader_id.clone());
                self.receipts
                    .on_peer_read_receipt(&conversation_id, &reader_id)
                    .await;
            }
            InboundEvent::MessageEdited { message } => {
                let conversation_id = message.conversation_for(&self.local_user_id);
                let mut state = self.state.write().await;
                let applied = state.threads.apply_edit(&conversation_id, &message);
                drop(state);
                if applied {
                    self.thread_updated(&conversation_id);
                }
            }
            InboundEvent::MessageDeleted {
                conversation_id,
                message_id,
            } => {
                let removed = self
                    .state
                    .write()
                    .await
                    .threads
                    .remove_message(&conversation_id, MessageKey::Server(&message_id));
                if removed.is_some() {
                    self.thread_updated(&conversation_id);
                }
            }
            InboundEvent::UserOnline { user_id } => self.presence(&user_id, true).await,
            InboundEvent::UserOffline { user_id } => self.presence(&user_id, false).await,
            InboundEvent::OnlineUsers { user_ids } => {
                self.state
                    .write()
                    .await
                    .conversations
                    .replace_presence(user_ids);
                self.notifier.notify(ClientUpdate::ConversationsChanged);
            }
        }
    }

    async fn apply_message(&self, message: MessagePayload, temp_id: Option<String>) {
        let conversation_id = message.conversation_for(&self.local_user_id);
        let authored_locally = message.sender_id == self.local_user_id;

        let mut state = self.state.write().await;
        let applied = match &temp_id {
            Some(key) => state.threads.reconcile(&conversation_id, key, &message),
            None => state.threads.append_if_absent(&conversation_id, &message),
        };
        if applied == Applied::Duplicate {
            debug!("Ignoring duplicate {} in {}", message.id, conversation_id);
            return;
        }

        let mut focused = state.conversations.is_focused(&conversation_id);
        if applied == Applied::Inserted {
            let entry = state
                .threads
                .find(&conversation_id, MessageKey::Server(&message.id))
                .cloned();
            if let Some(entry) = entry {
                let effect = state.conversations.on_inbound_message(
                    &conversation_id,
                    &entry,
                    authored_locally,
                    &message.hint(),
                );
                focused = effect.focused;
                if effect.created {
                    debug!("New conversation {} from inbound message", conversation_id);
                }
            }
        }
        drop(state);

        if applied == Applied::Inserted {
            self.notifier.notify(ClientUpdate::ConversationsChanged);
        }
        if !focused {
            return;
        }
        if applied == Applied::Inserted && !authored_locally {
            self.typing.clear_remote(&conversation_id).await;
            if let Err(e) = self.receipts.mark_conversation_read(&conversation_id).await {
                debug!("mark-read for {} not sent: {}", conversation_id, e);
            }
        }
        self.thread_updated(&conversation_id);
    }

    async fn presence(&self, user_id: &str, online: bool) {
        let changed = self
            .state
            .write()
            .await
            .conversations
            .set_presence(user_id, online);
        if changed {
            self.notifier.notify(ClientUpdate::ConversationsChanged);
        }
    }

    fn thread_updated(&self, conversation_id: &str) {
        self.notifier.notify(ClientUpdate::ThreadUpdated {
            conversation_id: conversation_id.to_string(),
        });
    }
}
