/// Per-conversation message logs with optimistic-send reconciliation
///
/// Matching order for a server message against a thread:
///   1. server id already present            -> duplicate, no-op
///   2. echoed `temp_id` names a pending key -> patch that entry in place
///   3. no `temp_id` echoed, same sender + content, `created_at` within the
///      reconcile window of a pending entry (oldest first)
///                                           -> patch that entry in place
///   4. otherwise                            -> insert by `created_at`
///
/// Step 3 only exists for servers that do not echo the correlation id; it can
/// pair the wrong entry when the same text is sent twice inside the window.
/// An echoed `temp_id` that names no pending entry (it already failed) never
/// falls through to step 3.
use crate::messenger_types::{
    Applied, ChatMessage, DeliveryState, Draft, MessageKey, MessagePayload, PageInfo, ReadScope,
};
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Ordered log of one conversation plus its ephemeral state
#[derive(Debug, Clone, Default)]
pub struct Thread {
    messages: Vec<ChatMessage>,
    /// Peer typing flag; the decay timer lives in the typing coordinator
    pub typing_from_peer: bool,
    /// Last page info seen from REST
    pub page_info: Option<PageInfo>,
}

impl Thread {
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    fn position_by_id(&self, id: &str) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.id.as_deref() == Some(id))
    }

    fn position_pending(&self, local_key: &str) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.is_pending() && m.local_key.as_deref() == Some(local_key))
    }

    fn position_by_key(&self, key: MessageKey<'_>) -> Option<usize> {
        self.messages.iter().position(|m| m.key() == key)
    }

    fn position_heuristic(&self, payload: &MessagePayload, window: chrono::Duration) -> Option<usize> {
        self.messages.iter().position(|m| {
            let delta = m.created_at - payload.created_at;
            m.is_pending()
                && m.sender_id == payload.sender_id
                && m.content == payload.content
                && delta <= window
                && -delta <= window
        })
    }

    fn insert_sorted(&mut self, msg: ChatMessage) {
        let pos = self
            .messages
            .partition_point(|m| m.created_at <= msg.created_at);
        self.messages.insert(pos, msg);
    }

    fn confirm_at(&mut self, pos: usize, payload: &MessagePayload) {
        let entry = &mut self.messages[pos];
        entry.id = Some(payload.id.clone());
        entry.created_at = payload.created_at;
        entry.content = payload.content.clone();
        entry.state = DeliveryState::Sent;
        entry.read = entry.read || payload.read;
        entry.edited = payload.edited;
    }
}

/// Registry of threads keyed by conversation id
#[derive(Debug, Clone)]
pub struct MessageThreadStore {
    threads: HashMap<String, Thread>,
    reconcile_window: chrono::Duration,
}

impl MessageThreadStore {
    pub fn new(reconcile_window: Duration) -> Self {
        Self {
            threads: HashMap::new(),
            reconcile_window: chrono::Duration::from_std(reconcile_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(10)),
        }
    }

    pub fn thread(&self, conversation_id: &str) -> Option<&Thread> {
        self.threads.get(conversation_id)
    }

    fn thread_mut(&mut self, conversation_id: &str) -> &mut Thread {
        self.threads
            .entry(conversation_id.to_string())
            .or_default()
    }

    /// Messages of a thread in display order (empty if never loaded)
    pub fn messages(&self, conversation_id: &str) -> &[ChatMessage] {
        self.threads
            .get(conversation_id)
            .map(|t| t.messages())
            .unwrap_or(&[])
    }

    pub fn find(&self, conversation_id: &str, key: MessageKey<'_>) -> Option<&ChatMessage> {
        let thread = self.threads.get(conversation_id)?;
        thread.position_by_key(key).map(|pos| &thread.messages[pos])
    }

    /// Entry created by `append_pending`, whatever its state now
    pub fn by_local_key(&self, conversation_id: &str, local_key: &str) -> Option<&ChatMessage> {
        self.threads
            .get(conversation_id)?
            .messages
            .iter()
            .find(|m| m.local_key.as_deref() == Some(local_key))
    }

    /// Merge a page of history. Existing ids are updated in place, new ones are
    /// inserted by timestamp; calling twice with the same page changes nothing.
    pub fn load_history(&mut self, conversation_id: &str, page: &[MessagePayload]) -> &[ChatMessage] {
        for payload in page {
            let known = self.thread_mut(conversation_id).position_by_id(&payload.id);
            match known {
                Some(pos) => {
                    let entry = &mut self.thread_mut(conversation_id).messages[pos];
                    entry.content = payload.content.clone();
                    entry.edited = payload.edited;
                    entry.read = entry.read || payload.read;
                }
                None => {
                    self.append_if_absent(conversation_id, payload);
                }
            }
        }
        self.messages(conversation_id)
    }

    /// Append an optimistic entry at the tail and return its fresh local key
    pub fn append_pending(&mut self, conversation_id: &str, draft: Draft) -> String {
        let local_key = format!("tmp-{}", Uuid::new_v4());
        let msg = ChatMessage {
            id: None,
            local_key: Some(local_key.clone()),
            conversation_id: conversation_id.to_string(),
            sender_id: draft.sender_id,
            content: draft.content,
            kind: draft.kind,
            created_at: Utc::now(),
            state: DeliveryState::Pending,
            read: false,
            edited: false,
        };
        self.thread_mut(conversation_id).messages.push(msg);
        local_key
    }

    /// Resolve the pending entry for `local_key` with the server's identity.
    /// Falls back to `append_if_absent` when the entry is gone or already resolved.
    pub fn reconcile(
        &mut self,
        conversation_id: &str,
        local_key: &str,
        payload: &MessagePayload,
    ) -> Applied {
        let thread = self.thread_mut(conversation_id);
        let pending = thread.position_pending(local_key);

        if thread.position_by_id(&payload.id).is_some() {
            // The echo got here first as a separate entry; the confirmed one wins.
            if let Some(pos) = pending {
                thread.messages.remove(pos);
                debug!("Dropped pending {} superseded by {}", local_key, payload.id);
            }
            return Applied::Duplicate;
        }

        match pending {
            Some(pos) => {
                thread.confirm_at(pos, payload);
                debug!("Reconciled {} -> {} in {}", local_key, payload.id, conversation_id);
                Applied::Reconciled
            }
            None => {
                // Entry already failed or was removed; the key is known, so no
                // content matching against other pending sends
                debug!("No pending {} for {}, inserting", local_key, payload.id);
                thread.insert_sorted(ChatMessage::confirmed(conversation_id, payload));
                Applied::Inserted
            }
        }
    }

    /// Merge a message that arrived from the server outside of an ack
    pub fn append_if_absent(&mut self, conversation_id: &str, payload: &MessagePayload) -> Applied {
        let window = self.reconcile_window;
        let thread = self.thread_mut(conversation_id);

        if thread.position_by_id(&payload.id).is_some() {
            debug!("Duplicate delivery of {} in {}", payload.id, conversation_id);
            return Applied::Duplicate;
        }

        let matched = match payload.temp_id.as_deref() {
            Some(key) => thread.position_pending(key),
            None => thread.position_heuristic(payload, window),
        };
        if let Some(pos) = matched {
            thread.confirm_at(pos, payload);
            return Applied::Reconciled;
        }

        thread.insert_sorted(ChatMessage::confirmed(conversation_id, payload));
        Applied::Inserted
    }

    /// `Pending -> Failed`. Returns false if no pending entry has this key.
    pub fn mark_failed(&mut self, conversation_id: &str, local_key: &str) -> bool {
        let Some(thread) = self.threads.get_mut(conversation_id) else {
            return false;
        };
        match thread.position_pending(local_key) {
            Some(pos) => {
                thread.messages[pos].state = DeliveryState::Failed;
                true
            }
            None => false,
        }
    }

    /// Set `read` on the covered messages; returns how many flipped
    pub fn mark_read(&mut self, conversation_id: &str, scope: &ReadScope) -> usize {
        let Some(thread) = self.threads.get_mut(conversation_id) else {
            return 0;
        };
        let mut changed = 0;
        for msg in thread.messages.iter_mut().filter(|m| !m.read) {
            let covered = match scope {
                ReadScope::Messages(ids) => msg
                    .id
                    .as_ref()
                    .is_some_and(|id| ids.iter().any(|x| x == id)),
                // Unsent entries cannot have been seen by anyone
                ReadScope::AuthoredBy(user) => {
                    &msg.sender_id == user && msg.state == DeliveryState::Sent
                }
            };
            if covered {
                msg.read = true;
                changed += 1;
            }
        }
        changed
    }

    /// Apply a server-side edit; unknown ids are ignored
    pub fn apply_edit(&mut self, conversation_id: &str, payload: &MessagePayload) -> bool {
        self.edit_content(conversation_id, &payload.id, &payload.content)
    }

    pub fn edit_content(&mut self, conversation_id: &str, message_id: &str, content: &str) -> bool {
        let Some(thread) = self.threads.get_mut(conversation_id) else {
            return false;
        };
        match thread.position_by_id(message_id) {
            Some(pos) => {
                let entry = &mut thread.messages[pos];
                if entry.content != content {
                    entry.content = content.to_string();
                    entry.edited = true;
                }
                true
            }
            None => false,
        }
    }

    pub fn remove_message(&mut self, conversation_id: &str, key: MessageKey<'_>) -> Option<ChatMessage> {
        let thread = self.threads.get_mut(conversation_id)?;
        let pos = thread.position_by_key(key)?;
        Some(thread.messages.remove(pos))
    }

    pub fn remove_thread(&mut self, conversation_id: &str) -> Option<Thread> {
        self.threads.remove(conversation_id)
    }

    /// Returns true if the flag changed. Clearing never creates a thread.
    pub fn set_typing(&mut self, conversation_id: &str, typing: bool) -> bool {
        if !typing {
            return self
                .threads
                .get_mut(conversation_id)
                .is_some_and(|t| std::mem::replace(&mut t.typing_from_peer, false));
        }
        let thread = self.thread_mut(conversation_id);
        let changed = thread.typing_from_peer != typing;
        thread.typing_from_peer = typing;
        changed
    }

    pub fn is_typing(&self, conversation_id: &str) -> bool {
        self.threads
            .get(conversation_id)
            .is_some_and(|t| t.typing_from_peer)
    }

    pub fn set_page_info(&mut self, conversation_id: &str, info: PageInfo) {
        self.thread_mut(conversation_id).page_info = Some(info);
    }

    pub fn page_info(&self, conversation_id: &str) -> Option<PageInfo> {
        self.threads.get(conversation_id).and_then(|t| t.page_info)
    }
}

impl Default for MessageThreadStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}
