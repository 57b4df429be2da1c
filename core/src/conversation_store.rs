/// Conversation registry: one record per peer/group id, presence set, focus
use crate::messenger_types::{
    ChatMessage, Conversation, ConversationFilter, ConversationHint, ConversationSort,
    ConversationSummary, LastMessage,
};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// What `on_inbound_message` did to the conversation list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundEffect {
    /// A placeholder record was synthesized
    pub created: bool,
    /// `unread_count` was incremented
    pub counted_unread: bool,
    /// The conversation is the focused one
    pub focused: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ConversationStore {
    conversations: HashMap<String, Conversation>,
    online: HashSet<String>,
    focused: Option<String>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Conversation> {
        self.conversations.get(id)
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn focused(&self) -> Option<&str> {
        self.focused.as_deref()
    }

    pub fn is_focused(&self, id: &str) -> bool {
        self.focused.as_deref() == Some(id)
    }

    /// Seed from a REST snapshot. Real-time state already known locally wins:
    /// the higher unread count and the newer preview are kept.
    pub fn upsert_from_history(&mut self, list: Vec<Conversation>) {
        for incoming in list {
            match self.conversations.get_mut(&incoming.id) {
                Some(existing) => {
                    existing.display_name = incoming.display_name;
                    existing.avatar = incoming.avatar;
                    existing.is_group = incoming.is_group;
                    existing.favorite = incoming.favorite;
                    if !self.focused.as_deref().is_some_and(|f| f == existing.id) {
                        existing.unread_count = existing.unread_count.max(incoming.unread_count);
                    }
                    if is_newer(incoming.last_message.as_ref(), existing.last_message.as_ref()) {
                        existing.last_message = incoming.last_message;
                    }
                }
                None => {
                    let mut conv = incoming;
                    if self.is_focused(&conv.id) {
                        conv.unread_count = 0;
                    }
                    self.conversations.insert(conv.id.clone(), conv);
                }
            }
        }
    }

    /// Record a message that arrived over the channel (not a duplicate)
    pub fn on_inbound_message(
        &mut self,
        conversation_id: &str,
        message: &ChatMessage,
        authored_by_local_user: bool,
        hint: &ConversationHint,
    ) -> InboundEffect {
        let focused = self.is_focused(conversation_id);
        let mut created = false;
        let conv = self
            .conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                created = true;
                Conversation::placeholder(conversation_id, hint)
            });

        let preview = LastMessage {
            content: message.content.clone(),
            timestamp: message.created_at,
            authored_by_local_user,
        };
        if is_newer(Some(&preview), conv.last_message.as_ref()) {
            conv.last_message = Some(preview);
        }

        let counted_unread = !focused && !authored_by_local_user;
        if counted_unread {
            conv.unread_count = conv.unread_count.saturating_add(1);
        }

        InboundEffect {
            created,
            counted_unread,
            focused,
        }
    }

    /// Preview update for an optimistic send; unread is untouched
    pub fn on_local_send(&mut self, conversation_id: &str, content: &str, timestamp: DateTime<Utc>) {
        let conv = self
            .conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| Conversation::placeholder(conversation_id, &ConversationHint::default()));
        conv.last_message = Some(LastMessage {
            content: content.to_string(),
            timestamp,
            authored_by_local_user: true,
        });
    }

    /// Change focus; the newly focused conversation's unread count drops to 0
    pub fn set_focused(&mut self, conversation_id: Option<&str>) -> Option<String> {
        let previous = self.focused.take();
        self.focused = conversation_id.map(str::to_string);
        if let Some(id) = conversation_id {
            self.reset_unread(id);
        }
        previous
    }

    /// Returns the count that was cleared
    pub fn reset_unread(&mut self, conversation_id: &str) -> u32 {
        match self.conversations.get_mut(conversation_id) {
            Some(conv) => std::mem::take(&mut conv.unread_count),
            None => 0,
        }
    }

    pub fn set_favorite(&mut self, conversation_id: &str, favorite: bool) -> bool {
        match self.conversations.get_mut(conversation_id) {
            Some(conv) => {
                conv.favorite = favorite;
                true
            }
            None => false,
        }
    }

    /// Explicit leave/delete; the only way a conversation goes away
    pub fn remove(&mut self, conversation_id: &str) -> Option<Conversation> {
        if self.is_focused(conversation_id) {
            self.focused = None;
        }
        self.conversations.remove(conversation_id)
    }

    pub fn set_presence(&mut self, user_id: &str, online: bool) -> bool {
        if online {
            self.online.insert(user_id.to_string())
        } else {
            self.online.remove(user_id)
        }
    }

    pub fn replace_presence<I: IntoIterator<Item = String>>(&mut self, online: I) {
        self.online = online.into_iter().collect();
    }

    pub fn is_online(&self, id: &str) -> bool {
        self.online.contains(id)
    }

    pub fn total_unread(&self) -> u32 {
        self.conversations.values().map(|c| c.unread_count).sum()
    }

    /// Filtered and sorted projection; stored state is never reordered
    pub fn list(&self, filter: ConversationFilter, sort: ConversationSort) -> Vec<ConversationSummary> {
        let mut out: Vec<ConversationSummary> = self
            .conversations
            .values()
            .filter(|c| match filter {
                ConversationFilter::All => true,
                ConversationFilter::Unread => c.unread_count > 0,
                ConversationFilter::Favorites => c.favorite,
                ConversationFilter::Groups => c.is_group,
            })
            .map(|c| ConversationSummary {
                id: c.id.clone(),
                display_name: c.display_name.clone(),
                avatar: c.avatar.clone(),
                is_group: c.is_group,
                favorite: c.favorite,
                last_message: c.last_message.clone(),
                unread_count: c.unread_count,
                online: !c.is_group && self.online.contains(&c.id),
            })
            .collect();

        out.sort_by(|a, b| match sort {
            ConversationSort::Recent => by_recency(a, b),
            ConversationSort::Unread => b
                .unread_count
                .cmp(&a.unread_count)
                .then_with(|| by_recency(a, b)),
            ConversationSort::Name => a
                .display_name
                .to_lowercase()
                .cmp(&b.display_name.to_lowercase())
                .then_with(|| a.id.cmp(&b.id)),
        });
        out
    }
}

fn is_newer(candidate: Option<&LastMessage>, current: Option<&LastMessage>) -> bool {
    match (candidate, current) {
        (Some(c), Some(cur)) => c.timestamp >= cur.timestamp,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

// Newest first, conversations without messages last, id as tie-break
fn by_recency(a: &ConversationSummary, b: &ConversationSummary) -> Ordering {
    let ta = a.last_message.as_ref().map(|m| m.timestamp);
    let tb = b.last_message.as_ref().map(|m| m.timestamp);
    tb.cmp(&ta).then_with(|| a.id.cmp(&b.id))
}
