/// Chat client tests
/// End-to-end flows over an in-process gateway link

extern crate chatsync_core;

use chatsync_core::channel::{ClientFrame, GatewayEnd, InboundEvent, OutboundEvent, SendAck};
use chatsync_core::messenger_types::PageInfo;
use chatsync_core::messenger_types::MessagePage;
use chatsync_core::{
    loopback, ChatClient, ChatMessage, ClientUpdate, Config, Conversation, ConversationFilter,
    ConversationSort, DeliveryState, HistorySource, MessageKey, MessageKind, MessagePayload,
    Result, Session, SocketSyncChannel, SyncError,
};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};

#[derive(Clone, Default)]
struct FakeHistory {
    conversations: Vec<Conversation>,
    pages: HashMap<(String, u32), MessagePage>,
    /// Fetches for this conversation block until notified
    gate: Option<(String, Arc<Notify>)>,
    fail: bool,
}

impl HistorySource for FakeHistory {
    async fn fetch_conversations(&self, _session: &Session) -> Result<Vec<Conversation>> {
        if self.fail {
            return Err(SyncError::Http("GET conversations returned 503".to_string()));
        }
        Ok(self.conversations.clone())
    }

    async fn fetch_messages(
        &self,
        _session: &Session,
        conversation_id: &str,
        page: u32,
        _page_size: u32,
    ) -> Result<MessagePage> {
        if let Some((id, gate)) = &self.gate {
            if id == conversation_id {
                gate.notified().await;
            }
        }
        Ok(self
            .pages
            .get(&(conversation_id.to_string(), page))
            .cloned()
            .unwrap_or(MessagePage {
                messages: Vec::new(),
                pagination: PageInfo {
                    page,
                    total_pages: page,
                },
            }))
    }
}

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_780_000_000 + secs, 0).unwrap()
}

fn conversation(id: &str, unread: u32) -> Conversation {
    Conversation {
        id: id.to_string(),
        display_name: id.to_string(),
        avatar: None,
        is_group: false,
        last_message: None,
        unread_count: unread,
        favorite: false,
    }
}

fn message(id: &str, sender: &str, recipient: &str, content: &str, at: DateTime<Utc>) -> MessagePayload {
    MessagePayload {
        id: id.to_string(),
        sender_id: sender.to_string(),
        sender_name: None,
        sender_avatar: None,
        recipient_id: Some(recipient.to_string()),
        group_id: None,
        group_name: None,
        content: content.to_string(),
        kind: MessageKind::Text,
        created_at: at,
        temp_id: None,
        read: false,
        edited: false,
    }
}

async fn start(history: FakeHistory) -> (Arc<ChatClient<FakeHistory>>, GatewayEnd) {
    let config = Config {
        user_id: "A".to_string(),
        token: "token".to_string(),
        ack_timeout: Duration::from_secs(2),
        ..Config::default()
    };
    let session = config.session();
    let channel = SocketSyncChannel::new(session.clone(), 64);
    let client = ChatClient::new(config, session, channel, history);

    let (link, mut gw) = loopback();
    client.start(link).unwrap();
    let auth = gw.recv().await.unwrap();
    assert!(matches!(auth.event, OutboundEvent::Authenticate { .. }));
    (Arc::new(client), gw)
}

/// Next frame that expects an ack
async fn next_request(gw: &mut GatewayEnd) -> ClientFrame {
    loop {
        let frame = timeout(Duration::from_secs(2), gw.recv())
            .await
            .expect("no request from client")
            .expect("link closed");
        if frame.seq.is_some() {
            return frame;
        }
    }
}

fn send_parts(frame: &ClientFrame) -> (u64, String) {
    match &frame.event {
        OutboundEvent::SendMessage { temp_id, .. } => (frame.seq.unwrap(), temp_id.clone()),
        other => panic!("expected send-message, got {:?}", other),
    }
}

fn ack_data(temp_id: &str, message: MessagePayload) -> serde_json::Value {
    serde_json::to_value(SendAck {
        temp_id: temp_id.to_string(),
        message,
    })
    .unwrap()
}

/// Poll until `check` holds
async fn until<F, Fut>(check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    timeout(Duration::from_secs(2), async {
        while !check().await {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

/// Events are dispatched in order; once this marker lands, everything pushed
/// before it has been applied.
async fn sync_point(gw: &GatewayEnd, client: &ChatClient<FakeHistory>, tag: &str) {
    gw.push(InboundEvent::NewMessage {
        message: message(tag, "Z", "A", tag, ts(0)),
    });
    until(|| async move { client.thread("Z").await.iter().any(|m| m.id.as_deref() == Some(tag)) }).await;
}

fn shape(thread: &[ChatMessage]) -> Vec<(Option<String>, String, String, DeliveryState)> {
    thread
        .iter()
        .map(|m| (m.id.clone(), m.sender_id.clone(), m.content.clone(), m.state))
        .collect()
}

#[tokio::test]
async fn test_ack_then_echo_yields_single_sent_message() {
    let (client, mut gw) = start(FakeHistory::default()).await;

    let sender = {
        let c = client.clone();
        tokio::spawn(async move { c.send("B", "hi").await })
    };
    let frame = next_request(&mut gw).await;
    let (seq, temp_id) = send_parts(&frame);
    gw.ack(seq, ack_data(&temp_id, message("m1", "A", "B", "hi", Utc::now())));
    let sent = sender.await.unwrap().unwrap();
    assert_eq!(sent.message_id, "m1");

    gw.push(InboundEvent::NewMessage {
        message: message("m1", "A", "B", "hi", Utc::now()),
    });
    sync_point(&gw, &client, "z1").await;

    let thread = client.thread("B").await;
    assert_eq!(
        shape(&thread),
        vec![(Some("m1".to_string()), "A".to_string(), "hi".to_string(), DeliveryState::Sent)]
    );
    // Own echo never counts as unread
    assert_eq!(client.unread_count("B").await, 0);
}

#[tokio::test]
async fn test_echo_then_ack_yields_same_thread() {
    let (client, mut gw) = start(FakeHistory::default()).await;

    let sender = {
        let c = client.clone();
        tokio::spawn(async move { c.send("B", "hi").await })
    };
    let frame = next_request(&mut gw).await;
    let (seq, temp_id) = send_parts(&frame);

    // Echo without a correlation id; matched by sender, content and time
    gw.push(InboundEvent::NewMessage {
        message: message("m1", "A", "B", "hi", Utc::now()),
    });
    sync_point(&gw, &client, "z1").await;
    assert_eq!(client.thread("B").await[0].state, DeliveryState::Sent);

    gw.ack(seq, ack_data(&temp_id, message("m1", "A", "B", "hi", Utc::now())));
    let sent = sender.await.unwrap().unwrap();
    assert_eq!(sent.message_id, "m1");

    let thread = client.thread("B").await;
    assert_eq!(
        shape(&thread),
        vec![(Some("m1".to_string()), "A".to_string(), "hi".to_string(), DeliveryState::Sent)]
    );
}

#[tokio::test]
async fn test_message_sent_event_reconciles_by_temp_id() {
    let (client, mut gw) = start(FakeHistory::default()).await;

    let sender = {
        let c = client.clone();
        tokio::spawn(async move { c.send("B", "hello").await })
    };
    let frame = next_request(&mut gw).await;
    let (seq, temp_id) = send_parts(&frame);

    gw.push(InboundEvent::MessageSent {
        temp_id: temp_id.clone(),
        message: message("m7", "A", "B", "hello", Utc::now() + chrono::Duration::minutes(3)),
    });
    sync_point(&gw, &client, "z1").await;
    gw.ack(seq, ack_data(&temp_id, message("m7", "A", "B", "hello", Utc::now())));
    sender.await.unwrap().unwrap();

    let thread = client.thread("B").await;
    assert_eq!(thread.len(), 1);
    assert_eq!(thread[0].id.as_deref(), Some("m7"));
    assert_eq!(thread[0].local_key.as_deref(), Some(temp_id.as_str()));
}

#[tokio::test]
async fn test_unread_counts_distinct_inbound_and_resets_on_focus() {
    let history = FakeHistory {
        conversations: vec![conversation("B", 0), conversation("C", 0)],
        ..FakeHistory::default()
    };
    let (client, mut gw) = start(history).await;
    client.sync_conversations().await.unwrap();
    client.open_conversation("C").await.unwrap();
    while gw.inbound.try_recv().is_ok() {}

    for (i, id) in ["b1", "b2", "b3"].iter().enumerate() {
        gw.push(InboundEvent::NewMessage {
            message: message(id, "B", "A", "ping", ts(i as i64)),
        });
    }
    // Redelivery of b2
    gw.push(InboundEvent::NewMessage {
        message: message("b2", "B", "A", "ping", ts(1)),
    });
    // Focused conversation stays at zero
    gw.push(InboundEvent::NewMessage {
        message: message("c1", "C", "A", "here", ts(5)),
    });

    // A message in the focused conversation is marked read on the server
    timeout(Duration::from_secs(2), async {
        loop {
            let frame = gw.recv().await.unwrap();
            if frame.event
                == (OutboundEvent::MarkRead {
                    conversation_id: "C".to_string(),
                })
            {
                break;
            }
        }
    })
    .await
    .expect("mark-read not emitted");

    assert_eq!(client.unread_count("B").await, 3);
    assert_eq!(client.unread_count("C").await, 0);
    assert_eq!(client.thread("B").await.len(), 3);

    let summaries = client
        .conversations(ConversationFilter::Unread, ConversationSort::Recent)
        .await;
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].id, "B");

    client.open_conversation("B").await.unwrap();
    assert_eq!(client.unread_count("B").await, 0);
    assert_eq!(client.total_unread().await, 0);
}

#[tokio::test]
async fn test_unknown_sender_creates_conversation() {
    let (client, gw) = start(FakeHistory::default()).await;
    let mut inbound = message("d1", "D", "A", "new here", ts(10));
    inbound.sender_name = Some("Dana".to_string());
    gw.push(InboundEvent::NewMessage { message: inbound });
    sync_point(&gw, &client, "z1").await;

    let list = client
        .conversations(ConversationFilter::All, ConversationSort::Name)
        .await;
    let dana = list.iter().find(|c| c.id == "D").unwrap();
    assert_eq!(dana.display_name, "Dana");
    assert_eq!(dana.unread_count, 1);
    assert_eq!(dana.last_message.as_ref().unwrap().content, "new here");
}

#[tokio::test]
async fn test_history_for_unfocused_conversation_is_stale() {
    let gate = Arc::new(Notify::new());
    let mut pages = HashMap::new();
    pages.insert(
        ("B".to_string(), 1),
        MessagePage {
            messages: vec![message("mb1", "B", "A", "old", ts(1))],
            pagination: PageInfo {
                page: 1,
                total_pages: 1,
            },
        },
    );
    let history = FakeHistory {
        conversations: vec![conversation("B", 0), conversation("C", 0)],
        pages,
        gate: Some(("B".to_string(), gate.clone())),
        fail: false,
    };
    let (client, _gw) = start(history).await;
    client.sync_conversations().await.unwrap();

    let slow = {
        let c = client.clone();
        tokio::spawn(async move { c.open_conversation("B").await })
    };
    let c = &client;
    until(|| async move { c.focused().await.as_deref() == Some("B") }).await;

    let fresh = client.open_conversation("C").await.unwrap();
    assert!(!fresh.stale);

    let mut updates = client.updates();
    gate.notify_one();
    let late = slow.await.unwrap().unwrap();
    assert!(late.stale);
    assert_eq!(client.focused().await.as_deref(), Some("C"));

    // Merged in the background, but no thread refresh for the UI
    assert_eq!(client.thread("B").await.len(), 1);
    while let Ok(update) = updates.try_recv() {
        assert_ne!(
            update,
            ClientUpdate::ThreadUpdated {
                conversation_id: "B".to_string()
            }
        );
    }
}

#[tokio::test]
async fn test_failed_sync_leaves_store_untouched() {
    let history = FakeHistory {
        fail: true,
        ..FakeHistory::default()
    };
    let (client, _gw) = start(history).await;
    assert!(client.sync_conversations().await.is_err());
    assert!(client
        .conversations(ConversationFilter::All, ConversationSort::Recent)
        .await
        .is_empty());
}

#[tokio::test]
async fn test_pagination_loads_older_pages() {
    let mut pages = HashMap::new();
    pages.insert(
        ("B".to_string(), 1),
        MessagePage {
            messages: vec![message("m3", "B", "A", "c", ts(30)), message("m4", "A", "B", "d", ts(40))],
            pagination: PageInfo {
                page: 1,
                total_pages: 2,
            },
        },
    );
    pages.insert(
        ("B".to_string(), 2),
        MessagePage {
            messages: vec![message("m1", "B", "A", "a", ts(10)), message("m2", "A", "B", "b", ts(20))],
            pagination: PageInfo {
                page: 2,
                total_pages: 2,
            },
        },
    );
    let history = FakeHistory {
        conversations: vec![conversation("B", 0)],
        pages,
        ..FakeHistory::default()
    };
    let (client, _gw) = start(history).await;

    let first = client.open_conversation("B").await.unwrap();
    assert_eq!(first.messages.len(), 2);
    assert!(client.has_older("B").await);

    let older = client.load_older("B").await.unwrap().unwrap();
    let ids: Vec<_> = older.messages.iter().filter_map(|m| m.id.clone()).collect();
    assert_eq!(ids, vec!["m1", "m2", "m3", "m4"]);
    assert!(!client.has_older("B").await);
    assert!(client.load_older("B").await.unwrap().is_none());

    // Refreshing the newest page keeps the pagination cursor
    client.load_history("B", 1).await.unwrap();
    assert!(!client.has_older("B").await);
    assert_eq!(client.thread("B").await.len(), 4);
}

#[tokio::test]
async fn test_peer_typing_clears_when_message_arrives() {
    let history = FakeHistory {
        conversations: vec![conversation("B", 0)],
        ..FakeHistory::default()
    };
    let (client, gw) = start(history).await;
    client.open_conversation("B").await.unwrap();

    gw.push(InboundEvent::UserTyping {
        user_id: "B".to_string(),
        conversation_id: None,
        is_typing: true,
    });
    let c = &client;
    until(|| async move { c.is_peer_typing("B").await }).await;

    gw.push(InboundEvent::NewMessage {
        message: message("m1", "B", "A", "done typing", Utc::now()),
    });
    until(|| async move { !c.is_peer_typing("B").await }).await;
    assert_eq!(client.thread("B").await.len(), 1);
}

#[tokio::test]
async fn test_peer_read_receipt_marks_own_messages() {
    let (client, mut gw) = start(FakeHistory::default()).await;

    let sender = {
        let c = client.clone();
        tokio::spawn(async move { c.send("B", "did you see this").await })
    };
    let frame = next_request(&mut gw).await;
    let (seq, temp_id) = send_parts(&frame);
    gw.ack(
        seq,
        ack_data(&temp_id, message("m1", "A", "B", "did you see this", Utc::now())),
    );
    sender.await.unwrap().unwrap();
    assert!(!client.thread("B").await[0].read);

    gw.push(InboundEvent::MessagesRead {
        reader_id: "B".to_string(),
        conversation_id: None,
    });
    let c = &client;
    until(|| async move { c.thread("B").await[0].read }).await;
}

#[tokio::test]
async fn test_presence_derives_online_flag() {
    let history = FakeHistory {
        conversations: vec![conversation("B", 0), conversation("C", 0)],
        ..FakeHistory::default()
    };
    let (client, gw) = start(history).await;
    client.sync_conversations().await.unwrap();

    let online = |id: &'static str| {
        let c = client.clone();
        async move {
            c.conversations(ConversationFilter::All, ConversationSort::Name)
                .await
                .into_iter()
                .find(|s| s.id == id)
                .is_some_and(|s| s.online)
        }
    };

    gw.push(InboundEvent::OnlineUsers {
        user_ids: vec!["B".to_string()],
    });
    until(|| online("B")).await;
    assert!(!online("C").await);

    gw.push(InboundEvent::UserOnline {
        user_id: "C".to_string(),
    });
    gw.push(InboundEvent::UserOffline {
        user_id: "B".to_string(),
    });
    until(|| online("C")).await;
    assert!(!online("B").await);
}

#[tokio::test]
async fn test_edit_and_delete_apply_after_ack() {
    let mut pages = HashMap::new();
    pages.insert(
        ("B".to_string(), 1),
        MessagePage {
            messages: vec![message("m1", "A", "B", "helo", ts(1))],
            pagination: PageInfo {
                page: 1,
                total_pages: 1,
            },
        },
    );
    let history = FakeHistory {
        conversations: vec![conversation("B", 0)],
        pages,
        ..FakeHistory::default()
    };
    let (client, mut gw) = start(history).await;
    client.open_conversation("B").await.unwrap();

    let editor = {
        let c = client.clone();
        tokio::spawn(async move { c.edit_message("B", "m1", "hello").await })
    };
    let frame = next_request(&mut gw).await;
    assert_eq!(
        frame.event,
        OutboundEvent::EditMessage {
            conversation_id: "B".to_string(),
            message_id: "m1".to_string(),
            content: "hello".to_string(),
        }
    );
    gw.ack(frame.seq.unwrap(), serde_json::Value::Null);
    editor.await.unwrap().unwrap();

    let thread = client.thread("B").await;
    assert_eq!(thread[0].content, "hello");
    assert!(thread[0].edited);

    let deleter = {
        let c = client.clone();
        tokio::spawn(async move { c.delete_message("B", MessageKey::Server("m1")).await })
    };
    let frame = next_request(&mut gw).await;
    gw.nack(frame.seq.unwrap(), "too old");
    assert!(deleter.await.unwrap().is_err());
    assert_eq!(client.thread("B").await.len(), 1);

    let deleter = {
        let c = client.clone();
        tokio::spawn(async move { c.delete_message("B", MessageKey::Server("m1")).await })
    };
    let frame = next_request(&mut gw).await;
    gw.ack(frame.seq.unwrap(), serde_json::Value::Null);
    deleter.await.unwrap().unwrap();
    assert!(client.thread("B").await.is_empty());
}

#[tokio::test]
async fn test_failed_send_can_be_deleted_locally_or_retried() {
    let (client, mut gw) = start(FakeHistory::default()).await;

    let mut keys = Vec::new();
    for text in ["first", "second"] {
        let sender = {
            let c = client.clone();
            tokio::spawn(async move { c.send("B", text).await })
        };
        let frame = next_request(&mut gw).await;
        gw.nack(frame.seq.unwrap(), "rate limited");
        let err = sender.await.unwrap().unwrap_err();
        keys.push(err.local_key().unwrap().to_string());
    }
    assert!(client
        .thread("B")
        .await
        .iter()
        .all(|m| m.state == DeliveryState::Failed));

    // Dropping a failed entry never touches the network
    client
        .delete_message("B", MessageKey::Local(&keys[0]))
        .await
        .unwrap();
    assert_eq!(client.thread("B").await.len(), 1);

    let retry = {
        let c = client.clone();
        let key = keys[1].clone();
        tokio::spawn(async move { c.retry("B", &key).await })
    };
    let frame = next_request(&mut gw).await;
    let (seq, temp_id) = send_parts(&frame);
    assert_ne!(temp_id, keys[1]);
    gw.ack(seq, ack_data(&temp_id, message("m2", "A", "B", "second", Utc::now())));
    retry.await.unwrap().unwrap();

    let thread = client.thread("B").await;
    assert_eq!(thread.len(), 1);
    assert_eq!(thread[0].state, DeliveryState::Sent);
    assert_eq!(thread[0].content, "second");
}

#[tokio::test]
async fn test_leave_conversation_removes_everything() {
    let history = FakeHistory {
        conversations: vec![conversation("B", 2)],
        ..FakeHistory::default()
    };
    let (client, mut gw) = start(history).await;
    client.sync_conversations().await.unwrap();
    client.open_conversation("B").await.unwrap();
    assert_eq!(client.channel().rooms(), vec!["B".to_string()]);

    client.leave_conversation("B").await.unwrap();
    assert!(client
        .conversations(ConversationFilter::All, ConversationSort::Recent)
        .await
        .is_empty());
    assert!(client.thread("B").await.is_empty());
    assert!(client.focused().await.is_none());
    assert!(client.channel().rooms().is_empty());

    let mut left = false;
    while let Ok(frame) = gw.inbound.try_recv() {
        if let OutboundEvent::LeaveConversation { conversation_id } = frame.event {
            left = conversation_id == "B";
        }
    }
    assert!(left);
}

#[tokio::test]
async fn test_favorites_filter() {
    let history = FakeHistory {
        conversations: vec![conversation("B", 0), conversation("C", 0)],
        ..FakeHistory::default()
    };
    let (client, _gw) = start(history).await;
    client.sync_conversations().await.unwrap();

    assert!(client.set_favorite("C", true).await);
    assert!(!client.set_favorite("nobody", true).await);
    let favorites = client
        .conversations(ConversationFilter::Favorites, ConversationSort::Recent)
        .await;
    assert_eq!(favorites.len(), 1);
    assert_eq!(favorites[0].id, "C");
}

#[tokio::test]
async fn test_link_loss_is_reported_and_blocks_sends() {
    let (client, gw) = start(FakeHistory::default()).await;
    let mut updates = client.updates();
    drop(gw);

    timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(ClientUpdate::ConnectionChanged { connected: false }) = updates.recv().await {
                break;
            }
        }
    })
    .await
    .expect("disconnect not reported");

    let err = client.send("B", "anyone?").await.unwrap_err();
    assert!(matches!(err, SyncError::Disconnected(_)));
    assert!(client.thread("B").await.is_empty());
}
