/// Realtime channel: one shared handle per process.
///
/// Lifecycle is `connect -> authenticate -> join rooms`. Reconnection policy
/// belongs to whoever owns the `Link`; a fresh `connect` re-joins every room
/// this handle has joined.
pub mod protocol;
pub mod tcp;

pub use protocol::{
    Ack, ClientFrame, EventKind, Frame, InboundEvent, OutboundEvent, SendAck, ServerFrame,
    PROTOCOL_VERSION,
};

use crate::error::{Result, SyncError};
use crate::session::Session;
use futures_util::stream::{unfold, Stream};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Client side of a connected transport
pub struct Link {
    pub outbound: mpsc::UnboundedSender<ClientFrame>,
    pub inbound: mpsc::UnboundedReceiver<ServerFrame>,
}

/// Gateway side of an in-process link
pub struct GatewayEnd {
    pub inbound: mpsc::UnboundedReceiver<ClientFrame>,
    pub outbound: mpsc::UnboundedSender<ServerFrame>,
}

impl GatewayEnd {
    pub async fn recv(&mut self) -> Option<ClientFrame> {
        self.inbound.recv().await
    }

    /// Next frame that is not authentication or room bookkeeping
    pub async fn recv_significant(&mut self) -> Option<ClientFrame> {
        while let Some(frame) = self.inbound.recv().await {
            match frame.event {
                OutboundEvent::Authenticate { .. }
                | OutboundEvent::JoinConversation { .. }
                | OutboundEvent::LeaveConversation { .. } => continue,
                _ => return Some(frame),
            }
        }
        None
    }

    pub fn push(&self, event: InboundEvent) -> bool {
        self.outbound.send(ServerFrame::Event { event }).is_ok()
    }

    pub fn ack(&self, seq: u64, data: serde_json::Value) -> bool {
        self.outbound
            .send(ServerFrame::Ack {
                seq,
                ok: true,
                data: Some(data),
                error: None,
            })
            .is_ok()
    }

    pub fn nack(&self, seq: u64, error: &str) -> bool {
        self.outbound
            .send(ServerFrame::Ack {
                seq,
                ok: false,
                data: None,
                error: Some(error.to_string()),
            })
            .is_ok()
    }
}

/// In-process link pair
pub fn loopback() -> (Link, GatewayEnd) {
    let (client_tx, gateway_rx) = mpsc::unbounded_channel();
    let (gateway_tx, client_rx) = mpsc::unbounded_channel();
    (
        Link {
            outbound: client_tx,
            inbound: client_rx,
        },
        GatewayEnd {
            inbound: gateway_rx,
            outbound: gateway_tx,
        },
    )
}

/// Handler registration; dropping it tears the listener down
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct ChannelInner {
    session: Session,
    generation: AtomicU64,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
    connected: watch::Sender<bool>,
    next_seq: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Ack>>>,
    events: broadcast::Sender<InboundEvent>,
    rooms: Mutex<HashSet<String>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ChannelInner {
    fn send(&self, frame: ClientFrame) -> Result<()> {
        let outbound = lock(&self.outbound);
        let tx = outbound
            .as_ref()
            .ok_or_else(|| SyncError::Disconnected("channel is not connected".to_string()))?;
        tx.send(frame)
            .map_err(|_| SyncError::Disconnected("link closed".to_string()))
    }

    fn resolve(&self, seq: u64, ack: Ack) {
        match lock(&self.pending).remove(&seq) {
            Some(tx) => {
                let _ = tx.send(ack);
            }
            None => debug!("Ack for unknown or expired request {}", seq),
        }
    }

    fn drop_link(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        *lock(&self.outbound) = None;
        // Dropping the senders fails every waiter with a closed oneshot
        lock(&self.pending).clear();
        self.connected.send_replace(false);
    }
}

/// A request that has been emitted and is waiting for its ack.
/// Dropping it forgets the request.
pub struct PendingRequest {
    inner: Arc<ChannelInner>,
    seq: u64,
    name: &'static str,
    rx: oneshot::Receiver<Ack>,
}

impl PendingRequest {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub async fn wait(mut self, wait: Duration) -> Result<Ack> {
        match timeout(wait, &mut self.rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(SyncError::Disconnected(format!(
                "link closed before {} #{} was acknowledged",
                self.name, self.seq
            ))),
            Err(_) => Err(SyncError::Timeout(format!(
                "{} #{} not acknowledged within {:?}",
                self.name, self.seq, wait
            ))),
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        lock(&self.inner.pending).remove(&self.seq);
    }
}

#[derive(Clone)]
pub struct SocketSyncChannel {
    inner: Arc<ChannelInner>,
}

impl SocketSyncChannel {
    pub fn new(session: Session, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        let (connected, _) = watch::channel(false);
        Self {
            inner: Arc::new(ChannelInner {
                session,
                generation: AtomicU64::new(0),
                outbound: Mutex::new(None),
                connected,
                next_seq: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                events,
                rooms: Mutex::new(HashSet::new()),
                reader: Mutex::new(None),
            }),
        }
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// Attach a transport link, authenticate and re-join known rooms
    pub fn connect(&self, link: Link) -> Result<()> {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(old) = lock(&self.inner.reader).take() {
            old.abort();
        }
        lock(&self.inner.pending).clear();

        let Link {
            outbound,
            mut inbound,
        } = link;
        *lock(&self.inner.outbound) = Some(outbound);

        let auth = self.inner.send(ClientFrame {
            seq: None,
            event: OutboundEvent::Authenticate {
                user_id: self.inner.session.user_id.clone(),
                token: self.inner.session.token.clone(),
                protocol_version: PROTOCOL_VERSION,
            },
        });
        if let Err(e) = auth {
            self.inner.drop_link(generation);
            return Err(e);
        }

        // Raised before the reader exists; a link that closes at once lowers it again
        self.inner.connected.send_replace(true);

        let inner = self.inner.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                match frame {
                    ServerFrame::Ack {
                        seq,
                        ok,
                        data,
                        error,
                    } => inner.resolve(seq, Ack { ok, data, error }),
                    ServerFrame::Event { event } => {
                        debug!("Received {}", event);
                        // No subscribers is fine
                        let _ = inner.events.send(event);
                    }
                }
            }
            info!("Realtime link closed");
            inner.drop_link(generation);
        });
        *lock(&self.inner.reader) = Some(reader);

        let rooms: Vec<String> = lock(&self.inner.rooms).iter().cloned().collect();
        for conversation_id in rooms {
            self.inner.send(ClientFrame {
                seq: None,
                event: OutboundEvent::JoinConversation { conversation_id },
            })?;
        }

        info!("Realtime channel connected as {}", self.inner.session.user_id);
        Ok(())
    }

    pub fn disconnect(&self) {
        let generation = self.inner.generation.load(Ordering::SeqCst);
        if let Some(reader) = lock(&self.inner.reader).take() {
            reader.abort();
        }
        self.inner.drop_link(generation);
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Watch connection state changes
    pub fn connection_state(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    /// Fire-and-forget emission
    pub fn emit(&self, event: OutboundEvent) -> Result<()> {
        debug!("Emitting {}", event.name());
        self.inner.send(ClientFrame { seq: None, event })
    }

    /// Emit with a sequence number; the ack is awaited on the returned handle
    pub fn send_request(&self, event: OutboundEvent) -> Result<PendingRequest> {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let name = event.name();
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(seq, tx);
        let pending = PendingRequest {
            inner: self.inner.clone(),
            seq,
            name,
            rx,
        };
        debug!("Requesting {} #{}", name, seq);
        self.inner.send(ClientFrame {
            seq: Some(seq),
            event,
        })?;
        Ok(pending)
    }

    /// Emit and wait for the matching ack
    pub async fn request(&self, event: OutboundEvent, wait: Duration) -> Result<Ack> {
        self.send_request(event)?.wait(wait).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InboundEvent> {
        self.inner.events.subscribe()
    }

    /// All inbound events as a stream; lagged events are skipped with a warning
    pub fn events(&self) -> impl Stream<Item = InboundEvent> {
        unfold(self.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(RecvError::Lagged(n)) => {
                        warn!("Event consumer lagged {} events", n);
                        continue;
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
    }

    /// Call `handler` for every inbound event of one kind until the
    /// returned `Subscription` is dropped
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(InboundEvent) + Send + 'static,
    {
        let mut rx = self.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.kind() == kind => handler(event),
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => warn!("{:?} handler lagged {} events", kind, n),
                    Err(RecvError::Closed) => break,
                }
            }
        });
        Subscription { handle }
    }

    /// Subscribe to a conversation room; remembered for reconnects
    pub fn join_room(&self, conversation_id: &str) -> Result<()> {
        lock(&self.inner.rooms).insert(conversation_id.to_string());
        if !self.is_connected() {
            return Ok(());
        }
        self.emit(OutboundEvent::JoinConversation {
            conversation_id: conversation_id.to_string(),
        })
    }

    pub fn leave_room(&self, conversation_id: &str) -> Result<()> {
        let was_joined = lock(&self.inner.rooms).remove(conversation_id);
        if !was_joined || !self.is_connected() {
            return Ok(());
        }
        self.emit(OutboundEvent::LeaveConversation {
            conversation_id: conversation_id.to_string(),
        })
    }

    pub fn rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = lock(&self.inner.rooms).iter().cloned().collect();
        rooms.sort();
        rooms
    }
}
