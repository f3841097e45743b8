use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::HubError;
use crate::protocol::Message;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique identity of one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    fn next() -> Self {
        Self(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// The hub's view of one connected subscriber: an identity plus the sending
/// half of its bounded outbound queue.
///
/// Once registered, the registry's copy should be the only sender left alive.
/// Dropping it is how the queue gets closed.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ClientId,
    tx: mpsc::Sender<Bytes>,
}

/// Receiving half of a subscriber's queue, drained by the transport.
#[derive(Debug)]
pub struct Outbound {
    id: ClientId,
    rx: mpsc::Receiver<Bytes>,
}

impl ClientHandle {
    /// Creates a handle and its outbound queue holding at most `capacity`
    /// frames. A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> (Self, Outbound) {
        let id = ClientId::next();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { id, tx }, Outbound { id, rx })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Enqueues without waiting. Fails when the queue is full or its
    /// receiver has gone away.
    fn try_deliver(&self, frame: Bytes) -> Result<(), TrySendError<Bytes>> {
        self.tx.try_send(frame)
    }
}

impl Outbound {
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Next queued frame, or `None` once the hub has let go of this client
    /// and the queue is drained.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}

/// Outcome of one broadcast pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub evicted: Vec<ClientId>,
}

/// The set of broadcast-eligible clients.
///
/// A client receives broadcasts if and only if it is a member. Only the
/// coordinator loop owns one of these at runtime; it is public so the
/// membership rules can be driven directly.
#[derive(Debug, Default)]
pub struct Registry {
    clients: HashMap<ClientId, ClientHandle>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    pub fn members(&self) -> Vec<ClientId> {
        let mut ids: Vec<_> = self.clients.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Adds `handle`. Registering an id that is already present keeps the
    /// existing entry; returns whether the client was newly added.
    pub fn register(&mut self, handle: ClientHandle) -> bool {
        let id = handle.id;
        if self.clients.contains_key(&id) {
            debug!(client = %id, "duplicate register ignored");
            return false;
        }
        self.clients.insert(id, handle);
        info!(client = %id, total = self.clients.len(), "client connected");
        true
    }

    /// Removes `id` and closes its queue. Unknown ids are a no-op.
    pub fn unregister(&mut self, id: ClientId) -> bool {
        match self.clients.remove(&id) {
            Some(_handle) => {
                info!(client = %id, total = self.clients.len(), "client disconnected");
                true
            }
            None => false,
        }
    }

    /// Sends `message` to every member, the sender included.
    ///
    /// The message is serialized once and the same buffer is queued for every
    /// recipient. Delivery never waits: a member whose queue is full, or whose
    /// receiver is gone, is evicted on the spot and its queue closed. If
    /// serialization fails nothing is delivered and membership is unchanged.
    pub fn broadcast(&mut self, message: &Message) -> Result<BroadcastReport, HubError> {
        let frame = message.encode()?;
        let mut report = BroadcastReport::default();

        self.clients.retain(|id, handle| match handle.try_deliver(frame.clone()) {
            Ok(()) => {
                report.delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(client = %id, "evicting slow client");
                report.evicted.push(*id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(client = %id, "evicting client with dropped queue");
                report.evicted.push(*id);
                false
            }
        });

        debug!(
            from = %message.email,
            delivered = report.delivered,
            evicted = report.evicted.len(),
            total = self.clients.len(),
            "broadcast"
        );
        Ok(report)
    }
}

enum HubCommand {
    Register(ClientHandle),
    Unregister(ClientId),
    Broadcast(Message),
    Members(oneshot::Sender<Vec<ClientId>>),
}

impl fmt::Debug for HubCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HubCommand::Register(h) => write!(f, "Register({})", h.id),
            HubCommand::Unregister(id) => write!(f, "Unregister({id})"),
            HubCommand::Broadcast(m) => write!(f, "Broadcast({})", m.email),
            HubCommand::Members(_) => f.write_str("Members"),
        }
    }
}

/// Cloneable submission side of the coordinator.
///
/// Every method enqueues onto one unbounded FIFO inbox, so callers never wait
/// on the loop and commands are served in arrival order.
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    pub fn register(&self, handle: ClientHandle) -> Result<(), HubError> {
        self.submit(HubCommand::Register(handle))
    }

    pub fn unregister(&self, id: ClientId) -> Result<(), HubError> {
        self.submit(HubCommand::Unregister(id))
    }

    pub fn broadcast(&self, message: Message) -> Result<(), HubError> {
        self.submit(HubCommand::Broadcast(message))
    }

    /// Current members, as seen by the loop after every earlier command.
    pub async fn members(&self) -> Result<Vec<ClientId>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.submit(HubCommand::Members(reply))?;
        rx.await.map_err(|_| HubError::Closed)
    }

    fn submit(&self, cmd: HubCommand) -> Result<(), HubError> {
        self.tx.send(cmd).map_err(|_| HubError::Closed)
    }
}

pub struct Hub;

impl Hub {
    /// Spawns the coordinator on the current tokio runtime.
    ///
    /// The loop runs until every [`HubHandle`] is dropped, then drops the
    /// registry, which closes all remaining queues.
    pub fn spawn() -> (HubHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_hub(rx));
        (HubHandle { tx }, task)
    }
}

/// run_hub is the only code that touches the registry. One command at a time.
async fn run_hub(mut rx: mpsc::UnboundedReceiver<HubCommand>) {
    let mut registry = Registry::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            HubCommand::Register(handle) => {
                registry.register(handle);
            }
            HubCommand::Unregister(id) => {
                registry.unregister(id);
            }
            HubCommand::Broadcast(message) => {
                if let Err(e) = registry.broadcast(&message) {
                    error!(from = %message.email, error = %e, "broadcast skipped");
                }
            }
            HubCommand::Members(reply) => {
                reply.send(registry.members()).ok();
            }
        }
    }

    info!(remaining = registry.len(), "hub stopped");
}
