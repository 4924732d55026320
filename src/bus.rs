//! Message bus — type-keyed publish/subscribe with batched drains.
//!
//! Decouples network-task producers from application consumers: connections
//! publish decoded events from their reader tasks, and all subscriber
//! callbacks run inside [`MessageBus::drain`] sweeps. With a scheduler hook
//! installed, `publish` arranges for exactly one future drain; the engine
//! services those from a single task so consumers execute on one controlled
//! logical sequence. Without a hook, drains are triggered manually — the
//! deterministic-test mode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::trace;

use crate::identity::PeerId;
use crate::protocol::{MessageRequest, MessagesReply, UserMetaRequest, UserMetaReply};

/// An event routed through the bus.
///
/// A closed union: the four wire messages (tagged with the connection they
/// arrived on) plus the connection lifecycle events.
#[derive(Debug, Clone)]
pub enum NetEvent {
    /// A connection finished its handshake and entered steady state.
    PeerConnected {
        peer_id: PeerId,
        display_name: Option<String>,
    },
    /// A connection's loops terminated.
    PeerDisconnected { peer_id: PeerId },
    /// Steady-state `UserMetaRequest` received from `from`.
    UserMetaRequest { from: PeerId, request: UserMetaRequest },
    /// Steady-state `UserMetaReply` received from `from`.
    UserMetaReply { from: PeerId, reply: UserMetaReply },
    /// A peer asked for stored messages.
    MessageRequest { from: PeerId, request: MessageRequest },
    /// A peer delivered chat text.
    MessagesReply { from: PeerId, reply: MessagesReply },
}

/// Subscription lookup key — one variant per [`NetEvent`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PeerConnected,
    PeerDisconnected,
    UserMetaRequest,
    UserMetaReply,
    MessageRequest,
    MessagesReply,
}

impl NetEvent {
    /// The subscription key for this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::PeerConnected { .. } => EventKind::PeerConnected,
            Self::PeerDisconnected { .. } => EventKind::PeerDisconnected,
            Self::UserMetaRequest { .. } => EventKind::UserMetaRequest,
            Self::UserMetaReply { .. } => EventKind::UserMetaReply,
            Self::MessageRequest { .. } => EventKind::MessageRequest,
            Self::MessagesReply { .. } => EventKind::MessagesReply,
        }
    }
}

/// A subscriber callback. Runs synchronously inside a drain sweep; must not
/// block.
pub type EventCallback = Box<dyn Fn(&NetEvent) + Send + Sync>;

/// Called by `publish` to schedule one drain (e.g. poke a channel serviced
/// by a runtime task).
pub type SchedulerHook = Box<dyn Fn() + Send + Sync>;

/// Handle returned by [`MessageBus::subscribe`]; pass to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    kind: EventKind,
    token: u64,
}

#[derive(Default)]
struct PendingQueue {
    events: Vec<NetEvent>,
    drain_scheduled: bool,
}

/// Type-keyed pub/sub dispatcher.
pub struct MessageBus {
    queue: Mutex<PendingQueue>,
    subscribers: RwLock<HashMap<EventKind, Vec<(u64, Arc<EventCallback>)>>>,
    hook: RwLock<Option<SchedulerHook>>,
    next_token: AtomicU64,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(PendingQueue::default()),
            subscribers: RwLock::new(HashMap::new()),
            hook: RwLock::new(None),
            next_token: AtomicU64::new(0),
        }
    }

    /// Append an event to the pending queue. If a scheduler hook is
    /// installed and no drain is currently scheduled, schedule exactly one.
    pub fn publish(&self, event: NetEvent) {
        // Hook presence is decided under the same critical section that
        // sets the scheduled flag, so the flag can never be set without a
        // hook to honor it.
        let hook = self.hook.read().expect("bus hook lock poisoned");
        let schedule = {
            let mut queue = self.queue.lock().expect("bus queue lock poisoned");
            queue.events.push(event);
            if hook.is_some() && !queue.drain_scheduled {
                queue.drain_scheduled = true;
                true
            } else {
                false
            }
        };

        if schedule {
            if let Some(hook) = hook.as_ref() {
                hook();
            }
        }
    }

    /// Register a callback for one event kind. Subscribers for a kind are
    /// invoked in registration order.
    pub fn subscribe(&self, kind: EventKind, callback: EventCallback) -> Subscription {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.subscribers.write().expect("bus subscriber lock poisoned");
        subscribers.entry(kind).or_default().push((token, Arc::new(callback)));
        Subscription { kind, token }
    }

    /// Remove a subscriber. Unknown handles are a no-op.
    pub fn unsubscribe(&self, subscription: Subscription) {
        let mut subscribers = self.subscribers.write().expect("bus subscriber lock poisoned");
        if let Some(list) = subscribers.get_mut(&subscription.kind) {
            list.retain(|(token, _)| *token != subscription.token);
        }
    }

    /// Install the mechanism used to schedule drains.
    pub fn set_scheduler_hook(&self, hook: SchedulerHook) {
        *self.hook.write().expect("bus hook lock poisoned") = Some(hook);
    }

    /// One sweep: swap out the entire pending queue, clear the scheduled
    /// flag, then dispatch every batched event in push order to its kind's
    /// subscribers. Producers publishing mid-drain land in the fresh queue
    /// and schedule a separate future drain.
    ///
    /// The subscriber table is snapshotted per event before dispatch, so
    /// callbacks may freely `subscribe`/`unsubscribe`. A subscriber removed
    /// mid-batch may still see the remainder of that event's dispatch.
    pub fn drain(&self) {
        let batch = {
            let mut queue = self.queue.lock().expect("bus queue lock poisoned");
            queue.drain_scheduled = false;
            std::mem::take(&mut queue.events)
        };

        if batch.is_empty() {
            return;
        }
        trace!("Bus drain: dispatching {} events", batch.len());

        for event in &batch {
            let callbacks: Vec<Arc<EventCallback>> = {
                let subscribers = self.subscribers.read().expect("bus subscriber lock poisoned");
                subscribers
                    .get(&event.kind())
                    .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                    .unwrap_or_default()
            };
            for callback in callbacks {
                callback(event);
            }
        }
    }

    /// Number of events awaiting the next drain.
    pub fn pending_len(&self) -> usize {
        self.queue.lock().expect("bus queue lock poisoned").events.len()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
