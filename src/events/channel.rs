//! Per-subscriber bounded queue.

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;

use super::bus::BusShared;
use super::Event;

/// Events a subscriber may have queued before the oldest unread is dropped.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Connected,
    /// Terminal. Queued events can still be drained.
    Disconnected,
}

struct ChannelQueue {
    events: VecDeque<Event>,
    dropped: u64,
    state: ChannelState,
}

/// Queue shared between the bus (producer) and one [`Subscription`].
pub(crate) struct ChannelShared {
    queue: Mutex<ChannelQueue>,
    notify: Notify,
    capacity: usize,
}

impl ChannelShared {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(ChannelQueue {
                events: VecDeque::with_capacity(capacity.min(DEFAULT_CHANNEL_CAPACITY)),
                dropped: 0,
                state: ChannelState::Connected,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue without blocking. A full queue loses its oldest unread event.
    /// Returns false once the channel is disconnected.
    pub(crate) fn push(&self, event: Event) -> bool {
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.state == ChannelState::Disconnected {
                return false;
            }
            if queue.events.len() >= self.capacity {
                queue.events.pop_front();
                queue.dropped += 1;
            }
            queue.events.push_back(event);
        }
        self.notify.notify_one();
        true
    }

    pub(crate) fn disconnect(&self) {
        self.queue.lock().unwrap().state = ChannelState::Disconnected;
        self.notify.notify_one();
    }
}

/// Handle held by one consumer of the bus.
///
/// Dropping the handle unsubscribes it.
pub struct Subscription {
    id: SubscriptionId,
    shared: Arc<ChannelShared>,
    bus: Weak<BusShared>,
}

impl Subscription {
    pub(crate) fn new(id: SubscriptionId, shared: Arc<ChannelShared>, bus: Weak<BusShared>) -> Self {
        Self { id, shared, bus }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next event. Returns `None` once the channel is
    /// disconnected and drained.
    pub async fn recv(&self) -> Option<Event> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut queue = self.shared.queue.lock().unwrap();
                if let Some(event) = queue.events.pop_front() {
                    return Some(event);
                }
                if queue.state == ChannelState::Disconnected {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn try_recv(&self) -> Option<Event> {
        self.shared.queue.lock().unwrap().events.pop_front()
    }

    /// Number of events waiting to be read.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().unwrap().events.len()
    }

    /// Events lost to overflow on this channel.
    pub fn dropped(&self) -> u64 {
        self.shared.queue.lock().unwrap().dropped
    }

    pub fn state(&self) -> ChannelState {
        self.shared.queue.lock().unwrap().state
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
        self.shared.disconnect();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pending", &self.pending())
            .finish()
    }
}
