//! Publish/subscribe hub with bounded history.
//!
//! Publishing never waits on consumers: every subscriber owns a bounded
//! queue and overflow drops that subscriber's oldest unread event only.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::channel::{ChannelShared, Subscription, SubscriptionId, DEFAULT_CHANNEL_CAPACITY};
use super::{Event, EventKind, Heartbeat};

/// Events retained for late subscribers and `get_recent`.
pub const HISTORY_CAPACITY: usize = 100;
/// History replayed into every new subscription.
pub const REPLAY_ON_SUBSCRIBE: usize = 5;
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

struct BusState {
    history: VecDeque<Event>,
    subscribers: HashMap<SubscriptionId, Arc<ChannelShared>>,
}

pub(crate) struct BusShared {
    state: Mutex<BusState>,
    next_id: AtomicU64,
    channel_capacity: usize,
    closed: watch::Sender<bool>,
}

impl BusShared {
    pub(crate) fn remove(&self, id: SubscriptionId) -> bool {
        let removed = self.state.lock().unwrap().subscribers.remove(&id);
        match removed {
            Some(channel) => {
                channel.disconnect();
                tracing::debug!("EventBus: {} unsubscribed", id);
                true
            }
            None => false,
        }
    }

    /// Deliver to every live channel, pruning disconnected ones.
    fn fan_out(state: &mut BusState, event: &Event) {
        state
            .subscribers
            .retain(|_, channel| channel.push(event.clone()));
    }
}

/// Cloneable handle to the event hub.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<BusShared>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_channel_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_channel_capacity(channel_capacity: usize) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            shared: Arc::new(BusShared {
                state: Mutex::new(BusState {
                    history: VecDeque::with_capacity(HISTORY_CAPACITY),
                    subscribers: HashMap::new(),
                }),
                next_id: AtomicU64::new(1),
                channel_capacity,
                closed,
            }),
        }
    }

    /// Record the event in history and deliver it to every subscriber.
    pub fn publish(&self, event: Event) {
        let mut state = self.shared.state.lock().unwrap();
        if state.history.len() >= HISTORY_CAPACITY {
            state.history.pop_front();
        }
        state.history.push_back(event.clone());
        BusShared::fan_out(&mut state, &event);
    }

    /// Register a new channel, pre-loaded with the most recent history.
    pub fn subscribe(&self) -> Subscription {
        let id = SubscriptionId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let channel = Arc::new(ChannelShared::new(self.shared.channel_capacity));

        {
            let mut state = self.shared.state.lock().unwrap();
            let skip = state.history.len().saturating_sub(REPLAY_ON_SUBSCRIBE);
            for event in state.history.iter().skip(skip) {
                channel.push(event.clone());
            }
            if *self.shared.closed.borrow() {
                channel.disconnect();
            } else {
                state.subscribers.insert(id, channel.clone());
            }
        }

        tracing::debug!("EventBus: {} subscribed", id);
        Subscription::new(id, channel, Arc::downgrade(&self.shared))
    }

    /// Idempotent; returns whether the subscription was still registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.remove(id)
    }

    /// Copy of the last `n` events, oldest first.
    pub fn get_recent(&self, n: usize) -> Vec<Event> {
        let state = self.shared.state.lock().unwrap();
        let skip = state.history.len().saturating_sub(n);
        state.history.iter().skip(skip).cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.state.lock().unwrap().subscribers.len()
    }

    /// Deliver a heartbeat to every subscriber. Heartbeats are not kept in
    /// history.
    pub fn heartbeat(&self) {
        let mut state = self.shared.state.lock().unwrap();
        let event = Event::new(EventKind::Heartbeat(Heartbeat {
            subscribers: state.subscribers.len(),
        }));
        BusShared::fan_out(&mut state, &event);
    }

    /// Emit heartbeats every `period` until the bus is closed or dropped.
    pub fn spawn_heartbeat(&self, period: Duration) -> JoinHandle<()> {
        let shared: Weak<BusShared> = Arc::downgrade(&self.shared);
        let mut closed = self.shared.closed.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick completes immediately
            interval.tick().await;

            loop {
                if *closed.borrow_and_update() {
                    break;
                }
                tokio::select! {
                    changed = closed.changed() => {
                        if changed.is_err() || *closed.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        match shared.upgrade() {
                            Some(shared) => EventBus { shared }.heartbeat(),
                            None => break,
                        }
                    }
                }
            }
            tracing::debug!("EventBus: heartbeat stopped");
        })
    }

    /// Disconnect every subscriber and stop heartbeats. Later subscriptions
    /// start disconnected. Idempotent.
    pub fn close(&self) {
        if self.shared.closed.send_replace(true) {
            return;
        }
        let channels: Vec<_> = {
            let mut state = self.shared.state.lock().unwrap();
            state.subscribers.drain().map(|(_, channel)| channel).collect()
        };
        for channel in channels {
            channel.disconnect();
        }
        tracing::info!("EventBus closed");
    }
}
