// ABOUTME: Per-(from,to) in-order delivery with ack-gated release and fail-open timeout
// ABOUTME: Two-level locking: short outer map lock to locate state, then a per-conversation lock

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::envelope::Envelope;

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("ack timeout for conversation {0}")]
    AckTimeout(String),
}

/// `lowercase(from) + "_" + lowercase(to)`.
pub fn correlation_key(from: &str, to: &str) -> String {
    format!("{}_{}", from.to_lowercase(), to.to_lowercase())
}

/// Receiver for envelopes the Conversation Manager releases onto the
/// client-origin channel. The Router implements this; the dependency is
/// inverted via a trait so `conversation` doesn't depend on `router`.
#[async_trait]
pub trait ClientOriginSink: Send + Sync {
    async fn dispatch_client_origin(&self, envelope: Envelope);
}

struct ConversationState {
    queue: VecDeque<Envelope>,
    in_flight: bool,
    expected_ack_id: String,
    /// Monotonic token invalidating a stale timer firing after a newer
    /// `set_expected_ack` call reused the slot.
    timer_epoch: u64,
}

impl ConversationState {
    fn new() -> Self {
        ConversationState {
            queue: VecDeque::new(),
            in_flight: false,
            expected_ack_id: String::new(),
            timer_epoch: 0,
        }
    }

    fn idle(&self) -> bool {
        !self.in_flight && self.queue.is_empty()
    }
}

struct Conversation {
    state: Mutex<ConversationState>,
    last_activity: Mutex<Instant>,
}

/// Provides per-conversation FIFO ordering with a single in-flight slot
///.
pub struct ConversationManager {
    conversations: DashMap<String, Arc<Conversation>>,
    /// global `ack_id -> correlation_key` table.
    in_flight_table: DashMap<String, String>,
    ack_timeout: Duration,
    idle_ttl: Duration,
}

impl ConversationManager {
    pub fn new(ack_timeout: Duration, idle_ttl: Duration) -> Self {
        ConversationManager {
            conversations: DashMap::new(),
            in_flight_table: DashMap::new(),
            ack_timeout,
            idle_ttl,
        }
    }

    fn get_or_create(&self, key: &str) -> Arc<Conversation> {
        self.conversations
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Conversation {
                    state: Mutex::new(ConversationState::new()),
                    last_activity: Mutex::new(Instant::now()),
                })
            })
            .clone()
    }

    /// Append `envelope` to the queue for `key`; if nothing is in flight,
    /// immediately flip `in_flight` and hand the head to the Router's
    /// client-origin channel.
    pub async fn add(&self, key: &str, envelope: Envelope, sink: &Arc<dyn ClientOriginSink>) {
        let conv = self.get_or_create(key);
        *conv.last_activity.lock().await = Instant::now();
        let mut state = conv.state.lock().await;
        state.queue.push_back(envelope);
        if !state.in_flight {
            if let Some(next) = state.queue.pop_front() {
                state.in_flight = true;
                drop(state);
                sink.dispatch_client_origin(next).await;
            }
        }
    }

    /// Record `ack_id` as the id expected to release `key`'s in-flight slot,
    /// register the reverse mapping in the global table, and arm a one-shot
    /// fail-open timer.
    pub async fn set_expected_ack(
        self: &Arc<Self>,
        key: &str,
        ack_id: String,
        sink: Arc<dyn ClientOriginSink>,
    ) {
        let conv = self.get_or_create(key);
        let epoch = {
            let mut state = conv.state.lock().await;
            state.expected_ack_id = ack_id.clone();
            state.timer_epoch += 1;
            state.timer_epoch
        };
        self.in_flight_table.insert(ack_id.clone(), key.to_string());

        let mgr = Arc::clone(self);
        let key = key.to_string();
        let timeout = self.ack_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            mgr.on_timer_fired(&key, &ack_id, epoch, sink).await;
        });
    }

    async fn on_timer_fired(
        &self,
        key: &str,
        ack_id: &str,
        epoch: u64,
        sink: Arc<dyn ClientOriginSink>,
    ) {
        // A fired timer is indistinguishable from an ack. Guard against a stale timer whose
        // conversation slot has since been reused by a newer
        // `set_expected_ack` call: the callback re-acquires the lock and
        // checks the epoch before releasing anything.
        if let Some(conv) = self.conversations.get(key).map(|e| e.clone()) {
            let should_release = {
                let state = conv.state.lock().await;
                state.in_flight && state.timer_epoch == epoch
            };
            if should_release {
                self.in_flight_table.remove(ack_id);
                self.release_and_advance(key, &conv, sink).await;
            }
        }
    }

    /// Stop the timer (logically — the epoch check above makes a late fire
    /// a no-op) and release the slot if `ack_id` matches what's expected;
    /// advance the queue if non-empty.
    pub async fn handle_ack(&self, key: &str, ack_id: &str, sink: &Arc<dyn ClientOriginSink>) {
        let Some(conv) = self.conversations.get(key).map(|e| e.clone()) else {
            return;
        };
        self.in_flight_table.remove(ack_id);
        let matched = {
            let state = conv.state.lock().await;
            state.in_flight && state.expected_ack_id == ack_id
        };
        if matched {
            self.release_and_advance(key, &conv, sink.clone()).await;
        }
    }

    /// Resolve `ack_id` via the global table and delegate to `handle_ack`.
    pub async fn handle_carrier_ack(&self, ack_id: &str, sink: &Arc<dyn ClientOriginSink>) {
        if let Some((_, key)) = self.in_flight_table.remove(ack_id) {
            self.handle_ack_unconditional(&key, sink).await;
        }
    }

    async fn handle_ack_unconditional(&self, key: &str, sink: &Arc<dyn ClientOriginSink>) {
        let Some(conv) = self.conversations.get(key).map(|e| e.clone()) else {
            return;
        };
        self.release_and_advance(key, &conv, sink.clone()).await;
    }

    /// Unconditionally release the slot (used when the Router fails before
    /// an ack is ever expected — a deferred release so the slot is never
    /// left locked by a message that never reached the point of awaiting one).
    pub async fn handle_failure(&self, key: &str, sink: &Arc<dyn ClientOriginSink>) {
        let Some(conv) = self.conversations.get(key).map(|e| e.clone()) else {
            return;
        };
        self.release_and_advance(key, &conv, sink.clone()).await;
    }

    async fn release_and_advance(&self, key: &str, conv: &Arc<Conversation>, sink: Arc<dyn ClientOriginSink>) {
        *conv.last_activity.lock().await = Instant::now();
        let next = {
            let mut state = conv.state.lock().await;
            state.in_flight = false;
            state.expected_ack_id.clear();
            match state.queue.pop_front() {
                Some(env) => {
                    state.in_flight = true;
                    Some(env)
                }
                None => None,
            }
        };
        let _ = key;
        if let Some(env) = next {
            sink.dispatch_client_origin(env).await;
        }
    }

    /// Drop conversation entries idle (empty queue, not in flight) longer
    /// than `idle_ttl`. Intended to run on a
    /// periodic background task.
    pub async fn sweep_idle(&self) -> usize {
        let mut to_remove = Vec::new();
        for entry in self.conversations.iter() {
            let conv = entry.value();
            let idle_for = conv.last_activity.lock().await.elapsed();
            let state = conv.state.lock().await;
            if state.idle() && idle_for > self.idle_ttl {
                to_remove.push(entry.key().clone());
            }
        }
        for key in &to_remove {
            self.conversations.remove(key);
        }
        to_remove.len()
    }

    /// Defensive secondary sweep of the global in-flight table for entries
    /// whose conversation no longer exists or is no longer in flight
    /// (SPEC_FULL.md §B) — not load-bearing given the timeout-releases
    /// contract, but guards against a carrier that never acks and whose
    /// conversation was later GC'd.
    pub fn sweep_stale_ack_table(&self) -> usize {
        let mut to_remove = Vec::new();
        for entry in self.in_flight_table.iter() {
            if !self.conversations.contains_key(entry.value()) {
                to_remove.push(entry.key().clone());
            }
        }
        for key in &to_remove {
            self.in_flight_table.remove(key);
        }
        to_remove.len()
    }

    #[cfg(test)]
    async fn in_flight(&self, key: &str) -> bool {
        match self.conversations.get(key) {
            Some(conv) => conv.state.lock().await.in_flight,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingSink {
        received: Mutex<Vec<Envelope>>,
        count: AtomicUsize,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(RecordingSink {
                received: Mutex::new(Vec::new()),
                count: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ClientOriginSink for RecordingSink {
        async fn dispatch_client_origin(&self, envelope: Envelope) {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.received.lock().await.push(envelope);
        }
    }

    #[tokio::test]
    async fn first_message_dispatches_immediately_second_waits() {
        let mgr = Arc::new(ConversationManager::new(
            Duration::from_secs(10),
            Duration::from_secs(3600),
        ));
        let sink = RecordingSink::new();
        let key = correlation_key("+1", "+2");
        let sink_dyn: Arc<dyn ClientOriginSink> = sink.clone();

        let e1 = crate::envelope::Envelope::new("+2", "+1", MessageKind::Sms).with_text("one");
        let e2 = crate::envelope::Envelope::new("+2", "+1", MessageKind::Sms).with_text("two");

        mgr.add(&key, e1, &sink_dyn).await;
        mgr.add(&key, e2, &sink_dyn).await;

        assert_eq!(sink.count.load(Ordering::SeqCst), 1);
        assert!(mgr.in_flight(&key).await);
    }

    #[tokio::test]
    async fn ack_releases_slot_and_advances_queue() {
        let mgr = Arc::new(ConversationManager::new(
            Duration::from_secs(10),
            Duration::from_secs(3600),
        ));
        let sink = RecordingSink::new();
        let sink_dyn: Arc<dyn ClientOriginSink> = sink.clone();
        let key = correlation_key("+1", "+2");

        let e1 = crate::envelope::Envelope::new("+2", "+1", MessageKind::Sms).with_text("one");
        let e2 = crate::envelope::Envelope::new("+2", "+1", MessageKind::Sms).with_text("two");
        mgr.add(&key, e1, &sink_dyn).await;
        mgr.add(&key, e2, &sink_dyn).await;

        mgr.set_expected_ack(&key, "ack-1".to_string(), sink_dyn.clone())
            .await;
        mgr.handle_ack(&key, "ack-1", &sink_dyn).await;

        assert_eq!(sink.count.load(Ordering::SeqCst), 2);
        assert!(mgr.in_flight(&key).await);
    }

    #[tokio::test]
    async fn carrier_ack_resolves_via_global_table() {
        let mgr = Arc::new(ConversationManager::new(
            Duration::from_secs(10),
            Duration::from_secs(3600),
        ));
        let sink = RecordingSink::new();
        let sink_dyn: Arc<dyn ClientOriginSink> = sink.clone();
        let key = correlation_key("+1", "+2");

        let e1 = crate::envelope::Envelope::new("+2", "+1", MessageKind::Sms).with_text("one");
        mgr.add(&key, e1, &sink_dyn).await;
        mgr.set_expected_ack(&key, "carrier-ack-7".to_string(), sink_dyn.clone())
            .await;

        mgr.handle_carrier_ack("carrier-ack-7", &sink_dyn).await;
        assert!(!mgr.in_flight(&key).await);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_timeout_releases_slot_fail_open() {
        let mgr = Arc::new(ConversationManager::new(
            Duration::from_millis(50),
            Duration::from_secs(3600),
        ));
        let sink = RecordingSink::new();
        let sink_dyn: Arc<dyn ClientOriginSink> = sink.clone();
        let key = correlation_key("+1", "+2");

        let e1 = crate::envelope::Envelope::new("+2", "+1", MessageKind::Sms).with_text("one");
        let e2 = crate::envelope::Envelope::new("+2", "+1", MessageKind::Sms).with_text("two");
        mgr.add(&key, e1, &sink_dyn).await;
        mgr.add(&key, e2, &sink_dyn).await;
        mgr.set_expected_ack(&key, "ack-timeout".to_string(), sink_dyn.clone())
            .await;

        tokio::time::advance(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(1)).await;
        tokio::task::yield_now().await;

        assert_eq!(sink.count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn handle_failure_releases_unconditionally() {
        let mgr = Arc::new(ConversationManager::new(
            Duration::from_secs(10),
            Duration::from_secs(3600),
        ));
        let sink = RecordingSink::new();
        let sink_dyn: Arc<dyn ClientOriginSink> = sink.clone();
        let key = correlation_key("+1", "+2");

        let e1 = crate::envelope::Envelope::new("+2", "+1", MessageKind::Sms).with_text("one");
        mgr.add(&key, e1, &sink_dyn).await;
        assert!(mgr.in_flight(&key).await);
        mgr.handle_failure(&key, &sink_dyn).await;
        assert!(!mgr.in_flight(&key).await);
    }
}
