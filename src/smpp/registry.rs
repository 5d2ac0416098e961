// ABOUTME: Maps a bound client's username to the session task that can deliver to it
// ABOUTME: Implements `router::SmppOutbound` so the Router never depends on session internals

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

use crate::envelope::Envelope;
use crate::router::SmppOutbound;

/// One outbound delivery handed to a bound session's task. `respond` carries
/// the outcome back to the Router once the session has a carrier-equivalent
/// ack (a `deliver_sm_resp`) or gives up after `smpp_retries`.
pub struct DeliverJob {
    pub envelope: Envelope,
    pub respond: oneshot::Sender<Result<(), String>>,
}

struct Registered {
    deliver: mpsc::UnboundedSender<DeliverJob>,
    evict: oneshot::Sender<()>,
}

/// Registered receivers, keyed by `system_id`. A client bound
/// `Tx`-only is never registered here since it cannot receive `deliver_sm`.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Registered>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(SessionRegistry::default())
    }

    /// Register a freshly-bound session. If `system_id` already has a
    /// session registered, it is evicted first by firing its `evict`
    /// one-shot, which the old session's select loop observes and uses to
    /// close its connection.
    pub fn register(
        &self,
        system_id: String,
        deliver: mpsc::UnboundedSender<DeliverJob>,
        evict: oneshot::Sender<()>,
    ) {
        let prior = self.sessions.insert(system_id, Registered { deliver, evict });
        if let Some(prior) = prior {
            let _ = prior.evict.send(());
        }
    }

    pub fn deregister(&self, system_id: &str) {
        self.sessions.remove(system_id);
    }

    /// Number of bound receiver/transceiver sessions, surfaced by `GET /stats`.
    pub fn active_session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[async_trait]
impl SmppOutbound for SessionRegistry {
    async fn has_active_session(&self, username: &str) -> bool {
        self.sessions.contains_key(username)
    }

    async fn send(&self, username: &str, envelope: &Envelope) -> Result<(), String> {
        let tx = self
            .sessions
            .get(username)
            .map(|e| e.deliver.clone())
            .ok_or_else(|| "no active SMPP session".to_string())?;
        let (respond, done) = oneshot::channel();
        tx.send(DeliverJob {
            envelope: envelope.clone(),
            respond,
        })
        .map_err(|_| "session task no longer running".to_string())?;
        done.await.map_err(|_| "session dropped delivery job".to_string())?
    }
}
