//! In-memory session.
//!
//! Stands in for a connected XMPP client: tracks presence per identity,
//! broadcasts presence events and encodes then records every delivered
//! request. Sends can be scripted to fail so the delivery path can be
//! exercised without a server.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use crate::{
    BareJid, FullJid, PresenceDirectory, PresenceEvent, Query, SendError, Sender, SessionEvents,
};

/// Buffer of the presence broadcast channel.
const PRESENCE_BUFFER: usize = 64;

#[derive(Default)]
struct LoopbackState {
    presence: BTreeMap<BareJid, Vec<String>>,
    delivered: Vec<(FullJid, Query)>,
    scripted_failures: VecDeque<SendError>,
    latency: Option<Duration>,
}

/// Loopback session. Cheap to clone, all clones share state.
#[derive(Clone)]
pub struct LoopbackSession {
    state: Arc<Mutex<LoopbackState>>,
    presence_tx: broadcast::Sender<PresenceEvent>,
    delivered_tx: Arc<watch::Sender<usize>>,
}

impl Default for LoopbackSession {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackSession {
    pub fn new() -> Self {
        let (presence_tx, _) = broadcast::channel(PRESENCE_BUFFER);
        let (delivered_tx, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(LoopbackState::default())),
            presence_tx,
            delivered_tx: Arc::new(delivered_tx),
        }
    }

    // ── Presence simulation ──────────────────────────────────────────

    /// Mark a resource as connected.
    pub fn set_available(&self, full: FullJid) {
        {
            let mut state = self.state.lock();
            let resources = state.presence.entry(full.bare().clone()).or_default();
            if !resources.iter().any(|r| r == full.resource()) {
                resources.push(full.resource().to_string());
            }
        }
        tracing::trace!(%full, "loopback: available");
        let _ = self.presence_tx.send(PresenceEvent::Available(full));
    }

    /// Mark a resource as gone. Emits `IdentityOffline` after the last one.
    pub fn set_unavailable(&self, full: FullJid) {
        let now_offline = {
            let mut state = self.state.lock();
            match state.presence.get_mut(full.bare()) {
                Some(resources) => {
                    resources.retain(|r| r != full.resource());
                    if resources.is_empty() {
                        state.presence.remove(full.bare());
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        tracing::trace!(%full, now_offline, "loopback: unavailable");
        let bare = full.bare().clone();
        let _ = self.presence_tx.send(PresenceEvent::Unavailable(full));
        if now_offline {
            let _ = self.presence_tx.send(PresenceEvent::IdentityOffline(bare));
        }
    }

    /// Drop every resource of an identity at once.
    pub fn set_offline(&self, bare: &BareJid) {
        self.state.lock().presence.remove(bare);
        let _ = self
            .presence_tx
            .send(PresenceEvent::IdentityOffline(bare.clone()));
    }

    /// Simulate the stream going away.
    pub fn tear_down(&self) {
        self.state.lock().presence.clear();
        let _ = self.presence_tx.send(PresenceEvent::SessionTornDown);
    }

    // ── Send scripting ───────────────────────────────────────────────

    /// Fail the next send with `error`. Queued failures apply in order.
    pub fn fail_next(&self, error: SendError) {
        self.state.lock().scripted_failures.push_back(error);
    }

    /// Delay every send by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().latency = latency;
    }

    // ── Inspection ───────────────────────────────────────────────────

    /// All requests accepted so far, in delivery order.
    pub fn delivered(&self) -> Vec<(FullJid, Query)> {
        self.state.lock().delivered.clone()
    }

    pub fn delivered_count(&self) -> usize {
        self.state.lock().delivered.len()
    }

    /// Wait until at least `count` requests have been accepted.
    pub async fn wait_delivered(&self, count: usize) {
        let mut rx = self.delivered_tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|n| *n >= count).await;
    }
}

#[async_trait::async_trait]
impl Sender for LoopbackSession {
    async fn send_request(&self, to: &FullJid, payload: &Query) -> Result<(), SendError> {
        let latency = self.state.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if let Err(err) = payload.to_bytes() {
            return Err(SendError::fatal(err.to_string()));
        }

        let mut state = self.state.lock();
        if let Some(err) = state.scripted_failures.pop_front() {
            return Err(err);
        }
        let present = state
            .presence
            .get(to.bare())
            .is_some_and(|r| r.iter().any(|res| res == to.resource()));
        if !present {
            return Err(SendError::transient(format!(
                "recipient-unavailable: {to}"
            )));
        }
        state.delivered.push((to.clone(), payload.clone()));
        let count = state.delivered.len();
        drop(state);
        self.delivered_tx.send_replace(count);
        Ok(())
    }
}

impl SessionEvents for LoopbackSession {
    fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.presence_tx.subscribe()
    }
}

impl PresenceDirectory for LoopbackSession {
    fn present_resources(&self, peer: &BareJid) -> Vec<String> {
        self.state
            .lock()
            .presence
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }
}
