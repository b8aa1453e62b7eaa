/// Presence-driven peer lock.
///
/// For every registered peer identity the lock tracks zero or one concrete
/// address the peer is reachable through right now. Presence events move
/// the lock:
///
/// - a resource of the peer becomes available: lock to it;
/// - the locked resource goes away: relock to any other present resource of
///   the peer, or unlock if there is none;
/// - the identity goes offline, or the session is torn down: unlock.
///
/// Each peer's state is a `watch` channel, so consumers can await the
/// locked condition; a broadcast of [`LockChange`] fires only when the
/// locked address actually changes.
use std::collections::HashMap;
use std::sync::Arc;

use hint_transport::{BareJid, FullJid, PresenceDirectory, PresenceEvent, SessionEvents};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Buffer of the lock change broadcast.
const CHANGE_BUFFER: usize = 64;

/// The locked address of `peer` changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockChange {
    pub peer: BareJid,
    /// New address, `None` when unlocked.
    pub locked_to: Option<FullJid>,
}

/// Read side of one registered peer.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    peer: BareJid,
    rx: watch::Receiver<Option<FullJid>>,
}

impl PeerHandle {
    pub fn peer(&self) -> &BareJid {
        &self.peer
    }

    /// Address currently locked to.
    pub fn current(&self) -> Option<FullJid> {
        self.rx.borrow().clone()
    }

    pub fn is_locked(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Wait until the peer is locked and return the address.
    ///
    /// Returns `None` only if the owning [`PeerLock`] is gone.
    pub async fn wait_locked(&self) -> Option<FullJid> {
        let mut rx = self.rx.clone();
        let locked = rx.wait_for(Option::is_some).await.ok()?;
        locked.clone()
    }

    /// Receiver notified on every change of the locked address.
    pub fn watch(&self) -> watch::Receiver<Option<FullJid>> {
        self.rx.clone()
    }
}

pub struct PeerLock {
    directory: Arc<dyn PresenceDirectory>,
    peers: Mutex<HashMap<BareJid, watch::Sender<Option<FullJid>>>>,
    changes: broadcast::Sender<LockChange>,
}

impl PeerLock {
    pub fn new(directory: Arc<dyn PresenceDirectory>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            directory,
            peers: Mutex::new(HashMap::new()),
            changes,
        }
    }

    /// Track `peer`. Locks right away if the peer already has a resource
    /// present. Registering twice returns a handle to the same state.
    pub fn register(&self, peer: BareJid) -> PeerHandle {
        let mut peers = self.peers.lock();
        if let Some(tx) = peers.get(&peer) {
            return PeerHandle {
                peer,
                rx: tx.subscribe(),
            };
        }

        let initial = self
            .directory
            .present_resources(&peer)
            .into_iter()
            .find_map(|resource| peer.with_resource(&resource).ok());
        if let Some(full) = &initial {
            tracing::debug!(%full, "locked on registration");
        }
        let (tx, rx) = watch::channel(initial);
        peers.insert(peer.clone(), tx);
        PeerHandle { peer, rx }
    }

    /// Subscribe to lock changes of all registered peers.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<LockChange> {
        self.changes.subscribe()
    }

    /// Address `peer` is currently locked to.
    pub fn locked_to(&self, peer: &BareJid) -> Option<FullJid> {
        self.peers.lock().get(peer).and_then(|tx| tx.borrow().clone())
    }

    /// Apply one presence event.
    pub fn handle_event(&self, event: &PresenceEvent) {
        match event {
            PresenceEvent::Available(full) => {
                if self.is_registered(full.bare()) {
                    self.set(full.bare(), Some(full.clone()));
                }
            }
            PresenceEvent::Unavailable(full) => {
                if self.locked_to(full.bare()).as_ref() != Some(full) {
                    return;
                }
                tracing::debug!(%full, "locked-to address is offline, trying another resource");
                let next = self.survivor(full.bare(), Some(full.resource()));
                if next.is_none() {
                    tracing::debug!(peer = %full.bare(), "no more resources to lock to");
                }
                self.set(full.bare(), next);
            }
            PresenceEvent::IdentityOffline(bare) => {
                if self.is_registered(bare) {
                    tracing::debug!(peer = %bare, "peer went offline, unlocking");
                    self.set(bare, None);
                }
            }
            PresenceEvent::SessionTornDown => {
                tracing::debug!("session torn down, unlocking all peers");
                for peer in self.registered() {
                    self.set(&peer, None);
                }
            }
        }
    }

    /// Re-derive every lock from the presence directory. Used after missed
    /// events.
    pub fn resync(&self) {
        for peer in self.registered() {
            let present = self.directory.present_resources(&peer);
            let keep = self
                .locked_to(&peer)
                .filter(|full| present.iter().any(|r| r == full.resource()));
            let next = keep.or_else(|| self.survivor(&peer, None));
            self.set(&peer, next);
        }
    }

    /// Consume presence events until `cancel` fires or the session closes.
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<PresenceEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(&event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "presence receiver lagged, resyncing locks");
                        self.resync();
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::debug!("presence channel closed");
                        return;
                    }
                },
            }
        }
    }

    /// Subscribe to `events` now and follow them in a background task.
    pub fn spawn(self: &Arc<Self>, events: &dyn SessionEvents, cancel: CancellationToken) -> JoinHandle<()> {
        let rx = events.subscribe();
        tokio::spawn(self.clone().run(rx, cancel))
    }

    // ── Internal ───────────────────────────────────────────────────────

    fn is_registered(&self, peer: &BareJid) -> bool {
        self.peers.lock().contains_key(peer)
    }

    fn registered(&self) -> Vec<BareJid> {
        self.peers.lock().keys().cloned().collect()
    }

    /// Any present resource of `peer` other than `except`.
    fn survivor(&self, peer: &BareJid, except: Option<&str>) -> Option<FullJid> {
        self.directory
            .present_resources(peer)
            .into_iter()
            .filter(|resource| Some(resource.as_str()) != except)
            .find_map(|resource| peer.with_resource(&resource).ok())
    }

    fn set(&self, peer: &BareJid, next: Option<FullJid>) {
        let changed = {
            let peers = self.peers.lock();
            let Some(tx) = peers.get(peer) else {
                return;
            };
            tx.send_if_modified(|current| {
                if *current == next {
                    false
                } else {
                    *current = next.clone();
                    true
                }
            })
        };
        if !changed {
            return;
        }
        match &next {
            Some(full) => tracing::debug!(%full, "locked"),
            None => tracing::debug!(%peer, "unlocked"),
        }
        let _ = self.changes.send(LockChange {
            peer: peer.clone(),
            locked_to: next,
        });
    }
}
