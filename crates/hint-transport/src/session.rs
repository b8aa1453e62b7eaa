use tokio::sync::broadcast;

use crate::{BareJid, FullJid, Query, SendError};

/// Presence change observed on the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    /// A resource of some identity became available.
    Available(FullJid),
    /// A single resource went away; other resources may remain.
    Unavailable(FullJid),
    /// The identity has no resources left.
    IdentityOffline(BareJid),
    /// The session itself is gone; all presence is void.
    SessionTornDown,
}

/// Sends requests to a concrete peer address and waits for the reply.
///
/// In production: an IQ round trip on the XMPP stream.
/// In tests: [`LoopbackSession`](crate::LoopbackSession).
#[async_trait::async_trait]
pub trait Sender: Send + Sync {
    async fn send_request(&self, to: &FullJid, payload: &Query) -> Result<(), SendError>;
}

/// Source of presence events.
pub trait SessionEvents: Send + Sync {
    /// Subscribe to presence changes from now on.
    fn subscribe(&self) -> broadcast::Receiver<PresenceEvent>;
}

/// Snapshot of which resources an identity currently has online.
pub trait PresenceDirectory: Send + Sync {
    /// Resources of `peer` currently present, in arrival order.
    fn present_resources(&self, peer: &BareJid) -> Vec<String>;
}
