//! Hint telemetry session layer.
//!
//! Everything the resilience core needs from a messaging session, behind
//! a small stable API: peer addresses, presence events, the request
//! sender and the wire payloads exchanged with the remote collector.
//!
//! The real XMPP stack lives outside this workspace. [`LoopbackSession`]
//! implements every seam in memory so the core can be driven end to end.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use hint_transport::{FullJid, LoopbackSession, Query, SampleBatchesPayload, Sender};
//!
//! # async fn example() -> Result<(), hint_transport::HintTransportError> {
//! let session = LoopbackSession::new();
//! let collector: FullJid = "collector@example.net/sink".parse()?;
//! session.set_available(collector.clone());
//!
//! let payload = Query::SampleBatches(SampleBatchesPayload::new("sensor-hub"));
//! session.send_request(&collector, &payload).await.ok();
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
pub mod loopback;
mod session;
mod wire;

pub use config::{BuddyConfig, SessionConfig, DEFAULT_PORT};
pub use error::{HintTransportError, SendError, SendErrorKind};
pub use loopback::LoopbackSession;
pub use session::{PresenceDirectory, PresenceEvent, Sender, SessionEvents};
pub use wire::{NumericSample, Query, SampleBatchPayload, SampleBatchesPayload, StreamPayload};

use std::fmt;
use std::str::FromStr;

/// Resource-less peer identity (`local@domain`).
///
/// Identifies a logical correspondent independent of which of its
/// sessions is currently connected.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BareJid {
    local: Option<String>,
    domain: String,
}

impl BareJid {
    /// Build from parts. The domain must not be empty.
    pub fn new(local: Option<&str>, domain: &str) -> Result<Self, HintTransportError> {
        let domain = domain.trim();
        if domain.is_empty() || domain.contains(['@', '/']) {
            return Err(HintTransportError::InvalidAddress(domain.to_string()));
        }
        let local = match local {
            Some(l) if l.is_empty() || l.contains(['@', '/']) => {
                return Err(HintTransportError::InvalidAddress(l.to_string()))
            }
            Some(l) => Some(l.to_ascii_lowercase()),
            None => None,
        };
        Ok(Self {
            local,
            domain: domain.to_ascii_lowercase(),
        })
    }

    pub fn local(&self) -> Option<&str> {
        self.local.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Attach a resource, producing a concrete session address.
    pub fn with_resource(&self, resource: &str) -> Result<FullJid, HintTransportError> {
        if resource.is_empty() {
            return Err(HintTransportError::InvalidAddress(format!("{self}/")));
        }
        Ok(FullJid {
            bare: self.clone(),
            resource: resource.to_string(),
        })
    }
}

impl fmt::Display for BareJid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.local {
            Some(local) => write!(f, "{local}@{}", self.domain),
            None => f.write_str(&self.domain),
        }
    }
}

impl fmt::Debug for BareJid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BareJid({self})")
    }
}

impl FromStr for BareJid {
    type Err = HintTransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains('/') {
            return Err(HintTransportError::InvalidAddress(s.to_string()));
        }
        match s.split_once('@') {
            Some((local, domain)) => Self::new(Some(local), domain),
            None => Self::new(None, s),
        }
    }
}

/// Concrete session address: a peer identity plus one connected resource.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FullJid {
    bare: BareJid,
    resource: String,
}

impl FullJid {
    pub fn bare(&self) -> &BareJid {
        &self.bare
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Same identity, different resource.
    pub fn replace_resource(&self, resource: &str) -> Result<Self, HintTransportError> {
        self.bare.with_resource(resource)
    }
}

impl fmt::Display for FullJid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bare, self.resource)
    }
}

impl fmt::Debug for FullJid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FullJid({self})")
    }
}

impl FromStr for FullJid {
    type Err = HintTransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (bare, resource) = s
            .split_once('/')
            .ok_or_else(|| HintTransportError::InvalidAddress(s.to_string()))?;
        bare.parse::<BareJid>()?.with_resource(resource)
    }
}

macro_rules! string_serde {
    ($ty:ty) => {
        impl serde::Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> serde::Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(BareJid);
string_serde!(FullJid);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_jid() {
        let jid: FullJid = "Collector@Example.net/sink-1".parse().unwrap();
        assert_eq!(jid.bare().local(), Some("collector"));
        assert_eq!(jid.bare().domain(), "example.net");
        assert_eq!(jid.resource(), "sink-1");
        assert_eq!(jid.to_string(), "collector@example.net/sink-1");
    }

    #[test]
    fn resource_keeps_slashes() {
        let jid: FullJid = "a@b/c/d".parse().unwrap();
        assert_eq!(jid.resource(), "c/d");
    }

    #[test]
    fn bare_rejects_resource() {
        assert!("a@b/c".parse::<BareJid>().is_err());
        assert!("".parse::<BareJid>().is_err());
        assert!("@domain".parse::<BareJid>().is_err());
    }

    #[test]
    fn full_requires_resource() {
        assert!("a@b".parse::<FullJid>().is_err());
        assert!("a@b/".parse::<FullJid>().is_err());
    }

    #[test]
    fn domain_only_identity() {
        let jid: BareJid = "example.net".parse().unwrap();
        assert_eq!(jid.local(), None);
        assert_eq!(jid.to_string(), "example.net");
    }

    #[test]
    fn replace_resource_keeps_identity() {
        let jid: FullJid = "a@b/one".parse().unwrap();
        let other = jid.replace_resource("two").unwrap();
        assert_eq!(other.bare(), jid.bare());
        assert_ne!(other, jid);
    }

    #[test]
    fn serde_as_string() {
        let jid: FullJid = "a@b/c".parse().unwrap();
        let json = serde_json::to_string(&jid).unwrap();
        assert_eq!(json, "\"a@b/c\"");
        let back: FullJid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, jid);
    }
}
