use serde::{Deserialize, Serialize};

use crate::{BareJid, HintTransportError};

/// Default client-to-server port used with a host override.
pub const DEFAULT_PORT: u16 = 5222;

/// A configured peer and the permissions granted to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuddyConfig {
    pub jid: BareJid,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Configuration for a messaging session.
///
/// Only the account address and password are required. Use the builder
/// methods for the rest:
///
/// ```rust
/// use hint_transport::SessionConfig;
///
/// let config = SessionConfig::new("sensor@example.net", "secret")
///     .unwrap()
///     .host("10.0.0.2", 5223);
/// assert_eq!(config.peer_override(), Some(("10.0.0.2", 5223)));
/// ```
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub(crate) jid: BareJid,
    pub(crate) password: String,
    /// Connect here instead of resolving the account domain.
    pub(crate) host: Option<(String, u16)>,
    /// Public key pin for the server certificate.
    pub(crate) public_key_pin: Option<String>,
    pub(crate) buddies: Vec<BuddyConfig>,
}

impl SessionConfig {
    /// Create a config for the given account.
    ///
    /// If the `HINT_XMPP_HOST` environment variable is set, it is used as
    /// the host override on [`DEFAULT_PORT`]. [`.host()`](Self::host)
    /// replaces it.
    pub fn new(jid: &str, password: &str) -> Result<Self, HintTransportError> {
        let jid: BareJid = jid.parse()?;
        if password.is_empty() {
            return Err(HintTransportError::Config("empty password".into()));
        }
        let host = std::env::var("HINT_XMPP_HOST")
            .ok()
            .filter(|h| !h.is_empty())
            .map(|h| (h, DEFAULT_PORT));

        Ok(Self {
            jid,
            password: password.to_string(),
            host,
            public_key_pin: None,
            buddies: Vec::new(),
        })
    }

    /// Connect to a fixed host and port.
    pub fn host(mut self, host: &str, port: u16) -> Self {
        self.host = Some((host.to_string(), port));
        self
    }

    /// Pin the server's public key.
    pub fn public_key_pin(mut self, pin: &str) -> Self {
        self.public_key_pin = Some(pin.to_string());
        self
    }

    /// Replace the configured buddy list.
    pub fn buddies(mut self, buddies: Vec<BuddyConfig>) -> Self {
        self.buddies = buddies;
        self
    }

    pub fn jid(&self) -> &BareJid {
        &self.jid
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn peer_override(&self) -> Option<(&str, u16)> {
        self.host.as_ref().map(|(h, p)| (h.as_str(), *p))
    }

    pub fn pin(&self) -> Option<&str> {
        self.public_key_pin.as_deref()
    }

    pub fn buddy_list(&self) -> &[BuddyConfig] {
        &self.buddies
    }
}
