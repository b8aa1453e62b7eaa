/// Configured peer roster.
use std::collections::BTreeSet;

use hint_transport::{BareJid, BuddyConfig};

/// Wildcard permission granting every key.
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, Default)]
pub struct Buddies {
    entries: Vec<(BareJid, BTreeSet<String>)>,
}

impl Buddies {
    pub fn from_config(config: &[BuddyConfig]) -> Self {
        Self {
            entries: config
                .iter()
                .map(|buddy| (buddy.jid.clone(), buddy.permissions.iter().cloned().collect()))
                .collect(),
        }
    }

    /// Peers holding every permission in `keys`, or the wildcard.
    pub fn by_permissions<'a>(&'a self, keys: &'a [&str]) -> impl Iterator<Item = &'a BareJid> + 'a {
        self.entries.iter().filter_map(move |(jid, perms)| {
            let granted = perms.contains(WILDCARD) || keys.iter().all(|k| perms.contains(*k));
            granted.then_some(jid)
        })
    }

    pub fn jids(&self) -> impl Iterator<Item = &BareJid> {
        self.entries.iter().map(|(jid, _)| jid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
