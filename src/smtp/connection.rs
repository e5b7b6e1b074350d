use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    time::SystemTime,
};

/// Everything known about the remote peer for the lifetime of one TCP
/// connection. Owned exclusively by the session driving it.
#[derive(Debug)]
pub struct Connection {
    peer: SocketAddr,
    started: SystemTime,
    notes: HashMap<String, String>,
    /// Hostname from HELO/EHLO, once seen.
    pub helo_host: Option<String>,
    /// Authenticated or IP-trusted peers bypass policy plugins.
    pub relay_client: bool,
    /// Host-level whitelist flag set at connect time.
    pub whitelisthost: bool,
}

impl Connection {
    #[must_use]
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            started: SystemTime::now(),
            notes: HashMap::default(),
            helo_host: None,
            relay_client: false,
            whitelisthost: false,
        }
    }

    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    #[must_use]
    pub const fn remote_ip(&self) -> IpAddr {
        self.peer.ip()
    }

    #[must_use]
    pub const fn started(&self) -> SystemTime {
        self.started
    }

    #[must_use]
    pub fn note(&self, key: &str) -> Option<&str> {
        self.notes.get(key).map(String::as_str)
    }

    /// Notes are set-once-read-many: the first writer wins and later
    /// writes are refused. Returns whether the note was stored.
    pub fn set_note(&mut self, key: &str, value: impl Into<String>) -> bool {
        match self.notes.entry(key.to_owned()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(value.into());
                true
            }
        }
    }
}
