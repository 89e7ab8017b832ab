// Liveness table for datagram peers.
//
// UDP has no connections, so the relay learns about peers from the datagrams
// they send. Every inbound datagram refreshes its sender's last-seen instant
// (`touch`); a periodic `sweep` on the event loop evicts peers that have been
// silent for at least `expire_time`. Nothing is evicted on read: between
// sweeps, a stale peer still receives relayed datagrams.
//
// Callers pass `now` explicitly so the expiry boundary can be tested without
// sleeping.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Known datagram endpoints and when each was last heard from.
pub struct EndpointTable {
    entries: BTreeMap<SocketAddr, Instant>,
    expire_time: Duration,
}

impl EndpointTable {
    pub fn new(expire_time: Duration) -> Self {
        Self {
            entries: BTreeMap::new(),
            expire_time,
        }
    }

    /// Record that `addr` was heard from at `now`. Inserts unknown peers.
    pub fn touch(&mut self, addr: SocketAddr, now: Instant) {
        if self.entries.insert(addr, now).is_none() {
            debug!(%addr, "new datagram endpoint");
        }
    }

    /// Remove every endpoint silent for `expire_time` or longer and return
    /// the removed addresses.
    pub fn sweep(&mut self, now: Instant) -> Vec<SocketAddr> {
        let expire_time = self.expire_time;
        let mut expired = Vec::new();
        self.entries.retain(|addr, last_seen| {
            let alive = now.saturating_duration_since(*last_seen) < expire_time;
            if !alive {
                expired.push(*addr);
            }
            alive
        });
        for addr in &expired {
            warn!(%addr, "dropping expired datagram endpoint");
        }
        expired
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.entries.contains_key(addr)
    }

    pub fn last_seen(&self, addr: &SocketAddr) -> Option<Instant> {
        self.entries.get(addr).copied()
    }

    /// All known endpoints, in address order.
    pub fn iter(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
