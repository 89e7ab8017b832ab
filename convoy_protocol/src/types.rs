// Core identity types for the relay protocol.
//
// `PeerKey` identifies a stream client by its remote `(ip, port)` pair and is
// the lookup key for everything the relay keeps per connection. `PlayerId` is
// the random id handed out in the `HOLA` greeting and shown in the roster; the
// relay never looks players up by it.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Remote address of a connected peer, used directly as a map key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerKey {
    pub ip: IpAddr,
    pub port: u16,
}

impl PeerKey {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for PeerKey {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.socket_addr().fmt(f)
    }
}

/// Display identifier assigned to a player when its stream connects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub Uuid);

impl PlayerId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for PlayerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn peer_key_from_socket_addr() {
        let addr: SocketAddr = "10.0.0.7:4321".parse().unwrap();
        let key = PeerKey::from(addr);
        assert_eq!(key.ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(key.port, 4321);
        assert_eq!(key.socket_addr(), addr);
        assert_eq!(key.to_string(), "10.0.0.7:4321");
    }

    #[test]
    fn player_id_parses_its_own_display() {
        let id = PlayerId::generate();
        assert_eq!(id.to_string().parse::<PlayerId>().unwrap(), id);
        assert!("not-a-uuid".parse::<PlayerId>().is_err());
    }

    #[test]
    fn peer_keys_differ_by_port() {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert_ne!(PeerKey::new(ip, 1000), PeerKey::new(ip, 1001));
    }

    #[test]
    fn generated_player_ids_are_unique() {
        let a = PlayerId::generate();
        let b = PlayerId::generate();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 36);
    }

    #[test]
    fn player_id_serializes_as_plain_string() {
        let id = PlayerId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }
}
