// Relay configuration.
//
// All three transports hang off one base port `P`: stream on `P`, datagram on
// `P + 1`, WebSocket echo on `P + 2`, so `P` is at most `MAX_BASE_PORT`.
// Tests bind each transport to port 0 instead so the OS picks free ports; the
// actual addresses come back from `start_relay`.
//
// The two routing policies exist because the historical relay behaviour is
// kept available for unmodified clients while the cleaner behaviour is the
// default (see DESIGN.md for the reasoning).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::ValueEnum;

use crate::error::{RelayError, Result};

/// Default base port.
pub const DEFAULT_PORT: u16 = 30813;

/// Highest base port that leaves room for the two derived ports.
pub const MAX_BASE_PORT: u16 = u16::MAX - 2;

/// Protocol version announced in `VCHK`.
pub const PROTOCOL_VERSION: &str = "0.0.3";

/// Default time after which a silent datagram endpoint is forgotten.
pub const DEFAULT_EXPIRE_TIME: Duration = Duration::from_secs(30);

/// What to do with a frame whose opcode is not in the table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum UnknownOpcodePolicy {
    /// Relay the raw frame to every peer on the same transport, sender
    /// included. Clients rely on this for vehicle packets the relay does not
    /// know by name.
    #[default]
    Broadcast,
    /// Log and discard.
    Drop,
}

/// Which stream peers receive a single-axis vehicle update (`U-V*`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum VehicleRelayFilter {
    /// Everyone whose `(ip, port)` differs from the sender's.
    #[default]
    ExcludeSender,
    /// The historical condition: a peer receives the update when its port
    /// differs from the sender's and either its ip also differs or matches.
    /// Peers on another host that happen to share the sender's port are
    /// skipped.
    Legacy,
}

/// Configuration for starting a relay.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub host: IpAddr,
    pub stream_port: u16,
    pub datagram_port: u16,
    pub broadcast_port: u16,
    /// Silence after which a datagram endpoint is dropped. The sweep runs
    /// every `2 * expire_time`.
    pub expire_time: Duration,
    pub protocol_version: String,
    pub unknown_opcodes: UnknownOpcodePolicy,
    pub vehicle_relay: VehicleRelayFilter,
    /// Push a fresh roster to every stream peer after an effective `C-VS`.
    pub roster_on_vehicle_change: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::on_ports(DEFAULT_PORT, DEFAULT_PORT + 1, DEFAULT_PORT + 2)
    }
}

impl RelayConfig {
    fn on_ports(stream_port: u16, datagram_port: u16, broadcast_port: u16) -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            stream_port,
            datagram_port,
            broadcast_port,
            expire_time: DEFAULT_EXPIRE_TIME,
            protocol_version: PROTOCOL_VERSION.into(),
            unknown_opcodes: UnknownOpcodePolicy::default(),
            vehicle_relay: VehicleRelayFilter::default(),
            roster_on_vehicle_change: false,
        }
    }

    /// Config with the three transports on `port`, `port + 1` and `port + 2`.
    /// Fails when a derived port would not fit in a `u16`.
    pub fn with_base_port(port: u16) -> Result<Self> {
        match (port.checked_add(1), port.checked_add(2)) {
            (Some(datagram), Some(broadcast)) => Ok(Self::on_ports(port, datagram, broadcast)),
            _ => Err(RelayError::PortRange { port }),
        }
    }

    /// Config bound to localhost with OS-assigned ports on every transport.
    pub fn ephemeral() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..Self::on_ports(0, 0, 0)
        }
    }

    pub fn stream_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.stream_port)
    }

    pub fn datagram_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.datagram_port)
    }

    pub fn broadcast_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.broadcast_port)
    }

    /// Interval between endpoint expiry sweeps.
    pub fn sweep_interval(&self) -> Duration {
        self.expire_time * 2
    }
}
