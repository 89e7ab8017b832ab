// Opcode dispatch for the datagram (UDP) transport.
//
// Datagram peers are disjoint from stream peers: a datagram is only ever
// relayed to endpoints in the `EndpointTable`. Every datagram refreshes its
// sender before routing, whatever its opcode. Relays forward the datagram
// bytes untouched; only the opcode is read, from the whitespace-trimmed
// datagram.
//
// Routing:
// - PING                          -> PONG to the sender only
// - U-VC                          -> every endpoint, sender included
// - U-VR U-VL U-VP U-VN U-VE U-VI -> every endpoint except the sender
// - anything else (U-VV included) -> `UnknownOpcodePolicy`
//
// A failed send is logged for that endpoint; it does not stop the fan-out and
// does not evict the endpoint. Only the sweep evicts.

use std::net::{SocketAddr, UdpSocket};
use std::time::Instant;

use convoy_protocol::{Frame, Opcode, ServerFrame, VehicleField};
use tracing::{debug, warn};

use crate::config::UnknownOpcodePolicy;
use crate::endpoints::EndpointTable;
use crate::error::Result;

/// Routes inbound datagrams to known endpoints.
#[derive(Clone, Copy, Debug, Default)]
pub struct DatagramDispatcher {
    pub unknown_opcodes: UnknownOpcodePolicy,
}

impl DatagramDispatcher {
    pub fn new(unknown_opcodes: UnknownOpcodePolicy) -> Self {
        Self { unknown_opcodes }
    }

    /// Handle one datagram from `from` received at `now`.
    pub fn handle_datagram(
        &self,
        endpoints: &mut EndpointTable,
        socket: &UdpSocket,
        from: SocketAddr,
        data: &[u8],
        now: Instant,
    ) -> Result<()> {
        endpoints.touch(from, now);

        let frame = Frame::parse(data);
        match frame.opcode {
            Opcode::Ping => send_or_log(socket, &ServerFrame::Pong.encode()?, from),
            Opcode::VehicleCreate => relay(endpoints, socket, data, |_| true),
            Opcode::VehicleUpdate(field) if is_single_axis(field) => {
                relay(endpoints, socket, data, |peer| peer != from);
            }
            _ => match self.unknown_opcodes {
                UnknownOpcodePolicy::Broadcast => relay(endpoints, socket, data, |_| true),
                UnknownOpcodePolicy::Drop => {
                    debug!(%from, len = data.len(), "dropping unhandled datagram");
                }
            },
        }
        Ok(())
    }
}

/// Single-axis vehicle updates are never echoed back to their sender.
/// Velocity is not among them on this transport.
fn is_single_axis(field: VehicleField) -> bool {
    !matches!(field, VehicleField::Velocity)
}

fn relay(
    endpoints: &EndpointTable,
    socket: &UdpSocket,
    data: &[u8],
    filter: impl Fn(SocketAddr) -> bool,
) {
    for peer in endpoints.iter().filter(|peer| filter(*peer)) {
        send_or_log(socket, data, peer);
    }
}

fn send_or_log(socket: &UdpSocket, data: &[u8], to: SocketAddr) {
    if let Err(e) = socket.send_to(data, to) {
        warn!(%to, error = %e, "datagram send failed");
    }
}
