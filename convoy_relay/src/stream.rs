// Opcode dispatch for the stream (TCP) transport.
//
// `StreamDispatcher::handle_frame` is called by the event loop once per
// newline-terminated frame, in the order the frames arrived on their
// connection. It parses the opcode and routes to one handler per opcode;
// each handler runs to completion against the `Registry`.
//
// Routing summary:
// - PING                -> PONG to the sender only
// - CHAT, U-VC          -> every connection, sender included
// - MAPS                -> set the map, confirm to the sender
// - USER                -> nickname + roster + join announcement
// - QUIT / 2001         -> stop sending to the sender
// - U-VI .. U-VV        -> everyone but the sender (see `VehicleRelayFilter`)
// - U-NV                -> logged only
// - C-VS                -> record the vehicle switch
// - anything else       -> `UnknownOpcodePolicy`

use convoy_protocol::{Frame, Opcode, PeerKey, ServerFrame, VehicleField};
use tracing::{debug, info, warn};

use crate::config::{RelayConfig, UnknownOpcodePolicy, VehicleRelayFilter};
use crate::error::Result;
use crate::registry::Registry;

/// Routing policy for stream frames.
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamDispatcher {
    pub unknown_opcodes: UnknownOpcodePolicy,
    pub vehicle_relay: VehicleRelayFilter,
    pub roster_on_vehicle_change: bool,
}

impl StreamDispatcher {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            unknown_opcodes: config.unknown_opcodes,
            vehicle_relay: config.vehicle_relay,
            roster_on_vehicle_change: config.roster_on_vehicle_change,
        }
    }

    /// Handle one frame received from `sender`. Blank frames are ignored.
    pub fn handle_frame(
        &self,
        registry: &mut Registry,
        sender: PeerKey,
        bytes: &[u8],
    ) -> Result<()> {
        let frame = Frame::parse(bytes);
        if frame.is_empty() {
            return Ok(());
        }
        match frame.opcode {
            Opcode::Ping => self.ping(registry, sender)?,
            Opcode::Chat | Opcode::VehicleCreate => registry.broadcast(frame.raw),
            Opcode::MapSelect => self.select_map(registry, sender, &frame)?,
            Opcode::User => {
                registry.set_nickname(sender, &frame.payload_text())?;
            }
            Opcode::Quit => {
                registry.drop_connection(sender);
            }
            Opcode::VehicleUpdate(field) => {
                self.relay_vehicle_update(registry, sender, field, &frame)
            }
            Opcode::NewVehicle => {
                info!(peer = %sender, payload = %frame.payload_text(), "new vehicle request");
            }
            Opcode::VehicleSwitch => self.switch_vehicle(registry, sender, &frame),
            Opcode::Unknown => self.unknown(registry, sender, &frame),
        }
        Ok(())
    }

    fn ping(&self, registry: &mut Registry, sender: PeerKey) -> Result<()> {
        registry.send_to(sender, &ServerFrame::Pong.encode()?);
        Ok(())
    }

    fn select_map(
        &self,
        registry: &mut Registry,
        sender: PeerKey,
        frame: &Frame<'_>,
    ) -> Result<()> {
        let map = frame.payload_text();
        registry.set_map(&map);
        registry.send_to(sender, &ServerFrame::MapConfirm { map }.encode()?);
        Ok(())
    }

    fn relay_vehicle_update(
        &self,
        registry: &mut Registry,
        sender: PeerKey,
        field: VehicleField,
        frame: &Frame<'_>,
    ) {
        debug!(peer = %sender, ?field, len = frame.raw.len(), "relaying vehicle update");
        let filter = self.vehicle_relay;
        registry.broadcast_where(|peer| filter.should_relay(sender, peer), frame.raw);
    }

    fn switch_vehicle(&self, registry: &mut Registry, sender: PeerKey, frame: &Frame<'_>) {
        let vehicle_id = frame.payload_text();
        if registry.set_vehicle(sender, &vehicle_id) && self.roster_on_vehicle_change {
            registry.broadcast_roster();
        }
    }

    fn unknown(&self, registry: &mut Registry, sender: PeerKey, frame: &Frame<'_>) {
        let data = String::from_utf8_lossy(frame.raw);
        match self.unknown_opcodes {
            UnknownOpcodePolicy::Broadcast => {
                warn!(peer = %sender, %data, "unhandled frame, relaying to all");
                registry.broadcast(frame.raw);
            }
            UnknownOpcodePolicy::Drop => {
                warn!(peer = %sender, %data, "unhandled frame, dropping");
            }
        }
    }
}

impl VehicleRelayFilter {
    /// Whether a vehicle update from `sender` goes to `peer`.
    pub fn should_relay(self, sender: PeerKey, peer: PeerKey) -> bool {
        match self {
            VehicleRelayFilter::ExcludeSender => peer != sender,
            VehicleRelayFilter::Legacy => {
                (peer.ip != sender.ip && peer.port != sender.port)
                    || (peer.ip == sender.ip && peer.port != sender.port)
            }
        }
    }
}
