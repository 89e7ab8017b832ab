// Opcode vocabulary shared by the stream and datagram transports.
//
// Every frame starts with a 4-byte ASCII opcode followed directly by the
// payload. `Frame::parse` trims surrounding whitespace (clients terminate
// lines with `\n` or `\r\n` and sometimes pad datagrams), splits off the
// opcode, and maps it onto `Opcode`. Anything not in the table, including
// frames shorter than four bytes, becomes `Opcode::Unknown` so that routing
// policy stays with the dispatchers rather than the parser.

use std::fmt;

/// Length of the opcode prefix in bytes.
pub const OPCODE_LEN: usize = 4;

/// Which field of a vehicle a single-axis update carries.
///
/// The relay does not interpret the payload; the field only matters for
/// routing (the datagram path does not treat `Velocity` as a single-axis
/// update).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VehicleField {
    /// `U-VI`
    Inputs,
    /// `U-VE`
    Electrics,
    /// `U-VN`
    Nodes,
    /// `U-VP`
    Powertrain,
    /// `U-VL`
    Position,
    /// `U-VR`
    Rotation,
    /// `U-VV`
    Velocity,
}

impl VehicleField {
    pub fn code(self) -> &'static [u8; OPCODE_LEN] {
        match self {
            VehicleField::Inputs => b"U-VI",
            VehicleField::Electrics => b"U-VE",
            VehicleField::Nodes => b"U-VN",
            VehicleField::Powertrain => b"U-VP",
            VehicleField::Position => b"U-VL",
            VehicleField::Rotation => b"U-VR",
            VehicleField::Velocity => b"U-VV",
        }
    }
}

/// Client-originated opcodes understood by the relay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    Ping,
    Chat,
    /// Map proposal (`MAPS`). The server also sends a bare `MAPS` to ask a
    /// fresh client to pick a map.
    MapSelect,
    /// Nickname (`USER`).
    User,
    /// `QUIT`, or the numeric `2001` some clients send instead.
    Quit,
    VehicleUpdate(VehicleField),
    /// `U-VC`
    VehicleCreate,
    /// `U-NV`
    NewVehicle,
    /// `C-VS`: the client switched to another vehicle.
    VehicleSwitch,
    Unknown,
}

impl Opcode {
    /// Map a 4-byte prefix onto an opcode. Prefixes of any other length are
    /// unknown by definition.
    pub fn from_prefix(prefix: &[u8]) -> Self {
        match prefix {
            b"PING" => Opcode::Ping,
            b"CHAT" => Opcode::Chat,
            b"MAPS" => Opcode::MapSelect,
            b"USER" => Opcode::User,
            b"QUIT" | b"2001" => Opcode::Quit,
            b"U-VI" => Opcode::VehicleUpdate(VehicleField::Inputs),
            b"U-VE" => Opcode::VehicleUpdate(VehicleField::Electrics),
            b"U-VN" => Opcode::VehicleUpdate(VehicleField::Nodes),
            b"U-VP" => Opcode::VehicleUpdate(VehicleField::Powertrain),
            b"U-VL" => Opcode::VehicleUpdate(VehicleField::Position),
            b"U-VR" => Opcode::VehicleUpdate(VehicleField::Rotation),
            b"U-VV" => Opcode::VehicleUpdate(VehicleField::Velocity),
            b"U-VC" => Opcode::VehicleCreate,
            b"U-NV" => Opcode::NewVehicle,
            b"C-VS" => Opcode::VehicleSwitch,
            _ => Opcode::Unknown,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code: &[u8] = match self {
            Opcode::Ping => b"PING",
            Opcode::Chat => b"CHAT",
            Opcode::MapSelect => b"MAPS",
            Opcode::User => b"USER",
            Opcode::Quit => b"QUIT",
            Opcode::VehicleUpdate(field) => field.code(),
            Opcode::VehicleCreate => b"U-VC",
            Opcode::NewVehicle => b"U-NV",
            Opcode::VehicleSwitch => b"C-VS",
            Opcode::Unknown => b"????",
        };
        f.write_str(&String::from_utf8_lossy(code))
    }
}

/// A parsed inbound frame: the opcode plus the trimmed raw bytes it came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    pub opcode: Opcode,
    /// The whole frame (opcode and payload) with surrounding whitespace
    /// removed. This is what gets relayed.
    pub raw: &'a [u8],
}

impl<'a> Frame<'a> {
    pub fn parse(bytes: &'a [u8]) -> Self {
        let raw = bytes.trim_ascii();
        let opcode = match raw.get(..OPCODE_LEN) {
            Some(prefix) => Opcode::from_prefix(prefix),
            None => Opcode::Unknown,
        };
        Self { opcode, raw }
    }

    /// Bytes after the opcode. Empty for frames of four bytes or fewer.
    pub fn payload(&self) -> &'a [u8] {
        self.raw.get(OPCODE_LEN..).unwrap_or_default()
    }

    /// Payload decoded as text, replacing invalid UTF-8.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(self.payload()).into_owned()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}
