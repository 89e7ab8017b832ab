// Server-originated frames and the roster record.
//
// The relay only ever builds a handful of frames itself; everything else it
// sends is a client frame relayed verbatim. `ServerFrame::encode` produces the
// bytes without the stream terminator; the stream transport appends `\n` via
// `framing::write_frame`, the datagram transport sends them as-is.
//
// The roster (`PLST`) payload is a JSON array of `RosterEntry`. Field names
// follow the camelCase keys existing clients already parse.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::types::PlayerId;

/// One player as it appears in a roster broadcast.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    #[serde(rename = "remoteAddress")]
    pub address: IpAddr,
    #[serde(rename = "remotePort")]
    pub port: u16,
    pub nickname: String,
    pub id: PlayerId,
    #[serde(rename = "currentVehID")]
    pub current_vehicle_id: String,
}

/// Frames the relay originates rather than relays.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerFrame {
    /// `HOLA<id>`: first frame on a new stream connection.
    Hello { id: PlayerId },
    /// Bare `MAPS`: no map is set yet, the client should propose one.
    RequestMap,
    /// `MAPC<map>`: the current map.
    MapConfirm { map: String },
    /// `VCHK<version>`: protocol version the relay speaks.
    VersionCheck { version: String },
    /// `PONG`
    Pong,
    /// `PLST<json>`
    PlayerList { players: Vec<RosterEntry> },
    /// `SMSG<text>`: server chat line.
    ServerMessage { text: String },
}

impl ServerFrame {
    /// Announcement sent when a player sets its nickname.
    pub fn joined(nickname: &str) -> Self {
        ServerFrame::ServerMessage {
            text: format!("{nickname} Just Joined the Session."),
        }
    }

    /// Encode to wire bytes (opcode + payload, no terminator).
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let bytes = match self {
            ServerFrame::Hello { id } => format!("HOLA{id}").into_bytes(),
            ServerFrame::RequestMap => b"MAPS".to_vec(),
            ServerFrame::MapConfirm { map } => format!("MAPC{map}").into_bytes(),
            ServerFrame::VersionCheck { version } => format!("VCHK{version}").into_bytes(),
            ServerFrame::Pong => b"PONG".to_vec(),
            ServerFrame::PlayerList { players } => {
                let mut bytes = b"PLST".to_vec();
                serde_json::to_writer(&mut bytes, players)?;
                bytes
            }
            ServerFrame::ServerMessage { text } => format!("SMSG{text}").into_bytes(),
        };
        Ok(bytes)
    }
}
