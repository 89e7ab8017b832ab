// convoy_protocol: wire protocol for the Convoy multiplayer relay.
//
// Defines the vocabulary spoken between vehicle-sim clients and the relay
// (`convoy_relay`) on both the TCP stream and the UDP datagram transports.
// Shared by the server and by any Rust client; no networking of its own.
//
// Module overview:
// - `types.rs`:    Identity types: `PeerKey` (remote ip + port) and
//                  `PlayerId` (random v4 UUID shown in rosters).
// - `opcode.rs`:   The 4-byte opcode table and `Frame::parse`, which splits a
//                  raw frame into opcode and payload.
// - `framing.rs`:  Newline-delimited framing for the stream transport.
// - `message.rs`:  Frames the relay originates (`HOLA`, `MAPC`, `PLST`, ...)
//                  and the JSON roster record.
//
// Design decisions:
// - **Opaque payloads.** Vehicle updates are relayed byte-for-byte; only the
//   opcode is ever inspected.
// - **Unknown is a variant, not an error.** Parsing never fails, so routing
//   policy for unrecognized frames lives in the relay's dispatchers.
// - **No async runtime.** Framing works on `std::io::BufRead`/`Write`.

pub mod framing;
pub mod message;
pub mod opcode;
pub mod types;

pub use framing::{MAX_FRAME_SIZE, read_frame, write_frame};
pub use message::{RosterEntry, ServerFrame};
pub use opcode::{Frame, OPCODE_LEN, Opcode, VehicleField};
pub use types::{PeerKey, PlayerId};

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    /// A server frame written to a stream comes back as one frame whose
    /// opcode prefix matches.
    #[test]
    fn server_frame_through_stream_framing() {
        let mut wire = Vec::new();
        let pong = ServerFrame::Pong.encode().unwrap();
        write_frame(&mut wire, &pong).unwrap();
        let hello = ServerFrame::Hello {
            id: PlayerId::generate(),
        }
        .encode()
        .unwrap();
        write_frame(&mut wire, &hello).unwrap();

        let mut cursor = Cursor::new(wire);
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), b"PONG");
        let second = read_frame(&mut cursor).unwrap().unwrap();
        assert!(second.starts_with(b"HOLA"));
        assert_eq!(second.len(), OPCODE_LEN + 36);
    }

    /// Client frames read off the stream parse to the right opcode.
    #[test]
    fn client_frames_parse_after_framing() {
        let mut cursor = Cursor::new(b"C-VS42\r\nU-VL1,2,3\n".to_vec());
        let first = read_frame(&mut cursor).unwrap().unwrap();
        let frame = Frame::parse(&first);
        assert_eq!(frame.opcode, Opcode::VehicleSwitch);
        assert_eq!(frame.payload_text(), "42");

        let second = read_frame(&mut cursor).unwrap().unwrap();
        let frame = Frame::parse(&second);
        assert_eq!(
            frame.opcode,
            Opcode::VehicleUpdate(VehicleField::Position)
        );
        assert_eq!(frame.payload(), b"1,2,3");
    }
}
