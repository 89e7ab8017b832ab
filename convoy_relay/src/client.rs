// Blocking TCP client for the stream transport.
//
// Used by the integration tests and by ad-hoc tooling that wants to poke a
// running relay. Architecture:
// - `connect()` performs the TCP connect and reads the greeting (`HOLA`, then
//   `MAPS` or `MAPC`, then `VCHK`) on the calling thread, then spawns a
//   background reader thread.
// - The reader thread calls `read_frame()` in a loop and pushes each line
//   into an `mpsc` channel.
// - The calling thread holds a `BufWriter<TcpStream>` for sending.
// - `poll()` drains the inbox non-blocking; `recv_timeout()` waits for one.
//
// Frames are raw bytes. The client knows the greeting opcodes and nothing
// else; callers match on the opcode prefix themselves.

use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use convoy_protocol::{Frame, OPCODE_LEN, Opcode, PlayerId, read_frame, write_frame};

use crate::error::{RelayError, Result};

/// How long `connect()` waits for each greeting frame.
const GREETING_TIMEOUT: Duration = Duration::from_secs(5);

/// What the relay told us when we connected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Greeting {
    pub id: PlayerId,
    /// `None` when the relay asked us to pick a map (`MAPS`).
    pub map: Option<String>,
    pub version: String,
}

/// TCP client for the relay's stream transport.
pub struct RelayClient {
    writer: BufWriter<TcpStream>,
    inbox: Receiver<Vec<u8>>,
    local_addr: SocketAddr,
}

impl RelayClient {
    /// Connect, read the greeting, and start the reader thread.
    pub fn connect(addr: SocketAddr) -> Result<(Self, Greeting)> {
        let stream = TcpStream::connect(addr)?;
        let local_addr = stream.local_addr()?;
        stream.set_read_timeout(Some(GREETING_TIMEOUT))?;

        let mut reader = BufReader::new(stream.try_clone()?);
        let writer = BufWriter::new(stream);

        let hello = next_greeting_frame(&mut reader)?;
        if !hello.starts_with(b"HOLA") {
            return Err(unexpected("HOLA", &hello));
        }
        let id = Frame::parse(&hello)
            .payload_text()
            .parse::<PlayerId>()
            .map_err(|e| RelayError::Greeting(format!("bad player id: {e}")))?;

        let map_frame = next_greeting_frame(&mut reader)?;
        let map = match map_frame.get(..OPCODE_LEN) {
            Some(b"MAPS") => None,
            Some(b"MAPC") => Some(Frame::parse(&map_frame).payload_text()),
            _ => return Err(unexpected("MAPS or MAPC", &map_frame)),
        };

        let version_frame = next_greeting_frame(&mut reader)?;
        if !version_frame.starts_with(b"VCHK") {
            return Err(unexpected("VCHK", &version_frame));
        }
        let version = Frame::parse(&version_frame).payload_text();

        // The reader thread blocks for as long as the connection lives.
        reader.get_ref().set_read_timeout(None)?;
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            while let Ok(Some(frame)) = read_frame(&mut reader) {
                if tx.send(frame).is_err() {
                    break;
                }
            }
        });

        Ok((
            Self {
                writer,
                inbox: rx,
                local_addr,
            },
            Greeting { id, map, version },
        ))
    }

    /// Our side of the connection, which is how the relay keys us.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send one frame (opcode and payload, without terminator).
    pub fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        write_frame(&mut self.writer, frame)?;
        Ok(())
    }

    /// Send `opcode` followed by `payload`.
    pub fn send_opcode(&mut self, opcode: Opcode, payload: &str) -> Result<()> {
        let mut frame = opcode.to_string().into_bytes();
        frame.extend_from_slice(payload.as_bytes());
        self.send_frame(&frame)
    }

    /// Drain all frames received so far (non-blocking).
    pub fn poll(&self) -> Vec<Vec<u8>> {
        self.inbox.try_iter().collect()
    }

    /// Wait up to `timeout` for the next frame. `None` on timeout or once the
    /// relay has closed the connection.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        match self.inbox.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Send `QUIT` and close our write half. Incoming frames still queued in
    /// the inbox remain readable.
    pub fn quit(&mut self) -> Result<()> {
        self.send_opcode(Opcode::Quit, "")?;
        self.writer.get_ref().shutdown(Shutdown::Write)?;
        Ok(())
    }
}

fn next_greeting_frame(reader: &mut BufReader<TcpStream>) -> Result<Vec<u8>> {
    read_frame(reader)?
        .ok_or_else(|| RelayError::Greeting("connection closed during greeting".into()))
}

fn unexpected(wanted: &str, frame: &[u8]) -> RelayError {
    RelayError::Greeting(format!(
        "expected {wanted}, got {:?}",
        String::from_utf8_lossy(frame)
    ))
}
