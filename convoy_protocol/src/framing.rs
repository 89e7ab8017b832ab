// Newline-delimited framing for the stream transport.
//
// Each frame is an opcode plus payload terminated by a single `\n`. Clients
// may add a `\r`; `Frame::parse` strips it. Datagrams are framed by the
// transport and never go through this module.
//
// `MAX_FRAME_SIZE` bounds a single line so that a client that never sends a
// newline cannot make the reader buffer grow without limit. Vehicle node and
// powertrain updates are the largest frames in practice.

use std::io::{self, BufRead, Read, Write};

/// Maximum length of one frame, excluding the terminating newline (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Write one frame followed by `\n`, then flush.
pub fn write_frame<W: Write>(writer: &mut W, frame: &[u8]) -> io::Result<()> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
                frame.len()
            ),
        ));
    }
    writer.write_all(frame)?;
    writer.write_all(b"\n")?;
    writer.flush()
}

/// Read one frame up to and excluding the next `\n`.
///
/// Returns `Ok(None)` on a clean end of stream. A trailing line without a
/// newline is still returned as a frame. Returns `InvalidData` if the line
/// exceeds `MAX_FRAME_SIZE`.
pub fn read_frame<R: BufRead>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut buf = Vec::new();
    let limit = (MAX_FRAME_SIZE + 1) as u64;
    let read = reader.by_ref().take(limit).read_until(b'\n', &mut buf)?;
    if read == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    } else if buf.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame exceeds {MAX_FRAME_SIZE} bytes without a newline"),
        ));
    }
    Ok(Some(buf))
}
