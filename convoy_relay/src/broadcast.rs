// WebSocket echo channel.
//
// An isolated side channel with no opcodes and no session: every text or
// binary message from any peer goes to every connected peer, the sender
// included. New peers are greeted with `Welcome!`.
//
// Same shape as the stream transport, on a smaller scale: an accept thread,
// one thread per peer, and a hub thread that owns the peer set and receives
// everything over one `mpsc` channel. Peer threads own their `WebSocket` and
// alternate between a short-timeout read and draining the outbound messages
// the hub queued for them, so a peer socket is only touched by its own
// thread.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};
use tungstenite::{Message, WebSocket};

use crate::error::{RelayError, Result};

/// Greeting sent to every new peer.
pub const WELCOME: &str = "Welcome!";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

enum HubEvent {
    Joined { id: u64, outbox: Sender<Message> },
    Message { from: u64, message: Message },
    Left { id: u64 },
}

/// Bind the echo listener and start its accept and hub threads.
pub fn start_broadcast(addr: SocketAddr, keep_running: Arc<AtomicBool>) -> Result<SocketAddr> {
    let listener = TcpListener::bind(addr).map_err(|source| RelayError::Bind {
        transport: "websocket",
        addr,
        source,
    })?;
    let local = listener.local_addr()?;
    listener.set_nonblocking(true)?;
    info!(addr = %local, "websocket echo listening");

    let (hub_tx, hub_rx) = mpsc::channel();
    thread::spawn(move || hub_loop(hub_rx));

    thread::spawn(move || {
        let mut next_id = 0u64;
        while keep_running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let id = next_id;
                    next_id += 1;
                    let hub = hub_tx.clone();
                    let keep_running = keep_running.clone();
                    thread::spawn(move || {
                        if let Err(e) = peer_loop(id, stream, hub.clone(), keep_running) {
                            debug!(%peer, error = %e, "websocket peer ended with error");
                        }
                        let _ = hub.send(HubEvent::Left { id });
                    });
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    warn!(error = %e, "websocket listener failed");
                    break;
                }
            }
        }
    });

    Ok(local)
}

/// Owns the peer set. Ends when every sender (accept thread and peers) is
/// gone.
fn hub_loop(rx: Receiver<HubEvent>) {
    let mut peers: BTreeMap<u64, Sender<Message>> = BTreeMap::new();
    while let Ok(event) = rx.recv() {
        match event {
            HubEvent::Joined { id, outbox } => {
                peers.insert(id, outbox);
            }
            HubEvent::Message { from, message } => {
                debug!(from, peers = peers.len(), "echoing websocket message");
                for outbox in peers.values() {
                    let _ = outbox.send(message.clone());
                }
            }
            HubEvent::Left { id } => {
                peers.remove(&id);
            }
        }
    }
}

fn peer_loop(
    id: u64,
    stream: TcpStream,
    hub: Sender<HubEvent>,
    keep_running: Arc<AtomicBool>,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    let mut socket = tungstenite::accept(stream).map_err(|e| match e {
        tungstenite::HandshakeError::Failure(e) => RelayError::WebSocket(e),
        tungstenite::HandshakeError::Interrupted(_) => {
            RelayError::Io(std::io::Error::from(ErrorKind::WouldBlock))
        }
    })?;
    socket.get_ref().set_read_timeout(Some(POLL_INTERVAL))?;

    let (outbox, inbox) = mpsc::channel();
    if hub.send(HubEvent::Joined { id, outbox }).is_err() {
        return Ok(());
    }
    info!(id, "websocket peer connected");
    socket.send(Message::text(WELCOME))?;

    while keep_running.load(Ordering::SeqCst) {
        match socket.read() {
            Ok(message) if message.is_text() || message.is_binary() => {
                if hub.send(HubEvent::Message { from: id, message }).is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(tungstenite::Error::Io(ref e))
                if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => break,
            Err(e) => return Err(e.into()),
        }
        flush_outbox(&mut socket, &inbox)?;
    }
    info!(id, "websocket peer disconnected");
    Ok(())
}

fn flush_outbox(socket: &mut WebSocket<TcpStream>, inbox: &Receiver<Message>) -> Result<()> {
    while let Ok(message) = inbox.try_recv() {
        socket.send(message)?;
    }
    Ok(())
}
