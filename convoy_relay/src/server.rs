// Listeners and the main event loop.
//
// Architecture: thread-per-reader with a central `mpsc` channel.
//
// - **Stream listener thread**: non-blocking `TcpListener::accept()` loop.
//   Sends `InternalEvent::Accepted` for each connection, or
//   `InternalEvent::ListenerFailed` if the listener faults.
// - **Stream reader threads** (one per client): `read_frame()` in a loop,
//   forwarding each line as `InternalEvent::Frame`. EOF becomes `Closed`, a
//   read error becomes `Failed`; either way the thread exits.
// - **Datagram reader thread**: `recv_from()` with a short timeout, forwarding
//   each datagram as `InternalEvent::Datagram`.
// - **Stream writer threads** (one per client, started by the `Registry`):
//   drain that client's outbox onto its socket.
// - **Main thread**: owns the `Registry` and the `EndpointTable`. It never
//   writes to a stream socket itself, only queues frames, and it is the only
//   sender on the UDP socket. It waits on the channel with
//   `recv_timeout` up to the next sweep deadline and runs the endpoint sweep
//   when the deadline passes, so sweeps and message handling never overlap.
//
// The WebSocket echo channel (`broadcast.rs`) runs on its own threads and
// shares nothing with the loop.
//
// Failure domains: a read error on one client ends that client's session
// only. A stream listener fault ends the loop with `ListenerFailed`, which
// the binary turns into a non-zero exit.

use std::io::{self, BufReader, ErrorKind};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use convoy_protocol::{PeerKey, read_frame};
use tracing::{debug, error, info, warn};

use crate::broadcast::start_broadcast;
use crate::config::RelayConfig;
use crate::datagram::DatagramDispatcher;
use crate::endpoints::EndpointTable;
use crate::error::{RelayError, Result};
use crate::registry::{ConnectionId, Registry};
use crate::stream::StreamDispatcher;

/// Bound on how long a writer thread waits on a client that is not reading.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// How often idle listener and reader threads check `keep_running`.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Largest datagram the relay accepts.
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Events sent from listener/reader threads to the main thread.
enum InternalEvent {
    Accepted {
        stream: TcpStream,
        key: PeerKey,
    },
    Frame {
        key: PeerKey,
        connection: ConnectionId,
        bytes: Vec<u8>,
    },
    Closed {
        key: PeerKey,
        connection: ConnectionId,
    },
    Failed {
        key: PeerKey,
        connection: ConnectionId,
        error: io::Error,
    },
    Datagram {
        from: SocketAddr,
        data: Vec<u8>,
    },
    ListenerFailed {
        error: io::Error,
    },
}

/// Addresses the relay actually bound (useful when port 0 was requested).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelayAddrs {
    pub stream: SocketAddr,
    pub datagram: SocketAddr,
    pub broadcast: SocketAddr,
}

/// Handle returned by `start_relay` to control the running server.
pub struct RelayHandle {
    keep_running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<Result<()>>>,
}

impl RelayHandle {
    /// Signal the relay to stop and wait for it to shut down.
    pub fn stop(mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    /// Wait for the event loop to end on its own and return how it ended.
    pub fn join(mut self) -> Result<()> {
        match self.thread.take() {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("relay thread panicked").into())),
            None => Ok(()),
        }
    }
}

/// Bind all three transports and start the relay on background threads.
/// Returns a handle for stopping it and the bound addresses.
pub fn start_relay(config: RelayConfig) -> Result<(RelayHandle, RelayAddrs)> {
    let stream_addr = config.stream_addr();
    let listener = TcpListener::bind(stream_addr).map_err(|source| RelayError::Bind {
        transport: "stream",
        addr: stream_addr,
        source,
    })?;
    let datagram_addr = config.datagram_addr();
    let socket = UdpSocket::bind(datagram_addr).map_err(|source| RelayError::Bind {
        transport: "datagram",
        addr: datagram_addr,
        source,
    })?;

    let keep_running = Arc::new(AtomicBool::new(true));
    let broadcast = start_broadcast(config.broadcast_addr(), keep_running.clone())?;
    let addrs = RelayAddrs {
        stream: listener.local_addr()?,
        datagram: socket.local_addr()?,
        broadcast,
    };
    info!(addr = %addrs.stream, "stream listening");
    info!(addr = %addrs.datagram, "datagram listening");

    let (tx, rx) = mpsc::channel();
    spawn_stream_listener(listener, tx.clone(), keep_running.clone())?;
    let send_socket = socket.try_clone()?;
    spawn_datagram_reader(socket, tx.clone(), keep_running.clone())?;

    let keep_running_loop = keep_running.clone();
    let thread = thread::spawn(move || {
        let mut relay = EventLoop::new(&config, send_socket, tx);
        relay.run(rx, &keep_running_loop)
    });

    Ok((
        RelayHandle {
            keep_running,
            thread: Some(thread),
        },
        addrs,
    ))
}

fn spawn_stream_listener(
    listener: TcpListener,
    tx: Sender<InternalEvent>,
    keep_running: Arc<AtomicBool>,
) -> io::Result<()> {
    listener.set_nonblocking(true)?;
    thread::spawn(move || {
        while keep_running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, addr)) => {
                    let event = InternalEvent::Accepted {
                        stream,
                        key: PeerKey::from(addr),
                    };
                    if tx.send(event).is_err() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(POLL_INTERVAL);
                }
                Err(ref e) if is_transient_accept_error(e) => {
                    warn!(error = %e, "accept failed, continuing");
                }
                Err(error) => {
                    let _ = tx.send(InternalEvent::ListenerFailed { error });
                    break;
                }
            }
        }
    });
    Ok(())
}

/// Accept errors that concern a single incoming connection rather than the
/// listener itself.
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted
    )
}

fn spawn_datagram_reader(
    socket: UdpSocket,
    tx: Sender<InternalEvent>,
    keep_running: Arc<AtomicBool>,
) -> io::Result<()> {
    socket.set_read_timeout(Some(POLL_INTERVAL))?;
    thread::spawn(move || {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        while keep_running.load(Ordering::SeqCst) {
            match socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    let event = InternalEvent::Datagram {
                        from,
                        data: buf[..len].to_vec(),
                    };
                    if tx.send(event).is_err() {
                        break;
                    }
                }
                Err(ref e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                // ICMP port-unreachable from an earlier send surfaces here on
                // some platforms; it says nothing about this socket.
                Err(e) => debug!(error = %e, "datagram receive error"),
            }
        }
    });
    Ok(())
}

/// Reader loop for a single stream client. Runs in its own thread.
fn reader_loop(
    mut reader: BufReader<TcpStream>,
    key: PeerKey,
    connection: ConnectionId,
    tx: Sender<InternalEvent>,
) {
    loop {
        let event = match read_frame(&mut reader) {
            Ok(Some(bytes)) => InternalEvent::Frame {
                key,
                connection,
                bytes,
            },
            Ok(None) => {
                let _ = tx.send(InternalEvent::Closed { key, connection });
                return;
            }
            Err(error) => {
                let _ = tx.send(InternalEvent::Failed {
                    key,
                    connection,
                    error,
                });
                return;
            }
        };
        if tx.send(event).is_err() {
            return;
        }
    }
}

/// State owned by the main thread.
struct EventLoop {
    registry: Registry,
    endpoints: EndpointTable,
    stream: StreamDispatcher,
    datagram: DatagramDispatcher,
    socket: UdpSocket,
    tx: Sender<InternalEvent>,
    next_connection: u64,
    sweep_interval: Duration,
}

impl EventLoop {
    fn new(config: &RelayConfig, socket: UdpSocket, tx: Sender<InternalEvent>) -> Self {
        Self {
            registry: Registry::new(config.protocol_version.clone()),
            endpoints: EndpointTable::new(config.expire_time),
            stream: StreamDispatcher::from_config(config),
            datagram: DatagramDispatcher::new(config.unknown_opcodes),
            socket,
            tx,
            next_connection: 0,
            sweep_interval: config.sweep_interval().max(POLL_INTERVAL),
        }
    }

    /// Main loop. Runs until `keep_running` is cleared or a fatal event
    /// arrives.
    fn run(&mut self, rx: Receiver<InternalEvent>, keep_running: &AtomicBool) -> Result<()> {
        let mut next_sweep = Instant::now() + self.sweep_interval;

        let result = loop {
            if !keep_running.load(Ordering::SeqCst) {
                break Ok(());
            }
            // Wake at least every POLL_INTERVAL so a stop request is noticed.
            let wait = next_sweep
                .saturating_duration_since(Instant::now())
                .min(POLL_INTERVAL);
            match rx.recv_timeout(wait) {
                Ok(event) => {
                    if let Err(e) = self.handle_event(event) {
                        break Err(e);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break Err(RelayError::ChannelClosed),
            }

            let now = Instant::now();
            if now >= next_sweep {
                let expired = self.endpoints.sweep(now);
                debug!(
                    expired = expired.len(),
                    remaining = self.endpoints.len(),
                    "endpoint sweep"
                );
                next_sweep = now + self.sweep_interval;
            }
        };

        keep_running.store(false, Ordering::SeqCst);
        result
    }

    fn handle_event(&mut self, event: InternalEvent) -> Result<()> {
        match event {
            InternalEvent::Accepted { stream, key } => self.accept(stream, key),
            InternalEvent::Frame {
                key,
                connection,
                bytes,
            } => {
                if self.registry.is_current(key, connection) {
                    self.stream.handle_frame(&mut self.registry, key, &bytes)?;
                } else {
                    debug!(peer = %key, "frame from superseded connection");
                }
            }
            InternalEvent::Closed { key, connection } => self.close(key, connection),
            InternalEvent::Failed {
                key,
                connection,
                error,
            } => {
                self.report_failure(key, &error);
                self.close(key, connection);
            }
            InternalEvent::Datagram { from, data } => {
                self.datagram.handle_datagram(
                    &mut self.endpoints,
                    &self.socket,
                    from,
                    &data,
                    Instant::now(),
                )?;
            }
            InternalEvent::ListenerFailed { error } => {
                error!(error = %error, "stream listener failed");
                return Err(RelayError::ListenerFailed {
                    transport: "stream",
                    source: error,
                });
            }
        }
        Ok(())
    }

    /// Register a new client and start its reader thread.
    fn accept(&mut self, stream: TcpStream, key: PeerKey) {
        let connection = ConnectionId(self.next_connection);
        self.next_connection += 1;

        let prepared = stream
            .set_nonblocking(false)
            .and_then(|()| stream.set_write_timeout(Some(WRITE_TIMEOUT)))
            .and_then(|()| stream.try_clone());
        let read_half = match prepared {
            Ok(read_half) => read_half,
            Err(e) => {
                warn!(peer = %key, error = %e, "could not set up connection");
                return;
            }
        };

        let record = self.registry.connect(key, connection, stream);
        debug!(peer = %key, id = %record.id, ?connection, "starting reader");

        let tx = self.tx.clone();
        thread::spawn(move || reader_loop(BufReader::new(read_half), key, connection, tx));
    }

    fn close(&mut self, key: PeerKey, connection: ConnectionId) {
        if self.registry.is_current(key, connection) {
            self.registry.disconnect(key);
        } else {
            debug!(peer = %key, ?connection, "ignoring close of superseded connection");
        }
    }

    fn report_failure(&self, key: PeerKey, err: &io::Error) {
        let player = self.registry.player(key);
        let nickname = player.map(|p| p.nickname.as_str()).unwrap_or("<unknown>");
        let id = player.map(|p| p.id.to_string()).unwrap_or_default();
        if err.kind() == ErrorKind::ConnectionReset {
            warn!(peer = %key, nickname, id = %id, "connection reset by player");
        } else {
            error!(peer = %key, nickname, id = %id, error = %err, "connection failed");
        }
    }
}
