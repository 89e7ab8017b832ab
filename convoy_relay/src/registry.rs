// Session registry for stream clients.
//
// `Registry` is the authoritative list of connected TCP clients and their
// player records. `server.rs` owns exactly one and drives it from the single
// event-loop thread, so there is no internal locking. `stream.rs` calls into
// it for every opcode that touches shared state.
//
// Two maps, one key: `players` and `connections` are both keyed by the
// client's `PeerKey` and are added and removed together, with one deliberate
// exception: `QUIT` drops only the connection (the client stops receiving
// broadcasts) and the record goes when the socket actually closes.
//
// Every accepted socket also gets a `ConnectionId`. If a new socket arrives
// under a key that is still registered (the close event for the old socket
// has not been processed yet), the new session supersedes the old one, and
// the old socket's late close event is recognised as stale via
// `is_current` and ignored.
//
// Writing to clients: each connection has a writer thread that owns a cloned
// `TcpStream` write half in a `BufWriter` and drains a bounded outbox. The
// registry only queues frames, so a client that stops reading never stalls
// the event loop. A client whose outbox fills up, or whose socket write
// fails, is shut down; its reader thread then sees the closed socket and
// reports the close like any other.

use std::collections::BTreeMap;
use std::io::BufWriter;
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread;

use convoy_protocol::{PeerKey, PlayerId, RosterEntry, ServerFrame, write_frame};
use tracing::{debug, info, warn};

use crate::error::Result;

/// Frames a connection may have queued before it counts as stalled.
pub const OUTBOX_CAPACITY: usize = 256;

/// Nickname a player has until it sends `USER`.
pub const PLACEHOLDER_NICKNAME: &str = "New User, Loading...";

/// Identifies one accepted socket, distinct across reconnects from the same
/// address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// Player state for one stream connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlayerRecord {
    pub id: PlayerId,
    pub key: PeerKey,
    pub nickname: String,
    pub current_vehicle_id: String,
    pub connection: ConnectionId,
}

impl PlayerRecord {
    fn roster_entry(&self) -> RosterEntry {
        RosterEntry {
            address: self.key.ip,
            port: self.key.port,
            nickname: self.nickname.clone(),
            id: self.id,
            current_vehicle_id: self.current_vehicle_id.clone(),
        }
    }
}

struct Connection {
    id: ConnectionId,
    outbox: SyncSender<Vec<u8>>,
    stream: TcpStream,
    closing: bool,
}

impl Connection {
    /// Start the writer thread for `stream`.
    fn open(key: PeerKey, id: ConnectionId, stream: TcpStream) -> Self {
        let (outbox, inbox) = mpsc::sync_channel(OUTBOX_CAPACITY);
        match stream.try_clone() {
            Ok(write_half) => {
                thread::spawn(move || writer_loop(key, write_half, inbox));
            }
            Err(e) => {
                warn!(peer = %key, error = %e, "could not start writer, closing");
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
        Self {
            id,
            outbox,
            stream,
            closing: false,
        }
    }

    fn enqueue(&mut self, key: PeerKey, frame: &[u8]) {
        match self.outbox.try_send(frame.to_vec()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if !self.closing {
                    warn!(peer = %key, "client is not reading, closing connection");
                    self.closing = true;
                    let _ = self.stream.shutdown(Shutdown::Both);
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!(peer = %key, "writer already stopped, frame dropped");
            }
        }
    }
}

/// Writes queued frames until the registry drops the outbox or a write fails.
fn writer_loop(key: PeerKey, stream: TcpStream, inbox: Receiver<Vec<u8>>) {
    let mut writer = BufWriter::new(stream);
    for frame in inbox {
        if let Err(e) = write_frame(&mut writer, &frame) {
            warn!(peer = %key, error = %e, "write to client failed, closing connection");
            let _ = writer.get_ref().shutdown(Shutdown::Both);
            return;
        }
    }
}

/// Connected stream clients, their records, and the current map.
pub struct Registry {
    players: BTreeMap<PeerKey, PlayerRecord>,
    connections: BTreeMap<PeerKey, Connection>,
    current_map: String,
    protocol_version: String,
    vehicle_updates: u64,
}

impl Registry {
    pub fn new(protocol_version: impl Into<String>) -> Self {
        Self {
            players: BTreeMap::new(),
            connections: BTreeMap::new(),
            current_map: String::new(),
            protocol_version: protocol_version.into(),
            vehicle_updates: 0,
        }
    }

    /// Register a freshly accepted socket.
    ///
    /// Creates the player record, sends the greeting (`HOLA`, then `MAPS` or
    /// `MAPC`, then `VCHK`) to the new client, and broadcasts the roster to
    /// everyone, the new client included. Returns a copy of the new record.
    pub fn connect(
        &mut self,
        key: PeerKey,
        connection: ConnectionId,
        stream: TcpStream,
    ) -> PlayerRecord {
        let record = PlayerRecord {
            id: PlayerId::generate(),
            key,
            nickname: PLACEHOLDER_NICKNAME.into(),
            current_vehicle_id: String::new(),
            connection,
        };

        if let Some(stale) = self.players.insert(key, record.clone()) {
            warn!(
                peer = %key,
                stale_id = %stale.id,
                "new connection supersedes a session that was never closed"
            );
        }
        self.connections
            .insert(key, Connection::open(key, connection, stream));
        info!(peer = %key, id = %record.id, "player connected");

        self.send_frame_to(key, &ServerFrame::Hello { id: record.id });
        let map_frame = if self.current_map.is_empty() {
            ServerFrame::RequestMap
        } else {
            ServerFrame::MapConfirm {
                map: self.current_map.clone(),
            }
        };
        self.send_frame_to(key, &map_frame);
        self.send_frame_to(
            key,
            &ServerFrame::VersionCheck {
                version: self.protocol_version.clone(),
            },
        );

        self.broadcast_roster();
        record
    }

    /// Remove the record and connection for `key`. When anything was
    /// removed, the remaining clients get the updated roster.
    pub fn disconnect(&mut self, key: PeerKey) {
        let record = self.players.remove(&key);
        let connection = self.connections.remove(&key);
        if record.is_none() && connection.is_none() {
            debug!(peer = %key, "disconnect for unknown peer");
            return;
        }
        match &record {
            Some(record) => info!(
                peer = %key,
                id = %record.id,
                nickname = %record.nickname,
                "player disconnected"
            ),
            None => info!(peer = %key, "connection closed"),
        }
        self.broadcast_roster();
        debug!(players = self.players.len(), "roster after disconnect");
    }

    /// Stop sending to `key` without forgetting its player record. Used for
    /// `QUIT`; the record goes when the socket closes.
    pub fn drop_connection(&mut self, key: PeerKey) -> bool {
        let removed = self.connections.remove(&key).is_some();
        if removed {
            info!(peer = %key, "client quit");
        }
        removed
    }

    /// Whether `connection` is still the live socket for `key`.
    pub fn is_current(&self, key: PeerKey, connection: ConnectionId) -> bool {
        self.players
            .get(&key)
            .map(|record| record.connection == connection)
            .or_else(|| self.connections.get(&key).map(|c| c.id == connection))
            .unwrap_or(false)
    }

    /// Set the nickname for `key`, then broadcast the roster and a join
    /// announcement to every client. Unknown keys are ignored.
    pub fn set_nickname(&mut self, key: PeerKey, nickname: &str) -> Result<bool> {
        let Some(record) = self.players.get_mut(&key) else {
            warn!(peer = %key, nickname, "nickname for unknown peer");
            return Ok(false);
        };
        info!(id = %record.id, nickname, "setting nickname");
        record.nickname = nickname.to_owned();

        self.broadcast_roster();
        self.broadcast(&ServerFrame::joined(nickname).encode()?);
        Ok(true)
    }

    /// Update the current vehicle for `key` when it differs from the stored
    /// one. Returns whether anything changed.
    pub fn set_vehicle(&mut self, key: PeerKey, vehicle_id: &str) -> bool {
        let Some(record) = self.players.get_mut(&key) else {
            debug!(peer = %key, vehicle_id, "vehicle switch for unknown peer");
            return false;
        };
        if record.current_vehicle_id == vehicle_id {
            return false;
        }
        info!(id = %record.id, vehicle_id, "updating current vehicle");
        record.current_vehicle_id = vehicle_id.to_owned();
        self.vehicle_updates += 1;
        true
    }

    /// Number of effective vehicle updates since the registry was created.
    pub fn vehicle_updates(&self) -> u64 {
        self.vehicle_updates
    }

    pub fn set_map(&mut self, map: &str) {
        info!(map, "setting map");
        self.current_map = map.to_owned();
    }

    /// The current map; empty when no client has proposed one yet.
    pub fn current_map(&self) -> &str {
        &self.current_map
    }

    pub fn player(&self, key: PeerKey) -> Option<&PlayerRecord> {
        self.players.get(&key)
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_connected(&self, key: PeerKey) -> bool {
        self.connections.contains_key(&key)
    }

    /// Roster records for every player, in key order.
    pub fn roster(&self) -> Vec<RosterEntry> {
        self.players.values().map(PlayerRecord::roster_entry).collect()
    }

    /// The roster as the JSON array carried by `PLST`.
    pub fn serialize_roster(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.roster())?)
    }

    /// Send the current roster to every client.
    pub fn broadcast_roster(&mut self) {
        let frame = ServerFrame::PlayerList {
            players: self.roster(),
        };
        match frame.encode() {
            Ok(bytes) => self.broadcast(&bytes),
            Err(e) => warn!(error = %e, "failed to encode roster"),
        }
    }

    /// Write `frame` to every connected client.
    pub fn broadcast(&mut self, frame: &[u8]) {
        self.broadcast_where(|_| true, frame);
    }

    /// Write `frame` to every connected client whose key passes `filter`.
    pub fn broadcast_where(&mut self, filter: impl Fn(PeerKey) -> bool, frame: &[u8]) {
        for (key, connection) in self.connections.iter_mut() {
            if filter(*key) {
                connection.enqueue(*key, frame);
            }
        }
    }

    /// Write `frame` to one client. Returns false if it is not connected.
    pub fn send_to(&mut self, key: PeerKey, frame: &[u8]) -> bool {
        match self.connections.get_mut(&key) {
            Some(connection) => {
                connection.enqueue(key, frame);
                true
            }
            None => false,
        }
    }

    fn send_frame_to(&mut self, key: PeerKey, frame: &ServerFrame) {
        match frame.encode() {
            Ok(bytes) => {
                self.send_to(key, &bytes);
            }
            Err(e) => warn!(peer = %key, error = %e, "failed to encode frame"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::{BufReader, ErrorKind, Read};
    use std::net::TcpListener;
    use std::time::{Duration, Instant};

    use convoy_protocol::read_frame;

    use super::*;

    /// A TCP pair on localhost: (client side, server side).
    pub(crate) fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    /// Client reader plus the key the server sees for that client.
    pub(crate) fn client_pair() -> (BufReader<TcpStream>, PeerKey, TcpStream) {
        let (client, server) = tcp_pair();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let key = PeerKey::from(server.peer_addr().unwrap());
        (BufReader::new(client), key, server)
    }

    pub(crate) fn recv(reader: &mut BufReader<TcpStream>) -> Vec<u8> {
        read_frame(reader).unwrap().expect("stream closed")
    }

    pub(crate) fn recv_text(reader: &mut BufReader<TcpStream>) -> String {
        String::from_utf8(recv(reader)).unwrap()
    }

    /// Read and discard the three greeting frames plus the roster broadcast
    /// that follows a connect.
    pub(crate) fn skip_greeting(reader: &mut BufReader<TcpStream>) {
        for _ in 0..4 {
            recv(reader);
        }
    }

    /// Assert nothing arrives within a short window.
    pub(crate) fn assert_silent(reader: &mut BufReader<TcpStream>) {
        reader
            .get_ref()
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        match read_frame(reader) {
            Err(e) => assert!(
                matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut),
                "unexpected error {e:?}"
            ),
            Ok(frame) => panic!("expected silence, got {frame:?}"),
        }
        reader
            .get_ref()
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
    }

    fn roster_of(frame: &[u8]) -> Vec<RosterEntry> {
        assert!(frame.starts_with(b"PLST"), "expected PLST, got {frame:?}");
        serde_json::from_slice(&frame[4..]).unwrap()
    }

    #[test]
    fn connect_sends_greeting_then_roster() {
        let (mut reader, key, server) = client_pair();
        let mut registry = Registry::new("0.0.3");

        let record = registry.connect(key, ConnectionId(1), server);
        assert_eq!(record.nickname, PLACEHOLDER_NICKNAME);
        assert_eq!(record.current_vehicle_id, "");
        assert_eq!(registry.player_count(), 1);
        assert_eq!(registry.connection_count(), 1);

        assert_eq!(recv_text(&mut reader), format!("HOLA{}", record.id));
        assert_eq!(recv_text(&mut reader), "MAPS");
        assert_eq!(recv_text(&mut reader), "VCHK0.0.3");
        let roster = roster_of(&recv(&mut reader));
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].id, record.id);
        assert_eq!(roster[0].port, key.port);
    }

    #[test]
    fn connect_confirms_existing_map() {
        let (mut reader, key, server) = client_pair();
        let mut registry = Registry::new("0.0.3");
        registry.set_map("levels/west_coast_usa/info.json");

        registry.connect(key, ConnectionId(1), server);
        let _hola = recv(&mut reader);
        assert_eq!(
            recv_text(&mut reader),
            "MAPClevels/west_coast_usa/info.json"
        );
    }

    #[test]
    fn connect_broadcasts_roster_to_existing_clients() {
        let (mut reader_a, key_a, server_a) = client_pair();
        let (_reader_b, key_b, server_b) = client_pair();
        let mut registry = Registry::new("0.0.3");

        registry.connect(key_a, ConnectionId(1), server_a);
        skip_greeting(&mut reader_a);
        registry.connect(key_b, ConnectionId(2), server_b);

        let roster = roster_of(&recv(&mut reader_a));
        assert_eq!(roster.len(), 2);
    }

    #[test]
    fn player_ids_are_unique_per_connection() {
        let (_ra, key_a, server_a) = client_pair();
        let (_rb, key_b, server_b) = client_pair();
        let mut registry = Registry::new("0.0.3");
        let a = registry.connect(key_a, ConnectionId(1), server_a);
        let b = registry.connect(key_b, ConnectionId(2), server_b);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn set_nickname_broadcasts_roster_and_announcement() {
        let (mut reader_a, key_a, server_a) = client_pair();
        let (mut reader_b, key_b, server_b) = client_pair();
        let mut registry = Registry::new("0.0.3");
        registry.connect(key_a, ConnectionId(1), server_a);
        registry.connect(key_b, ConnectionId(2), server_b);
        skip_greeting(&mut reader_a);
        let _roster_after_b = recv(&mut reader_a);
        skip_greeting(&mut reader_b);

        assert!(registry.set_nickname(key_b, "Alice").unwrap());

        for reader in [&mut reader_a, &mut reader_b] {
            let roster = roster_of(&recv(reader));
            let alice = roster.iter().find(|e| e.port == key_b.port).unwrap();
            assert_eq!(alice.nickname, "Alice");
            assert_eq!(alice.current_vehicle_id, "");
            assert_eq!(recv_text(reader), "SMSGAlice Just Joined the Session.");
        }
    }

    #[test]
    fn set_nickname_unknown_peer_is_ignored() {
        let (mut reader, key, server) = client_pair();
        let mut registry = Registry::new("0.0.3");
        registry.connect(key, ConnectionId(1), server);
        skip_greeting(&mut reader);

        let stranger = PeerKey::new(key.ip, key.port.wrapping_add(1));
        assert!(!registry.set_nickname(stranger, "Ghost").unwrap());
        assert_silent(&mut reader);
    }

    #[test]
    fn set_vehicle_is_idempotent() {
        let (_reader, key, server) = client_pair();
        let mut registry = Registry::new("0.0.3");
        registry.connect(key, ConnectionId(1), server);

        assert!(registry.set_vehicle(key, "42"));
        assert!(!registry.set_vehicle(key, "42"));
        assert_eq!(registry.vehicle_updates(), 1);
        assert_eq!(registry.player(key).unwrap().current_vehicle_id, "42");

        assert!(registry.set_vehicle(key, "43"));
        assert_eq!(registry.vehicle_updates(), 2);
    }

    #[test]
    fn disconnect_broadcasts_roster_without_player() {
        let (mut reader_a, key_a, server_a) = client_pair();
        let (_reader_b, key_b, server_b) = client_pair();
        let mut registry = Registry::new("0.0.3");
        registry.connect(key_a, ConnectionId(1), server_a);
        registry.connect(key_b, ConnectionId(2), server_b);
        skip_greeting(&mut reader_a);
        let _roster_after_b = recv(&mut reader_a);

        registry.disconnect(key_b);

        let roster = roster_of(&recv(&mut reader_a));
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].port, key_a.port);
        assert_eq!(registry.player_count(), 1);
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn disconnect_unknown_peer_is_noop() {
        let (mut reader, key, server) = client_pair();
        let mut registry = Registry::new("0.0.3");
        registry.connect(key, ConnectionId(1), server);
        skip_greeting(&mut reader);

        registry.disconnect(PeerKey::new(key.ip, key.port.wrapping_add(1)));
        assert_eq!(registry.player_count(), 1);
        assert_silent(&mut reader);
    }

    #[test]
    fn drop_connection_keeps_record_until_disconnect() {
        let (mut reader_a, key_a, server_a) = client_pair();
        let (_reader_b, key_b, server_b) = client_pair();
        let mut registry = Registry::new("0.0.3");
        registry.connect(key_a, ConnectionId(1), server_a);
        registry.connect(key_b, ConnectionId(2), server_b);
        skip_greeting(&mut reader_a);
        let _roster_after_b = recv(&mut reader_a);

        assert!(registry.drop_connection(key_a));
        assert!(!registry.is_connected(key_a));
        assert!(registry.player(key_a).is_some());
        assert!(registry.is_current(key_a, ConnectionId(1)));

        // A no longer receives broadcasts.
        registry.broadcast(b"CHAThello");
        assert_silent(&mut reader_a);

        registry.disconnect(key_a);
        assert!(registry.player(key_a).is_none());
        assert_eq!(registry.player_count(), 1);
    }

    #[test]
    fn superseded_connection_is_not_current() {
        let (_ra, key, server_a) = client_pair();
        let (_rb, _, server_b) = client_pair();
        let mut registry = Registry::new("0.0.3");

        registry.connect(key, ConnectionId(1), server_a);
        registry.connect(key, ConnectionId(2), server_b);

        assert_eq!(registry.player_count(), 1);
        assert!(!registry.is_current(key, ConnectionId(1)));
        assert!(registry.is_current(key, ConnectionId(2)));
    }

    #[test]
    fn broadcast_survives_failed_write() {
        let (mut reader_a, key_a, server_a) = client_pair();
        let (_reader_b, key_b, server_b) = client_pair();
        let mut registry = Registry::new("0.0.3");
        registry.connect(key_a, ConnectionId(1), server_a);
        skip_greeting(&mut reader_a);

        // B's write half is shut before it is registered, so every write
        // to B fails.
        server_b.shutdown(Shutdown::Write).unwrap();
        registry.connect(key_b, ConnectionId(2), server_b);
        let _roster_after_b = recv(&mut reader_a);

        registry.broadcast(b"CHATstill here");
        assert_eq!(recv_text(&mut reader_a), "CHATstill here");
        assert_eq!(registry.connection_count(), 2);
    }

    #[test]
    fn broadcast_where_filters_by_key() {
        let (mut reader_a, key_a, server_a) = client_pair();
        let (mut reader_b, key_b, server_b) = client_pair();
        let mut registry = Registry::new("0.0.3");
        registry.connect(key_a, ConnectionId(1), server_a);
        registry.connect(key_b, ConnectionId(2), server_b);
        skip_greeting(&mut reader_a);
        let _roster_after_b = recv(&mut reader_a);
        skip_greeting(&mut reader_b);

        registry.broadcast_where(|key| key != key_a, b"U-VLdata");
        assert_eq!(recv_text(&mut reader_b), "U-VLdata");
        assert_silent(&mut reader_a);
    }

    #[test]
    fn serialize_roster_lists_every_player() {
        let (_ra, key_a, server_a) = client_pair();
        let (_rb, key_b, server_b) = client_pair();
        let mut registry = Registry::new("0.0.3");
        registry.connect(key_a, ConnectionId(1), server_a);
        registry.connect(key_b, ConnectionId(2), server_b);
        registry.set_nickname(key_a, "Alice").unwrap();
        registry.set_vehicle(key_b, "7");

        let json = registry.serialize_roster().unwrap();
        let parsed: Vec<RosterEntry> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parsed.iter().any(|e| e.nickname == "Alice"));
        assert!(parsed.iter().any(|e| e.current_vehicle_id == "7"));
    }

    /// A frame just under the line limit, so a few of them fill the socket
    /// buffers of a client that never reads.
    fn bulky_chat() -> Vec<u8> {
        let mut frame = b"CHAT".to_vec();
        frame.resize(60_000, b'x');
        frame
    }

    #[test]
    fn stalled_client_does_not_delay_broadcast() {
        let (mut reader_a, key_a, server_a) = client_pair();
        let (_stalled, key_b, server_b) = client_pair();
        let mut registry = Registry::new("0.0.3");
        registry.connect(key_a, ConnectionId(1), server_a);
        registry.connect(key_b, ConnectionId(2), server_b);
        skip_greeting(&mut reader_a);
        let _roster_after_b = recv(&mut reader_a);

        // Far more than the socket buffers hold, still within the outbox.
        let chat = bulky_chat();
        let started = Instant::now();
        for _ in 0..200 {
            registry.broadcast(&chat);
        }
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "broadcast blocked for {:?}",
            started.elapsed()
        );

        for _ in 0..200 {
            assert_eq!(recv(&mut reader_a), chat);
        }
        assert_eq!(registry.connection_count(), 2);
    }

    #[test]
    fn overflowing_outbox_closes_client() {
        let (mut stalled, key, server) = client_pair();
        let mut registry = Registry::new("0.0.3");
        registry.connect(key, ConnectionId(1), server);

        let chat = bulky_chat();
        for _ in 0..(OUTBOX_CAPACITY * 4) {
            registry.broadcast(&chat);
        }
        // The registry keeps the record until the reader reports the close.
        assert_eq!(registry.connection_count(), 1);

        // Whatever made it onto the wire drains, then the socket ends.
        let mut sink = Vec::new();
        match stalled.read_to_end(&mut sink) {
            Ok(_) => {}
            Err(e) => assert!(
                !matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut),
                "connection was never closed"
            ),
        }
    }
}
