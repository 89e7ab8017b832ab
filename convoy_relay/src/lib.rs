// convoy_relay: multiplayer relay for Convoy vehicle sessions.
//
// The relay is a thin message broker. Game clients connect over TCP (the
// stream transport) for session traffic and over UDP (the datagram
// transport) for high-rate vehicle updates; a third WebSocket channel echoes
// every message to every peer. The relay never simulates anything; apart
// from the roster, the map name, and the set of live UDP endpoints, it only
// forwards bytes.
//
// Module overview:
// - `config.rs`:    `RelayConfig`, default ports, routing policies.
// - `error.rs`:     `RelayError` and the crate `Result`.
// - `registry.rs`:  Stream sessions: player records, write halves, roster
//                   broadcasts. Owned by the event loop.
// - `stream.rs`:    Opcode dispatch for stream frames.
// - `endpoints.rs`: Last-seen table of UDP endpoints and its expiry sweep.
// - `datagram.rs`:  Opcode dispatch for datagrams.
// - `broadcast.rs`: The WebSocket echo channel.
// - `server.rs`:    Listeners, reader threads, and the main event loop. Uses
//                   `std::net` with a thread-per-reader architecture and an
//                   `mpsc` channel funnelling events into one thread that
//                   owns the `Registry` and the `EndpointTable`.
// - `client.rs`:    Blocking stream client for tests and tooling.
//
// Dependencies: `convoy_protocol` (opcodes, framing, server frames).
//
// The relay runs as a standalone binary (`main.rs`) or embedded via the
// library API (`start_relay`).

pub mod broadcast;
pub mod client;
pub mod config;
pub mod datagram;
pub mod endpoints;
pub mod error;
pub mod registry;
pub mod server;
pub mod stream;

pub use client::{Greeting, RelayClient};
pub use config::{RelayConfig, UnknownOpcodePolicy, VehicleRelayFilter};
pub use error::{RelayError, Result};
pub use server::{RelayAddrs, RelayHandle, start_relay};
