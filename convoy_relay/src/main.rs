// CLI entry point for the Convoy relay.
//
// Starts a standalone relay that game clients connect to and blocks until the
// event loop ends. The process normally runs until it is killed; it exits
// with status 1 if a transport cannot be bound or the stream listener fails.
// See `server.rs` for the networking architecture and `config.rs` for what
// the routing options mean.
//
// Usage:
//   relay [OPTIONS]
//     --port <PORT>                 Base port; datagram on +1, WebSocket on +2
//                                   (at most 65533)
//     --host <ADDR>                 Bind address (default: 0.0.0.0)
//     --expire-secs <N>             Datagram endpoint expiry, at least 1 (default: 30)
//     --unknown-opcodes <POLICY>    broadcast | drop
//     --vehicle-relay <FILTER>      exclude-sender | legacy
//     --roster-on-vehicle-change    Push the roster after every C-VS
//
// Logging goes through `tracing`; set `RUST_LOG` to change the level.

use std::net::IpAddr;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use convoy_relay::config::{
    DEFAULT_PORT, MAX_BASE_PORT, RelayConfig, UnknownOpcodePolicy, VehicleRelayFilter,
};
use convoy_relay::{Result, start_relay};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Multiplayer relay for Convoy vehicle sessions")]
struct Args {
    /// Base port: stream on PORT, datagram on PORT+1, WebSocket echo on PORT+2
    #[arg(
        long,
        default_value_t = DEFAULT_PORT,
        value_parser = clap::value_parser!(u16).range(..=i64::from(MAX_BASE_PORT))
    )]
    port: u16,

    /// Address to bind all three transports to
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Seconds of silence after which a datagram endpoint is forgotten
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    expire_secs: u64,

    /// What to do with frames whose opcode the relay does not know
    #[arg(long, value_enum, default_value_t = UnknownOpcodePolicy::Broadcast)]
    unknown_opcodes: UnknownOpcodePolicy,

    /// Which stream peers receive single-axis vehicle updates
    #[arg(long, value_enum, default_value_t = VehicleRelayFilter::ExcludeSender)]
    vehicle_relay: VehicleRelayFilter,

    /// Broadcast the roster after every vehicle switch
    #[arg(long, default_value_t = false)]
    roster_on_vehicle_change: bool,
}

impl Args {
    fn into_config(self) -> Result<RelayConfig> {
        Ok(RelayConfig {
            host: self.host,
            expire_time: Duration::from_secs(self.expire_secs),
            unknown_opcodes: self.unknown_opcodes,
            vehicle_relay: self.vehicle_relay,
            roster_on_vehicle_change: self.roster_on_vehicle_change,
            ..RelayConfig::with_base_port(self.port)?
        })
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let started = Args::parse().into_config().and_then(start_relay);
    let (handle, addrs) = match started {
        Ok(started) => started,
        Err(e) => {
            error!(error = %e, "failed to start relay");
            return ExitCode::FAILURE;
        }
    };
    info!(
        stream = %addrs.stream,
        datagram = %addrs.datagram,
        websocket = %addrs.broadcast,
        "relay running"
    );

    match handle.join() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "relay stopped");
            ExitCode::FAILURE
        }
    }
}
