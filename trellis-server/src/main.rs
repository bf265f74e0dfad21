//! Trellis room server.
//!
//! Serves `GET /rooms/{id}` (WebSocket), `GET /rooms/{id}/info` and
//! `GET /health`. Logging goes through `env_logger`; set `RUST_LOG` to
//! override the default `info` level.

use std::path::PathBuf;
use std::time::Duration;

use clap::{value_parser, Arg, ArgMatches, Command};
use log::info;
use trellis_collab::{ServerConfig, StorageBackend, SyncServer};

fn cli() -> Command {
    Command::new("trellis-server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Real-time collaborative document sync server.")
        .arg(
            Arg::new("bind")
                .long("bind")
                .env("TRELLIS_BIND")
                .value_name("ADDR")
                .default_value("127.0.0.1:9090")
                .help("Address to listen on"),
        )
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .env("TRELLIS_DATA_DIR")
                .value_name("DIR")
                .value_parser(value_parser!(PathBuf))
                .help("Snapshot directory; snapshots are kept in memory if unset"),
        )
        .arg(
            Arg::new("snapshot-debounce-ms")
                .long("snapshot-debounce-ms")
                .value_name("MS")
                .value_parser(value_parser!(u64))
                .help("Delay between an applied update and its snapshot write"),
        )
        .arg(
            Arg::new("idle-shutdown-secs")
                .long("idle-shutdown-secs")
                .value_name("SECS")
                .value_parser(value_parser!(u64))
                .help("Stop a room this long after its last session leaves"),
        )
}

fn server_config(matches: &ArgMatches) -> ServerConfig {
    let mut config = ServerConfig::default();
    if let Some(addr) = matches.get_one::<String>("bind") {
        config.bind_addr = addr.clone();
    }
    if let Some(dir) = matches.get_one::<PathBuf>("data-dir") {
        config.storage = StorageBackend::Files(dir.clone());
    }
    if let Some(ms) = matches.get_one::<u64>("snapshot-debounce-ms") {
        config.room.snapshot_debounce = Duration::from_millis(*ms);
    }
    if let Some(secs) = matches.get_one::<u64>("idle-shutdown-secs") {
        config.room.idle_shutdown = Duration::from_secs(*secs);
    }
    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = server_config(&cli().get_matches());
    info!("Starting trellis-server v{}", env!("CARGO_PKG_VERSION"));
    info!("storage: {:?}", config.storage);

    SyncServer::new(config)?.run().await?;
    info!("Shutdown complete");
    Ok(())
}
