mod probe;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::*;
use xrelay::config::{SERVER_ADDRESS_KEY, SERVER_PORT_KEY};
use xrelay::{Endpoint, RelayConfig};

/// Drives the relay against a server and reports round-trip throughput.
#[derive(Parser, Debug)]
#[command(name = "xrelay-client")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address
    #[arg(short, long, env = "XRELAY_SERVER", default_value = "127.0.0.1")]
    server: String,

    /// Server port
    #[arg(short, long, env = "XRELAY_PORT", default_value_t = xrelay::DEFAULT_SERVER_PORT)]
    port: u16,

    /// Connect over a Unix socket instead of TCP
    #[arg(long, conflicts_with = "vsock_cid")]
    unix: Option<PathBuf>,

    /// Connect over vsock to this CID (uses --port as the vsock port)
    #[arg(long)]
    vsock_cid: Option<u32>,

    /// Connect timeout in milliseconds
    #[arg(long, default_value_t = xrelay::DEFAULT_CONNECT_TIMEOUT_MS)]
    timeout: u64,

    /// Number of packets to send
    #[arg(short, long, default_value_t = 1000)]
    count: usize,

    /// Packet size in bytes
    #[arg(long, default_value_t = 1024)]
    size: usize,

    /// Seconds to wait for echoes
    #[arg(long, default_value_t = 5)]
    wait: u64,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

impl Args {
    fn relay_config(&self) -> xrelay::Result<RelayConfig> {
        let provider = HashMap::from([
            (SERVER_ADDRESS_KEY.to_string(), self.server.clone()),
            (SERVER_PORT_KEY.to_string(), self.port.to_string()),
        ]);
        let mut config = RelayConfig::from_provider_configuration(&provider)?
            .with_connect_timeout(Duration::from_millis(self.timeout));

        if let Some(path) = &self.unix {
            config = config.with_endpoint(Endpoint::Unix(path.clone()));
        } else if let Some(cid) = self.vsock_cid {
            config = config.with_endpoint(Endpoint::Vsock {
                cid,
                port: u32::from(self.port),
            });
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = args.relay_config()?;
    info!("Connecting to server at {}...", config.endpoint);
    let report = probe::run(config, args.count, args.size, Duration::from_secs(args.wait)).await?;
    report.print();

    if report.received < report.sent {
        return Err(format!("{} of {} packets came back", report.received, report.sent).into());
    }
    Ok(())
}
