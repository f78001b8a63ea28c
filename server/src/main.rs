mod socks;
mod tunnel_server;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;
use log::*;
use socks::SocksProxy;
use tunnel_server::{ServerTarget, TunnelServer};

/// Wildcard vsock CID.
const VMADDR_CID_ANY: u32 = u32::MAX;

/// Remote end of the relay: tunnel server plus a local SOCKS5 proxy.
#[derive(Parser, Debug)]
#[command(name = "xrelay-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Tunnel port
    #[arg(long, env = "XRELAY_PORT", default_value_t = xrelay::DEFAULT_SERVER_PORT)]
    port: u16,

    /// Listen on a Unix socket instead of TCP
    #[arg(long, conflicts_with = "vsock_port")]
    unix: Option<PathBuf>,

    /// Listen on this vsock port (any CID) instead of TCP
    #[arg(long)]
    vsock_port: Option<u32>,

    /// Local SOCKS5 proxy port
    #[arg(long, env = "XRELAY_SOCKS_PORT", default_value_t = 1080)]
    socks_port: u16,

    /// Only run the SOCKS5 proxy
    #[arg(long)]
    socks_only: bool,

    /// Send every IPv4 packet back to the client
    #[arg(long)]
    echo: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

impl Args {
    fn target(&self) -> ServerTarget {
        if let Some(path) = &self.unix {
            ServerTarget::Unix(path.clone())
        } else if let Some(port) = self.vsock_port {
            ServerTarget::Vsock {
                cid: VMADDR_CID_ANY,
                port,
            }
        } else {
            ServerTarget::Tcp(SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port)))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let socks = SocksProxy::new(SocketAddr::from((Ipv4Addr::LOCALHOST, args.socks_port)));
    tokio::spawn(async move {
        if let Err(e) = socks.run().await {
            error!("SOCKS5 proxy stopped: {}", e);
        }
    });

    if !args.socks_only {
        let server = TunnelServer::new(args.target()).with_echo(args.echo);
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Tunnel server stopped: {}", e);
            }
        });
    }

    info!("Server is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_target_is_tcp() {
        let args = Args::parse_from(["server"]);
        assert_eq!(args.port, 9876);
        assert_eq!(args.socks_port, 1080);
        assert!(matches!(args.target(), ServerTarget::Tcp(addr) if addr.port() == 9876));
    }

    #[test]
    fn test_unix_target() {
        let args = Args::parse_from(["server", "--unix", "/tmp/xrelay.sock", "--echo"]);
        assert!(args.echo);
        assert!(matches!(args.target(), ServerTarget::Unix(path) if path == PathBuf::from("/tmp/xrelay.sock")));
    }

    #[test]
    fn test_vsock_target() {
        let args = Args::parse_from(["server", "--vsock-port", "1234"]);
        assert!(matches!(args.target(), ServerTarget::Vsock { port: 1234, .. }));
    }
}
