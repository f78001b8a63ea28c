use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use futures::{SinkExt, StreamExt};
use log::*;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UdpSocket, UnixListener};
use tokio_util::codec::Framed;
use tokio_vsock::{VsockAddr, VsockListener};
use xrelay::{Error, FrameCodec, Ipv4Header};

/// Where the tunnel server listens.
#[derive(Debug, Clone)]
pub enum ServerTarget {
    Unix(PathBuf),
    Tcp(SocketAddr),
    Vsock { cid: u32, port: u32 },
}

/// What happened on one tunnel connection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSummary {
    /// IPv4 packets seen.
    pub packets: u64,
    /// Empty or non-IPv4 packets.
    pub skipped: u64,
    /// Packets written back to the client.
    pub echoed: u64,
}

/// Accepts relay connections and inspects the packets they carry.
pub struct TunnelServer {
    target: ServerTarget,
    echo: bool,
}

impl TunnelServer {
    pub fn new(target: ServerTarget) -> Self {
        Self { target, echo: false }
    }

    /// Writes every IPv4 packet back to the client that sent it.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub async fn run(&self) -> io::Result<()> {
        let echo = self.echo;
        match &self.target {
            ServerTarget::Unix(path) => {
                if path.exists() {
                    let _ = std::fs::remove_file(path);
                }
                let listener = UnixListener::bind(path)?;
                info!("Tunnel server listening on Unix Socket {:?}", path);
                loop {
                    match listener.accept().await {
                        Ok((stream, _)) => {
                            info!("New tunnel connection on {:?}", path);
                            tokio::spawn(Self::handle_connection(stream, format!("{:?}", path), echo));
                        }
                        Err(e) => warn!("Failed to accept: {}", e),
                    }
                }
            }
            ServerTarget::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await?;
                info!("Tunnel server listening on TCP {}", listener.local_addr()?);
                print_banner(addr.port()).await;
                Self::serve_tcp(listener, echo).await
            }
            ServerTarget::Vsock { cid, port } => {
                let listener = VsockListener::bind(VsockAddr::new(*cid, *port))?;
                info!("Tunnel server listening on Vsock CID:{} Port:{}", cid, port);
                loop {
                    match listener.accept().await {
                        Ok((stream, addr)) => {
                            info!("New tunnel connection from {:?}", addr);
                            tokio::spawn(Self::handle_connection(stream, format!("{:?}", addr), echo));
                        }
                        Err(e) => warn!("Failed to accept: {}", e),
                    }
                }
            }
        }
    }

    /// Accept loop for an already bound TCP listener.
    pub async fn serve_tcp(listener: TcpListener, echo: bool) -> io::Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    info!("New tunnel connection from {}", peer);
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("set_nodelay failed for {}: {}", peer, e);
                    }
                    tokio::spawn(Self::handle_connection(stream, peer.to_string(), echo));
                }
                Err(e) => warn!("Failed to accept: {}", e),
            }
        }
    }

    /// Reads frames until the client goes away.
    pub async fn handle_connection<T>(stream: T, peer: String, echo: bool) -> ConnectionSummary
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = Framed::new(stream, FrameCodec::new());
        let mut summary = ConnectionSummary::default();

        while let Some(frame) = framed.next().await {
            let packet = match frame {
                Ok(packet) => packet,
                Err(Error::FrameTooLarge { len, .. }) => {
                    warn!("Invalid packet length: {}, closing {}", len, peer);
                    break;
                }
                Err(e) => {
                    error!("Error handling tunnel client {}: {}", peer, e);
                    break;
                }
            };

            if packet.is_empty() {
                warn!("Invalid packet length: 0");
                summary.skipped += 1;
                continue;
            }

            let Some(header) = inspect(&packet) else {
                summary.skipped += 1;
                continue;
            };
            summary.packets += 1;
            debug!(
                "IP packet: {} -> {}, protocol={}",
                header.source, header.destination, header.protocol
            );

            if echo {
                if let Err(e) = framed.send(packet).await {
                    warn!("Failed to echo packet to {}: {}", peer, e);
                    break;
                }
                summary.echoed += 1;
            }
        }

        info!("Client {} disconnected", peer);
        summary
    }
}

fn inspect(packet: &[u8]) -> Option<Ipv4Header> {
    let version = packet[0] >> 4;
    if version != 4 {
        debug!("Non-IPv4 packet (version={}), skipping", version);
        return None;
    }
    let header = Ipv4Header::parse(packet);
    if header.is_none() {
        debug!("Truncated IPv4 packet of {} bytes, skipping", packet.len());
    }
    header
}

/// Address other hosts most likely reach this machine on.
async fn local_ip() -> IpAddr {
    async fn probe() -> io::Result<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect("8.8.8.8:80").await?;
        Ok(socket.local_addr()?.ip())
    }
    probe().await.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

async fn print_banner(port: u16) {
    let rule = "=".repeat(60);
    info!("{}", rule);
    info!("Client configuration:");
    info!("  Server Address: {}", local_ip().await);
    info!("  Server Port: {}", port);
    info!("{}", rule);
}
