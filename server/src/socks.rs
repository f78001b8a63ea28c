//! Minimal SOCKS5 proxy: no authentication, CONNECT only.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use log::*;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

#[derive(Debug, Error)]
pub enum SocksError {
    #[error("invalid SOCKS version {0}")]
    Version(u8),
    #[error("unsupported command {0}")]
    Command(u8),
    #[error("unsupported address type {0}")]
    AddressType(u8),
    #[error("domain name is not valid UTF-8")]
    Domain,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Destination requested by a CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

impl TargetAddr {
    async fn connect(&self) -> io::Result<TcpStream> {
        match self {
            TargetAddr::Ip(addr) => TcpStream::connect(addr).await,
            TargetAddr::Domain(host, port) => TcpStream::connect((host.as_str(), *port)).await,
        }
    }
}

pub struct SocksProxy {
    addr: SocketAddr,
}

impl SocksProxy {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub async fn run(&self) -> io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("SOCKS5 proxy listening on {}", listener.local_addr()?);
        Self::serve(listener).await
    }

    pub async fn serve(listener: TcpListener) -> io::Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("New SOCKS connection from {}", peer);
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_client(stream).await {
                            warn!("SOCKS client {}: {}", peer, e);
                        }
                    });
                }
                Err(e) => warn!("Failed to accept: {}", e),
            }
        }
    }

    /// Runs the handshake, connects and relays until either side closes.
    pub async fn handle_client<S>(mut client: S) -> Result<(), SocksError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut greeting = [0u8; 2];
        client.read_exact(&mut greeting).await?;
        if greeting[0] != SOCKS_VERSION {
            return Err(SocksError::Version(greeting[0]));
        }
        let mut methods = vec![0u8; usize::from(greeting[1])];
        client.read_exact(&mut methods).await?;
        client.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

        let mut request = [0u8; 4];
        client.read_exact(&mut request).await?;
        if request[0] != SOCKS_VERSION {
            return Err(SocksError::Version(request[0]));
        }
        if request[1] != CMD_CONNECT {
            reply(&mut client, REPLY_COMMAND_NOT_SUPPORTED).await?;
            return Err(SocksError::Command(request[1]));
        }

        let target = match read_target(&mut client, request[3]).await {
            Err(SocksError::AddressType(atyp)) => {
                reply(&mut client, REPLY_ADDRESS_NOT_SUPPORTED).await?;
                return Err(SocksError::AddressType(atyp));
            }
            other => other?,
        };

        info!("Connecting to {}", target);
        let mut remote = match target.connect().await {
            Ok(remote) => remote,
            Err(e) => {
                error!("Connection to {} failed: {}", target, e);
                reply(&mut client, REPLY_CONNECTION_REFUSED).await?;
                return Ok(());
            }
        };
        reply(&mut client, REPLY_SUCCEEDED).await?;

        match tokio::io::copy_bidirectional(&mut client, &mut remote).await {
            Ok((up, down)) => debug!("Relay to {} closed: {} bytes up, {} bytes down", target, up, down),
            Err(e) => debug!("Relay to {} ended: {}", target, e),
        }
        Ok(())
    }
}

async fn read_target<S>(client: &mut S, atyp: u8) -> Result<TargetAddr, SocksError>
where
    S: AsyncRead + Unpin,
{
    let target = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            client.read_exact(&mut octets).await?;
            let port = client.read_u16().await?;
            TargetAddr::Ip(SocketAddr::new(Ipv4Addr::from(octets).into(), port))
        }
        ATYP_DOMAIN => {
            let len = client.read_u8().await?;
            let mut name = vec![0u8; usize::from(len)];
            client.read_exact(&mut name).await?;
            let host = String::from_utf8(name).map_err(|_| SocksError::Domain)?;
            let port = client.read_u16().await?;
            TargetAddr::Domain(host, port)
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            client.read_exact(&mut octets).await?;
            let port = client.read_u16().await?;
            TargetAddr::Ip(SocketAddr::new(Ipv6Addr::from(octets).into(), port))
        }
        other => return Err(SocksError::AddressType(other)),
    };
    Ok(target)
}

/// Bound address is always reported as 0.0.0.0:0.
async fn reply<S>(client: &mut S, code: u8) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    client
        .write_all(&[SOCKS_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    client.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn proxy() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(SocksProxy::serve(listener));
        addr
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (mut r, mut w) = stream.split();
            tokio::io::copy(&mut r, &mut w).await.unwrap();
        });
        addr
    }

    async fn handshake(proxy: SocketAddr, request: &[u8]) -> (TcpStream, [u8; 10]) {
        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [5, 0]);

        client.write_all(request).await.unwrap();
        let mut response = [0u8; 10];
        client.read_exact(&mut response).await.unwrap();
        (client, response)
    }

    fn connect_ipv4(addr: SocketAddr) -> Vec<u8> {
        let SocketAddr::V4(v4) = addr else {
            panic!("expected an IPv4 address");
        };
        let mut request = vec![5, CMD_CONNECT, 0, ATYP_IPV4];
        request.extend_from_slice(&v4.ip().octets());
        request.extend_from_slice(&v4.port().to_be_bytes());
        request
    }

    #[tokio::test]
    async fn test_connect_ipv4_and_relay() {
        let proxy = proxy().await;
        let target = echo_server().await;

        let (mut client, response) = handshake(proxy, &connect_ipv4(target)).await;
        assert_eq!(response, [5, 0, 0, 1, 0, 0, 0, 0, 0, 0]);

        client.write_all(b"hello through socks").await.unwrap();
        let mut echoed = [0u8; 19];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello through socks");
    }

    #[tokio::test]
    async fn test_connect_domain() {
        let proxy = proxy().await;
        let target = echo_server().await;

        let mut request = vec![5, CMD_CONNECT, 0, ATYP_DOMAIN, 9];
        request.extend_from_slice(b"127.0.0.1");
        request.extend_from_slice(&target.port().to_be_bytes());

        let (mut client, response) = handshake(proxy, &request).await;
        assert_eq!(response[1], REPLY_SUCCEEDED);

        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");
    }

    #[tokio::test]
    async fn test_refused_target_replies_failure() {
        let proxy = proxy().await;
        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let (_client, response) = handshake(proxy, &connect_ipv4(closed)).await;
        assert_eq!(response, [5, 5, 0, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_rejects_bad_version() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&[4, 1, 0]).await.unwrap();

        let err = SocksProxy::handle_client(server).await.unwrap_err();
        assert!(matches!(err, SocksError::Version(4)));
    }

    #[tokio::test]
    async fn test_rejects_unsupported_command() {
        let (mut client, server) = tokio::io::duplex(64);
        client
            .write_all(&[5, 1, 0, 5, 0x02, 0, ATYP_IPV4, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();

        let err = SocksProxy::handle_client(server).await.unwrap_err();
        assert!(matches!(err, SocksError::Command(0x02)));

        let mut response = [0u8; 12];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(&response[..2], &[5, 0]);
        assert_eq!(response[3], REPLY_COMMAND_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn test_parses_ipv6_target() {
        let mut request: Vec<u8> = Ipv6Addr::LOCALHOST.octets().to_vec();
        request.extend_from_slice(&8080u16.to_be_bytes());
        let mut reader = &request[..];

        let target = read_target(&mut reader, ATYP_IPV6).await.unwrap();
        assert_eq!(target, TargetAddr::Ip("[::1]:8080".parse().unwrap()));
    }
}
