use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::interface::NetworkSettings;
use crate::{DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_MTU, DEFAULT_SERVER_PORT, MAX_PACKET_SIZE};

/// Provider configuration key holding the server address.
pub const SERVER_ADDRESS_KEY: &str = "serverAddress";

/// Provider configuration key holding the server port.
pub const SERVER_PORT_KEY: &str = "serverPort";

/// Where the transport session connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP host name or address and port.
    Tcp { host: String, port: u16 },
    /// Unix domain stream socket.
    Unix(PathBuf),
    /// Vsock stream socket.
    Vsock { cid: u32, port: u32 },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } if host.contains(':') => write!(f, "[{}]:{}", host, port),
            Endpoint::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Vsock { cid, port } => write!(f, "vsock:{}:{}", cid, port),
        }
    }
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Server address, also used as the tunnel remote address.
    pub server_address: String,
    /// Stream endpoint of the server.
    pub endpoint: Endpoint,
    /// How long `start` waits for the connection.
    pub connect_timeout: Duration,
    /// Largest packet accepted in either direction.
    pub max_packet_size: usize,
    /// Settings pushed to the virtual interface before connecting.
    pub network: NetworkSettings,
}

impl RelayConfig {
    pub fn new(server_address: impl Into<String>) -> Self {
        let server_address = server_address.into();
        Self {
            endpoint: Endpoint::Tcp {
                host: server_address.clone(),
                port: DEFAULT_SERVER_PORT,
            },
            network: NetworkSettings::for_server(&server_address),
            server_address,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            max_packet_size: MAX_PACKET_SIZE,
        }
    }

    /// Builds a configuration from the host's provider configuration map.
    pub fn from_provider_configuration(map: &HashMap<String, String>) -> Result<Self> {
        let address = map
            .get(SERVER_ADDRESS_KEY)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Configuration("missing server configuration".into()))?;

        let port = match map.get(SERVER_PORT_KEY) {
            Some(raw) => raw.trim().parse::<u16>().map_err(|_| {
                Error::Configuration(format!("invalid {}: {:?}", SERVER_PORT_KEY, raw))
            })?,
            None => DEFAULT_SERVER_PORT,
        };

        let config = Self::new(address).with_port(port);
        config.validate()?;
        Ok(config)
    }

    /// Sets the TCP port; ignored for non-TCP endpoints.
    pub fn with_port(mut self, port: u16) -> Self {
        if let Endpoint::Tcp { port: p, .. } = &mut self.endpoint {
            *p = port;
        }
        self
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.network.mtu = mtu;
        self
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn with_network_settings(mut self, settings: NetworkSettings) -> Self {
        self.network = settings;
        self
    }

    /// Checks the configuration before anything touches the network.
    pub fn validate(&self) -> Result<()> {
        if self.server_address.trim().is_empty() {
            return Err(Error::Configuration("missing server address".into()));
        }
        match &self.endpoint {
            Endpoint::Tcp { host, port } => {
                if host.trim().is_empty() {
                    return Err(Error::Configuration("missing server host".into()));
                }
                if *port == 0 {
                    return Err(Error::Configuration("server port must not be 0".into()));
                }
            }
            Endpoint::Unix(path) => {
                if path.as_os_str().is_empty() {
                    return Err(Error::Configuration("empty unix socket path".into()));
                }
            }
            Endpoint::Vsock { .. } => {}
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::Configuration("connect timeout must be positive".into()));
        }
        if self.max_packet_size == 0 || self.max_packet_size > u32::MAX as usize {
            return Err(Error::Configuration(format!(
                "max packet size {} out of range",
                self.max_packet_size
            )));
        }
        if self.network.mtu == 0 {
            return Err(Error::Configuration("mtu must be positive".into()));
        }
        Ok(())
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::new("127.0.0.1")
    }
}
