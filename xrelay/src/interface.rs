//! Collaborators on the virtual-interface side of the relay.
//!
//! The relay does not own the interface. It pulls packet batches from a
//! [`PacketSource`], pushes decoded packets into a [`PacketSink`] and asks a
//! [`NetworkSettingsApplier`] to configure addresses, routes and DNS before
//! connecting. [`channel_interface`] provides an in-memory implementation.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};

use futures::channel::mpsc;
use futures::{Stream, StreamExt};
use log::{debug, info};

use crate::core::PacketBatch;
use crate::error::Result;
use crate::DEFAULT_MTU;

/// Lazy, infinite, non-restartable sequence of batches read from the interface.
///
/// The stream ending means the interface is gone.
pub trait PacketSource: Stream<Item = PacketBatch> + Send + Unpin + 'static {}

impl<T> PacketSource for T where T: Stream<Item = PacketBatch> + Send + Unpin + 'static {}

/// Destination for packets coming back from the transport.
pub trait PacketSink: Send + Sync + 'static {
    /// Hands a batch to the interface. Must not block.
    fn write_packets(&self, batch: PacketBatch);
}

/// An IPv4 route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Route {
    /// Destination network.
    pub destination: Ipv4Addr,
    /// Subnet mask.
    pub mask: Ipv4Addr,
}

impl Ipv4Route {
    pub fn new(destination: Ipv4Addr, mask: Ipv4Addr) -> Self {
        Self { destination, mask }
    }

    /// The default route, 0.0.0.0/0.
    pub fn default_route() -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED)
    }

    /// A single-host route.
    pub fn host(address: Ipv4Addr) -> Self {
        Self::new(address, Ipv4Addr::BROADCAST)
    }
}

/// IPv4 part of the tunnel network settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Settings {
    /// Local tunnel addresses.
    pub addresses: Vec<Ipv4Addr>,
    /// Masks matching `addresses`.
    pub subnet_masks: Vec<Ipv4Addr>,
    /// Routes sent through the tunnel.
    pub included_routes: Vec<Ipv4Route>,
    /// Routes kept off the tunnel.
    pub excluded_routes: Vec<Ipv4Route>,
}

/// Configuration pushed to the host before the relay connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSettings {
    /// Address of the remote end of the tunnel.
    pub tunnel_remote_address: String,
    /// IPv4 addressing and routes.
    pub ipv4: Ipv4Settings,
    /// DNS servers used while the tunnel is up.
    pub dns_servers: Vec<IpAddr>,
    /// Interface MTU.
    pub mtu: u16,
}

impl NetworkSettings {
    /// Local tunnel address.
    pub const LOCAL_ADDRESS: Ipv4Addr = Ipv4Addr::new(10, 8, 0, 2);

    /// Local tunnel subnet mask.
    pub const LOCAL_MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

    /// Full-tunnel settings for the given server.
    ///
    /// All traffic is routed into the tunnel except the server itself, which
    /// can only be excluded when it is given as a literal IPv4 address.
    pub fn for_server(server_address: &str) -> Self {
        let excluded_routes = server_address
            .parse::<Ipv4Addr>()
            .map(|addr| vec![Ipv4Route::host(addr)])
            .unwrap_or_default();

        Self {
            tunnel_remote_address: server_address.to_string(),
            ipv4: Ipv4Settings {
                addresses: vec![Self::LOCAL_ADDRESS],
                subnet_masks: vec![Self::LOCAL_MASK],
                included_routes: vec![Ipv4Route::default_route()],
                excluded_routes,
            },
            dns_servers: vec![
                IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
                IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)),
            ],
            mtu: DEFAULT_MTU,
        }
    }
}

/// Applies tunnel network settings on the host.
pub trait NetworkSettingsApplier: Send + Sync {
    /// Applies `settings`, completing once the host accepted or refused them.
    fn apply(&self, settings: &NetworkSettings) -> impl Future<Output = Result<()>> + Send;
}

/// Applier that only logs the settings. For hosts that configure the
/// interface out of band.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOnlyApplier;

impl NetworkSettingsApplier for LogOnlyApplier {
    async fn apply(&self, settings: &NetworkSettings) -> Result<()> {
        info!(
            "Tunnel settings: remote={} addr={:?} mask={:?} mtu={}",
            settings.tunnel_remote_address,
            settings.ipv4.addresses,
            settings.ipv4.subnet_masks,
            settings.mtu
        );
        debug!(
            "Routes: include={:?} exclude={:?} dns={:?}",
            settings.ipv4.included_routes, settings.ipv4.excluded_routes, settings.dns_servers
        );
        Ok(())
    }
}

/// Sink half of an in-memory interface.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<PacketBatch>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<PacketBatch>) -> Self {
        Self { tx }
    }
}

impl PacketSink for ChannelSink {
    fn write_packets(&self, batch: PacketBatch) {
        if self.tx.unbounded_send(batch).is_err() {
            debug!("Interface closed, dropping delivered batch");
        }
    }
}

/// Host side of an in-memory interface.
#[derive(Debug)]
pub struct InterfaceHandle {
    inject: mpsc::UnboundedSender<PacketBatch>,
    delivered: mpsc::UnboundedReceiver<PacketBatch>,
}

impl InterfaceHandle {
    /// Injects a batch as if the host network stack produced it.
    ///
    /// Returns false once the relay stopped reading.
    pub fn send(&self, batch: PacketBatch) -> bool {
        self.inject.unbounded_send(batch).is_ok()
    }

    /// Waits for the next batch the relay delivered to the interface.
    pub async fn recv(&mut self) -> Option<PacketBatch> {
        self.delivered.next().await
    }

    /// Ends the packet source; the inbound pump stops after draining it.
    pub fn close_source(&self) {
        self.inject.close_channel();
    }
}

/// Creates a connected in-memory interface.
///
/// Returns the host handle, the source read by the inbound pump and the sink
/// written by the outbound pump.
pub fn channel_interface() -> (
    InterfaceHandle,
    mpsc::UnboundedReceiver<PacketBatch>,
    ChannelSink,
) {
    let (inject, source) = mpsc::unbounded();
    let (delivered_tx, delivered) = mpsc::unbounded();
    (
        InterfaceHandle { inject, delivered },
        source,
        ChannelSink::new(delivered_tx),
    )
}
