//! # XRelay - A Packet Relay over a Single Stream
//!
//! XRelay moves raw IP packets between a virtual ("tun"-style) network
//! interface and one outbound stream connection. Packets keep their
//! boundaries on the byte stream thanks to a minimal length-prefixed framing:
//!
//! - **Framing**: every packet is sent as a 4-byte big-endian length followed by the payload
//! - **Two pumps**: interface → transport and transport → interface run as independent tasks
//! - **Explicit session state**: the transport connection is a small observable state machine
//! - **Bounded startup**: connecting races a deadline instead of sleeping and checking
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Relay Controller                      │
//! │        start(config) / stop(reason) / stats()            │
//! ├──────────────────────────┬──────────────────────────────┤
//! │      Inbound Pump        │        Outbound Pump          │
//! │  interface ──► encode    │   read_exact ──► decode       │
//! │            ──► write     │              ──► interface    │
//! ├──────────────────────────┴──────────────────────────────┤
//! │                    Transport Session                     │
//! │  Disconnected → Connecting → Connected → Cancelled/Failed│
//! ├─────────────────────────────────────────────────────────┤
//! │             TCP  /  Unix socket  /  Vsock                │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use xrelay::{channel_interface, LogOnlyApplier, RelayConfig, RelayController, StopReason};
//!
//! let config = RelayConfig::new("192.168.1.20").with_port(9876);
//! let mut controller = RelayController::new(config, LogOnlyApplier);
//!
//! let (handle, source, sink) = channel_interface();
//! controller.start(source, sink).await?;
//!
//! // ... inject packets through `handle`, receive the replies ...
//!
//! controller.stop(StopReason::UserInitiated).await;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod controller;
pub mod core;
pub mod error;
pub mod interface;
pub mod pump;
pub mod session;

pub use config::{Endpoint, RelayConfig};
pub use controller::{RelayController, StopReason};
pub use crate::core::{decode_header, encode, FrameCodec, Ipv4Header, PacketBatch, Protocol, FRAME_HEADER_SIZE};
pub use error::{Error, ErrorKind, Result};
pub use interface::{
    channel_interface, ChannelSink, InterfaceHandle, Ipv4Route, Ipv4Settings, LogOnlyApplier,
    NetworkSettings, NetworkSettingsApplier, PacketSink, PacketSource,
};
pub use pump::{RelayStats, StatsSnapshot};
pub use session::{SessionState, TransportSession};

/// Default port of the relay server.
pub const DEFAULT_SERVER_PORT: u16 = 9876;

/// Default MTU pushed to the virtual interface.
pub const DEFAULT_MTU: u16 = 1400;

/// Largest packet carried by one frame.
pub const MAX_PACKET_SIZE: usize = 65535;

/// Default time allowed for the transport connection to come up.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;
