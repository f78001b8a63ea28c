//! The two long-lived loops moving packets across the relay.
//!
//! - Inbound: interface → frame → transport
//! - Outbound: transport → unframe → interface
//!
//! Each pump runs as its own task and only stops by ending its own loop;
//! errors never cross into the controller.

mod inbound;
mod outbound;

use std::sync::atomic::{AtomicU64, Ordering};

pub use inbound::InboundPump;
pub use outbound::OutboundPump;

/// Counters shared by both pumps.
#[derive(Debug, Default)]
pub struct RelayStats {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    packets_dropped: AtomicU64,
    malformed_frames: AtomicU64,
    write_errors: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Packets written to the transport.
    pub packets_sent: u64,

    /// Payload bytes written to the transport.
    pub bytes_sent: u64,

    /// Packets delivered to the interface.
    pub packets_received: u64,

    /// Payload bytes delivered to the interface.
    pub bytes_received: u64,

    /// Packets discarded before reaching the transport.
    pub packets_dropped: u64,

    /// Short frame headers skipped by the outbound pump.
    pub malformed_frames: u64,

    /// Failed transport writes.
    pub write_errors: u64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self, packets: usize) {
        self.packets_dropped.fetch_add(packets as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }
}
