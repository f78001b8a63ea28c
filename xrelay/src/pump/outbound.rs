//! Transport → interface.

use std::sync::Arc;

use bytes::Bytes;
use log::{debug, trace, warn};

use crate::core::{decode_header, PacketBatch, Protocol, FRAME_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::interface::PacketSink;
use crate::session::TransportSession;
use crate::MAX_PACKET_SIZE;

use super::RelayStats;

/// Reads framed packets from the transport and hands them to the interface.
pub struct OutboundPump<K> {
    session: Arc<TransportSession>,
    sink: K,
    stats: Arc<RelayStats>,
    max_packet_size: usize,
}

impl<K: PacketSink> OutboundPump<K> {
    pub fn new(session: Arc<TransportSession>, sink: K, stats: Arc<RelayStats>) -> Self {
        Self {
            session,
            sink,
            stats,
            max_packet_size: MAX_PACKET_SIZE,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Loops while the session is connected.
    ///
    /// A short header is skipped and the loop continues; any other error,
    /// including cancellation, ends the loop.
    pub async fn run(self) {
        debug!("Outbound pump started");
        while self.session.is_connected() {
            match self.next_packet().await {
                Ok(Some(packet)) => self.deliver(packet),
                Ok(None) => trace!("Skipping empty frame"),
                Err(e) if !e.is_fatal_to_pump() => {
                    debug!("Skipping frame: {}", e);
                    self.stats.record_malformed();
                }
                Err(Error::Cancelled) => break,
                Err(e) => {
                    warn!("Outbound pump stopping: {}", e);
                    break;
                }
            }
        }
        debug!("Outbound pump stopped");
    }

    /// Reads one frame. `Ok(None)` for a zero-length frame.
    async fn next_packet(&self) -> Result<Option<Bytes>> {
        let header = self.session.read_exact(FRAME_HEADER_SIZE).await?;
        let len = decode_header(&header)? as usize;
        if len == 0 {
            return Ok(None);
        }
        if len > self.max_packet_size {
            return Err(Error::FrameTooLarge {
                len,
                max: self.max_packet_size,
            });
        }

        let payload = self.session.read_exact(len).await?;
        if payload.len() < len {
            // Stream ended inside the payload; never deliver a partial packet.
            return Err(Error::ConnectionClosed);
        }
        Ok(Some(payload))
    }

    fn deliver(&self, packet: Bytes) {
        let protocol = Protocol::of_packet(&packet);
        self.stats.record_received(packet.len());
        trace!("Delivering {} byte {:?} packet", packet.len(), protocol);

        let mut batch = PacketBatch::new();
        batch.push(packet, protocol);
        self.sink.write_packets(batch);
    }
}
