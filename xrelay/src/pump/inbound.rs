//! Interface → transport.

use std::sync::Arc;

use bytes::BytesMut;
use futures::StreamExt;
use log::{debug, trace};

use crate::core::{encode_into, PacketBatch};
use crate::error::Error;
use crate::interface::PacketSource;
use crate::session::TransportSession;
use crate::MAX_PACKET_SIZE;

use super::RelayStats;

/// Drains packet batches from the interface into the transport.
///
/// Batches that arrive while the session is not connected are dropped
/// without buffering. The pump keeps consuming until the session is
/// cancelled or the source ends.
pub struct InboundPump<S> {
    session: Arc<TransportSession>,
    source: S,
    stats: Arc<RelayStats>,
    max_packet_size: usize,
    frame: BytesMut,
}

impl<S: PacketSource> InboundPump<S> {
    pub fn new(session: Arc<TransportSession>, source: S, stats: Arc<RelayStats>) -> Self {
        Self {
            session,
            source,
            stats,
            max_packet_size: MAX_PACKET_SIZE,
            frame: BytesMut::new(),
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Runs until the session is cancelled or the source ends.
    pub async fn run(mut self) {
        debug!("Inbound pump started");
        loop {
            let batch = tokio::select! {
                biased;
                _ = self.session.cancelled() => break,
                batch = self.source.next() => match batch {
                    Some(batch) => batch,
                    None => {
                        debug!("Packet source ended");
                        break;
                    }
                },
            };
            if !self.forward(batch).await {
                break;
            }
        }
        debug!("Inbound pump stopped");
    }

    /// Frames and writes each packet in order. Returns false once the
    /// session has been cancelled.
    async fn forward(&mut self, batch: PacketBatch) -> bool {
        if !self.session.is_connected() {
            trace!(
                "Session {}, dropping batch of {} packets",
                self.session.state(),
                batch.len()
            );
            self.stats.record_dropped(batch.len());
            return true;
        }

        let (packets, _) = batch.into_parts();
        let total = packets.len();
        for (i, packet) in packets.into_iter().enumerate() {
            if packet.is_empty() || packet.len() > self.max_packet_size {
                debug!("Skipping packet of {} bytes", packet.len());
                self.stats.record_dropped(1);
                continue;
            }

            self.frame.clear();
            if let Err(e) = encode_into(&packet, &mut self.frame) {
                debug!("Cannot frame packet: {}", e);
                self.stats.record_dropped(1);
                continue;
            }

            match self.session.write(&self.frame).await {
                Ok(()) => self.stats.record_sent(packet.len()),
                Err(Error::Cancelled) => return false,
                Err(Error::NotConnected(state)) => {
                    trace!("Session {}, dropping rest of batch", state);
                    self.stats.record_dropped(total - i);
                    return true;
                }
                Err(_) => self.stats.record_write_error(),
            }
        }
        true
    }
}
