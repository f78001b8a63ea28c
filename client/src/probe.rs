use std::time::{Duration, Instant};

use log::*;
use xrelay::{
    channel_interface, Ipv4Header, LogOnlyApplier, NetworkSettings, PacketBatch, RelayConfig,
    RelayController, Result, StatsSnapshot, StopReason,
};

/// Packets handed to the interface per batch.
const BATCH_SIZE: usize = 64;

/// Smallest packet the probe can build: IPv4 header plus UDP header.
pub const MIN_PACKET_SIZE: usize = Ipv4Header::MIN_LEN + 8;

/// Outcome of one probe run.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub sent: usize,
    pub received: usize,
    pub bytes_received: usize,
    pub elapsed: Duration,
    pub stats: StatsSnapshot,
}

impl ProbeReport {
    pub fn print(&self) {
        let kb = self.bytes_received as f64 / 1024.0;
        let speed = kb / self.elapsed.as_secs_f64().max(f64::EPSILON);

        info!("=== Probe Complete ===");
        info!("Packets sent: {}", self.sent);
        info!("Echoes received: {}", self.received);
        info!("Total received: {:.1} KB", kb);
        info!("Time: {:.2} seconds", self.elapsed.as_secs_f64());
        info!("Speed: {:.2} KB/s", speed);
        info!(
            "Relay stats: sent={} ({} B) received={} ({} B) dropped={} malformed={} write_errors={}",
            self.stats.packets_sent,
            self.stats.bytes_sent,
            self.stats.packets_received,
            self.stats.bytes_received,
            self.stats.packets_dropped,
            self.stats.malformed_frames,
            self.stats.write_errors
        );
    }
}

/// Sends `count` UDP packets of `size` bytes through the relay and counts
/// what comes back within `wait`.
pub async fn run(config: RelayConfig, count: usize, size: usize, wait: Duration) -> Result<ProbeReport> {
    let size = size.max(MIN_PACKET_SIZE);
    let mut controller = RelayController::new(config, LogOnlyApplier);
    let (mut handle, source, sink) = channel_interface();
    controller.start(source, sink).await?;

    info!("Sending {} packets of {} bytes...", count, size);
    let start = Instant::now();
    let packets: Vec<Vec<u8>> = (0..count).map(|seq| synthetic_packet(seq, size)).collect();
    for chunk in packets.chunks(BATCH_SIZE) {
        if !handle.send(PacketBatch::from_packets(chunk.iter().cloned())) {
            warn!("Relay stopped reading from the interface");
            break;
        }
    }

    let deadline = tokio::time::Instant::now() + wait;
    let mut received = 0;
    let mut bytes_received = 0;
    while received < count {
        match tokio::time::timeout_at(deadline, handle.recv()).await {
            Ok(Some(batch)) => {
                received += batch.len();
                bytes_received += batch.byte_len();
            }
            Ok(None) => break,
            Err(_) => {
                warn!("Gave up waiting after {:?}, {} of {} echoes", wait, received, count);
                break;
            }
        }
    }
    let elapsed = start.elapsed();

    controller.stop(StopReason::UserInitiated).await;

    Ok(ProbeReport {
        sent: count,
        received,
        bytes_received,
        elapsed,
        stats: controller.stats(),
    })
}

/// IPv4/UDP packet from the tunnel address to 10.8.0.1:9, sequence number
/// in the first payload bytes.
fn synthetic_packet(seq: usize, size: usize) -> Vec<u8> {
    let mut packet = vec![0u8; size];
    let total = u16::try_from(size).unwrap_or(u16::MAX);

    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&total.to_be_bytes());
    packet[4..6].copy_from_slice(&(seq as u16).to_be_bytes());
    packet[8] = 64;
    packet[9] = 17;
    packet[12..16].copy_from_slice(&NetworkSettings::LOCAL_ADDRESS.octets());
    packet[16..20].copy_from_slice(&[10, 8, 0, 1]);

    let udp_len = total.saturating_sub(Ipv4Header::MIN_LEN as u16);
    packet[20..22].copy_from_slice(&40000u16.to_be_bytes());
    packet[22..24].copy_from_slice(&9u16.to_be_bytes());
    packet[24..26].copy_from_slice(&udp_len.to_be_bytes());
    if size >= MIN_PACKET_SIZE + 8 {
        packet[28..36].copy_from_slice(&(seq as u64).to_be_bytes());
    }
    packet
}
