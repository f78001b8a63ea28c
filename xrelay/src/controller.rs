//! Relay lifecycle: start, stop and everything in between.
//!
//! The controller is the only owner of the transport session. `start`
//! applies the tunnel network settings, connects, waits for the session to
//! reach `Connected` (or the deadline, whichever comes first) and then
//! launches both pumps together. `stop` cancels the session, which is the
//! single signal that ends both pumps.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::{Endpoint, RelayConfig};
use crate::error::{Error, Result};
use crate::interface::{NetworkSettingsApplier, PacketSink, PacketSource};
use crate::pump::{InboundPump, OutboundPump, RelayStats, StatsSnapshot};
use crate::session::{SessionState, TransportSession};

/// How long `stop` waits for each task before aborting it.
const STOP_GRACE: Duration = Duration::from_secs(1);

/// Why the relay is being stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The user turned the tunnel off.
    UserInitiated,
    /// The hosting provider failed.
    ProviderFailed,
    /// The connection to the server was lost.
    ConnectionFailed,
    /// The host has no network.
    NoNetworkAvailable,
    /// Another configuration took over.
    Superseded,
    /// Anything else.
    Other,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StopReason::UserInitiated => "user initiated",
            StopReason::ProviderFailed => "provider failed",
            StopReason::ConnectionFailed => "connection failed",
            StopReason::NoNetworkAvailable => "no network available",
            StopReason::Superseded => "superseded",
            StopReason::Other => "other",
        };
        f.write_str(name)
    }
}

struct ActiveRelay {
    session: Arc<TransportSession>,
    tasks: Vec<JoinHandle<()>>,
}

/// Drives one relay session at a time.
///
/// Calls to [`start`](RelayController::start) and
/// [`stop`](RelayController::stop) are expected to be serialized by the host.
pub struct RelayController<A> {
    config: RelayConfig,
    applier: A,
    stats: Arc<RelayStats>,
    active: Option<ActiveRelay>,
}

impl<A: NetworkSettingsApplier> RelayController<A> {
    pub fn new(config: RelayConfig, applier: A) -> Self {
        Self {
            config,
            applier,
            stats: Arc::new(RelayStats::new()),
            active: None,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Counters of the current (or last) relay session.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Returns true between a successful `start` and the next `stop`.
    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// State of the live transport session, if any.
    pub fn session_state(&self) -> Option<SessionState> {
        self.active.as_ref().map(|active| active.session.state())
    }

    /// Brings the relay up.
    ///
    /// On success both pumps are running. On failure nothing is left
    /// running and the error says why: bad configuration, refused network
    /// settings, connection failure or connection timeout.
    pub async fn start<S, K>(&mut self, source: S, sink: K) -> Result<()>
    where
        S: PacketSource,
        K: PacketSink,
    {
        if self.active.is_some() {
            return Err(Error::InvalidState("relay already running"));
        }

        info!("Starting tunnel...");
        if let Err(e) = self.config.validate() {
            error!("Missing server configuration: {}", e);
            return Err(e);
        }

        if let Err(e) = self.applier.apply(&self.config.network).await {
            error!("Failed to set tunnel network settings: {}", e);
            return Err(e);
        }

        let endpoint = self.config.endpoint.clone();
        let session = Arc::new(TransportSession::new());
        let states = session.subscribe();
        session.connect(endpoint.clone())?;

        if let Err(e) = wait_for_connected(states, self.config.connect_timeout, &endpoint).await {
            error!("Failed to connect to server: {}", e);
            session.cancel();
            return Err(e);
        }
        info!("Connected to server successfully");

        self.stats = Arc::new(RelayStats::new());
        let max = self.config.max_packet_size;
        let inbound = InboundPump::new(Arc::clone(&session), source, Arc::clone(&self.stats))
            .with_max_packet_size(max);
        let outbound = OutboundPump::new(Arc::clone(&session), sink, Arc::clone(&self.stats))
            .with_max_packet_size(max);

        let tasks = vec![
            tokio::spawn(inbound.run()),
            tokio::spawn(outbound.run()),
            tokio::spawn(monitor_session(session.subscribe())),
        ];
        self.active = Some(ActiveRelay { session, tasks });

        Ok(())
    }

    /// Tears the relay down. Always succeeds and never waits longer than a
    /// short grace period per task.
    pub async fn stop(&mut self, reason: StopReason) {
        info!("Stopping tunnel with reason: {}", reason);
        let Some(active) = self.active.take() else {
            debug!("No relay running");
            return;
        };

        active.session.cancel();
        for mut task in active.tasks {
            if timeout(STOP_GRACE, &mut task).await.is_err() {
                warn!("Relay task did not stop within {:?}, aborting", STOP_GRACE);
                task.abort();
            }
        }
        debug!("Tunnel stopped");
    }

    /// Accepts a message from the controlling application. The relay has
    /// no commands, so the message is only logged.
    pub fn handle_app_message(&self, message: &[u8]) -> Option<Vec<u8>> {
        debug!("Received app message: {}", String::from_utf8_lossy(message));
        None
    }
}

/// Waits until the session is connected, has failed, or `deadline` passed.
pub(crate) async fn wait_for_connected(
    mut states: watch::Receiver<SessionState>,
    deadline: Duration,
    endpoint: &Endpoint,
) -> Result<()> {
    let outcome = timeout(
        deadline,
        states.wait_for(|s| *s == SessionState::Connected || s.is_terminal()),
    )
    .await;

    match outcome {
        Err(_) => Err(Error::ConnectionTimeout(deadline)),
        Ok(Err(_)) => Err(Error::ConnectionFailed(endpoint.to_string())),
        Ok(Ok(state)) if *state == SessionState::Connected => Ok(()),
        Ok(Ok(state)) => Err(Error::ConnectionFailed(format!("{} ({})", endpoint, *state))),
    }
}

async fn monitor_session(mut states: watch::Receiver<SessionState>) {
    while states.changed().await.is_ok() {
        let state = *states.borrow_and_update();
        match state {
            SessionState::Failed => {
                warn!("Connection to server lost, relay no longer forwarding");
                break;
            }
            SessionState::Cancelled => break,
            other => debug!("Connection state: {}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FrameCodec, PacketBatch};
    use crate::error::ErrorKind;
    use crate::interface::{channel_interface, LogOnlyApplier, NetworkSettings};
    use bytes::Bytes;
    use futures::{SinkExt, StreamExt};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::time::Instant;
    use tokio_util::codec::Framed;

    #[derive(Default)]
    struct CountingApplier {
        calls: AtomicUsize,
        fail: bool,
    }

    impl NetworkSettingsApplier for CountingApplier {
        async fn apply(&self, _settings: &NetworkSettings) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::NetworkSettings("refused".into()));
            }
            Ok(())
        }
    }

    async fn local_server() -> (TcpListener, RelayConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = RelayConfig::new("127.0.0.1")
            .with_port(port)
            .with_connect_timeout(Duration::from_secs(2));
        (listener, config)
    }

    #[tokio::test]
    async fn test_start_rejects_missing_address() {
        let mut controller = RelayController::new(RelayConfig::new(""), CountingApplier::default());
        let (_handle, source, sink) = channel_interface();

        let err = controller.start(source, sink).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(controller.applier.calls.load(Ordering::SeqCst), 0);
        assert!(!controller.is_running());
    }

    #[tokio::test]
    async fn test_start_surfaces_network_settings_failure() {
        let applier = CountingApplier {
            fail: true,
            ..Default::default()
        };
        let mut controller = RelayController::new(RelayConfig::new("127.0.0.1"), applier);
        let (_handle, source, sink) = channel_interface();

        let err = controller.start(source, sink).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkSettings);
        assert!(!controller.is_running());
    }

    #[tokio::test]
    async fn test_start_connection_refused() {
        let (listener, config) = local_server().await;
        drop(listener);

        let mut controller = RelayController::new(config, LogOnlyApplier);
        let (_handle, source, sink) = channel_interface();

        let started = Instant::now();
        let err = controller.start(source, sink).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!controller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_deadline_is_honoured() {
        let session = TransportSession::new();
        session.transition(SessionState::Connecting);
        let endpoint = Endpoint::Tcp {
            host: "192.0.2.1".into(),
            port: 9876,
        };

        let started = Instant::now();
        let err = wait_for_connected(session.subscribe(), Duration::from_secs(5), &endpoint)
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err.kind(), ErrorKind::ConnectionTimeout);
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_within_deadline_succeeds() {
        let session = Arc::new(TransportSession::new());
        session.transition(SessionState::Connecting);
        let endpoint = Endpoint::Unix("/tmp/relay.sock".into());

        let late = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(4900)).await;
                let (local, remote) = tokio::io::duplex(16);
                session.attach(local).await;
                remote
            })
        };

        wait_for_connected(session.subscribe(), Duration::from_secs(5), &endpoint)
            .await
            .unwrap();
        let _remote = late.await.unwrap();
    }

    #[tokio::test]
    async fn test_relays_both_directions() {
        let (listener, config) = local_server().await;
        let mut controller = RelayController::new(config, LogOnlyApplier);
        let (mut handle, source, sink) = channel_interface();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, FrameCodec::new());
            let packet = framed.next().await.unwrap().unwrap();
            let mut reply = packet.to_vec();
            reply.reverse();
            framed.send(Bytes::from(reply)).await.unwrap();
            framed
        });

        controller.start(source, sink).await.unwrap();
        assert!(controller.is_running());
        assert_eq!(controller.session_state(), Some(SessionState::Connected));

        let mut packet = vec![0u8; 20];
        packet[19] = 0x45;
        handle.send(PacketBatch::from_packets(vec![packet]));

        let batch = timeout(Duration::from_secs(2), handle.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.packets()[0][0], 0x45);
        assert_eq!(batch.packets()[0].len(), 20);

        let _framed = server.await.unwrap();
        controller.stop(StopReason::UserInitiated).await;
        assert!(!controller.is_running());

        let stats = controller.stats();
        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.bytes_sent, 20);
        assert_eq!(stats.packets_received, 1);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let (listener, config) = local_server().await;
        let accept = tokio::spawn(async move { listener.accept().await.map(|(s, _)| s) });
        let mut controller = RelayController::new(config, LogOnlyApplier);

        let (_h1, source, sink) = channel_interface();
        controller.start(source, sink).await.unwrap();
        let _server = accept.await.unwrap().unwrap();

        let (_h2, source, sink) = channel_interface();
        let err = controller.start(source, sink).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        controller.stop(StopReason::UserInitiated).await;
    }

    #[tokio::test]
    async fn test_stop_while_outbound_blocked_mid_frame() {
        let (listener, config) = local_server().await;
        let mut controller = RelayController::new(config, LogOnlyApplier);
        let (mut handle, source, sink) = channel_interface();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(&[0, 0, 0, 40, 0x45, 0]).await.unwrap();
            stream
        });

        controller.start(source, sink).await.unwrap();
        let _stream = server.await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        timeout(Duration::from_secs(3), controller.stop(StopReason::UserInitiated))
            .await
            .expect("stop never blocks indefinitely");

        // The sink was dropped with the pump and nothing partial came through.
        assert!(handle.recv().await.is_none());
        assert_eq!(controller.stats().packets_received, 0);
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let mut controller = RelayController::new(RelayConfig::default(), LogOnlyApplier);
        controller.stop(StopReason::Other).await;
        assert!(!controller.is_running());
        assert!(controller.session_state().is_none());
    }

    #[test]
    fn test_app_message_is_ignored() {
        let controller = RelayController::new(RelayConfig::default(), LogOnlyApplier);
        assert!(controller.handle_app_message(b"status?").is_none());
    }
}
