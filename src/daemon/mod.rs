//! The coordinator: one RIB engine and one supervised session per peer.
//!
//! Every peer runs in its own task under a cancellation token derived from
//! the daemon's shutdown token. When a session instance fails, the peer's
//! task waits for the connect-retry time and starts a fresh one; failures
//! never leave that task. A peer cancelled with [`Coordinator::cancel_peer`]
//! is gone for good: its session closes with Cease 6/3 and its routes are
//! flushed from the RIB.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::bgp::fsm::FsmState;
use crate::bgp::session::{Session, SessionConfig};
use crate::bgp::transport::{TcpTransport, Transport};
use crate::config::{Config, Resolved};
use crate::rib::{connected_rib, AdjRib, RibEngine, RibHandle};

struct PeerTask {
    idx: usize,
    name: String,
    token: CancellationToken,
    removed: CancellationToken,
    state: watch::Receiver<FsmState>,
    task: JoinHandle<()>,
}

pub struct Coordinator {
    engine: JoinHandle<()>,
    rib: RibHandle,
    shutdown: CancellationToken,
    peers: Vec<PeerTask>,
}

impl Coordinator {
    /// Start the RIB engine. Must be called from within a Tokio runtime; the
    /// engine runs until `shutdown` is cancelled.
    pub fn new(local_asn: u16, connected: AdjRib, shutdown: CancellationToken) -> Self {
        let (engine, rib) = RibEngine::new(local_asn, connected);
        let engine = tokio::spawn(engine.run(shutdown.clone()));
        Self {
            engine,
            rib,
            shutdown,
            peers: Vec::new(),
        }
    }

    /// Build a coordinator with one TCP session per resolved peer.
    ///
    /// Peers that failed to resolve are logged and left out.
    pub fn from_config(config: &Config, resolved: &Resolved, shutdown: CancellationToken) -> Self {
        for failure in &resolved.failures {
            error!(error = %failure, "Skipping peer: {}", failure);
        }

        let identity = &resolved.identity;
        let connected = connected_rib(identity.asn, &identity.connected);
        let mut coordinator = Self::new(identity.asn, connected, shutdown);

        for peer in &resolved.peers {
            let transport = TcpTransport::new(peer.mode, peer.local_addr, peer.remote_addr)
                .with_port(config.port);
            coordinator.spawn_peer(config.session_config(peer), transport);
        }
        coordinator
    }

    pub fn rib(&self) -> &RibHandle {
        &self.rib
    }

    /// Start a supervised session for one peer.
    pub fn spawn_peer<T: Transport>(&mut self, config: SessionConfig, transport: T) {
        let idx = config.peer_idx;
        let name = config.name.clone();
        let token = self.shutdown.child_token();
        let removed = CancellationToken::new();

        info!(
            peer = %name,
            peer_idx = idx,
            mode = ?config.mode,
            local_addr = %config.local_addr,
            "Starting peer {}",
            name
        );
        let session = Session::new(config, transport, self.rib.clone())
            .with_deconfigure_token(removed.clone());
        let state = session.state_watch();
        let task = tokio::spawn(supervise(
            session,
            self.rib.clone(),
            token.clone(),
            removed.clone(),
        ));

        self.peers.push(PeerTask {
            idx,
            name,
            token,
            removed,
            state,
            task,
        });
    }

    /// Watch one peer's session state.
    pub fn peer_state(&self, idx: usize) -> Option<watch::Receiver<FsmState>> {
        self.peers
            .iter()
            .find(|peer| peer.idx == idx)
            .map(|peer| peer.state.clone())
    }

    /// Current state of every peer, by index and name.
    pub fn peer_states(&self) -> Vec<(usize, String, FsmState)> {
        self.peers
            .iter()
            .map(|peer| (peer.idx, peer.name.clone(), *peer.state.borrow()))
            .collect()
    }

    /// Stop one peer for good and drop its routes. Returns false if no such
    /// peer exists.
    pub fn cancel_peer(&self, idx: usize) -> bool {
        match self.peers.iter().find(|peer| peer.idx == idx) {
            Some(peer) => {
                info!(peer = %peer.name, "Cancelling peer {}", peer.name);
                peer.removed.cancel();
                peer.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait for shutdown, then for every peer task and the RIB engine.
    pub async fn run(self) {
        let Coordinator {
            engine,
            rib,
            shutdown,
            peers,
        } = self;
        info!(peers = peers.len(), "Coordinator running with {} peers", peers.len());

        shutdown.cancelled().await;
        drop(rib);

        for peer in peers {
            peer.token.cancel();
            if let Err(e) = peer.task.await {
                error!(peer = %peer.name, error = %e, "Peer task failed: {}", e);
            }
        }
        if let Err(e) = engine.await {
            error!(error = %e, "RIB engine failed: {}", e);
        }
        info!("Coordinator stopped");
    }
}

/// Run session instances back to back until `token` is cancelled.
///
/// If the peer was removed rather than shut down with the daemon, its
/// Adj-RIB-In is flushed on the way out.
async fn supervise<T: Transport>(
    mut session: Session<T>,
    rib: RibHandle,
    token: CancellationToken,
    removed: CancellationToken,
) {
    let idx = session.config().peer_idx;
    let name = session.config().name.clone();
    let retry: Duration = session.config().connect_retry_time;

    loop {
        match session.run(token.child_token()).await {
            Ok(()) => break,
            Err(e) => {
                info!(
                    peer = %name,
                    error = %e,
                    "Restarting session in {}s",
                    retry.as_secs()
                );
            }
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(retry) => {}
        }
    }

    if removed.is_cancelled() {
        if let Err(e) = rib.peer_down(idx).await {
            debug!(peer = %name, error = %e, "Could not flush routes: {}", e);
        }
    }
    debug!(peer = %name, state = %session.state(), "Peer task finished");
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::bgp::message::{Message, MessageCodec, OpenMessage};
    use crate::bgp::prefix::Prefix;
    use crate::bgp::transport::{MockTransport, SessionMode};
    use crate::bgp::update::{AsPath, Origin, PathAttribute, UpdateMessage};
    use crate::rib::RouteSource;

    use tokio_stream::StreamExt;
    use tokio_util::codec::FramedRead;

    fn session_config(idx: usize) -> SessionConfig {
        let mut config = SessionConfig::new(
            idx,
            format!("swp{}", idx + 1),
            SessionMode::Passive,
            65000,
            Ipv4Addr::new(1, 1, 1, 1),
            Ipv4Addr::new(10, 0, idx as u8 + 1, 0),
        );
        config.hold_time = 9;
        config.connect_retry_time = Duration::from_secs(5);
        config
    }

    /// Drive a remote peer through the handshake and return its streams.
    async fn handshake(
        stream: tokio::io::DuplexStream,
    ) -> (
        FramedRead<tokio::io::ReadHalf<tokio::io::DuplexStream>, MessageCodec>,
        tokio::io::WriteHalf<tokio::io::DuplexStream>,
    ) {
        let (read_half, mut writer) = tokio::io::split(stream);
        let mut frames = FramedRead::new(read_half, MessageCodec);

        assert!(matches!(frames.next().await, Some(Ok(Message::Open(_)))));
        let open = Message::Open(OpenMessage::new(65001, 9, Ipv4Addr::new(2, 2, 2, 2)));
        writer.write_all(&open.to_bytes()).await.unwrap();
        assert!(matches!(frames.next().await, Some(Ok(Message::Keepalive))));
        writer.write_all(&Message::Keepalive.to_bytes()).await.unwrap();
        (frames, writer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_session_is_restarted() {
        let shutdown = CancellationToken::new();
        let mut coordinator = Coordinator::new(65000, AdjRib::new(), shutdown.clone());
        let (transport, connector) = MockTransport::new();
        let first = connector.connect();
        let second = connector.connect();
        coordinator.spawn_peer(session_config(0), transport);

        let mut state = coordinator.peer_state(0).unwrap();
        let run = tokio::spawn(coordinator.run());

        let (_frames, mut writer) = handshake(first).await;
        state.wait_for(|s| s.is_established()).await.unwrap();

        // Garbage desynchronizes the first session.
        writer.write_all(&[0u8; 19]).await.unwrap();
        state.wait_for(|s| *s == FsmState::Idle).await.unwrap();

        let (_frames, _writer) = handshake(second).await;
        state.wait_for(|s| s.is_established()).await.unwrap();

        shutdown.cancel();
        run.await.unwrap();
        assert_eq!(*state.borrow(), FsmState::Idle);
    }

    #[tokio::test]
    async fn test_cancel_peer_stops_only_that_peer() {
        let shutdown = CancellationToken::new();
        let mut coordinator = Coordinator::new(65000, AdjRib::new(), shutdown.clone());

        let (transport_a, connector_a) = MockTransport::new();
        let (transport_b, connector_b) = MockTransport::new();
        let remote_a = connector_a.connect();
        let remote_b = connector_b.connect();
        coordinator.spawn_peer(session_config(0), transport_a);
        coordinator.spawn_peer(session_config(1), transport_b);

        let mut state_a = coordinator.peer_state(0).unwrap();
        let mut state_b = coordinator.peer_state(1).unwrap();
        assert!(coordinator.peer_state(7).is_none());
        assert!(!coordinator.cancel_peer(7));

        let _a = handshake(remote_a).await;
        let _b = handshake(remote_b).await;
        state_a.wait_for(|s| s.is_established()).await.unwrap();
        state_b.wait_for(|s| s.is_established()).await.unwrap();

        assert!(coordinator.cancel_peer(0));
        state_a.wait_for(|s| *s == FsmState::Idle).await.unwrap();
        assert_eq!(*state_b.borrow(), FsmState::Established);

        let states = coordinator.peer_states();
        assert_eq!(states[0], (0, "swp1".to_string(), FsmState::Idle));
        assert_eq!(states[1], (1, "swp2".to_string(), FsmState::Established));

        shutdown.cancel();
        coordinator.run().await;
    }

    #[tokio::test]
    async fn test_cancel_peer_sends_deconfigured_and_flushes_routes() {
        let shutdown = CancellationToken::new();
        let mut coordinator = Coordinator::new(65000, AdjRib::new(), shutdown.clone());
        let (transport, connector) = MockTransport::new();
        let remote = connector.connect();
        coordinator.spawn_peer(session_config(0), transport);

        let rib = coordinator.rib().clone();
        let mut state = coordinator.peer_state(0).unwrap();
        let (mut frames, mut writer) = handshake(remote).await;
        state.wait_for(|s| s.is_established()).await.unwrap();

        let announce = UpdateMessage::new(
            vec![],
            vec![
                PathAttribute::origin(Origin::Igp),
                PathAttribute::as_path(AsPath::sequence(vec![65001])),
                PathAttribute::next_hop(Ipv4Addr::new(10, 0, 1, 1)),
            ],
            vec!["10.9.0.0/24".parse::<Prefix>().unwrap()],
        );
        writer
            .write_all(&Message::Update(announce).to_bytes())
            .await
            .unwrap();

        let mut loc_rib = rib.subscribe();
        loc_rib.wait_for(|table| !table.is_empty()).await.unwrap();
        assert!(coordinator.cancel_peer(0));
        let run = tokio::spawn(coordinator.run());

        let cease = loop {
            match frames.next().await {
                Some(Ok(Message::Notification(notification))) => break notification,
                Some(Ok(_)) => continue,
                other => panic!("expected NOTIFICATION, got {:?}", other),
            }
        };
        assert_eq!((cease.code, cease.subcode), (6, 3));
        state.wait_for(|s| *s == FsmState::Idle).await.unwrap();

        loc_rib.wait_for(|table| table.is_empty()).await.unwrap();

        shutdown.cancel();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn test_from_config_seeds_connected_routes() {
        let config = Config::parse(
            r#"
            asn = 65000
            router_id = "10.255.0.1"
            prefixes = ["10.255.0.1/32"]
            "#,
        )
        .unwrap();
        let resolved = config.resolve(None).unwrap();
        let shutdown = CancellationToken::new();
        let coordinator = Coordinator::from_config(&config, &resolved, shutdown.clone());
        let rib = coordinator.rib().clone();
        let run = tokio::spawn(coordinator.run());

        let loc_rib = rib.snapshot().await.unwrap();
        let best = &loc_rib[&"10.255.0.1/32".parse::<Prefix>().unwrap()];
        assert_eq!(best.source, RouteSource::Connected);
        assert_eq!(best.entry.next_hop, Ipv4Addr::new(10, 255, 0, 1));

        shutdown.cancel();
        run.await.unwrap();
    }
}
