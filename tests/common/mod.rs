//! Shared helpers for driving closbgp sessions over in-memory pipes.

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use closbgp::bgp::prefix::Prefix;
use closbgp::bgp::transport::{MockTransport, SessionMode};
use closbgp::bgp::update::{AsPath, Origin, PathAttribute, UpdateMessage};
use closbgp::bgp::{Message, MessageCodec, OpenMessage, SessionConfig};
use closbgp::rib::{AdjRib, LocRib, RibHandle};
use closbgp::Coordinator;

pub const LOCAL_ASN: u16 = 65000;
const TIMEOUT: Duration = Duration::from_secs(10);

pub fn prefix(s: &str) -> Prefix {
    s.parse().unwrap()
}

/// Our address on the link to peer `idx`.
pub fn local_addr(idx: usize) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, idx as u8 + 1, 0)
}

pub fn announce(path: Vec<u16>, next_hop: Ipv4Addr, local_pref: u32, nlri: &str) -> Message {
    Message::Update(UpdateMessage::new(
        vec![],
        vec![
            PathAttribute::origin(Origin::Igp),
            PathAttribute::as_path(AsPath::sequence(path)),
            PathAttribute::next_hop(next_hop),
            PathAttribute::local_pref(local_pref),
        ],
        vec![prefix(nlri)],
    ))
}

pub fn withdraw(nlri: &str) -> Message {
    Message::Update(UpdateMessage::withdraw(vec![prefix(nlri)]))
}

/// A remote BGP speaker played by the test.
pub struct TestPeer {
    pub asn: u16,
    frames: FramedRead<ReadHalf<DuplexStream>, MessageCodec>,
    writer: WriteHalf<DuplexStream>,
}

impl TestPeer {
    pub fn new(asn: u16, stream: DuplexStream) -> Self {
        let (read_half, writer) = tokio::io::split(stream);
        Self {
            asn,
            frames: FramedRead::new(read_half, MessageCodec),
            writer,
        }
    }

    pub async fn send(&mut self, message: Message) {
        self.writer.write_all(&message.to_bytes()).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    pub async fn recv(&mut self) -> Message {
        tokio::time::timeout(TIMEOUT, self.frames.next())
            .await
            .expect("timed out waiting for message")
            .expect("stream ended")
            .expect("decode failed")
    }

    /// Skip keepalives until the next UPDATE.
    pub async fn recv_update(&mut self) -> UpdateMessage {
        loop {
            match self.recv().await {
                Message::Update(update) => return update,
                Message::Keepalive => continue,
                other => panic!("expected UPDATE, got {:?}", other),
            }
        }
    }

    /// Read UPDATEs until one satisfies `accept`.
    pub async fn recv_update_matching(
        &mut self,
        mut accept: impl FnMut(&UpdateMessage) -> bool,
    ) -> UpdateMessage {
        loop {
            let update = self.recv_update().await;
            if accept(&update) {
                return update;
            }
        }
    }

    pub async fn handshake(&mut self) {
        assert!(matches!(self.recv().await, Message::Open(_)));
        let open = OpenMessage::new(self.asn, 90, Ipv4Addr::new(2, 2, 2, self.asn as u8));
        self.send(Message::Open(open)).await;
        assert_eq!(self.recv().await, Message::Keepalive);
        self.send(Message::Keepalive).await;
    }
}

/// A coordinator with one mock-transport peer per entry in `peer_asns`.
pub struct Fabric {
    pub rib: RibHandle,
    pub peers: Vec<TestPeer>,
    pub shutdown: CancellationToken,
    pub task: tokio::task::JoinHandle<()>,
}

impl Fabric {
    pub async fn start(peer_asns: &[u16]) -> Self {
        let shutdown = CancellationToken::new();
        let mut coordinator = Coordinator::new(LOCAL_ASN, AdjRib::new(), shutdown.clone());

        let mut peers = Vec::new();
        for (idx, asn) in peer_asns.iter().enumerate() {
            let (transport, connector) = MockTransport::new();
            let mut config = SessionConfig::new(
                idx,
                format!("swp{}", idx + 1),
                SessionMode::Active,
                LOCAL_ASN,
                Ipv4Addr::new(1, 1, 1, 1),
                local_addr(idx),
            );
            config.peer_asn = Some(*asn);
            config.hold_time = 90;
            coordinator.spawn_peer(config, transport);
            peers.push(TestPeer::new(*asn, connector.connect()));
        }

        let rib = coordinator.rib().clone();
        let task = tokio::spawn(coordinator.run());

        for peer in &mut peers {
            peer.handshake().await;
        }

        Self {
            rib,
            peers,
            shutdown,
            task,
        }
    }

    /// Wait until the published Local RIB satisfies `check`.
    pub async fn wait_for_loc_rib(&self, check: impl FnMut(&Arc<LocRib>) -> bool) -> Arc<LocRib> {
        let mut feed = self.rib.subscribe();
        let loc_rib = tokio::time::timeout(TIMEOUT, feed.wait_for(check))
            .await
            .expect("timed out waiting for Local RIB")
            .expect("RIB engine stopped");
        Arc::clone(&loc_rib)
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        self.task.await.unwrap();
    }
}
