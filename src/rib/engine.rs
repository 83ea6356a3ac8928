//! The RIB engine task.
//!
//! One task owns every Adj-RIB-In and the Connected RIB. Sessions reach it
//! through a single shared command channel, tagging each command with their
//! peer index. For every UPDATE the engine applies it, reruns selection and
//! publishes the new Local RIB before taking the next command, so no observer
//! ever sees a Local RIB built from part of an UPDATE.
//!
//! The Local RIB is published on a `watch` channel: each subscriber only ever
//! sees the latest table, so a slow session cannot hold up the engine or the
//! other sessions.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bgp::update::UpdateMessage;
use crate::error::RibError;

use super::{apply_update, select_best, AdjRib, LocRib};

const COMMAND_CHANNEL_SIZE: usize = 256;

/// Commands accepted by the RIB engine.
#[derive(Debug)]
pub enum RibCommand {
    /// An UPDATE received from a peer.
    Update { peer_idx: usize, update: UpdateMessage },
    /// A new session with this peer reached Established; anything left from
    /// the previous session is stale.
    PeerUp { peer_idx: usize },
    /// The peer was removed for good; its routes go with it.
    PeerDown { peer_idx: usize },
    /// Current Local RIB.
    GetLocRib { response: oneshot::Sender<Arc<LocRib>> },
    /// Copy of one peer's Adj-RIB-In.
    GetAdjRibIn {
        peer_idx: usize,
        response: oneshot::Sender<AdjRib>,
    },
}

pub struct RibEngine {
    local_asn: u16,
    connected: AdjRib,
    adj_rib_in: BTreeMap<usize, AdjRib>,
    command_rx: mpsc::Receiver<RibCommand>,
    loc_rib_tx: watch::Sender<Arc<LocRib>>,
}

impl RibEngine {
    /// Create the engine and a handle to it. The initial Local RIB holds the
    /// connected routes.
    pub fn new(local_asn: u16, connected: AdjRib) -> (Self, RibHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let initial = select_best(&connected, &BTreeMap::new());
        let (loc_rib_tx, loc_rib_rx) = watch::channel(Arc::new(initial));

        let engine = Self {
            local_asn,
            connected,
            adj_rib_in: BTreeMap::new(),
            command_rx,
            loc_rib_tx,
        };
        (
            engine,
            RibHandle {
                command_tx,
                loc_rib_rx,
            },
        )
    }

    /// Run until `shutdown` is cancelled or every handle is dropped.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            connected = self.connected.len(),
            "RIB engine started with {} connected routes",
            self.connected.len()
        );

        loop {
            let command = tokio::select! {
                _ = shutdown.cancelled() => break,
                command = self.command_rx.recv() => command,
            };
            match command {
                Some(command) => self.handle_command(command),
                None => break,
            }
        }

        debug!("RIB engine stopped");
    }

    fn handle_command(&mut self, command: RibCommand) {
        match command {
            RibCommand::Update { peer_idx, update } => {
                debug!(
                    peer_idx,
                    withdrawn = update.withdrawn.len(),
                    announced = update.nlri.len(),
                    "Applying UPDATE"
                );
                self.apply(peer_idx, &update);
                self.reselect();
            }
            RibCommand::PeerUp { peer_idx } => {
                let stale = self.flush(peer_idx);
                if stale > 0 {
                    info!(
                        peer_idx,
                        routes = stale,
                        "Flushed {} routes from previous session",
                        stale
                    );
                }
            }
            RibCommand::PeerDown { peer_idx } => {
                let removed = self.flush(peer_idx);
                info!(peer_idx, routes = removed, "Peer removed, flushed {} routes", removed);
            }
            RibCommand::GetLocRib { response } => {
                let _ = response.send(self.loc_rib_tx.borrow().clone());
            }
            RibCommand::GetAdjRibIn { peer_idx, response } => {
                let rib = self.adj_rib_in.get(&peer_idx).cloned().unwrap_or_default();
                let _ = response.send(rib);
            }
        }
    }

    /// Drop a peer's Adj-RIB-In and reselect if it held anything.
    fn flush(&mut self, peer_idx: usize) -> usize {
        let removed = self.adj_rib_in.remove(&peer_idx).map_or(0, |rib| rib.len());
        if removed > 0 {
            self.reselect();
        }
        removed
    }

    fn apply(&mut self, peer_idx: usize, update: &UpdateMessage) {
        let rib = self.adj_rib_in.entry(peer_idx).or_default();

        // Routes that already crossed this AS are treated as withdrawn.
        let looped = !update.nlri.is_empty()
            && update.as_path().is_some_and(|path| path.contains(self.local_asn));
        if looped {
            debug!(peer_idx, prefixes = update.nlri.len(), "Dropping looped routes");
            let withdrawn = update.withdrawn.iter().chain(&update.nlri).copied().collect();
            apply_update(rib, &UpdateMessage::withdraw(withdrawn));
        } else {
            apply_update(rib, update);
        }
    }

    fn reselect(&mut self) {
        let loc_rib = select_best(&self.connected, &self.adj_rib_in);
        let changed = self.loc_rib_tx.send_if_modified(|current| {
            if **current == loc_rib {
                false
            } else {
                *current = Arc::new(loc_rib);
                true
            }
        });
        if changed {
            debug!(
                routes = self.loc_rib_tx.borrow().len(),
                "Local RIB changed"
            );
        }
    }
}

/// Clonable handle for talking to the RIB engine.
#[derive(Clone)]
pub struct RibHandle {
    command_tx: mpsc::Sender<RibCommand>,
    loc_rib_rx: watch::Receiver<Arc<LocRib>>,
}

impl RibHandle {
    /// Hand an UPDATE from `peer_idx` to the engine. Waits for channel space.
    pub async fn update(&self, peer_idx: usize, update: UpdateMessage) -> Result<(), RibError> {
        self.send(RibCommand::Update { peer_idx, update }).await
    }

    pub async fn peer_up(&self, peer_idx: usize) -> Result<(), RibError> {
        self.send(RibCommand::PeerUp { peer_idx }).await
    }

    pub async fn peer_down(&self, peer_idx: usize) -> Result<(), RibError> {
        self.send(RibCommand::PeerDown { peer_idx }).await
    }

    /// Snapshot of the current Local RIB.
    pub async fn snapshot(&self) -> Result<Arc<LocRib>, RibError> {
        let (tx, rx) = oneshot::channel();
        self.send(RibCommand::GetLocRib { response: tx }).await?;
        rx.await.map_err(|_| RibError::EngineClosed)
    }

    pub async fn adj_rib_in(&self, peer_idx: usize) -> Result<AdjRib, RibError> {
        let (tx, rx) = oneshot::channel();
        self.send(RibCommand::GetAdjRibIn {
            peer_idx,
            response: tx,
        })
        .await?;
        rx.await.map_err(|_| RibError::EngineClosed)
    }

    /// Latest-value feed of the Local RIB, for sessions and route installers.
    pub fn subscribe(&self) -> watch::Receiver<Arc<LocRib>> {
        self.loc_rib_rx.clone()
    }

    async fn send(&self, command: RibCommand) -> Result<(), RibError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| RibError::EngineClosed)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::bgp::prefix::Prefix;
    use crate::bgp::update::{AsPath, Origin, PathAttribute};
    use crate::rib::{connected_rib, RouteSource};

    fn prefix(s: &str) -> Prefix {
        s.parse().unwrap()
    }

    fn announce(path: Vec<u16>, local_pref: u32, nlri: &str) -> UpdateMessage {
        UpdateMessage::new(
            vec![],
            vec![
                PathAttribute::origin(Origin::Igp),
                PathAttribute::as_path(AsPath::sequence(path)),
                PathAttribute::next_hop(Ipv4Addr::new(10, 0, 1, 1)),
                PathAttribute::local_pref(local_pref),
            ],
            vec![prefix(nlri)],
        )
    }

    fn start(connected: AdjRib) -> (RibHandle, CancellationToken) {
        let (engine, handle) = RibEngine::new(65000, connected);
        let shutdown = CancellationToken::new();
        tokio::spawn(engine.run(shutdown.clone()));
        (handle, shutdown)
    }

    #[tokio::test]
    async fn test_initial_loc_rib_has_connected_routes() {
        let connected = connected_rib(65000, &[(prefix("10.0.1.0/31"), Ipv4Addr::new(10, 0, 1, 0))]);
        let (handle, _shutdown) = start(connected);

        let loc_rib = handle.snapshot().await.unwrap();
        assert_eq!(loc_rib.len(), 1);
        assert_eq!(loc_rib[&prefix("10.0.1.0/31")].source, RouteSource::Connected);
        assert_eq!(handle.subscribe().borrow().len(), 1);
    }

    #[tokio::test]
    async fn test_update_selects_and_publishes() {
        let (handle, _shutdown) = start(AdjRib::new());
        let mut feed = handle.subscribe();

        handle.update(0, announce(vec![65001], 100, "10.0.0.0/24")).await.unwrap();
        handle.update(1, announce(vec![65002], 150, "10.0.0.0/24")).await.unwrap();

        let loc_rib = handle.snapshot().await.unwrap();
        let best = &loc_rib[&prefix("10.0.0.0/24")];
        assert_eq!(best.source, RouteSource::Peer(1));
        assert_eq!(best.entry.local_pref, 150);

        assert!(feed.has_changed().unwrap());
        assert_eq!(*feed.borrow_and_update(), loc_rib);
    }

    #[tokio::test]
    async fn test_withdrawal_falls_back() {
        let (handle, _shutdown) = start(AdjRib::new());
        handle.update(0, announce(vec![65001], 100, "10.0.0.0/24")).await.unwrap();
        handle.update(1, announce(vec![65002], 150, "10.0.0.0/24")).await.unwrap();
        handle
            .update(1, UpdateMessage::withdraw(vec![prefix("10.0.0.0/24")]))
            .await
            .unwrap();

        let loc_rib = handle.snapshot().await.unwrap();
        assert_eq!(loc_rib[&prefix("10.0.0.0/24")].source, RouteSource::Peer(0));

        handle
            .update(0, UpdateMessage::withdraw(vec![prefix("10.0.0.0/24")]))
            .await
            .unwrap();
        assert!(handle.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_looped_routes_are_dropped() {
        let (handle, _shutdown) = start(AdjRib::new());
        handle.update(0, announce(vec![65001], 100, "10.0.0.0/24")).await.unwrap();
        handle
            .update(0, announce(vec![65001, 65000, 65003], 100, "10.0.0.0/24"))
            .await
            .unwrap();

        assert!(handle.adj_rib_in(0).await.unwrap().is_empty());
        assert!(handle.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_peer_up_flushes_previous_session() {
        let (handle, _shutdown) = start(AdjRib::new());
        handle.update(0, announce(vec![65001], 100, "10.0.0.0/24")).await.unwrap();
        handle.update(1, announce(vec![65002], 100, "10.1.0.0/24")).await.unwrap();

        handle.peer_up(0).await.unwrap();

        assert!(handle.adj_rib_in(0).await.unwrap().is_empty());
        let loc_rib = handle.snapshot().await.unwrap();
        assert_eq!(loc_rib.keys().copied().collect::<Vec<_>>(), vec![prefix("10.1.0.0/24")]);
    }

    #[tokio::test]
    async fn test_peer_down_removes_routes_and_falls_back() {
        let (handle, _shutdown) = start(AdjRib::new());
        handle.update(0, announce(vec![65001], 200, "10.0.0.0/24")).await.unwrap();
        handle.update(1, announce(vec![65002], 100, "10.0.0.0/24")).await.unwrap();
        let loc_rib = handle.snapshot().await.unwrap();
        assert_eq!(loc_rib[&prefix("10.0.0.0/24")].source, RouteSource::Peer(0));

        handle.peer_down(0).await.unwrap();

        assert!(handle.adj_rib_in(0).await.unwrap().is_empty());
        let loc_rib = handle.snapshot().await.unwrap();
        assert_eq!(loc_rib[&prefix("10.0.0.0/24")].source, RouteSource::Peer(1));
    }

    #[tokio::test]
    async fn test_identical_update_does_not_republish() {
        let (handle, _shutdown) = start(AdjRib::new());
        handle.update(0, announce(vec![65001], 100, "10.0.0.0/24")).await.unwrap();
        handle.snapshot().await.unwrap();

        let mut feed = handle.subscribe();
        feed.borrow_and_update();
        handle.update(0, announce(vec![65001], 100, "10.0.0.0/24")).await.unwrap();
        handle.snapshot().await.unwrap();

        assert!(!feed.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_handle_errors_after_shutdown() {
        let (handle, shutdown) = start(AdjRib::new());
        shutdown.cancel();

        for _ in 0..100 {
            if handle.snapshot().await.is_err() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("engine still answering after shutdown");
    }
}
