//! Routing information bases.
//!
//! Tables are plain ordered maps keyed by [`Prefix`]. They are owned by the
//! RIB engine task ([`engine::RibEngine`]); everything else sees snapshots.

pub mod engine;
pub mod export;
pub mod selection;

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

use tracing::warn;

use crate::bgp::prefix::Prefix;
use crate::bgp::update::{AsPath, Origin, PathAttribute, UpdateMessage};

pub use engine::{RibCommand, RibEngine, RibHandle};
pub use export::{diff_updates, ExportPolicy};
pub use selection::select_best;

/// LOCAL_PREF assumed when an UPDATE does not carry one, and given to connected routes.
pub const DEFAULT_LOCAL_PREF: u32 = 100;

/// The attributes of one route for one prefix from one source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RibEntry {
    pub origin: Origin,
    pub as_path: AsPath,
    pub next_hop: Ipv4Addr,
    pub local_pref: u32,
}

impl RibEntry {
    /// A locally originated route: origin IGP, AS path `{asn}`.
    pub fn connected(asn: u16, next_hop: Ipv4Addr) -> Self {
        Self {
            origin: Origin::Igp,
            as_path: AsPath::sequence(vec![asn]),
            next_hop,
            local_pref: DEFAULT_LOCAL_PREF,
        }
    }

    /// The entry carried by an UPDATE's NLRI, if its mandatory attributes are present.
    pub fn from_update(update: &UpdateMessage) -> Option<Self> {
        Some(Self {
            origin: update.origin()?,
            as_path: update.as_path()?.clone(),
            next_hop: update.next_hop()?,
            local_pref: update.local_pref().unwrap_or(DEFAULT_LOCAL_PREF),
        })
    }

    pub fn to_attributes(&self) -> Vec<PathAttribute> {
        vec![
            PathAttribute::origin(self.origin),
            PathAttribute::as_path(self.as_path.clone()),
            PathAttribute::next_hop(self.next_hop),
            PathAttribute::local_pref(self.local_pref),
        ]
    }
}

impl fmt::Display for RibEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "via {} path [{}] origin {} local-pref {}",
            self.next_hop, self.as_path, self.origin, self.local_pref
        )
    }
}

/// Where a Local RIB entry came from. Connected sorts before any peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RouteSource {
    Connected,
    Peer(usize),
}

impl fmt::Display for RouteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteSource::Connected => write!(f, "connected"),
            RouteSource::Peer(idx) => write!(f, "peer {}", idx),
        }
    }
}

/// A Local RIB entry: the winning route and its source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BestRoute {
    pub source: RouteSource,
    pub entry: RibEntry,
}

/// Per-source table (Adj-RIB-In, Adj-RIB-Out, Connected RIB).
pub type AdjRib = BTreeMap<Prefix, RibEntry>;

/// Best route per prefix.
pub type LocRib = BTreeMap<Prefix, BestRoute>;

/// Apply one UPDATE to an adjacency table: withdrawals first, then the
/// announced prefixes, each replacing any previous entry wholesale.
pub fn apply_update(rib: &mut AdjRib, update: &UpdateMessage) {
    for prefix in &update.withdrawn {
        rib.remove(prefix);
    }

    if update.nlri.is_empty() {
        return;
    }
    match RibEntry::from_update(update) {
        Some(entry) => {
            for prefix in &update.nlri {
                rib.insert(*prefix, entry.clone());
            }
        }
        None => warn!(
            prefixes = update.nlri.len(),
            "Ignoring NLRI without ORIGIN, AS_PATH and NEXT_HOP"
        ),
    }
}

/// Build the Connected RIB from locally attached networks and their local addresses.
pub fn connected_rib(asn: u16, networks: &[(Prefix, Ipv4Addr)]) -> AdjRib {
    networks
        .iter()
        .map(|(prefix, local_addr)| (*prefix, RibEntry::connected(asn, *local_addr)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix(s: &str) -> Prefix {
        s.parse().unwrap()
    }

    fn announce(path: Vec<u16>, local_pref: Option<u32>, nlri: &[&str]) -> UpdateMessage {
        let mut attributes = vec![
            PathAttribute::origin(Origin::Igp),
            PathAttribute::as_path(AsPath::sequence(path)),
            PathAttribute::next_hop(Ipv4Addr::new(10, 0, 1, 2)),
        ];
        if let Some(pref) = local_pref {
            attributes.push(PathAttribute::local_pref(pref));
        }
        UpdateMessage::new(vec![], attributes, nlri.iter().map(|s| prefix(s)).collect())
    }

    #[test]
    fn test_apply_update_inserts_entries() {
        let mut rib = AdjRib::new();
        apply_update(&mut rib, &announce(vec![65001], Some(200), &["10.0.0.0/24", "10.0.1.0/24"]));

        assert_eq!(rib.len(), 2);
        let entry = &rib[&prefix("10.0.0.0/24")];
        assert_eq!(entry.local_pref, 200);
        assert_eq!(entry.as_path.asns, vec![65001]);
    }

    #[test]
    fn test_apply_update_defaults_local_pref() {
        let mut rib = AdjRib::new();
        apply_update(&mut rib, &announce(vec![65001], None, &["10.0.0.0/24"]));
        assert_eq!(rib[&prefix("10.0.0.0/24")].local_pref, DEFAULT_LOCAL_PREF);
    }

    #[test]
    fn test_apply_update_replaces_wholesale() {
        let mut rib = AdjRib::new();
        apply_update(&mut rib, &announce(vec![65001, 65005], Some(300), &["10.0.0.0/24"]));
        apply_update(&mut rib, &announce(vec![65001], None, &["10.0.0.0/24"]));

        let entry = &rib[&prefix("10.0.0.0/24")];
        assert_eq!(entry.as_path.asns, vec![65001]);
        assert_eq!(entry.local_pref, DEFAULT_LOCAL_PREF);
    }

    #[test]
    fn test_withdrawal_applied_before_announcement() {
        let mut rib = AdjRib::new();
        apply_update(&mut rib, &announce(vec![65009], Some(50), &["10.0.0.0/24"]));

        let mut update = announce(vec![65001], Some(150), &["10.0.0.0/24"]);
        update.withdrawn = vec![prefix("10.0.0.0/24")];
        apply_update(&mut rib, &update);

        let entry = &rib[&prefix("10.0.0.0/24")];
        assert_eq!(entry.local_pref, 150);
        assert_eq!(entry.as_path.asns, vec![65001]);
    }

    #[test]
    fn test_apply_update_is_idempotent() {
        let mut update = announce(vec![65001], Some(100), &["10.0.0.0/24", "10.2.0.0/16"]);
        update.withdrawn = vec![prefix("10.9.0.0/16")];

        let mut once = AdjRib::new();
        apply_update(&mut once, &update);
        let mut twice = once.clone();
        apply_update(&mut twice, &update);

        assert_eq!(once, twice);
    }

    #[test]
    fn test_withdraw_only() {
        let mut rib = AdjRib::new();
        apply_update(&mut rib, &announce(vec![65001], None, &["10.0.0.0/24", "10.0.1.0/24"]));
        apply_update(&mut rib, &UpdateMessage::withdraw(vec![prefix("10.0.0.0/24")]));

        assert_eq!(rib.keys().copied().collect::<Vec<_>>(), vec![prefix("10.0.1.0/24")]);
    }

    #[test]
    fn test_nlri_without_mandatory_attributes_ignored() {
        let mut rib = AdjRib::new();
        let update = UpdateMessage::new(
            vec![],
            vec![PathAttribute::origin(Origin::Igp)],
            vec![prefix("10.0.0.0/24")],
        );
        apply_update(&mut rib, &update);
        assert!(rib.is_empty());
    }

    #[test]
    fn test_connected_rib_entries() {
        let rib = connected_rib(
            65000,
            &[(prefix("10.0.1.0/31"), Ipv4Addr::new(10, 0, 1, 0))],
        );
        let entry = &rib[&prefix("10.0.1.0/31")];
        assert_eq!(entry.origin, Origin::Igp);
        assert_eq!(entry.as_path, AsPath::sequence(vec![65000]));
        assert_eq!(entry.next_hop, Ipv4Addr::new(10, 0, 1, 0));
        assert_eq!(entry.local_pref, DEFAULT_LOCAL_PREF);
    }

    #[test]
    fn test_route_source_ordering() {
        assert!(RouteSource::Connected < RouteSource::Peer(0));
        assert!(RouteSource::Peer(1) < RouteSource::Peer(2));
    }
}
