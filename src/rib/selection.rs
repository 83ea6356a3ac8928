//! Best-path selection.
//!
//! [`select_best`] recomputes the whole Local RIB from the Connected RIB and
//! every peer's Adj-RIB-In. It holds no state between calls.

use std::cmp::Ordering;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use super::{AdjRib, BestRoute, LocRib, RibEntry, RouteSource};

/// Order two candidates for the same prefix; `Less` means `a` is preferred.
///
/// 1. higher LOCAL_PREF
/// 2. shorter AS_PATH
/// 3. lower ORIGIN
/// 4. connected before learned, then lowest next hop, then lowest peer index
pub fn compare(a: (RouteSource, &RibEntry), b: (RouteSource, &RibEntry)) -> Ordering {
    let (a_source, a) = a;
    let (b_source, b) = b;

    b.local_pref
        .cmp(&a.local_pref)
        .then_with(|| a.as_path.path_len().cmp(&b.as_path.path_len()))
        .then_with(|| a.origin.cmp(&b.origin))
        .then_with(|| {
            let a_connected = a_source == RouteSource::Connected;
            let b_connected = b_source == RouteSource::Connected;
            b_connected.cmp(&a_connected)
        })
        .then_with(|| a.next_hop.cmp(&b.next_hop))
        .then_with(|| a_source.cmp(&b_source))
}

/// Compute the best route for every prefix known to any table.
pub fn select_best(connected: &AdjRib, peers: &BTreeMap<usize, AdjRib>) -> LocRib {
    let candidates = connected
        .iter()
        .map(|(prefix, entry)| (prefix, RouteSource::Connected, entry))
        .chain(peers.iter().flat_map(|(idx, rib)| {
            rib.iter()
                .map(move |(prefix, entry)| (prefix, RouteSource::Peer(*idx), entry))
        }));

    let mut loc_rib = LocRib::new();
    for (prefix, source, entry) in candidates {
        match loc_rib.entry(*prefix) {
            Entry::Vacant(slot) => {
                slot.insert(BestRoute {
                    source,
                    entry: entry.clone(),
                });
            }
            Entry::Occupied(mut slot) => {
                let current = slot.get();
                if compare((source, entry), (current.source, &current.entry)) == Ordering::Less {
                    slot.insert(BestRoute {
                        source,
                        entry: entry.clone(),
                    });
                }
            }
        }
    }
    loc_rib
}
