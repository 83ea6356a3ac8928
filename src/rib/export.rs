//! Turning the Local RIB into UPDATE messages for one peer.
//!
//! Each session remembers what it last advertised (its Adj-RIB-Out) and only
//! sends the difference when a new Local RIB arrives.

use std::net::Ipv4Addr;

use bytes::BytesMut;
use tracing::warn;

use crate::bgp::message::{BGP_HEADER_LEN, BGP_MAX_MESSAGE_LEN};
use crate::bgp::prefix::Prefix;
use crate::bgp::update::{SegmentType, UpdateMessage};

use super::{AdjRib, BestRoute, LocRib, RibEntry, RouteSource};

/// Bytes of an UPDATE left for withdrawn routes, attributes and NLRI once the
/// header and the two length fields are paid for.
const UPDATE_PAYLOAD_LEN: usize = BGP_MAX_MESSAGE_LEN - BGP_HEADER_LEN - 2 - 2;

/// Largest encoded IPv4 prefix (a /25 to /32).
const MAX_PREFIX_LEN: usize = 5;

/// Attribute rewriting applied to routes advertised over one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportPolicy {
    pub local_asn: u16,
    /// Our address on the link to the peer; becomes NEXT_HOP.
    pub next_hop: Ipv4Addr,
}

impl ExportPolicy {
    pub fn export_entry(&self, route: &BestRoute) -> RibEntry {
        let mut entry = route.entry.clone();
        entry.next_hop = self.next_hop;
        if route.source != RouteSource::Connected
            && entry.as_path.segment_type == SegmentType::Sequence
        {
            entry.as_path = entry.as_path.prepend(self.local_asn);
        }
        entry
    }

    /// Exported form of every route that still fits in an UPDATE.
    ///
    /// A route whose attributes leave no room for its prefix is left out, so
    /// a peer that had it gets a withdrawal instead.
    pub fn export_table(&self, loc_rib: &LocRib) -> AdjRib {
        loc_rib
            .iter()
            .filter_map(|(prefix, route)| {
                let entry = self.export_entry(route);
                if attributes_len(&entry) + prefix.encoded_len() > UPDATE_PAYLOAD_LEN {
                    warn!(
                        prefix = %prefix,
                        path_len = entry.as_path.asns.len(),
                        "Not exporting {}: attributes too large for one UPDATE",
                        prefix
                    );
                    return None;
                }
                Some((*prefix, entry))
            })
            .collect()
    }
}

fn attributes_len(entry: &RibEntry) -> usize {
    let mut buf = BytesMut::new();
    for attr in entry.to_attributes() {
        attr.encode(&mut buf);
    }
    buf.len()
}

/// Split `prefixes` into runs whose encoding fits in `budget` bytes.
fn chunk_by_size(prefixes: &[Prefix], budget: usize) -> Vec<Vec<Prefix>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut used = 0;
    for prefix in prefixes {
        let len = prefix.encoded_len();
        if used + len > budget && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            used = 0;
        }
        current.push(*prefix);
        used += len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// UPDATEs that move a peer from `advertised` to `desired`.
///
/// New or changed prefixes are grouped by identical attributes; prefixes that
/// disappeared are withdrawn in withdraw-only UPDATEs sent last. Every UPDATE
/// encodes to at most 4096 bytes.
pub fn diff_updates(advertised: &AdjRib, desired: &AdjRib) -> Vec<UpdateMessage> {
    let mut groups: Vec<(&RibEntry, Vec<Prefix>)> = Vec::new();
    for (prefix, entry) in desired {
        if advertised.get(prefix) == Some(entry) {
            continue;
        }
        match groups.iter_mut().find(|(attrs, _)| *attrs == entry) {
            Some((_, prefixes)) => prefixes.push(*prefix),
            None => groups.push((entry, vec![*prefix])),
        }
    }

    let withdrawn: Vec<Prefix> = advertised
        .keys()
        .filter(|prefix| !desired.contains_key(prefix))
        .copied()
        .collect();

    let mut updates = Vec::new();
    for (entry, prefixes) in groups {
        let budget = UPDATE_PAYLOAD_LEN.saturating_sub(attributes_len(entry));
        if budget < MAX_PREFIX_LEN {
            warn!(prefixes = prefixes.len(), "Skipping routes with oversized attributes");
            continue;
        }
        for chunk in chunk_by_size(&prefixes, budget) {
            updates.push(UpdateMessage::new(vec![], entry.to_attributes(), chunk));
        }
    }
    for chunk in chunk_by_size(&withdrawn, UPDATE_PAYLOAD_LEN) {
        updates.push(UpdateMessage::withdraw(chunk));
    }
    updates
}
