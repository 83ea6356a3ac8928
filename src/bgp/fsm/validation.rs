use std::net::Ipv4Addr;
use std::time::Duration;

use super::error::NotificationError;
use crate::bgp::message::{OpenMessage, BGP_VERSION};

/// Minimum non-zero hold time a peer may propose.
pub const MIN_HOLD_TIME: u16 = 3;

/// Validate an OPEN message per RFC 4271 Section 6.2.
///
/// `expected_asn` of `None` accepts any peer AS.
pub fn validate_open(open: &OpenMessage, expected_asn: Option<u16>) -> Result<(), NotificationError> {
    if open.version != BGP_VERSION {
        return Err(NotificationError::unsupported_version(BGP_VERSION));
    }

    if open.hold_time != 0 && open.hold_time < MIN_HOLD_TIME {
        return Err(NotificationError::unacceptable_hold_time());
    }

    if open.router_id == Ipv4Addr::UNSPECIFIED || open.router_id == Ipv4Addr::BROADCAST {
        return Err(NotificationError::bad_bgp_identifier());
    }

    if let Some(asn) = expected_asn {
        if open.asn != asn {
            return Err(NotificationError::bad_peer_as());
        }
    }

    Ok(())
}

/// Negotiate hold time by taking the minimum of local and peer values.
/// If either side proposes 0 the hold timer is disabled.
pub fn negotiate_hold_time(local_hold_time: u16, peer_hold_time: u16) -> Duration {
    if local_hold_time == 0 || peer_hold_time == 0 {
        Duration::ZERO
    } else {
        Duration::from_secs(local_hold_time.min(peer_hold_time) as u64)
    }
}

/// Keepalive interval is one third of the hold time.
pub fn keepalive_time(hold_time: Duration) -> Duration {
    hold_time / 3
}
