//! Data structures shared between the daemon's tasks.
//!
//! A [`DiscoveryRecord`] is one observed advertisement of the watched
//! service, as produced by the discovery engine's browse and lookup
//! operations.  Records are immutable once constructed and consumed
//! exactly once by the discoverer task.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// One observed service advertisement.
///
/// A record without an `address` is "bare": the browse operation saw the
/// instance but has not resolved its address records yet, and the daemon
/// must issue an explicit lookup for it.  A record with `ttl == 0` is an
/// explicit withdrawal of the advertisement, distinct from natural expiry
/// by silence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRecord {
    /// Identity of the advertiser, typically its hostname.
    pub instance: String,
    /// Service type, e.g. `_beacond._tcp`.
    pub service: String,
    /// Discovery domain, typically `local`.
    pub domain: String,
    /// Resolved IPv4 address, absent until a lookup completes.
    pub address: Option<Ipv4Addr>,
    /// Advertised time-to-live in seconds; `0` means withdrawal.
    pub ttl: u32,
}

impl DiscoveryRecord {
    /// True when this record still needs an address lookup.
    pub fn needs_resolution(&self) -> bool {
        self.address.is_none()
    }

    /// True when this record withdraws the advertisement.
    pub fn is_withdrawal(&self) -> bool {
        self.ttl == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(address: Option<Ipv4Addr>, ttl: u32) -> DiscoveryRecord {
        DiscoveryRecord {
            instance: "host-a".into(),
            service: "_beacond._tcp".into(),
            domain: "local".into(),
            address,
            ttl,
        }
    }

    #[test]
    fn bare_record_needs_resolution() {
        assert!(record(None, 120).needs_resolution());
        assert!(!record(Some(Ipv4Addr::new(10, 0, 0, 5)), 120).needs_resolution());
    }

    #[test]
    fn zero_ttl_is_withdrawal() {
        assert!(record(Some(Ipv4Addr::new(10, 0, 0, 5)), 0).is_withdrawal());
        assert!(!record(Some(Ipv4Addr::new(10, 0, 0, 5)), 1).is_withdrawal());
    }
}
