//! Network interface selection.
//!
//! Registration is only useful on an interface whose multicast traffic
//! actually reaches the network, which cannot be read off interface
//! flags.  Each candidate interface is therefore probed: an interface is
//! eligible when any of its IPv4 addresses gets an answer from the
//! all-hosts group within one second.  IPv6 addresses are not evaluated.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use log::debug;

use crate::probe::{Probe, ProbeOutcome};

/// Well-known all-hosts multicast group used as the probe target.
pub const PROBE_TARGET: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);

/// Per-probe timeout during interface selection.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// One local interface with its IPv4 addresses, in enumeration order.
#[derive(Debug, Clone)]
pub struct IfaceAddrs {
    pub name: String,
    pub loopback: bool,
    pub v4: Vec<Ipv4Addr>,
}

/// An interface selected for binding, paired with the address that
/// answered the probe (or its first address for by-name resolution).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub name: String,
    pub addr: Ipv4Addr,
}

/// Enumerate the host's interfaces and their IPv4 addresses.
///
/// The order is the OS enumeration order and is stable for a fixed set of
/// interfaces, which makes first-eligible selection deterministic.
pub fn interface_table() -> Vec<IfaceAddrs> {
    let mut table: Vec<IfaceAddrs> = Vec::new();
    let Ok(addrs) = if_addrs::get_if_addrs() else {
        return table;
    };
    // if-addrs yields one entry per (interface, address) pair; fold them
    // back into per-interface rows without disturbing the order.
    for entry in addrs {
        let v4 = match entry.ip() {
            IpAddr::V4(addr) => Some(addr),
            IpAddr::V6(_) => None,
        };
        match table.iter_mut().find(|row| row.name == entry.name) {
            Some(row) => {
                row.loopback |= entry.is_loopback();
                if let Some(addr) = v4 {
                    row.v4.push(addr);
                }
            }
            None => table.push(IfaceAddrs {
                loopback: entry.is_loopback(),
                name: entry.name,
                v4: v4.into_iter().collect(),
            }),
        }
    }
    table
}

/// Every IPv4 address bound on this host, loopback included.  Used to
/// suppress records that describe the local node itself.
pub fn local_v4_addrs() -> HashSet<Ipv4Addr> {
    let mut addrs = HashSet::new();
    if let Ok(entries) = if_addrs::get_if_addrs() {
        for entry in entries {
            if let IpAddr::V4(addr) = entry.ip() {
                addrs.insert(addr);
            }
        }
    }
    addrs
}

/// Check one interface: never eligible when loopback, otherwise eligible
/// as soon as any IPv4 address draws a probe reply.  Returns the address
/// that answered.
pub async fn eligible_addr(probe: &dyn Probe, iface: &IfaceAddrs) -> Option<Ipv4Addr> {
    if iface.loopback {
        return None;
    }
    for addr in &iface.v4 {
        match probe.probe(PROBE_TARGET, Some(*addr), PROBE_TIMEOUT).await {
            ProbeOutcome::Reply => return Some(*addr),
            ProbeOutcome::NoReply => {}
            ProbeOutcome::Error(e) => {
                // A transport failure just disqualifies this address.
                debug!("Probe from {} ({}) failed: {}", addr, iface.name, e);
            }
        }
    }
    None
}

/// True when the interface can be bound for multicast registration.
pub async fn is_eligible(probe: &dyn Probe, iface: &IfaceAddrs) -> bool {
    eligible_addr(probe, iface).await.is_some()
}

/// All eligible interfaces, in enumeration order.
pub async fn eligible(probe: &dyn Probe, table: &[IfaceAddrs]) -> Vec<Candidate> {
    let mut out = Vec::new();
    for iface in table {
        if let Some(addr) = eligible_addr(probe, iface).await {
            out.push(Candidate {
                name: iface.name.clone(),
                addr,
            });
        }
    }
    out
}

/// The first eligible interface, short-circuiting the remaining probes.
pub async fn first_eligible(probe: &dyn Probe, table: &[IfaceAddrs]) -> Option<Candidate> {
    for iface in table {
        if let Some(addr) = eligible_addr(probe, iface).await {
            return Some(Candidate {
                name: iface.name.clone(),
                addr,
            });
        }
    }
    None
}

/// Resolve an explicitly configured interface by name to its first IPv4
/// address.
pub fn by_name(table: &[IfaceAddrs], name: &str) -> Option<Candidate> {
    table
        .iter()
        .find(|iface| iface.name == name)
        .and_then(|iface| iface.v4.first().copied())
        .map(|addr| Candidate {
            name: name.to_string(),
            addr,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io;
    use std::sync::Mutex;

    /// Probe stub that replies only for a fixed set of source addresses
    /// and records every probe it sees.
    struct FixedProbe {
        reply_from: Vec<Ipv4Addr>,
        error_from: Vec<Ipv4Addr>,
        seen: Mutex<Vec<Ipv4Addr>>,
    }

    impl FixedProbe {
        fn new(reply_from: Vec<Ipv4Addr>) -> Self {
            Self {
                reply_from,
                error_from: Vec::new(),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Probe for FixedProbe {
        async fn probe(
            &self,
            target: Ipv4Addr,
            source: Option<Ipv4Addr>,
            _timeout: Duration,
        ) -> ProbeOutcome {
            assert_eq!(target, PROBE_TARGET);
            let source = source.expect("selection always probes with a source");
            self.seen.lock().unwrap().push(source);
            if self.reply_from.contains(&source) {
                ProbeOutcome::Reply
            } else if self.error_from.contains(&source) {
                ProbeOutcome::Error(io::Error::new(io::ErrorKind::Other, "network unreachable"))
            } else {
                ProbeOutcome::NoReply
            }
        }
    }

    fn iface(name: &str, loopback: bool, v4: &[Ipv4Addr]) -> IfaceAddrs {
        IfaceAddrs {
            name: name.into(),
            loopback,
            v4: v4.to_vec(),
        }
    }

    const LO: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);
    const A: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
    const B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 7);

    #[tokio::test]
    async fn loopback_is_never_probed() {
        let probe = FixedProbe::new(vec![LO]);
        let table = [iface("lo", true, &[LO])];
        assert!(first_eligible(&probe, &table).await.is_none());
        assert!(probe.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn first_eligible_picks_replying_interface() {
        let probe = FixedProbe::new(vec![A]);
        let table = [
            iface("lo", true, &[LO]),
            iface("eth0", false, &[B]),
            iface("eth1", false, &[A]),
        ];
        let picked = first_eligible(&probe, &table).await.unwrap();
        assert_eq!(picked.name, "eth1");
        assert_eq!(picked.addr, A);
    }

    #[tokio::test]
    async fn first_eligible_short_circuits() {
        let probe = FixedProbe::new(vec![B]);
        let table = [iface("eth0", false, &[B]), iface("eth1", false, &[A])];
        let picked = first_eligible(&probe, &table).await.unwrap();
        assert_eq!(picked.name, "eth0");
        // eth1's address was never probed.
        assert_eq!(probe.seen.lock().unwrap().as_slice(), &[B]);
    }

    #[tokio::test]
    async fn probe_error_means_ineligible() {
        let mut probe = FixedProbe::new(vec![]);
        probe.error_from = vec![B];
        let table = [iface("eth0", false, &[B]), iface("eth1", false, &[A])];
        assert!(!is_eligible(&probe, &table[0]).await);
        // Selection continues past the failing interface.
        assert!(eligible(&probe, &table).await.is_empty());
        assert_eq!(probe.seen.lock().unwrap().as_slice(), &[B, A]);
    }

    #[tokio::test]
    async fn eligible_lists_all_replying_interfaces() {
        let probe = FixedProbe::new(vec![A, B]);
        let table = [
            iface("eth0", false, &[B]),
            iface("wlan0", false, &[A]),
            iface("lo", true, &[LO]),
        ];
        let all = eligible(&probe, &table).await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "eth0");
        assert_eq!(all[1].name, "wlan0");
    }

    #[test]
    fn by_name_resolves_first_v4() {
        let table = [iface("eth0", false, &[B, A])];
        let found = by_name(&table, "eth0").unwrap();
        assert_eq!(found.addr, B);
        assert!(by_name(&table, "eth9").is_none());
    }
}
