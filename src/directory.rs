//! Discovery-protocol engine seam.
//!
//! The daemon never touches mDNS wire details itself; it drives the
//! protocol engine through the [`ServiceDirectory`] trait:
//!
//! * **register** — (re-)advertise the local service.
//! * **browse** — a lazy, unbounded stream of [`DiscoveryRecord`]s that
//!   keeps producing for the daemon's lifetime.
//! * **lookup** — resolve one bare instance; resolved records re-enter
//!   the same browse stream.
//!
//! [`MdnsDirectory`] implements the seam on the `mdns-sd` service daemon.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;

use crate::iface::{self, Candidate};
use crate::types::DiscoveryRecord;

/// Nominal TTL attached to bare (unresolved) records; routing of bare
/// records depends only on the missing address.
const BARE_RECORD_TTL: u32 = 120;

/// External discovery-protocol engine, as seen by the daemon.
#[async_trait]
pub trait ServiceDirectory: Send + Sync {
    /// Advertise `instance` under `service.domain` on `port`.
    /// Registration is idempotent and best-effort; callers re-register on
    /// a timer.  When `bind` is set the advertisement is restricted to
    /// `iface`.
    async fn register(
        &self,
        instance: &str,
        service: &str,
        domain: &str,
        port: u16,
        txt: &HashMap<String, String>,
        iface: Option<&Candidate>,
        bind: bool,
    ) -> Result<()>;

    /// Start browsing for `service.domain`.  Fails synchronously when the
    /// browse cannot start; afterwards the receiver yields records until
    /// the daemon shuts down.
    async fn browse(&self, service: &str, domain: &str)
        -> Result<mpsc::Receiver<DiscoveryRecord>>;

    /// Ask the engine to resolve one bare instance.
    async fn lookup(&self, instance: &str, service: &str, domain: &str) -> Result<()>;
}

/// mDNS implementation of [`ServiceDirectory`] backed by
/// [`mdns_sd::ServiceDaemon`].
pub struct MdnsDirectory {
    daemon: ServiceDaemon,
}

impl MdnsDirectory {
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(|e| anyhow!("mdns daemon init: {}", e))?;
        Ok(Self { daemon })
    }
}

#[async_trait]
impl ServiceDirectory for MdnsDirectory {
    async fn register(
        &self,
        instance: &str,
        service: &str,
        domain: &str,
        port: u16,
        txt: &HashMap<String, String>,
        iface: Option<&Candidate>,
        bind: bool,
    ) -> Result<()> {
        // Advertising only the bound interface's address is how mDNS
        // expresses interface-exclusive registration.
        let host_addr = match iface {
            Some(candidate) => {
                if bind {
                    debug!(
                        "Restricting registration to {} ({})",
                        candidate.name, candidate.addr
                    );
                }
                Some(candidate.addr)
            }
            None => default_host_addr(),
        };
        let host_addr =
            host_addr.ok_or_else(|| anyhow!("no usable IPv4 address to advertise"))?;

        let ty = ty_domain(service, domain);
        let host_name = format!("{}.{}.", instance, domain.trim_matches('.'));
        let info = ServiceInfo::new(&ty, instance, &host_name, host_addr, port, Some(txt.clone()))
            .map_err(|e| anyhow!("building service info: {}", e))?;
        self.daemon
            .register(info)
            .map_err(|e| anyhow!("mdns register: {}", e))?;
        debug!("Registered {} at {} under {}", instance, host_addr, ty);
        Ok(())
    }

    async fn browse(
        &self,
        service: &str,
        domain: &str,
    ) -> Result<mpsc::Receiver<DiscoveryRecord>> {
        let ty = ty_domain(service, domain);
        let events = self
            .daemon
            .browse(&ty)
            .map_err(|e| anyhow!("mdns browse: {}", e))?;
        let (tx, rx) = mpsc::channel(64);

        let service = service.to_string();
        let domain = domain.to_string();
        // The mdns-sd receiver is a blocking channel; pump it from a
        // blocking task into the daemon's record channel.
        tokio::task::spawn_blocking(move || {
            pump_events(&ty, &service, &domain, events, tx);
        });
        Ok(rx)
    }

    async fn lookup(&self, instance: &str, service: &str, domain: &str) -> Result<()> {
        // mdns-sd resolves found instances on its own and delivers the
        // result as ServiceResolved on the browse channel, so there is no
        // separate query to issue here.
        debug!(
            "Lookup requested for {}.{}",
            instance,
            ty_domain(service, domain)
        );
        Ok(())
    }
}

/// Compose the `<service>.<domain>.` browse key, e.g. `_beacond._tcp.local.`.
fn ty_domain(service: &str, domain: &str) -> String {
    format!("{}.{}.", service.trim_matches('.'), domain.trim_matches('.'))
}

/// Extract the instance label from a full service instance name.
fn instance_from_fullname(fullname: &str, ty: &str) -> String {
    fullname
        .strip_suffix(ty)
        .and_then(|rest| rest.strip_suffix('.'))
        .unwrap_or(fullname)
        .to_string()
}

/// First non-loopback IPv4 address on the host, used when registration is
/// not pinned to an interface.
fn default_host_addr() -> Option<Ipv4Addr> {
    iface::interface_table()
        .into_iter()
        .find(|row| !row.loopback && !row.v4.is_empty())
        .and_then(|row| row.v4.first().copied())
}

/// Translate mdns-sd service events into discovery records until either
/// side of the bridge hangs up.
fn pump_events(
    ty: &str,
    service: &str,
    domain: &str,
    events: mdns_sd::Receiver<ServiceEvent>,
    tx: mpsc::Sender<DiscoveryRecord>,
) {
    // Addresses last resolved per instance, so removals can be surfaced
    // as addressed withdrawal records.
    let mut resolved: HashMap<String, Vec<Ipv4Addr>> = HashMap::new();

    while let Ok(event) = events.recv() {
        let records: Vec<DiscoveryRecord> = match event {
            ServiceEvent::SearchStarted(t) => {
                debug!("Search started for {}", t);
                continue;
            }
            ServiceEvent::SearchStopped(t) => {
                debug!("Search stopped for {}", t);
                continue;
            }
            ServiceEvent::ServiceFound(_, fullname) => {
                let instance = instance_from_fullname(&fullname, ty);
                vec![DiscoveryRecord {
                    instance,
                    service: service.to_string(),
                    domain: domain.to_string(),
                    address: None,
                    ttl: BARE_RECORD_TTL,
                }]
            }
            ServiceEvent::ServiceResolved(srv_info) => {
                let instance = instance_from_fullname(srv_info.get_fullname(), ty);
                let addrs: Vec<Ipv4Addr> = srv_info.get_addresses().iter().copied().collect();
                resolved.insert(srv_info.get_fullname().to_string(), addrs.clone());
                addrs
                    .into_iter()
                    .map(|addr| DiscoveryRecord {
                        instance: instance.clone(),
                        service: service.to_string(),
                        domain: domain.to_string(),
                        address: Some(addr),
                        ttl: srv_info.get_host_ttl(),
                    })
                    .collect()
            }
            ServiceEvent::ServiceRemoved(_, fullname) => {
                let instance = instance_from_fullname(&fullname, ty);
                let Some(addrs) = resolved.remove(&fullname) else {
                    warn!("Removal for never-resolved instance {}", fullname);
                    continue;
                };
                addrs
                    .into_iter()
                    .map(|addr| DiscoveryRecord {
                        instance: instance.clone(),
                        service: service.to_string(),
                        domain: domain.to_string(),
                        address: Some(addr),
                        ttl: 0,
                    })
                    .collect()
            }
        };

        for record in records {
            if tx.blocking_send(record).is_err() {
                info!("Record consumer gone, stopping mdns event pump");
                return;
            }
        }
    }
    info!("mdns event channel closed, stopping event pump");
}
