//! Membership tracking.
//!
//! [`Membership`] owns the address → (record, last-seen) cache and is the
//! only place it is ever mutated.  The discoverer and the reaper both
//! call into it concurrently; every transition goes through the write
//! lock, so arrivals, withdrawals, and evictions serialize regardless of
//! which task drives them.
//!
//! Transition rules:
//!
//! * first arrival for an address → insert, notify `new_member`, nudge
//!   the publisher so the newcomer sees this node quickly;
//! * repeated arrival → refresh `last_seen` only, no re-notification;
//! * withdrawal (`ttl == 0`) of a known address → remove, notify
//!   `remove_member`; unknown address → no-op;
//! * reap → evict entries silent for longer than the staleness window,
//!   one `remove_member` notification each.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use tokio::sync::{mpsc, RwLock};

use crate::notify::Notify;
use crate::types::DiscoveryRecord;

/// Cache state for one live peer.
#[derive(Debug, Clone)]
struct MemberEntry {
    record: DiscoveryRecord,
    last_seen: Instant,
}

/// The authoritative, expiring membership view.
pub struct Membership {
    cache: RwLock<HashMap<Ipv4Addr, MemberEntry>>,
    notify: Arc<dyn Notify>,
    publish_tx: mpsc::Sender<()>,
}

impl Membership {
    /// `publish_tx` is the publisher's out-of-band nudge channel; it is
    /// written with `try_send`, so a burst of new peers coalesces into at
    /// most one pending extra publish cycle.
    pub fn new(notify: Arc<dyn Notify>, publish_tx: mpsc::Sender<()>) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            notify,
            publish_tx,
        }
    }

    /// Apply a resolved, non-self record with `ttl > 0`.
    pub async fn on_arrival(&self, record: DiscoveryRecord) {
        let Some(addr) = record.address else {
            warn!("Arrival without an address for {}", record.instance);
            return;
        };
        let mut cache = self.cache.write().await;
        match cache.entry(addr) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.record = record;
                entry.last_seen = Instant::now();
            }
            Entry::Vacant(vacant) => {
                info!(
                    "New member: {}, {}, {}, {}",
                    record.instance, record.service, record.domain, addr
                );
                vacant.insert(MemberEntry {
                    record,
                    last_seen: Instant::now(),
                });
                // Full nudge channel means a publish is already pending.
                let _ = self.publish_tx.try_send(());
                self.notify.new_member(addr);
            }
        }
    }

    /// Apply an explicit withdrawal (`ttl == 0`) for a resolved record.
    pub async fn on_withdrawal(&self, record: DiscoveryRecord) {
        let Some(addr) = record.address else {
            warn!("Withdrawal without an address for {}", record.instance);
            return;
        };
        let mut cache = self.cache.write().await;
        if cache.remove(&addr).is_some() {
            info!(
                "Member gone: {}, {}, {}, {}",
                record.instance, record.service, record.domain, addr
            );
            self.notify.remove_member(addr);
        }
    }

    /// Evict every entry not refreshed within `window`, notifying for
    /// each.  Idempotent: a second call with no new events evicts nothing.
    pub async fn reap(&self, now: Instant, window: Duration) -> usize {
        let mut cache = self.cache.write().await;
        let stale: Vec<Ipv4Addr> = cache
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_seen) > window)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in &stale {
            cache.remove(addr);
            info!("Member timed out: {}", addr);
            self.notify.remove_member(*addr);
        }
        stale.len()
    }

    /// Consistent snapshot of the current members.
    pub async fn members(&self) -> Vec<Ipv4Addr> {
        self.cache.read().await.keys().copied().collect()
    }

    /// Whether `addr` is currently a live member.
    pub async fn contains(&self, addr: Ipv4Addr) -> bool {
        self.cache.read().await.contains_key(&addr)
    }

    /// The most recent record seen for a live member.
    pub async fn last_record(&self, addr: Ipv4Addr) -> Option<DiscoveryRecord> {
        self.cache
            .read()
            .await
            .get(&addr)
            .map(|entry| entry.record.clone())
    }
}
