//! Daemon orchestration.
//!
//! [`Daemon::start`] wires up the channels and spawns the four
//! long-running tasks:
//!
//! * **publisher** — re-registers the local service every 30 s and
//!   whenever the tracker nudges it about a brand-new peer;
//! * **discoverer** — consumes the browse stream and routes each record
//!   (bare → lookup queue, self → dropped, `ttl > 0` → arrival,
//!   `ttl == 0` → withdrawal);
//! * **lookup dispatcher** — single consumer issuing serialized lookups
//!   so the engine never sees concurrent queries from this daemon;
//! * **reaper** — evicts members silent for two publish intervals.
//!
//! Only a failure to start the browse stream is fatal; every steady-state
//! failure is logged in its own cycle and the task carries on.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::directory::ServiceDirectory;
use crate::error::DaemonError;
use crate::iface;
use crate::membership::Membership;
use crate::notify::Notify;
use crate::probe::Probe;
use crate::types::DiscoveryRecord;

/// Interval between publish cycles; also the reaper's tick.
const PUBLISH_INTERVAL: Duration = Duration::from_secs(30);

/// A peer must stay silent for two full announcement cycles before it is
/// declared gone, which absorbs one missed announcement.
const STALE_WINDOW: Duration = Duration::from_secs(60);

/// Queue depth for discovery records and lookup requests.  Producers
/// block when full; mDNS re-announces periodically, so nothing durable is
/// lost while the consumer catches up.
const QUEUE_DEPTH: usize = 64;

/// A configured, not-yet-started daemon instance.
pub struct Daemon {
    config: Config,
    directory: Arc<dyn ServiceDirectory>,
    probe: Arc<dyn Probe>,
    notify: Arc<dyn Notify>,
}

/// Handle for a running daemon; dropping it does not stop the tasks,
/// call [`DaemonHandle::stop`].
pub struct DaemonHandle {
    membership: Arc<Membership>,
    tasks: Vec<JoinHandle<()>>,
}

impl DaemonHandle {
    /// The live membership view, for embedders that want snapshots.
    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    /// Stop all background tasks.
    pub fn stop(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Daemon {
    pub fn new(
        config: Config,
        directory: Arc<dyn ServiceDirectory>,
        probe: Arc<dyn Probe>,
        notify: Arc<dyn Notify>,
    ) -> Self {
        Self {
            config,
            directory,
            probe,
            notify,
        }
    }

    /// Start the daemon.  Fails without spawning anything when the browse
    /// stream cannot be started.
    pub async fn start(self) -> Result<DaemonHandle, DaemonError> {
        let records = self
            .directory
            .browse(&self.config.service_name, &self.config.service_domain)
            .await
            .map_err(DaemonError::Browse)?;

        let (publish_tx, publish_rx) = mpsc::channel(1);
        let (query_tx, query_rx) = mpsc::channel(QUEUE_DEPTH);
        let membership = Arc::new(Membership::new(self.notify.clone(), publish_tx));

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(publish_loop(
            self.directory.clone(),
            self.probe.clone(),
            self.config.clone(),
            publish_rx,
        )));
        tasks.push(tokio::spawn(discover_loop(
            records,
            membership.clone(),
            query_tx,
        )));
        tasks.push(tokio::spawn(lookup_loop(self.directory.clone(), query_rx)));
        tasks.push(tokio::spawn(reap_loop(membership.clone())));

        info!(
            "Daemon started for {}.{}",
            self.config.service_name, self.config.service_domain
        );
        Ok(DaemonHandle { membership, tasks })
    }
}

/// Where one discovery record should go.
#[derive(Debug, PartialEq, Eq)]
enum Route {
    /// Bare record: needs an explicit lookup.
    Resolve,
    /// One of this host's own addresses: never tracked, never notified.
    Ignore,
    /// Resolved, live peer.
    Arrival,
    /// Resolved explicit withdrawal.
    Withdrawal,
}

fn classify(record: &DiscoveryRecord, local: &HashSet<Ipv4Addr>) -> Route {
    match record.address {
        None => Route::Resolve,
        Some(addr) if local.contains(&addr) => Route::Ignore,
        Some(_) if record.is_withdrawal() => Route::Withdrawal,
        Some(_) => Route::Arrival,
    }
}

/// Publisher task: one registration per interval plus out-of-band cycles
/// requested by the tracker.
async fn publish_loop(
    directory: Arc<dyn ServiceDirectory>,
    probe: Arc<dyn Probe>,
    config: Config,
    mut nudge: mpsc::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(PUBLISH_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            Some(()) = nudge.recv() => {
                debug!("Out-of-band publish requested");
            }
        }
        publish_once(directory.as_ref(), probe.as_ref(), &config).await;
    }
}

/// One publish cycle.  Failures are logged; the next cycle retries
/// unconditionally since registration is idempotent.
async fn publish_once(directory: &dyn ServiceDirectory, probe: &dyn Probe, config: &Config) {
    let table = iface::interface_table();
    let candidate = match (&config.interface_name, config.bind_to_interface) {
        (Some(name), true) => {
            let found = iface::by_name(&table, name);
            if found.is_none() {
                error!("Configured interface {} has no IPv4 address", name);
            }
            found
        }
        // Eligibility can change while the daemon runs, so the selector
        // is consulted each cycle.
        _ => iface::first_eligible(probe, &table).await,
    };

    let instance = match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            error!("Failed to read hostname: {}", e);
            return;
        }
    };

    let txt = [("txtv", "1"), ("key1", "val1"), ("key2", "val2")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    if let Err(e) = directory
        .register(
            &instance,
            &config.service_name,
            &config.service_domain,
            config.service_port,
            &txt,
            candidate.as_ref(),
            config.bind_to_interface,
        )
        .await
    {
        error!("Registration failed: {}", e);
    }
}

/// Discoverer task: drains the browse stream in arrival order.  The
/// stream ending is an unrecoverable transport failure (or shutdown) and
/// is logged as such.
async fn discover_loop(
    mut records: mpsc::Receiver<DiscoveryRecord>,
    membership: Arc<Membership>,
    query_tx: mpsc::Sender<DiscoveryRecord>,
) {
    while let Some(record) = records.recv().await {
        let local = iface::local_v4_addrs();
        match classify(&record, &local) {
            Route::Resolve => {
                if query_tx.send(record).await.is_err() {
                    error!("Lookup queue closed");
                    return;
                }
            }
            Route::Ignore => {
                debug!("Ignoring own advertisement from {:?}", record.address);
            }
            Route::Arrival => membership.on_arrival(record).await,
            Route::Withdrawal => membership.on_withdrawal(record).await,
        }
    }
    error!("Discovery stream ended");
}

/// Lookup dispatcher task: the single serialized consumer of resolution
/// requests.  Failed lookups are dropped; the peer's next periodic
/// announcement is the retry.
async fn lookup_loop(directory: Arc<dyn ServiceDirectory>, mut queries: mpsc::Receiver<DiscoveryRecord>) {
    while let Some(request) = queries.recv().await {
        if let Err(e) = directory
            .lookup(&request.instance, &request.service, &request.domain)
            .await
        {
            error!("Lookup for {} failed: {}", request.instance, e);
        }
    }
}

/// Reaper task: periodic staleness sweep of the membership cache.
async fn reap_loop(membership: Arc<Membership>) {
    let mut ticker = tokio::time::interval(PUBLISH_INTERVAL);
    loop {
        ticker.tick().await;
        membership.reap(Instant::now(), STALE_WINDOW).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::Candidate;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::time::sleep;

    const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
    const SELF_ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 2);

    fn record(address: Option<Ipv4Addr>, ttl: u32) -> DiscoveryRecord {
        DiscoveryRecord {
            instance: "peer".into(),
            service: "_beacond._tcp".into(),
            domain: "local".into(),
            address,
            ttl,
        }
    }

    #[test]
    fn classification_routes() {
        let local: HashSet<Ipv4Addr> = [SELF_ADDR].into_iter().collect();
        assert_eq!(classify(&record(None, 120), &local), Route::Resolve);
        assert_eq!(classify(&record(Some(SELF_ADDR), 120), &local), Route::Ignore);
        // Even a withdrawal of our own address stays ignored.
        assert_eq!(classify(&record(Some(SELF_ADDR), 0), &local), Route::Ignore);
        assert_eq!(classify(&record(Some(PEER), 120), &local), Route::Arrival);
        assert_eq!(classify(&record(Some(PEER), 0), &local), Route::Withdrawal);
    }

    /// Directory stub: hands the test a sender feeding the browse stream
    /// and records register/lookup calls.
    struct StubDirectory {
        record_tx: Mutex<Option<mpsc::Sender<DiscoveryRecord>>>,
        record_rx: Mutex<Option<mpsc::Receiver<DiscoveryRecord>>>,
        registrations: Mutex<Vec<String>>,
        lookups: Mutex<Vec<String>>,
    }

    impl StubDirectory {
        fn new() -> Self {
            let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
            Self {
                record_tx: Mutex::new(Some(tx)),
                record_rx: Mutex::new(Some(rx)),
                registrations: Mutex::new(Vec::new()),
                lookups: Mutex::new(Vec::new()),
            }
        }

        fn feed(&self) -> mpsc::Sender<DiscoveryRecord> {
            self.record_tx.lock().unwrap().take().unwrap()
        }
    }

    #[async_trait]
    impl ServiceDirectory for StubDirectory {
        async fn register(
            &self,
            instance: &str,
            _service: &str,
            _domain: &str,
            _port: u16,
            _txt: &HashMap<String, String>,
            _iface: Option<&Candidate>,
            _bind: bool,
        ) -> Result<()> {
            self.registrations.lock().unwrap().push(instance.to_string());
            Ok(())
        }

        async fn browse(
            &self,
            _service: &str,
            _domain: &str,
        ) -> Result<mpsc::Receiver<DiscoveryRecord>> {
            self.record_rx
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| anyhow::anyhow!("browse already started"))
        }

        async fn lookup(&self, instance: &str, _service: &str, _domain: &str) -> Result<()> {
            self.lookups.lock().unwrap().push(instance.to_string());
            Ok(())
        }
    }

    struct SilentProbe;

    #[async_trait]
    impl Probe for SilentProbe {
        async fn probe(
            &self,
            _target: Ipv4Addr,
            _source: Option<Ipv4Addr>,
            _timeout: Duration,
        ) -> crate::probe::ProbeOutcome {
            crate::probe::ProbeOutcome::NoReply
        }
    }

    struct NullNotify;

    impl Notify for NullNotify {
        fn new_member(&self, _addr: Ipv4Addr) {}
        fn remove_member(&self, _addr: Ipv4Addr) {}
    }

    fn daemon(directory: Arc<StubDirectory>) -> Daemon {
        Daemon::new(
            Config::default(),
            directory,
            Arc::new(SilentProbe),
            Arc::new(NullNotify),
        )
    }

    #[tokio::test]
    async fn browse_failure_is_fatal_at_startup() {
        let directory = Arc::new(StubDirectory::new());
        // First start consumes the browse stream.
        let feed = directory.feed();
        let handle = daemon(directory.clone()).start().await.unwrap();
        handle.stop();
        drop(feed);

        // Second start cannot begin a browse and must fail.
        assert!(daemon(directory).start().await.is_err());
    }

    #[tokio::test]
    async fn resolved_records_drive_membership() {
        let directory = Arc::new(StubDirectory::new());
        let feed = directory.feed();
        let handle = daemon(directory).start().await.unwrap();

        feed.send(record(Some(PEER), 120)).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(handle.membership().contains(PEER).await);

        feed.send(record(Some(PEER), 0)).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(!handle.membership().contains(PEER).await);

        handle.stop();
    }

    #[tokio::test]
    async fn bare_records_are_dispatched_to_lookup() {
        let directory = Arc::new(StubDirectory::new());
        let feed = directory.feed();
        let handle = daemon(directory.clone()).start().await.unwrap();

        feed.send(record(None, 120)).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(directory.lookups.lock().unwrap().as_slice(), &["peer".to_string()]);
        // A bare record never enters the cache.
        assert!(handle.membership().members().await.is_empty());

        handle.stop();
    }

    #[tokio::test]
    async fn publisher_registers_on_startup_and_on_nudge() {
        let directory = Arc::new(StubDirectory::new());
        let feed = directory.feed();
        let handle = daemon(directory.clone()).start().await.unwrap();

        // The interval's first tick fires immediately.
        sleep(Duration::from_millis(100)).await;
        let initial = directory.registrations.lock().unwrap().len();
        assert!(initial >= 1);

        // A new peer triggers an out-of-band publish cycle.
        feed.send(record(Some(PEER), 120)).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        assert!(directory.registrations.lock().unwrap().len() > initial);

        handle.stop();
    }
}
