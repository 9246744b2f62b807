//! beacond — a peer-discovery daemon.
//!
//! beacond advertises a local service over mDNS, browses for other
//! advertisers of the same service, maintains a live membership view with
//! staleness expiry, and raises join/leave notifications to an observer.
//! It is the control-plane layer cluster-forming software uses to let a
//! fleet of hosts find each other on a local network.

pub mod config;
pub mod daemon;
pub mod directory;
pub mod error;
pub mod iface;
pub mod membership;
pub mod notify;
pub mod probe;
pub mod types;

pub use config::Config;
pub use daemon::{Daemon, DaemonHandle};
pub use directory::{MdnsDirectory, ServiceDirectory};
pub use error::DaemonError;
pub use membership::Membership;
pub use notify::{LogNotify, Notify};
pub use probe::{IcmpProbe, Probe, ProbeOutcome};
pub use types::DiscoveryRecord;
