//! Membership change observer.

use std::net::Ipv4Addr;

use log::info;

/// Receives join/leave notifications from the membership tracker.
///
/// Callbacks are invoked synchronously in the context of whichever task
/// applied the transition, at most once per absent→present transition and
/// exactly once per present→absent transition.  Implementations should
/// return quickly.
pub trait Notify: Send + Sync {
    fn new_member(&self, addr: Ipv4Addr);
    fn remove_member(&self, addr: Ipv4Addr);
}

/// Default observer that just logs membership changes.
pub struct LogNotify;

impl Notify for LogNotify {
    fn new_member(&self, addr: Ipv4Addr) {
        info!("New member added: {}", addr);
    }

    fn remove_member(&self, addr: Ipv4Addr) {
        info!("Member left: {}", addr);
    }
}
