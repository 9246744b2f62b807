use thiserror::Error;

/// Failures that abort daemon startup.
///
/// Steady-state failures (a registration or lookup that fails once) are
/// logged inside the owning task and retried on the next cycle; only the
/// errors below propagate out of [`Daemon::start`](crate::daemon::Daemon::start).
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("failed to start service browse: {0}")]
    Browse(#[source] anyhow::Error),
}
