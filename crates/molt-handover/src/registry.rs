//! The contract between the restart coordinator and whatever owns the
//! running servers.

use crate::config::ConfigInput;
use std::sync::Arc;

#[cfg(unix)]
use std::os::fd::OwnedFd;

/// Error type returned by registry implementations.
pub type RegistryError = Box<dyn std::error::Error + Send + Sync>;

/// One listening socket, snapshotted out of the registry.
///
/// `fd` is a duplicate owned by the snapshot, so it stays valid after the
/// registry's lock is released and is closed when the snapshot is dropped.
#[cfg(unix)]
#[derive(Debug)]
pub struct ListenerDescriptor {
    pub address: String,
    pub fd: OwnedFd,
}

/// The set of servers this process is running.
///
/// Implementations guard their own state; each method takes and releases
/// the registry lock internally and never holds it while the coordinator
/// waits on a child process.
pub trait ServerRegistry: Send + Sync {
    /// Snapshot every active listener, in registry order.
    #[cfg(unix)]
    fn listeners(&self) -> Result<Vec<ListenerDescriptor>, RegistryError>;

    /// Stop every running server. Draining is up to each server.
    fn stop_all(&self) -> Result<(), RegistryError>;

    /// Start servers for `config`, binding fresh sockets.
    fn start_all(&self, config: Arc<dyn ConfigInput>) -> Result<(), RegistryError>;
}
