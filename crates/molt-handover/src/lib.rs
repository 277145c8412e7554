//! # molt-handover
//!
//! Zero-downtime process handover for Molt servers.
//!
//! ## Overview
//!
//! A restart replaces the serving process with a freshly started copy of the
//! same executable without ever unbinding a listening socket:
//! 1. The parent forks and execs itself, passing its listening sockets down
//!    through a fixed descriptor table
//! 2. The parent writes the new configuration and the address → descriptor
//!    mapping to the child's standard input
//! 3. The child adopts the inherited sockets, starts serving, and writes a
//!    non-empty acknowledgment to descriptor 3
//! 4. Only then does the parent stop its own servers and drain
//!
//! If the child never acknowledges, the parent keeps serving as if the
//! restart had never been attempted.
//!
//! ## Descriptor Table
//!
//! | Position | Descriptor                          |
//! |----------|-------------------------------------|
//! | 0        | read end of the configuration pipe  |
//! | 1        | parent's standard output            |
//! | 2        | parent's standard error             |
//! | 3        | write end of the signal pipe        |
//! | 4..      | listening sockets, registry order   |
//!
//! ## Environment Variables
//!
//! - `MOLT_RESTART`: set to `true` in every process launched by a handover
//! - `MOLT_HANDSHAKE_TIMEOUT_SECS`: optional bound on the wait for the child
//! - `MOLT_DRAIN_TIMEOUT_SECS`: drain timeout in seconds (default: 30)
//!
//! ## Platform
//!
//! The graceful path requires Unix. Elsewhere [`Restarter`] falls back to
//! stopping and restarting servers in place, with a brief outage.

pub mod config;
pub mod payload;
pub mod registry;
pub mod restart;
pub mod shutdown;

#[cfg(unix)]
pub mod fdtable;
#[cfg(unix)]
pub mod handshake;
#[cfg(unix)]
pub mod launch;
#[cfg(unix)]
pub mod listener;

pub use config::{ConfigInput, CurrentConfig, FileInput};
pub use payload::{HandoffPayload, PayloadError};
pub use registry::{RegistryError, ServerRegistry};
pub use restart::{
    is_handoff_child, RestartError, RestartOptions, RestartOutcome, RestartStrategy, Restarter,
    StopStart, RESTART_ENV,
};
pub use shutdown::{GracefulShutdown, ShutdownSignal};

#[cfg(unix)]
pub use handshake::HandshakeError;
#[cfg(unix)]
pub use listener::{InheritError, InheritedListeners};
#[cfg(unix)]
pub use registry::ListenerDescriptor;
#[cfg(unix)]
pub use restart::GracefulRestart;
