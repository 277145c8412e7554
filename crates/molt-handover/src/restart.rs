//! Restart coordination.
//!
//! [`Restarter`] owns the current configuration and a [`RestartStrategy`]
//! chosen once for the platform:
//! - [`GracefulRestart`] (Unix): fork-exec a child with the listening
//!   sockets, hand it the config, and stop our servers only after the child
//!   confirms it is serving
//! - [`StopStart`] (elsewhere): stop everything, then start again with the
//!   new config, accepting a short outage

use crate::config::{ConfigInput, CurrentConfig};
use crate::registry::{RegistryError, ServerRegistry};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[cfg(unix)]
use crate::fdtable::DescriptorTable;
#[cfg(unix)]
use crate::handshake::{await_ready_by, deliver, Deadline, HandshakeError};
#[cfg(unix)]
use crate::launch::{launch, LaunchTarget};
#[cfg(unix)]
use crate::payload::HandoffPayload;
#[cfg(unix)]
use tracing::error;

/// Set to `true` in the environment of every handover child.
pub const RESTART_ENV: &str = "MOLT_RESTART";
const RESTART_VALUE: &str = "true";

/// Whether this process was launched by a handover and should adopt its
/// listeners from the parent instead of binding fresh ones.
pub fn is_handoff_child() -> bool {
    std::env::var(RESTART_ENV).is_ok_and(|v| v == RESTART_VALUE)
}

#[derive(Debug, Error)]
pub enum RestartError {
    /// Pipes, descriptors or the child process could not be created.
    /// Current servers are untouched.
    #[error("failed to launch new process: {0}")]
    Launch(#[source] std::io::Error),

    /// The child was launched but never confirmed it is serving.
    /// Current servers are untouched.
    #[cfg(unix)]
    #[error("new process did not confirm readiness; changes not applied: {0}")]
    Incomplete(#[source] IncompleteCause),

    /// Stop-then-start failed; servers may be down.
    #[error("restart in place failed, servers may be down: {0}")]
    FallbackDowntime(#[source] RegistryError),

    /// The child is serving but our own servers would not stop.
    #[error("new process is serving but stopping old servers failed: {0}")]
    Shutdown(#[source] RegistryError),

    #[error("a restart is already in progress")]
    InProgress,
}

impl RestartError {
    /// Whether the current process is still fully serving after this error.
    pub fn still_serving(&self) -> bool {
        match self {
            RestartError::Launch(_) | RestartError::InProgress | RestartError::Shutdown(_) => true,
            #[cfg(unix)]
            RestartError::Incomplete(_) => true,
            RestartError::FallbackDowntime(_) => false,
        }
    }
}

/// Why a launched child failed to take over.
#[cfg(unix)]
#[derive(Debug, Error)]
pub enum IncompleteCause {
    #[error("encoding the handoff payload failed: {0}")]
    Payload(#[from] crate::payload::PayloadError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error("child closed the signal pipe without answering")]
    NoAnswer,
}

/// `Ok(())` is a completed restart.
pub type RestartOutcome = Result<(), RestartError>;

/// Tunables for a restart attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestartOptions {
    /// Bound on the wait for the child's answer. `None` waits indefinitely.
    pub handshake_timeout: Option<Duration>,
}

impl RestartOptions {
    /// Read `MOLT_HANDSHAKE_TIMEOUT_SECS`; unset or unparsable means no timeout.
    pub fn from_env() -> Self {
        let handshake_timeout = std::env::var("MOLT_HANDSHAKE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        Self { handshake_timeout }
    }
}

/// One way of replacing the running servers with ones for `config`.
pub trait RestartStrategy: Send + Sync {
    fn restart(&self, registry: &dyn ServerRegistry, config: Arc<dyn ConfigInput>)
        -> RestartOutcome;

    fn name(&self) -> &'static str;

    /// Whether a successful restart leaves another process serving, so
    /// this one should drain and exit.
    fn replaces_process(&self) -> bool;
}

/// Coordinates restarts for one process.
pub struct Restarter {
    current: CurrentConfig,
    strategy: Box<dyn RestartStrategy>,
    in_flight: Mutex<()>,
}

impl Restarter {
    /// Use the graceful strategy where the platform supports it.
    pub fn new(initial: Arc<dyn ConfigInput>, options: RestartOptions) -> Self {
        #[cfg(unix)]
        let strategy: Box<dyn RestartStrategy> = Box::new(GracefulRestart::new(options));
        #[cfg(not(unix))]
        let strategy: Box<dyn RestartStrategy> = {
            let _ = options;
            Box::new(StopStart)
        };
        Self::with_strategy(initial, strategy)
    }

    pub fn with_strategy(
        initial: Arc<dyn ConfigInput>,
        strategy: Box<dyn RestartStrategy>,
    ) -> Self {
        Self {
            current: CurrentConfig::new(initial),
            strategy,
            in_flight: Mutex::new(()),
        }
    }

    pub fn current_config(&self) -> Arc<dyn ConfigInput> {
        self.current.get()
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn replaces_process(&self) -> bool {
        self.strategy.replaces_process()
    }

    /// Restart into `new_config`, or the current configuration if `None`.
    ///
    /// Blocks until the attempt is resolved. Only one restart runs at a
    /// time; a concurrent call fails with [`RestartError::InProgress`].
    pub fn restart(
        &self,
        registry: &dyn ServerRegistry,
        new_config: Option<Arc<dyn ConfigInput>>,
    ) -> RestartOutcome {
        let _guard = match self.in_flight.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(RestartError::InProgress),
        };

        let config = new_config.unwrap_or_else(|| self.current.get());

        info!(
            strategy = self.strategy.name(),
            config = %config.path().display(),
            "Restarting"
        );

        self.strategy.restart(registry, Arc::clone(&config))?;
        self.current.replace(config);
        Ok(())
    }
}

/// Stop every server, then start them again. Causes a brief outage.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopStart;

impl RestartStrategy for StopStart {
    fn restart(
        &self,
        registry: &dyn ServerRegistry,
        config: Arc<dyn ConfigInput>,
    ) -> RestartOutcome {
        warn!("Restarting in place; listeners will be briefly unavailable");
        registry.stop_all().map_err(RestartError::FallbackDowntime)?;
        registry
            .start_all(config)
            .map_err(RestartError::FallbackDowntime)?;
        info!("Restart in place complete");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "stop-start"
    }

    fn replaces_process(&self) -> bool {
        false
    }
}

/// Zero-downtime handover to a child process.
#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct GracefulRestart {
    options: RestartOptions,
    target: Option<LaunchTarget>,
}

#[cfg(unix)]
impl GracefulRestart {
    /// Re-execute the current binary with its original arguments.
    pub fn new(options: RestartOptions) -> Self {
        Self {
            options,
            target: None,
        }
    }

    /// Launch `target` instead of the current binary.
    pub fn with_target(options: RestartOptions, target: LaunchTarget) -> Self {
        Self {
            options,
            target: Some(target),
        }
    }

    fn launch_target(&self) -> std::io::Result<LaunchTarget> {
        let target = match &self.target {
            Some(target) => target.clone(),
            None => LaunchTarget::current_process()?,
        };
        Ok(target.env(RESTART_ENV, RESTART_VALUE))
    }
}

#[cfg(unix)]
impl RestartStrategy for GracefulRestart {
    fn restart(
        &self,
        registry: &dyn ServerRegistry,
        config: Arc<dyn ConfigInput>,
    ) -> RestartOutcome {
        let target = self.launch_target().map_err(RestartError::Launch)?;

        let (config_reader, config_writer) = std::io::pipe().map_err(RestartError::Launch)?;
        let (signal_reader, signal_writer) = std::io::pipe().map_err(RestartError::Launch)?;

        let listeners = registry.listeners().map_err(|e| {
            RestartError::Launch(std::io::Error::other(format!(
                "snapshotting listeners failed: {e}"
            )))
        })?;
        let listener_count = listeners.len();

        let table = DescriptorTable::build(config_reader.into(), signal_writer.into(), listeners)
            .map_err(RestartError::Launch)?;

        let mut child = launch(&target, &table).map_err(RestartError::Launch)?;
        let pid = child.id();

        // Consuming the table closes our copies of the config-pipe read end,
        // the signal-pipe write end and the listener duplicates. The child
        // now holds the only writer of the signal pipe.
        let payload = HandoffPayload::new(table.into_index(), config.body().to_vec());

        // One deadline covers the payload write and the answer, so a child
        // that never reads its stdin is bounded too.
        let deadline = self.options.handshake_timeout.map(Deadline::after);

        let answer = payload
            .encode()
            .map_err(IncompleteCause::from)
            .and_then(|bytes| {
                deliver(&config_writer, &bytes, deadline)?;
                drop(config_writer);
                let answer = await_ready_by(signal_reader, deadline)?;
                if answer.is_empty() {
                    Err(IncompleteCause::NoAnswer)
                } else {
                    Ok(answer)
                }
            });

        let answer = match answer {
            Ok(answer) => answer,
            Err(cause) => {
                warn!(pid, error = %cause, "restart: child failed to answer; changes not applied");
                // The child may still be running (hung, or closed fd 3 and
                // carried on). It must not outlive a failed handover.
                let _ = child.kill();
                if let Err(e) = child.wait() {
                    error!(pid, error = %e, "Failed to reap handover child");
                }
                return Err(RestartError::Incomplete(cause));
            }
        };

        info!(
            pid,
            listener_count,
            answer_len = answer.len(),
            "Child confirmed handover; stopping old servers"
        );

        registry.stop_all().map_err(RestartError::Shutdown)?;

        info!(pid, "Handover complete");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "graceful"
    }

    fn replaces_process(&self) -> bool {
        true
    }
}
