//! Signal-driven lifecycle with connection draining.
//!
//! - `SIGTERM` / `SIGINT` → stop accepting, drain, exit
//! - `SIGUSR1` → hand over to a new process; on success drain and exit,
//!   on failure keep serving and wait for the next signal
//!
//! Servers stop on a shared [`CancellationToken`] and run their connection
//! tasks on a shared [`TaskTracker`], which is what the drain waits on.

use std::future::Future;
use std::io;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// Why the lifecycle woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Graceful stop: drain and exit.
    Terminate,
    /// Graceful restart: hand over, then drain and exit.
    Restart,
}

/// Coordinator for graceful shutdown with connection draining.
#[derive(Debug)]
pub struct GracefulShutdown {
    /// Cancelled when every server should stop accepting.
    stop_accepting: CancellationToken,

    /// Tracks server and connection tasks still running.
    tasks: TaskTracker,

    drain_timeout: Duration,

    /// Installed once and kept, so no signal is lost between waits.
    #[cfg(unix)]
    signals: tokio::sync::Mutex<Option<UnixSignals>>,
}

#[cfg(unix)]
#[derive(Debug)]
struct UnixSignals {
    terminate: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
    restart: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl UnixSignals {
    fn install() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
            restart: signal(SignalKind::user_defined1())?,
        })
    }
}

impl GracefulShutdown {
    pub fn new(drain_timeout: Duration) -> Self {
        Self {
            stop_accepting: CancellationToken::new(),
            tasks: TaskTracker::new(),
            drain_timeout,
            #[cfg(unix)]
            signals: tokio::sync::Mutex::new(None),
        }
    }

    /// Drain timeout from `MOLT_DRAIN_TIMEOUT_SECS`, default 30s.
    pub fn from_env() -> Self {
        let timeout_secs: u64 = std::env::var("MOLT_DRAIN_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        Self::new(Duration::from_secs(timeout_secs))
    }

    /// Token cancelled when every server should stop. Servers that must be
    /// stoppable on their own should use a child token.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop_accepting.clone()
    }

    pub fn tracker(&self) -> TaskTracker {
        self.tasks.clone()
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub fn active_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Stop every server programmatically.
    pub fn trigger_stop(&self) {
        self.stop_accepting.cancel();
    }

    /// Take over `SIGTERM`, `SIGINT` and `SIGUSR1` now rather than at the
    /// first wait. Until then `SIGUSR1` kills the process.
    ///
    /// Must be called within a Tokio runtime.
    #[cfg(unix)]
    pub fn listen_for_signals(&self) -> io::Result<()> {
        let mut slot = self
            .signals
            .try_lock()
            .map_err(|_| io::Error::other("signal listener is busy"))?;
        if slot.is_none() {
            *slot = Some(UnixSignals::install()?);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn listen_for_signals(&self) -> io::Result<()> {
        Ok(())
    }

    /// Wait for the next lifecycle signal.
    #[cfg(unix)]
    pub async fn wait_for_signal(&self) -> io::Result<ShutdownSignal> {
        let mut slot = self.signals.lock().await;
        let installed = match slot.take() {
            Some(signals) => signals,
            None => UnixSignals::install()?,
        };
        let signals = slot.insert(installed);

        let signal = tokio::select! {
            _ = signals.terminate.recv() => {
                info!("Received SIGTERM; initiating graceful shutdown");
                ShutdownSignal::Terminate
            }
            _ = signals.interrupt.recv() => {
                info!("Received SIGINT; initiating graceful shutdown");
                ShutdownSignal::Terminate
            }
            _ = signals.restart.recv() => {
                info!("Received SIGUSR1; initiating graceful restart");
                ShutdownSignal::Restart
            }
        };
        Ok(signal)
    }

    /// Wait for the next lifecycle signal. Only Ctrl-C is available here.
    #[cfg(not(unix))]
    pub async fn wait_for_signal(&self) -> io::Result<ShutdownSignal> {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl-C; initiating graceful shutdown");
        Ok(ShutdownSignal::Terminate)
    }

    /// Wait for tracked tasks to finish, up to the drain timeout.
    ///
    /// Returns `true` if everything drained, `false` if timed out.
    pub async fn drain(&self) -> bool {
        self.tasks.close();

        let active = self.active_tasks();
        if active == 0 {
            info!("No active tasks, drain complete");
            return true;
        }

        info!(
            active_tasks = active,
            timeout_secs = self.drain_timeout.as_secs(),
            "Draining active connections"
        );

        match tokio::time::timeout(self.drain_timeout, self.tasks.wait()).await {
            Ok(()) => {
                info!("All connections drained cleanly");
                true
            }
            Err(_) => {
                warn!(
                    remaining_tasks = self.active_tasks(),
                    timeout_secs = self.drain_timeout.as_secs(),
                    "Drain timeout expired, force-exiting"
                );
                false
            }
        }
    }

    /// Run the lifecycle until the process should exit.
    ///
    /// 1. Wait for a signal
    /// 2. On restart, call `on_restart`; if it reports the handover did not
    ///    happen, keep serving and go back to 1
    /// 3. Cancel the stop token and drain
    pub async fn run<F, Fut>(self, mut on_restart: F) -> io::Result<ShutdownSignal>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        self.run_until(|| self.wait_for_signal(), &mut on_restart).await
    }

    async fn run_until<S, SFut, F, Fut>(
        &self,
        mut next_signal: S,
        on_restart: &mut F,
    ) -> io::Result<ShutdownSignal>
    where
        S: FnMut() -> SFut,
        SFut: Future<Output = io::Result<ShutdownSignal>>,
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let signal = loop {
            let signal = next_signal().await?;
            if signal == ShutdownSignal::Terminate {
                break signal;
            }

            if on_restart().await {
                break signal;
            }
            error!("Restart did not complete; continuing to serve");
        };

        info!("Stopping accept loops");
        self.stop_accepting.cancel();

        let clean = self.drain().await;
        if !clean {
            error!(
                remaining_tasks = self.active_tasks(),
                "Force-exiting with remaining connections"
            );
        }

        Ok(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn scripted(
        signals: Vec<ShutdownSignal>,
    ) -> impl FnMut() -> std::future::Ready<io::Result<ShutdownSignal>> {
        let mut signals: VecDeque<_> = signals.into();
        move || {
            std::future::ready(
                signals
                    .pop_front()
                    .ok_or_else(|| io::Error::other("no more signals")),
            )
        }
    }

    #[tokio::test]
    async fn test_graceful_drain() {
        let shutdown = GracefulShutdown::new(Duration::from_secs(5));
        let stop_token = shutdown.stop_token();
        let tracker = shutdown.tracker();

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        tracker.spawn(async move {
            let _ = release_rx.await;
        });
        assert_eq!(shutdown.active_tasks(), 1);

        shutdown.trigger_stop();
        assert!(stop_token.is_cancelled());

        release_tx.send(()).unwrap();
        assert!(shutdown.drain().await);
        assert_eq!(shutdown.active_tasks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_timeout() {
        let shutdown = GracefulShutdown::new(Duration::from_millis(100));
        shutdown.tracker().spawn(std::future::pending::<()>());

        assert!(!shutdown.drain().await);
        assert_eq!(shutdown.active_tasks(), 1);
    }

    #[tokio::test]
    async fn test_drain_with_nothing_running() {
        let shutdown = GracefulShutdown::new(Duration::from_secs(1));
        assert!(shutdown.drain().await);
    }

    #[tokio::test]
    async fn test_terminate_stops_without_restart() {
        let shutdown = GracefulShutdown::new(Duration::from_secs(1));
        let token = shutdown.stop_token();
        let mut restarts = 0;

        let signal = shutdown
            .run_until(scripted(vec![ShutdownSignal::Terminate]), &mut || {
                restarts += 1;
                std::future::ready(true)
            })
            .await
            .unwrap();

        assert_eq!(signal, ShutdownSignal::Terminate);
        assert_eq!(restarts, 0);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_failed_restart_keeps_serving() {
        let shutdown = GracefulShutdown::new(Duration::from_secs(1));
        let token = shutdown.stop_token();
        let mut outcomes = VecDeque::from([false, true]);
        let mut restarts = 0;

        let signal = shutdown
            .run_until(
                scripted(vec![ShutdownSignal::Restart, ShutdownSignal::Restart]),
                &mut || {
                    restarts += 1;
                    std::future::ready(outcomes.pop_front().unwrap_or(false))
                },
            )
            .await
            .unwrap();

        assert_eq!(signal, ShutdownSignal::Restart);
        assert_eq!(restarts, 2);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_failed_restart_does_not_cancel() {
        let shutdown = GracefulShutdown::new(Duration::from_secs(1));
        let token = shutdown.stop_token();

        let err = shutdown
            .run_until(scripted(vec![ShutdownSignal::Restart]), &mut || {
                std::future::ready(false)
            })
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "no more signals");
        assert!(!token.is_cancelled());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigusr1_is_restart() {
        let shutdown = GracefulShutdown::new(Duration::from_secs(1));
        shutdown.listen_for_signals().unwrap();

        // Delivered before the wait starts; the installed stream keeps it.
        // SAFETY: plain kill(2) on our own pid.
        assert_eq!(unsafe { libc::kill(libc::getpid(), libc::SIGUSR1) }, 0);

        let signal = tokio::time::timeout(Duration::from_secs(5), shutdown.wait_for_signal())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal, ShutdownSignal::Restart);
    }

    #[test]
    fn test_from_env_default() {
        std::env::remove_var("MOLT_DRAIN_TIMEOUT_SECS");
        let shutdown = GracefulShutdown::from_env();
        assert_eq!(shutdown.drain_timeout(), Duration::from_secs(30));
    }
}
