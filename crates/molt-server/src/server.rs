//! HTTP servers and the registry that owns their listening sockets.
//!
//! Each configured listener runs its own axum server on a child of the
//! lifecycle's stop token, so the registry can stop its servers without
//! ending the process (needed for restart in place) while a process-wide
//! stop still reaches every one of them.

use crate::config::{ListenerConfig, ServerConfig};
use axum::{extract::State, routing::get, Router};
use molt_handover::{ConfigInput, GracefulShutdown, RegistryError, ServerRegistry};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

#[cfg(unix)]
use molt_handover::ListenerDescriptor;
#[cfg(unix)]
use std::os::fd::{AsFd, OwnedFd};

struct RunningServer {
    address: String,
    local_addr: SocketAddr,
    /// Same socket as the server's listener, kept for handing over.
    #[cfg(unix)]
    socket: OwnedFd,
    stop: CancellationToken,
}

/// The HTTP servers this process is running.
pub struct HttpRegistry {
    runtime: Handle,
    stop: CancellationToken,
    tracker: TaskTracker,
    servers: Mutex<Vec<RunningServer>>,
}

impl HttpRegistry {
    pub fn new(runtime: Handle, shutdown: &GracefulShutdown) -> Self {
        Self {
            runtime,
            stop: shutdown.stop_token(),
            tracker: shutdown.tracker(),
            servers: Mutex::new(Vec::new()),
        }
    }

    fn servers(&self) -> MutexGuard<'_, Vec<RunningServer>> {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind `listener.address` and serve on it.
    pub fn bind(&self, listener: ListenerConfig) -> io::Result<()> {
        let addr = listener
            .socket_addr()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let socket = std::net::TcpListener::bind(addr)?;
        info!(address = %listener.address, "Bound listener");
        self.serve(listener, socket)
    }

    /// Serve on an already-bound socket, e.g. one inherited from the parent.
    pub fn serve(&self, listener: ListenerConfig, socket: std::net::TcpListener) -> io::Result<()> {
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        #[cfg(unix)]
        let handover_fd = socket.as_fd().try_clone_to_owned()?;

        let tcp = {
            let _guard = self.runtime.enter();
            tokio::net::TcpListener::from_std(socket)?
        };

        let stop = self.stop.child_token();
        let app = router(listener.body.clone());
        self.tracker.spawn_on(
            run_http_server(listener.address.clone(), tcp, app, stop.clone()),
            &self.runtime,
        );

        self.servers().push(RunningServer {
            address: listener.address,
            local_addr,
            #[cfg(unix)]
            socket: handover_fd,
            stop,
        });
        Ok(())
    }

    /// Configured addresses of running servers, in start order.
    pub fn addresses(&self) -> Vec<String> {
        self.servers().iter().map(|s| s.address.clone()).collect()
    }

    /// Addresses the running servers are actually bound to.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.servers().iter().map(|s| s.local_addr).collect()
    }
}

impl ServerRegistry for HttpRegistry {
    #[cfg(unix)]
    fn listeners(&self) -> Result<Vec<ListenerDescriptor>, RegistryError> {
        let servers = self.servers();
        let mut out = Vec::with_capacity(servers.len());
        for server in servers.iter() {
            out.push(ListenerDescriptor {
                address: server.address.clone(),
                fd: server.socket.try_clone()?,
            });
        }
        Ok(out)
    }

    fn stop_all(&self) -> Result<(), RegistryError> {
        let servers = std::mem::take(&mut *self.servers());
        for server in servers {
            info!(address = %server.address, "Stopping server");
            server.stop.cancel();
        }
        Ok(())
    }

    fn start_all(&self, config: Arc<dyn ConfigInput>) -> Result<(), RegistryError> {
        let config = ServerConfig::from_input(&*config)?;
        config.log_config();
        for listener in config.listeners {
            if let Err(e) = self.bind(listener) {
                // Leave nothing half-started.
                self.stop_all()?;
                return Err(e.into());
            }
        }
        Ok(())
    }
}

fn router(body: String) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .with_state(Arc::new(body))
}

async fn index(State(body): State<Arc<String>>) -> ([(&'static str, String); 1], String) {
    (
        [("x-molt-pid", std::process::id().to_string())],
        body.as_ref().clone(),
    )
}

async fn health() -> &'static str {
    "ok"
}

/// Run one HTTP server until `stop` is cancelled, then drain it.
async fn run_http_server(
    address: String,
    listener: tokio::net::TcpListener,
    app: Router,
    stop: CancellationToken,
) {
    info!(address = %address, "Starting HTTP server");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            stop.cancelled().await;
            info!("HTTP server received shutdown signal, draining connections");
        })
        .await;

    match result {
        Ok(()) => info!(address = %address, "HTTP server stopped"),
        Err(e) => error!(address = %address, error = %e, "HTTP server failed"),
    }
}
