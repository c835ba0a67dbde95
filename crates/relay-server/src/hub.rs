use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use relay_core::{OperationId, ProgressEvent, ProgressKind};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::forwarder::{Forwarder, ForwarderConfig};
use crate::server::{self, AppState};
use crate::viewers::ViewerRegistry;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Hub configuration.
#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Loopback port; 0 picks an ephemeral one (and therefore always wins).
    pub port: u16,
    pub max_send_queue: usize,
    pub ingest_body_limit: usize,
    pub forward_queue_cap: usize,
    pub retry_delay: Duration,
    pub flush_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            port: 7337,
            max_send_queue: 256,
            ingest_body_limit: 64 * 1024,
            forward_queue_cap: 2000,
            retry_delay: Duration::from_secs(1),
            flush_timeout: Duration::from_secs(2),
        }
    }
}

/// Which side of the port this instance ended up on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HubRole {
    /// Owns the port and serves viewers.
    Hub,
    /// Port was taken; events are relayed to whoever owns it.
    Forwarder,
}

impl std::fmt::Display for HubRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hub => write!(f, "hub"),
            Self::Forwarder => write!(f, "forwarder"),
        }
    }
}

enum Mode {
    Hub {
        registry: Arc<ViewerRegistry>,
        shutdown: CancellationToken,
        server: Mutex<Option<JoinHandle<()>>>,
    },
    Forwarder(Forwarder),
}

/// Machine-wide broadcast point for progress events. The first instance to
/// bind the port serves viewers; later ones forward to it.
pub struct ProgressHub {
    port: u16,
    mode: Mode,
}

impl ProgressHub {
    /// Bind the loopback port. Address-in-use makes this instance a
    /// forwarder; any other bind failure is returned.
    pub async fn start(config: HubConfig) -> io::Result<Self> {
        match TcpListener::bind(("127.0.0.1", config.port)).await {
            Ok(listener) => Self::serve(listener, &config),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                tracing::info!(port = config.port, "hub port taken, forwarding to existing hub");
                let forwarder = Forwarder::start(ForwarderConfig {
                    ingest_url: format!("http://127.0.0.1:{}/ingest", config.port),
                    queue_cap: config.forward_queue_cap,
                    retry_delay: config.retry_delay,
                    flush_timeout: config.flush_timeout,
                });
                Ok(Self {
                    port: config.port,
                    mode: Mode::Forwarder(forwarder),
                })
            }
            Err(e) => Err(e),
        }
    }

    fn serve(listener: TcpListener, config: &HubConfig) -> io::Result<Self> {
        let port = listener.local_addr()?.port();
        let registry = Arc::new(ViewerRegistry::new(config.max_send_queue));
        let router = server::build_router(
            AppState {
                registry: Arc::clone(&registry),
            },
            config.ingest_body_limit,
        );

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let server = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(signal.cancelled_owned())
                .await;
            if let Err(e) = served {
                tracing::warn!(error = %e, "hub server exited with error");
            }
        });

        tracing::info!(port, "progress hub started");
        Ok(Self {
            port,
            mode: Mode::Hub {
                registry,
                shutdown,
                server: Mutex::new(Some(server)),
            },
        })
    }

    pub fn role(&self) -> HubRole {
        match self.mode {
            Mode::Hub { .. } => HubRole::Hub,
            Mode::Forwarder(_) => HubRole::Forwarder,
        }
    }

    /// Port the hub listens on (or, for a forwarder, forwards to).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Connected viewers; always 0 for a forwarder.
    pub fn viewer_count(&self) -> usize {
        match &self.mode {
            Mode::Hub { registry, .. } => registry.count(),
            Mode::Forwarder(_) => 0,
        }
    }

    /// Publish an event. Never blocks and never fails.
    pub fn emit(&self, event: ProgressEvent) {
        match &self.mode {
            Mode::Hub { registry, .. } => {
                server::publish(registry, &event);
            }
            Mode::Forwarder(forwarder) => forwarder.enqueue(event),
        }
    }

    pub fn start_operation(&self, operation_id: &OperationId, content: impl Into<String>) {
        self.emit(ProgressEvent::now(operation_id, ProgressKind::Start, content));
    }

    pub fn end_operation(&self, operation_id: &OperationId, content: impl Into<String>) {
        self.emit(ProgressEvent::now(operation_id, ProgressKind::End, content));
    }

    pub fn fail_operation(&self, operation_id: &OperationId, message: impl Into<String>) {
        self.emit(ProgressEvent::now(operation_id, ProgressKind::Error, message));
    }

    #[cfg(test)]
    pub(crate) fn registry_for_tests(&self) -> Arc<ViewerRegistry> {
        match &self.mode {
            Mode::Hub { registry, .. } => Arc::clone(registry),
            Mode::Forwarder(_) => panic!("forwarder has no viewers"),
        }
    }

    /// Hub: close every viewer stream and release the port. Forwarder: flush
    /// for a bounded time, then discard the rest.
    pub async fn stop(&self) {
        match &self.mode {
            Mode::Hub {
                registry,
                shutdown,
                server,
            } => {
                registry.clear();
                shutdown.cancel();
                let handle = server.lock().take();
                if let Some(mut handle) = handle {
                    if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                        handle.abort();
                        let _ = handle.await;
                    }
                }
                tracing::info!(port = self.port, "progress hub stopped");
            }
            Mode::Forwarder(forwarder) => forwarder.stop().await,
        }
    }
}
