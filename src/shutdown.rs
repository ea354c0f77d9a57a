use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Per-process shutdown state.
///
/// Constructed once near the entry point and handed down; nothing in the
/// library installs signal handlers on its own. The worker loops only
/// observe the flag between reservations, so an in-flight job always
/// finishes before the process honors it.
#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for tasks that want to select on shutdown.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Request shutdown. Idempotent.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Subscribe the coordinator to OS signals. Each listed signal, once
    /// delivered, triggers shutdown.
    pub fn bind_signals(&self, kinds: &[SignalKind]) -> std::io::Result<()> {
        for kind in kinds {
            let mut stream = signal(*kind)?;
            let token = self.token.clone();
            let kind = *kind;
            tokio::spawn(async move {
                if stream.recv().await.is_some() {
                    tracing::info!(signal = ?kind, "Signal received, initiating graceful shutdown");
                    token.cancel();
                }
            });
        }
        Ok(())
    }
}

/// Coordinator wired to SIGTERM and SIGINT, the usual pair for services.
pub fn install_shutdown_handler() -> std::io::Result<ShutdownCoordinator> {
    let coordinator = ShutdownCoordinator::new();
    coordinator.bind_signals(&[SignalKind::terminate(), SignalKind::interrupt()])?;
    Ok(coordinator)
}
