//! Process-wide shutdown coordination.
//!
//! A [`ProcessContext`] owns the cancellation token every long-running task
//! watches and the ordered list of actions to run when the process winds
//! down. Actions run in reverse registration order, once, whether shutdown is
//! orderly, triggered by a signal or happens while unwinding from a panic.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type ShutdownAction = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

pub struct ProcessContext {
    token: CancellationToken,
    actions: Vec<(String, ShutdownAction)>,
}

impl std::fmt::Debug for ProcessContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.actions.iter().map(|(name, _)| name.as_str()).collect();
        f.debug_struct("ProcessContext")
            .field("cancelled", &self.token.is_cancelled())
            .field("actions", &names)
            .finish()
    }
}

impl Default for ProcessContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessContext {
    #[must_use]
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            actions: Vec::new(),
        }
    }

    /// Token cancelled when shutdown is requested.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Register an action to run at shutdown. Later registrations run first.
    pub fn on_shutdown<F>(&mut self, name: impl Into<String>, action: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.actions.push((name.into(), Box::new(action)));
    }

    #[must_use]
    pub fn pending_actions(&self) -> usize {
        self.actions.len()
    }

    /// Cancel the token when SIGINT or SIGTERM arrives.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn watch_signals(&self) -> JoinHandle<()> {
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = shutdown_signal() => {
                    info!("Shutdown signal received");
                    token.cancel();
                }
            }
        })
    }

    /// Cancel the token and run every registered action, newest first.
    ///
    /// Action errors are logged and the remaining actions still run. Calling
    /// this again only runs actions registered since the last call.
    pub fn shutdown(&mut self) {
        self.token.cancel();

        while let Some((name, action)) = self.actions.pop() {
            debug!("Running shutdown action: {}", name);
            if let Err(e) = action() {
                warn!("Shutdown action {} failed: {:#}", name, e);
            }
        }
    }
}

impl Drop for ProcessContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Resolve on Ctrl-C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
