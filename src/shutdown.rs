//! Cooperative Ctrl+C / SIGTERM handling for foreground runs.
//!
//! The first signal cancels the shared [`ShutdownToken`]; later signals are
//! no-ops. The signal thread then parks until the main loop calls
//! [`ShutdownCoordinator::complete`], so the process only exits once the
//! application finished its own orderly shutdown.

use std::sync::Arc;

use tokio::sync::watch;

pub const DEFAULT_SHUTDOWN_MESSAGE: &str = "Application is shutting down...";

struct Shared {
    message: Option<String>,
    cancel: watch::Sender<bool>,
    done: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct ShutdownCoordinator {
    shared: Arc<Shared>,
}

impl ShutdownCoordinator {
    pub fn new(message: Option<String>) -> Self {
        let (cancel, _) = watch::channel(false);
        let (done, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                message,
                cancel,
                done,
            }),
        }
    }

    /// Route SIGINT/SIGTERM (Ctrl+C, console close) to [`Self::trigger`].
    ///
    /// Only one handler can exist per process; a second registration is
    /// logged and otherwise ignored.
    pub fn install(&self) {
        let coordinator = self.clone();
        if let Err(err) = ctrlc::set_handler(move || coordinator.trigger()) {
            tracing::warn!("failed to install shutdown handler: {err}");
        }
    }

    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            cancel: self.shared.cancel.subscribe(),
        }
    }

    /// Cancel the token once. Returns `true` for the call that cancelled it.
    pub fn cancel(&self) -> bool {
        let first = self.shared.cancel.send_if_modified(|cancelled| {
            if *cancelled {
                false
            } else {
                *cancelled = true;
                true
            }
        });
        if first {
            if let Some(message) = &self.shared.message {
                println!("{message}");
            }
            tracing::debug!("shutdown requested");
        }
        first
    }

    /// Signal-handler body: cancel, then block until [`Self::complete`].
    pub fn trigger(&self) {
        self.cancel();
        let mut done = self.shared.done.subscribe();
        if futures::executor::block_on(done.wait_for(|done| *done)).is_err() {
            tracing::debug!("shutdown coordinator dropped before completion");
        }
    }

    /// Called by the main loop once the application has shut down.
    pub fn complete(&self) {
        self.shared.done.send_replace(true);
    }

    pub fn is_complete(&self) -> bool {
        *self.shared.done.borrow()
    }
}

/// Read side of the cancellation signal handed to the application.
#[derive(Clone)]
pub struct ShutdownToken {
    cancel: watch::Receiver<bool>,
}

impl ShutdownToken {
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once shutdown was requested.
    pub async fn cancelled(&self) {
        let mut cancel = self.cancel.clone();
        // A dropped coordinator can never cancel; treat it as cancelled so
        // waiters do not hang.
        let _ = cancel.wait_for(|cancelled| *cancelled).await;
    }

    /// Blocking variant of [`Self::cancelled`] for synchronous entry points.
    pub fn wait(&self) {
        futures::executor::block_on(self.cancelled());
    }
}
