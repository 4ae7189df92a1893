//! The supervised run loop behind `supervised-run`.
//!
//! Service-manager stop requests and the supervisor's own end-of-cycle
//! notification arrive on one channel as [`HostEvent`]s, so there is a
//! single path from "running" to "stopped".

use std::sync::mpsc::{Receiver, Sender};

use anyhow::Result;

use crate::settings::ServiceSettings;
use crate::supervisor::{ProcessSupervisor, StopReason};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// The service manager (or a signal) asked the service to stop.
    StopRequested,
    /// The supervision cycle ended.
    Stopped(StopReason),
}

/// Start the supervisor and block until its cycle ends.
///
/// `on_stopping` runs once a stop request arrives, before the child is
/// terminated, so the caller can tell its service manager a stop is pending.
pub fn run_loop<F>(
    supervisor: &ProcessSupervisor,
    events_tx: Sender<HostEvent>,
    events: Receiver<HostEvent>,
    mut on_stopping: F,
) -> StopReason
where
    F: FnMut(),
{
    supervisor.start(move |reason| {
        events_tx.send(HostEvent::Stopped(reason)).ok();
    });

    loop {
        match events.recv() {
            Ok(HostEvent::StopRequested) => {
                tracing::info!(service = %supervisor.name(), "stop requested");
                on_stopping();
                supervisor.stop();
            }
            Ok(HostEvent::Stopped(reason)) => {
                supervisor.stop();
                return reason;
            }
            Err(_) => {
                supervisor.stop();
                return StopReason::StopRequested;
            }
        }
    }
}

/// Become the service manager's managed entity until the child is gone.
pub fn run_supervised(settings: ServiceSettings) -> Result<()> {
    #[cfg(windows)]
    {
        crate::platform::windows::run_dispatcher(settings)
    }
    #[cfg(not(windows))]
    {
        run_signal_host(settings)
    }
}

/// Unix flavor: the service manager stops us with SIGTERM.
#[cfg(not(windows))]
fn run_signal_host(settings: ServiceSettings) -> Result<()> {
    use std::sync::mpsc;

    let supervisor = ProcessSupervisor::new(&settings)?;
    let (tx, rx) = mpsc::channel();

    let signal_tx = tx.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        signal_tx.send(HostEvent::StopRequested).ok();
    }) {
        tracing::warn!("failed to install stop signal handler: {err}");
    }

    let reason = run_loop(&supervisor, tx, rx, || {});
    if reason.is_failure() {
        anyhow::bail!("service {} stopped: {reason}", settings.name);
    }
    tracing::info!(service = %settings.name, "service stopped: {reason}");
    Ok(())
}
