//! Start/stop requests against an existing registration.

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::platform::{Registration, ServiceBackend, ServiceState};

/// Upper bound on waiting for a requested transition to show up.
pub const STATUS_WAIT: Duration = Duration::from_millis(1000);
const STATUS_POLL: Duration = Duration::from_millis(100);

/// Console-facing result of a management command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Installed {
        name: String,
        description: String,
        started: bool,
    },
    AlreadyInstalled {
        label: String,
    },
    NotInstalled {
        label: String,
    },
    Uninstalled {
        label: String,
    },
    Started {
        label: String,
        confirmed: bool,
    },
    AlreadyRunning {
        label: String,
    },
    Stopped {
        label: String,
        confirmed: bool,
    },
    AlreadyStopped {
        label: String,
    },
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Installed {
                name,
                description,
                started: true,
            } => write!(f, "Successfully registered and started service \"{name}\" (\"{description}\")"),
            Outcome::Installed {
                name,
                description,
                started: false,
            } => write!(f, "Successfully registered service \"{name}\" (\"{description}\")"),
            Outcome::AlreadyInstalled { label } => write!(f, "Service {label} was already installed."),
            Outcome::NotInstalled { label } => write!(f, "Service {label} does not exist."),
            Outcome::Uninstalled { label } => write!(f, "Successfully uninstalled service {label}"),
            Outcome::Started {
                label,
                confirmed: true,
            } => write!(f, "Successfully started service {label}"),
            Outcome::Started {
                label,
                confirmed: false,
            } => write!(
                f,
                "Start requested for service {label}; not confirmed running after {}ms",
                STATUS_WAIT.as_millis()
            ),
            Outcome::AlreadyRunning { label } => {
                write!(f, "Service {label} is already running or start is pending.")
            }
            Outcome::Stopped {
                label,
                confirmed: true,
            } => write!(f, "Successfully stopped service {label}"),
            Outcome::Stopped {
                label,
                confirmed: false,
            } => write!(
                f,
                "Stop requested for service {label}; not confirmed stopped after {}ms",
                STATUS_WAIT.as_millis()
            ),
            Outcome::AlreadyStopped { label } => {
                write!(f, "Service {label} is already stopped or stop is pending.")
            }
        }
    }
}

pub struct ServiceController<'a> {
    backend: &'a dyn ServiceBackend,
    wait: Duration,
    poll: Duration,
}

impl<'a> ServiceController<'a> {
    pub fn new(backend: &'a dyn ServiceBackend) -> Self {
        Self {
            backend,
            wait: STATUS_WAIT,
            poll: STATUS_POLL,
        }
    }

    pub fn with_wait(mut self, wait: Duration, poll: Duration) -> Self {
        self.wait = wait;
        self.poll = poll;
        self
    }

    pub fn backend(&self) -> &'a dyn ServiceBackend {
        self.backend
    }

    pub fn lookup(&self, name: &str) -> Result<Option<Registration>> {
        self.backend.query(name)
    }

    pub fn status(&self, registration: &Registration) -> Result<ServiceState> {
        self.backend.status(&registration.name)
    }

    pub fn start(&self, registration: &Registration) -> Result<Outcome> {
        let label = registration.label();
        if self.status(registration)?.is_running_or_pending() {
            return Ok(Outcome::AlreadyRunning { label });
        }

        self.backend.request_start(&registration.name)?;
        let confirmed = self.wait_for(registration, ServiceState::Running)?;
        if !confirmed {
            tracing::warn!(service = %registration.name, "start not confirmed within {:?}", self.wait);
        }
        Ok(Outcome::Started { label, confirmed })
    }

    pub fn stop(&self, registration: &Registration) -> Result<Outcome> {
        let label = registration.label();
        if self.status(registration)?.is_stopped_or_pending() {
            return Ok(Outcome::AlreadyStopped { label });
        }

        self.backend.request_stop(&registration.name)?;
        let confirmed = self.wait_for(registration, ServiceState::Stopped)?;
        if !confirmed {
            tracing::warn!(service = %registration.name, "stop not confirmed within {:?}", self.wait);
        }
        Ok(Outcome::Stopped { label, confirmed })
    }

    /// Stop followed by start.
    pub fn reset(&self, registration: &Registration) -> Result<Vec<Outcome>> {
        let stopped = self.stop(registration)?;
        let started = self.start(registration)?;
        Ok(vec![stopped, started])
    }

    /// Poll until `desired` is observed or the wait elapses.
    fn wait_for(&self, registration: &Registration, desired: ServiceState) -> Result<bool> {
        let deadline = Instant::now() + self.wait;
        loop {
            if self.status(registration)? == desired {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            thread::sleep(self.poll.min(deadline - now));
        }
    }
}
