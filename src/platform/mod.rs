//! Boundary to the host service manager.
//!
//! Everything above this module talks to [`ServiceBackend`] and
//! [`ConsoleSignal`]; each supported platform supplies its own implementation.

use std::path::PathBuf;

use anyhow::Result;

use crate::launch::LaunchSpec;
use crate::settings::{AccountType, StartType};

#[cfg(test)]
pub(crate) mod fake;
#[cfg(target_os = "linux")]
pub mod systemd;
#[cfg(windows)]
pub mod windows;

/// Service status as reported by the service manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    StartPending,
    StopPending,
    Running,
    Other,
}

impl ServiceState {
    pub fn is_running_or_pending(self) -> bool {
        matches!(self, ServiceState::Running | ServiceState::StartPending)
    }

    pub fn is_stopped_or_pending(self) -> bool {
        matches!(self, ServiceState::Stopped | ServiceState::StopPending)
    }
}

/// An existing registration found by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub name: String,
    pub display_name: String,
}

impl Registration {
    /// `display name(name)` as used in console messages.
    pub fn label(&self) -> String {
        format!("{}({})", self.display_name, self.name)
    }
}

/// Everything needed to create a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub command: LaunchSpec,
    pub account: AccountType,
    pub start_type: StartType,
    /// File the supervised run appends to; the service needs write access.
    pub log_path: Option<PathBuf>,
}

/// Minimal surface of an OS service manager.
pub trait ServiceBackend {
    /// Look up a registration; `None` when no service has that name.
    fn query(&self, name: &str) -> Result<Option<Registration>>;
    fn status(&self, name: &str) -> Result<ServiceState>;
    fn create(&self, definition: &ServiceDefinition) -> Result<()>;
    fn delete(&self, name: &str) -> Result<()>;
    /// Ask the manager to start the service without waiting for it.
    fn request_start(&self, name: &str) -> Result<()>;
    /// Ask the manager to stop the service without waiting for it.
    fn request_stop(&self, name: &str) -> Result<()>;
}

/// Backend for the platform this binary runs on.
pub fn default_backend() -> Result<Box<dyn ServiceBackend>> {
    #[cfg(windows)]
    {
        Ok(Box::new(windows::ScmBackend::new()))
    }
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(systemd::SystemdBackend::new()?))
    }
    #[cfg(not(any(windows, target_os = "linux")))]
    {
        anyhow::bail!("no service manager integration for this platform")
    }
}

/// Hook that asks a child to shut down cleanly before it is killed.
pub trait ConsoleSignal: Send + Sync {
    fn interrupt(&self, pid: u32) -> Result<()>;
}

/// Used where the platform has no notion of a console interrupt.
#[derive(Debug, Default)]
pub struct NoopConsoleSignal;

impl ConsoleSignal for NoopConsoleSignal {
    fn interrupt(&self, _pid: u32) -> Result<()> {
        Ok(())
    }
}

#[cfg(unix)]
#[derive(Debug, Default)]
pub struct SigintConsoleSignal;

#[cfg(unix)]
impl ConsoleSignal for SigintConsoleSignal {
    fn interrupt(&self, pid: u32) -> Result<()> {
        let pid = libc::pid_t::try_from(pid)?;
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid, libc::SIGINT) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }
}

pub fn default_console_signal() -> Box<dyn ConsoleSignal> {
    #[cfg(unix)]
    {
        Box::new(SigintConsoleSignal)
    }
    #[cfg(windows)]
    {
        Box::new(windows::AttachConsoleSignal)
    }
    #[cfg(not(any(unix, windows)))]
    {
        Box::new(NoopConsoleSignal)
    }
}
