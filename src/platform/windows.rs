//! Windows Service Control Manager integration.

use std::ffi::{OsStr, OsString};
use std::io;
use std::sync::OnceLock;
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use windows_service::service::{
    Service, ServiceAccess, ServiceControl, ServiceControlAccept, ServiceErrorControl,
    ServiceExitCode, ServiceInfo, ServiceStartType, ServiceState as ScmState, ServiceStatus,
    ServiceType,
};
use windows_service::service_control_handler::{self, ServiceControlHandlerResult};
use windows_service::service_manager::{ServiceManager, ServiceManagerAccess};
use windows_service::{define_windows_service, service_dispatcher};

use super::{ConsoleSignal, Registration, ServiceBackend, ServiceDefinition, ServiceState};
use crate::host::{self, HostEvent};
use crate::settings::{AccountType, ServiceSettings, StartType};
use crate::supervisor::ProcessSupervisor;

const ERROR_SERVICE_DOES_NOT_EXIST: i32 = 1060;
const SERVICE_TYPE: ServiceType = ServiceType::OWN_PROCESS;

#[derive(Debug, Default)]
pub struct ScmBackend;

impl ScmBackend {
    pub fn new() -> Self {
        Self
    }

    fn manager(access: ServiceManagerAccess) -> Result<ServiceManager> {
        ServiceManager::local_computer(None::<&str>, access)
            .context("failed to connect to the service control manager")
    }

    fn open(&self, name: &str, access: ServiceAccess) -> Result<Option<Service>> {
        let manager = Self::manager(ServiceManagerAccess::CONNECT)?;
        match manager.open_service(name, access) {
            Ok(service) => Ok(Some(service)),
            Err(windows_service::Error::Winapi(err))
                if err.raw_os_error() == Some(ERROR_SERVICE_DOES_NOT_EXIST) =>
            {
                Ok(None)
            }
            Err(err) => Err(err).with_context(|| format!("failed to open service {name}")),
        }
    }

    fn require(&self, name: &str, access: ServiceAccess) -> Result<Service> {
        self.open(name, access)?
            .ok_or_else(|| anyhow!("service {name} does not exist"))
    }
}

impl ServiceBackend for ScmBackend {
    fn query(&self, name: &str) -> Result<Option<Registration>> {
        let Some(service) = self.open(name, ServiceAccess::QUERY_CONFIG)? else {
            return Ok(None);
        };
        let config = service
            .query_config()
            .with_context(|| format!("failed to query config of {name}"))?;
        Ok(Some(Registration {
            name: name.to_string(),
            display_name: config.display_name.to_string_lossy().into_owned(),
        }))
    }

    fn status(&self, name: &str) -> Result<ServiceState> {
        let status = self
            .require(name, ServiceAccess::QUERY_STATUS)?
            .query_status()
            .with_context(|| format!("failed to query status of {name}"))?;
        Ok(match status.current_state {
            ScmState::Stopped => ServiceState::Stopped,
            ScmState::StartPending => ServiceState::StartPending,
            ScmState::StopPending => ServiceState::StopPending,
            ScmState::Running => ServiceState::Running,
            _ => ServiceState::Other,
        })
    }

    fn create(&self, definition: &ServiceDefinition) -> Result<()> {
        let manager =
            Self::manager(ServiceManagerAccess::CONNECT | ServiceManagerAccess::CREATE_SERVICE)?;
        let info = ServiceInfo {
            name: OsString::from(&definition.name),
            display_name: OsString::from(&definition.display_name),
            service_type: SERVICE_TYPE,
            start_type: match definition.start_type {
                StartType::Auto => ServiceStartType::AutoStart,
                StartType::Manual => ServiceStartType::OnDemand,
                StartType::Disabled => ServiceStartType::Disabled,
            },
            error_control: ServiceErrorControl::Normal,
            executable_path: definition.command.program.clone(),
            launch_arguments: definition.command.args.clone(),
            dependencies: Vec::new(),
            account_name: account_name(definition.account),
            account_password: None,
        };
        let service = manager
            .create_service(&info, ServiceAccess::CHANGE_CONFIG)
            .with_context(|| format!("failed to create service {}", definition.name))?;
        service
            .set_description(&definition.description)
            .with_context(|| format!("failed to set description of {}", definition.name))?;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.require(name, ServiceAccess::DELETE)?
            .delete()
            .with_context(|| format!("failed to delete service {name}"))
    }

    fn request_start(&self, name: &str) -> Result<()> {
        self.require(name, ServiceAccess::START)?
            .start(&[] as &[&OsStr])
            .with_context(|| format!("failed to start service {name}"))
    }

    fn request_stop(&self, name: &str) -> Result<()> {
        self.require(name, ServiceAccess::STOP)?
            .stop()
            .map(|_| ())
            .with_context(|| format!("failed to stop service {name}"))
    }
}

fn account_name(account: AccountType) -> Option<OsString> {
    match account {
        AccountType::LocalSystem => None,
        AccountType::LocalService => Some(OsString::from("NT AUTHORITY\\LocalService")),
        AccountType::NetworkService => Some(OsString::from("NT AUTHORITY\\NetworkService")),
    }
}

/// Attach to the child's console and raise Ctrl+C in it.
#[derive(Debug, Default)]
pub struct AttachConsoleSignal;

impl ConsoleSignal for AttachConsoleSignal {
    fn interrupt(&self, pid: u32) -> Result<()> {
        use windows_sys::Win32::System::Console::{
            AttachConsole, CTRL_C_EVENT, FreeConsole, GenerateConsoleCtrlEvent,
            SetConsoleCtrlHandler,
        };

        // SAFETY: plain Win32 calls without pointer arguments.
        unsafe {
            FreeConsole();
            if AttachConsole(pid) == 0 {
                return Err(io::Error::last_os_error())
                    .with_context(|| format!("failed to attach to console of {pid}"));
            }
            // Keep the event from terminating this process as well. A service
            // has no console of its own, so the handler stays disabled.
            SetConsoleCtrlHandler(None, 1);
            let sent = GenerateConsoleCtrlEvent(CTRL_C_EVENT, 0);
            let err = io::Error::last_os_error();
            FreeConsole();
            if sent == 0 {
                return Err(err).with_context(|| format!("failed to send Ctrl+C to {pid}"));
            }
        }
        Ok(())
    }
}

static SETTINGS: OnceLock<ServiceSettings> = OnceLock::new();

define_windows_service!(ffi_service_main, service_main);

/// Hand this thread to the SCM dispatcher; returns when the service stopped.
pub fn run_dispatcher(settings: ServiceSettings) -> Result<()> {
    let name = settings.name.clone();
    SETTINGS
        .set(settings)
        .map_err(|_| anyhow!("service dispatcher already running"))?;
    service_dispatcher::start(&name, ffi_service_main)
        .with_context(|| format!("failed to start service dispatcher for {name}"))
}

fn service_main(_arguments: Vec<OsString>) {
    let Some(settings) = SETTINGS.get() else {
        return;
    };
    if let Err(err) = run_service(settings) {
        tracing::error!(service = %settings.name, "service failed: {err:#}");
    }
}

fn run_service(settings: &ServiceSettings) -> Result<()> {
    let (tx, rx) = mpsc::channel();
    let control_tx = tx.clone();
    let status_handle =
        service_control_handler::register(&settings.name, move |control| match control {
            ServiceControl::Stop | ServiceControl::Shutdown => {
                control_tx.send(HostEvent::StopRequested).ok();
                ServiceControlHandlerResult::NoError
            }
            ServiceControl::Interrogate => ServiceControlHandlerResult::NoError,
            _ => ServiceControlHandlerResult::NotImplemented,
        })?;

    let report = |state: ScmState, exit_code: ServiceExitCode, wait_hint: Duration| {
        let controls_accepted = if state == ScmState::Running {
            ServiceControlAccept::STOP | ServiceControlAccept::SHUTDOWN
        } else {
            ServiceControlAccept::empty()
        };
        status_handle.set_service_status(ServiceStatus {
            service_type: SERVICE_TYPE,
            current_state: state,
            controls_accepted,
            exit_code,
            checkpoint: 0,
            wait_hint,
            process_id: None,
        })
    };

    report(ScmState::StartPending, ServiceExitCode::Win32(0), Duration::from_secs(10))?;

    let supervisor = match ProcessSupervisor::new(settings) {
        Ok(supervisor) => supervisor,
        Err(err) => {
            report(ScmState::Stopped, ServiceExitCode::ServiceSpecific(1), Duration::ZERO)?;
            return Err(err);
        }
    };

    report(ScmState::Running, ServiceExitCode::Win32(0), Duration::ZERO)?;
    let stop_hint = supervisor.stop_timeout() + Duration::from_secs(1);
    let reason = host::run_loop(&supervisor, tx, rx, || {
        if let Err(err) = report(ScmState::StopPending, ServiceExitCode::Win32(0), stop_hint) {
            tracing::warn!(service = %settings.name, "failed to report stop pending: {err}");
        }
    });

    let exit_code = if reason.is_failure() {
        ServiceExitCode::ServiceSpecific(reason.exit_code())
    } else {
        ServiceExitCode::Win32(0)
    };
    tracing::info!(service = %settings.name, "service stopped: {reason}");
    report(ScmState::Stopped, exit_code, Duration::ZERO)?;
    Ok(())
}
