//! Dispatch of the process argument vector.
//!
//! The first argument selects a management command or the supervised entry
//! point; anything else runs the application in the foreground.

use anyhow::{Result, bail};

use crate::cli::{self, Command};
use crate::control::{Outcome, ServiceController};
use crate::host;
use crate::platform::{self, ServiceBackend};
use crate::registrar;
use crate::settings::{ServiceOptions, ServiceSettings};
use crate::shutdown::{DEFAULT_SHUTDOWN_MESSAGE, ShutdownCoordinator, ShutdownToken};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// No command token; the full argument vector goes to the application.
    Foreground(Vec<String>),
    /// A management command and the arguments after it.
    Manage(Command, Vec<String>),
    /// Launched by the service manager.
    SupervisedRun(Vec<String>),
}

pub fn parse(args: Vec<String>) -> Invocation {
    let Some(command) = args.first().and_then(|first| Command::from_token(first)) else {
        return Invocation::Foreground(args);
    };
    let rest = args[1..].to_vec();
    match command {
        Command::SupervisedRun => Invocation::SupervisedRun(rest),
        command => Invocation::Manage(command, rest),
    }
}

/// Entry point for host applications.
///
/// `entry` runs the application in the foreground and must return once the
/// token is cancelled. `configure` adjusts the service options before they
/// are frozen.
pub fn run_as_service<E, C>(args: Vec<String>, entry: E, configure: C) -> Result<()>
where
    E: FnOnce(Vec<String>, ShutdownToken) -> Result<()>,
    C: FnOnce(&mut ServiceOptions),
{
    match parse(args) {
        Invocation::Foreground(args) => run_foreground(args, entry),
        Invocation::SupervisedRun(rest) => {
            let settings = ServiceSettings::build(rest, configure)?;
            host::run_supervised(settings)
        }
        Invocation::Manage(command, rest) => {
            let settings = ServiceSettings::build(rest, configure)?;
            let result = platform::default_backend()
                .and_then(|backend| manage(command, &settings, backend.as_ref()));
            report(command, &settings, result);
            Ok(())
        }
    }
}

/// Run `entry` until it returns, cancelling its token on Ctrl+C.
pub fn run_foreground<E>(args: Vec<String>, entry: E) -> Result<()>
where
    E: FnOnce(Vec<String>, ShutdownToken) -> Result<()>,
{
    cli::print_help();

    let coordinator = ShutdownCoordinator::new(Some(DEFAULT_SHUTDOWN_MESSAGE.to_string()));
    coordinator.install();
    println!("Application started. Press Ctrl+C to shut down.");

    let result = entry(args, coordinator.token());
    coordinator.complete();
    result
}

/// Carry out one management command against `backend`.
pub fn manage(
    command: Command,
    settings: &ServiceSettings,
    backend: &dyn ServiceBackend,
) -> Result<Vec<Outcome>> {
    let controller = ServiceController::new(backend);
    match command {
        Command::Install => return Ok(vec![registrar::install(settings, &controller)?]),
        Command::SupervisedRun => bail!("{} is not a management command", command.token()),
        _ => {}
    }

    let Some(registration) = controller.lookup(&settings.name)? else {
        return Ok(vec![Outcome::NotInstalled {
            label: settings.label(),
        }]);
    };

    match command {
        Command::Start => Ok(vec![controller.start(&registration)?]),
        Command::Stop => Ok(vec![controller.stop(&registration)?]),
        Command::Reset => controller.reset(&registration),
        Command::Uninstall => registrar::uninstall(&registration, &controller),
        Command::Install | Command::SupervisedRun => unreachable!("handled above"),
    }
}

fn report(command: Command, settings: &ServiceSettings, result: Result<Vec<Outcome>>) {
    match result {
        Ok(outcomes) => {
            for outcome in outcomes {
                println!("{outcome}");
            }
        }
        Err(err) => {
            tracing::error!(service = %settings.name, command = command.token(), "{err:#}");
            println!("Service {} {} failed: {err:#}", settings.name, command.token());
        }
    }
}
