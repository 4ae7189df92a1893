//! Creating and deleting the service registration.

use anyhow::{Context, Result};

use crate::control::{Outcome, ServiceController};
use crate::launch::LaunchSpec;
use crate::platform::{Registration, ServiceDefinition};
use crate::settings::{ServiceSettings, StartType};

/// Register this application; a no-op when the name is already taken.
pub fn install(settings: &ServiceSettings, controller: &ServiceController<'_>) -> Result<Outcome> {
    if controller.lookup(&settings.name)?.is_some() {
        return Ok(Outcome::AlreadyInstalled {
            label: settings.label(),
        });
    }

    let definition = ServiceDefinition {
        name: settings.name.clone(),
        display_name: settings.display_name.clone(),
        description: settings.description.clone(),
        command: LaunchSpec::service_command(settings)?,
        account: settings.account,
        start_type: settings.start_type,
        log_path: settings.write_log.then(|| settings.log_path.clone()),
    };
    tracing::info!(
        service = %definition.name,
        command = %definition.command.command_line(),
        "creating service registration"
    );

    let backend = controller.backend();
    backend
        .create(&definition)
        .with_context(|| format!("failed to create service {}", definition.name))?;

    let started = settings.start_type == StartType::Auto;
    if started {
        backend
            .request_start(&definition.name)
            .with_context(|| format!("service {} was created but failed to start", definition.name))?;
    }

    Ok(Outcome::Installed {
        name: settings.name.clone(),
        description: settings.description.clone(),
        started,
    })
}

/// Stop the service unless it already is, then delete the registration.
pub fn uninstall(
    registration: &Registration,
    controller: &ServiceController<'_>,
) -> Result<Vec<Outcome>> {
    let mut outcomes = Vec::new();
    if !controller.status(registration)?.is_stopped_or_pending() {
        outcomes.push(controller.stop(registration)?);
    }

    controller
        .backend()
        .delete(&registration.name)
        .with_context(|| format!("failed to delete service {}", registration.name))?;
    outcomes.push(Outcome::Uninstalled {
        label: registration.label(),
    });
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::platform::ServiceState;
    use crate::platform::fake::FakeBackend;
    use crate::settings::{AccountType, ServiceOptions};

    fn settings(start_type: StartType) -> ServiceSettings {
        let mut opts = ServiceOptions::defaults_for(Path::new("/opt/app/server"));
        opts.service_name = "api".to_string();
        opts.display_name = "Public API".to_string();
        opts.description = "Serves the public API".to_string();
        opts.account = AccountType::LocalService;
        opts.start_type = start_type;
        opts.freeze(vec!["--port".to_string(), "80".to_string()], "/opt/app/server".into())
    }

    #[test]
    fn install_registers_supervised_command() {
        let backend = FakeBackend::new();
        let controller = ServiceController::new(&backend);

        let outcome = install(&settings(StartType::Auto), &controller).unwrap();
        assert_eq!(
            outcome.to_string(),
            "Successfully registered and started service \"api\" (\"Serves the public API\")"
        );

        let def = backend.definition("api").unwrap();
        assert_eq!(def.display_name, "Public API");
        assert_eq!(def.account, AccountType::LocalService);
        assert_eq!(def.command.command_line(), "/opt/app/server supervised-run --port 80");
        assert_eq!(def.log_path, Some("/opt/app/service.log".into()));
        assert_eq!(backend.mutations(), vec!["create api", "start api"]);
        assert_eq!(backend.state_of("api"), Some(ServiceState::Running));
    }

    #[test]
    fn manual_install_does_not_start() {
        let backend = FakeBackend::new();
        let controller = ServiceController::new(&backend);

        let outcome = install(&settings(StartType::Manual), &controller).unwrap();
        assert!(matches!(outcome, Outcome::Installed { started: false, .. }));
        assert_eq!(backend.mutations(), vec!["create api"]);
    }

    #[test]
    fn log_path_is_omitted_without_write_log() {
        let backend = FakeBackend::new();
        let controller = ServiceController::new(&backend);
        let mut settings = settings(StartType::Manual);
        settings.write_log = false;

        install(&settings, &controller).unwrap();
        assert_eq!(backend.definition("api").unwrap().log_path, None);
    }

    #[test]
    fn install_twice_is_idempotent() {
        let backend = FakeBackend::new();
        let controller = ServiceController::new(&backend);
        let settings = settings(StartType::Auto);

        install(&settings, &controller).unwrap();
        let second = install(&settings, &controller).unwrap();

        assert_eq!(second.to_string(), "Service api(Public API) was already installed.");
        assert_eq!(backend.registered(), vec!["api"]);
        assert_eq!(
            backend.mutations().iter().filter(|c| c.starts_with("create")).count(),
            1
        );
    }

    #[test]
    fn create_failure_is_an_error() {
        let backend = FakeBackend::failing_create();
        let controller = ServiceController::new(&backend);

        let err = install(&settings(StartType::Auto), &controller).unwrap_err();
        assert!(format!("{err:#}").contains("access denied"));
        assert!(backend.registered().is_empty());
    }

    #[test]
    fn uninstall_stops_running_service_first() {
        let backend = FakeBackend::new();
        let controller = ServiceController::new(&backend);
        install(&settings(StartType::Auto), &controller).unwrap();
        let reg = controller.lookup("api").unwrap().unwrap();

        let outcomes = uninstall(&reg, &controller).unwrap();
        assert!(matches!(outcomes[0], Outcome::Stopped { .. }));
        assert_eq!(outcomes[1].to_string(), "Successfully uninstalled service Public API(api)");

        let mutations = backend.mutations();
        let stop = mutations.iter().position(|c| c == "stop api").unwrap();
        let delete = mutations.iter().position(|c| c == "delete api").unwrap();
        assert!(stop < delete);
        assert!(backend.registered().is_empty());
    }

    #[test]
    fn uninstall_stopped_service_skips_stop() {
        let backend = FakeBackend::new();
        let controller = ServiceController::new(&backend);
        install(&settings(StartType::Manual), &controller).unwrap();
        let reg = controller.lookup("api").unwrap().unwrap();

        let outcomes = uninstall(&reg, &controller).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(backend.mutations(), vec!["create api", "delete api"]);
    }
}
