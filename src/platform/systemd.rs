//! systemd integration through `systemctl` and unit files.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};

use super::{Registration, ServiceBackend, ServiceDefinition, ServiceState};
use crate::settings::{AccountType, StartType};

const UNIT_DIR: &str = "/etc/systemd/system";

/// Runs `systemctl` with the given arguments and returns its stdout.
pub trait Systemctl: Send + Sync {
    fn run(&self, args: &[&str]) -> Result<String>;
}

#[derive(Debug, Clone)]
struct SystemctlCommand {
    program: PathBuf,
}

impl Systemctl for SystemctlCommand {
    fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .with_context(|| format!("failed to run systemctl {}", args.join(" ")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("systemctl {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

pub struct SystemdBackend {
    systemctl: Box<dyn Systemctl>,
    unit_dir: PathBuf,
}

impl SystemdBackend {
    pub fn new() -> Result<Self> {
        let program = which::which("systemctl")
            .context("systemctl not found; is this host running systemd?")?;
        Ok(Self::with_systemctl(
            Box::new(SystemctlCommand { program }),
            UNIT_DIR,
        ))
    }

    pub fn with_systemctl(systemctl: Box<dyn Systemctl>, unit_dir: impl Into<PathBuf>) -> Self {
        Self {
            systemctl,
            unit_dir: unit_dir.into(),
        }
    }

    fn unit_path(&self, name: &str) -> PathBuf {
        self.unit_dir.join(unit_name(name))
    }

    fn systemctl(&self, args: &[&str]) -> Result<String> {
        self.systemctl.run(args)
    }

    fn show(&self, name: &str) -> Result<HashMap<String, String>> {
        let unit = unit_name(name);
        let out = self.systemctl(&[
            "show",
            &unit,
            "--property=LoadState",
            "--property=ActiveState",
            "--property=Description",
        ])?;
        Ok(parse_properties(&out))
    }

    /// Reload units and apply the start type to a freshly written unit.
    fn activate(&self, definition: &ServiceDefinition) -> Result<()> {
        self.systemctl(&["daemon-reload"])?;
        let unit = unit_name(&definition.name);
        match definition.start_type {
            StartType::Auto => {
                self.systemctl(&["enable", &unit])?;
            }
            // Disabled units keep no install symlinks; `mask` cannot be used
            // because the unit file itself lives in the unit directory.
            StartType::Manual | StartType::Disabled => {
                self.systemctl(&["disable", &unit])?;
            }
        }
        Ok(())
    }
}

impl ServiceBackend for SystemdBackend {
    fn query(&self, name: &str) -> Result<Option<Registration>> {
        let props = self.show(name)?;
        match props.get("LoadState").map(String::as_str) {
            None | Some("not-found") => Ok(None),
            Some(_) => Ok(Some(Registration {
                name: name.to_string(),
                display_name: props
                    .get("Description")
                    .filter(|d| !d.is_empty())
                    .cloned()
                    .unwrap_or_else(|| name.to_string()),
            })),
        }
    }

    fn status(&self, name: &str) -> Result<ServiceState> {
        let props = self.show(name)?;
        Ok(props
            .get("ActiveState")
            .map(|s| map_active_state(s))
            .unwrap_or(ServiceState::Other))
    }

    fn create(&self, definition: &ServiceDefinition) -> Result<()> {
        let path = self.unit_path(&definition.name);
        fs::write(&path, render_unit(definition))
            .with_context(|| format!("failed to write {}", path.display()))?;

        if let Err(err) = self.activate(definition) {
            if let Err(cleanup) = fs::remove_file(&path) {
                tracing::warn!(unit = %path.display(), "failed to roll back unit: {cleanup}");
            }
            self.systemctl(&["daemon-reload"]).ok();
            return Err(err);
        }
        tracing::debug!(unit = %path.display(), "wrote systemd unit");
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        let unit = unit_name(name);
        if let Err(err) = self.systemctl(&["disable", &unit]) {
            tracing::debug!("disable before delete: {err:#}");
        }

        let path = self.unit_path(name);
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("failed to remove {}", path.display()))?;
        }
        self.systemctl(&["daemon-reload"])?;
        Ok(())
    }

    fn request_start(&self, name: &str) -> Result<()> {
        self.systemctl(&["start", "--no-block", &unit_name(name)])?;
        Ok(())
    }

    fn request_stop(&self, name: &str) -> Result<()> {
        self.systemctl(&["stop", "--no-block", &unit_name(name)])?;
        Ok(())
    }
}

fn unit_name(name: &str) -> String {
    if name.ends_with(".service") {
        name.to_string()
    } else {
        format!("{name}.service")
    }
}

fn unit_stem(name: &str) -> &str {
    name.strip_suffix(".service").unwrap_or(name)
}

fn parse_properties(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn map_active_state(state: &str) -> ServiceState {
    match state {
        "active" => ServiceState::Running,
        "activating" | "reloading" => ServiceState::StartPending,
        "deactivating" => ServiceState::StopPending,
        "inactive" | "failed" => ServiceState::Stopped,
        _ => ServiceState::Other,
    }
}

fn render_unit(definition: &ServiceDefinition) -> String {
    let command = &definition.command;
    let working_dir = command
        .working_dir
        .as_deref()
        .or_else(|| command.program.parent())
        .unwrap_or(Path::new("/"));

    let (after, identity) = match definition.account {
        AccountType::LocalSystem => ("network.target", String::new()),
        AccountType::LocalService => ("network.target", "DynamicUser=yes\n".to_string()),
        AccountType::NetworkService => (
            "network-online.target",
            "DynamicUser=yes\n".to_string(),
        ),
    };
    // DynamicUser implies ProtectSystem=strict. The supervised run logs into
    // the LogsDirectory systemd hands it unless a path was configured, which
    // then has to be opened up explicitly.
    let mut writable = String::new();
    if !identity.is_empty() {
        writable.push_str(&format!("LogsDirectory={}\n", unit_stem(&definition.name)));
        if let Some(dir) = definition.log_path.as_deref().and_then(Path::parent) {
            writable.push_str(&format!("ReadWritePaths=-{}\n", dir.display()));
        }
    }
    let wants = if after == "network-online.target" {
        "Wants=network-online.target\n"
    } else {
        ""
    };

    format!(
        r#"# {description}
[Unit]
Description={display_name}
After={after}
{wants}
[Service]
Type=simple
WorkingDirectory={working_dir}
ExecStart={exec_start}
KillSignal=SIGTERM
TimeoutStopSec=30
{identity}{writable}
[Install]
WantedBy=multi-user.target
"#,
        description = definition.description.replace('\n', " "),
        display_name = definition.display_name,
        working_dir = working_dir.display(),
        exec_start = command.command_line(),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::launch::LaunchSpec;
    use crate::settings::ServiceOptions;

    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
        fail_on: Option<&'static str>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Systemctl for Recorder {
        fn run(&self, args: &[&str]) -> Result<String> {
            let call = args.join(" ");
            self.calls.lock().unwrap().push(call.clone());
            if self.fail_on.is_some_and(|verb| args.first() == Some(&verb)) {
                bail!("systemctl {call} failed");
            }
            Ok(String::new())
        }
    }

    fn backend(recorder: &Recorder, dir: &Path) -> SystemdBackend {
        SystemdBackend::with_systemctl(Box::new(recorder.clone()), dir)
    }

    fn definition(account: AccountType) -> ServiceDefinition {
        ServiceDefinition {
            name: "billing".to_string(),
            display_name: "Billing worker".to_string(),
            description: "Processes invoices".to_string(),
            command: LaunchSpec::new("/opt/billing/billing")
                .arg("supervised-run")
                .arg("--queue")
                .arg("main queue")
                .current_dir("/opt/billing"),
            account,
            start_type: StartType::Auto,
            log_path: Some(PathBuf::from("/var/lib/billing/service.log")),
        }
    }

    #[test]
    fn unit_runs_supervised_command() {
        let unit = render_unit(&definition(AccountType::LocalSystem));
        assert!(unit.contains("Description=Billing worker"));
        assert!(unit.contains("# Processes invoices"));
        assert!(unit.contains("WorkingDirectory=/opt/billing"));
        assert!(unit.contains("ExecStart=/opt/billing/billing supervised-run --queue 'main queue'"));
        assert!(!unit.contains("DynamicUser"));
    }

    #[test]
    fn accounts_map_to_identity() {
        let local = render_unit(&definition(AccountType::LocalService));
        assert!(local.contains("DynamicUser=yes"));
        assert!(local.contains("After=network.target"));

        let network = render_unit(&definition(AccountType::NetworkService));
        assert!(network.contains("DynamicUser=yes"));
        assert!(network.contains("After=network-online.target"));
        assert!(network.contains("Wants=network-online.target"));
    }

    #[test]
    fn parses_show_output() {
        let props = parse_properties("LoadState=loaded\nActiveState=activating\nDescription=Billing worker\n");
        assert_eq!(props["LoadState"], "loaded");
        assert_eq!(map_active_state(&props["ActiveState"]), ServiceState::StartPending);
        assert_eq!(map_active_state("failed"), ServiceState::Stopped);
        assert_eq!(map_active_state("deactivating"), ServiceState::StopPending);
    }

    #[test]
    fn unit_name_is_suffixed_once() {
        assert_eq!(unit_name("billing"), "billing.service");
        assert_eq!(unit_name("billing.service"), "billing.service");
    }

    #[test]
    fn default_install_can_write_its_log() {
        let mut opts = ServiceOptions::defaults_for(Path::new("/opt/app/server"));
        opts.start_type = StartType::Auto;
        let settings = opts.freeze(Vec::new(), "/opt/app/server".into());
        let definition = ServiceDefinition {
            name: settings.name.clone(),
            display_name: settings.display_name.clone(),
            description: settings.description.clone(),
            command: LaunchSpec::service_command(&settings).unwrap(),
            account: settings.account,
            start_type: settings.start_type,
            log_path: Some(settings.log_path.clone()),
        };

        let unit = render_unit(&definition);
        assert!(unit.contains("DynamicUser=yes"));
        assert!(unit.contains("LogsDirectory=server\n"), "{unit}");
        assert!(unit.contains("ReadWritePaths=-/opt/app\n"), "{unit}");
    }

    #[test]
    fn root_units_need_no_extra_write_access() {
        let unit = render_unit(&definition(AccountType::LocalSystem));
        assert!(!unit.contains("LogsDirectory"));
        assert!(!unit.contains("ReadWritePaths"));
    }

    #[test]
    fn create_applies_start_type() {
        let cases = [
            (StartType::Auto, "enable billing.service"),
            (StartType::Manual, "disable billing.service"),
            (StartType::Disabled, "disable billing.service"),
        ];
        for (start_type, expected) in cases {
            let dir = tempfile::tempdir().unwrap();
            let recorder = Recorder::default();
            let mut def = definition(AccountType::LocalSystem);
            def.start_type = start_type;

            backend(&recorder, dir.path()).create(&def).unwrap();

            assert_eq!(recorder.calls(), vec!["daemon-reload", expected]);
            assert!(dir.path().join("billing.service").exists());
            assert!(!recorder.calls().iter().any(|c| c.starts_with("mask")));
        }
    }

    #[test]
    fn failed_create_removes_unit_file() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder {
            fail_on: Some("enable"),
            ..Recorder::default()
        };

        let err = backend(&recorder, dir.path())
            .create(&definition(AccountType::LocalService))
            .unwrap_err();
        assert!(err.to_string().contains("enable billing.service"));
        assert!(!dir.path().join("billing.service").exists());
        assert_eq!(
            recorder.calls(),
            vec!["daemon-reload", "enable billing.service", "daemon-reload"]
        );
    }

    #[test]
    fn delete_disables_and_removes_unit() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::default();
        let backend = backend(&recorder, dir.path());
        backend.create(&definition(AccountType::LocalSystem)).unwrap();

        backend.delete("billing").unwrap();
        assert!(!dir.path().join("billing.service").exists());
        assert_eq!(
            recorder.calls()[2..],
            ["disable billing.service", "daemon-reload"]
        );
    }
}
