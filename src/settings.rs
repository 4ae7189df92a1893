//! Service configuration.
//!
//! [`ServiceOptions`] is what the embedding application edits through its
//! configuration callback. Once the callback returns the options are frozen
//! into a [`ServiceSettings`] snapshot that every other component borrows.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Optional overlay file looked up next to the executable.
pub const OPTIONS_FILE: &str = "service.toml";

const DEFAULT_DESCRIPTION: &str = "Supervised service host";
const DEFAULT_LOG_FILE: &str = "service.log";
/// Set by systemd for units with `LogsDirectory=`.
const LOGS_DIRECTORY_ENV: &str = "LOGS_DIRECTORY";

/// Identity the registered service runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccountType {
    LocalSystem,
    LocalService,
    #[default]
    NetworkService,
}

/// Whether the service manager starts the service at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StartType {
    #[default]
    Auto,
    Manual,
    Disabled,
}

/// Options recognized by the configuration callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceOptions {
    /// Unique name of the service registration.
    pub service_name: String,
    pub display_name: String,
    pub description: String,
    pub account: AccountType,
    pub start_type: StartType,
    /// Capture the child's output into the log file.
    pub write_log: bool,
    /// Overrides the default `<exe dir>/service.log`.
    pub log_path: Option<PathBuf>,
    /// Application module passed to a runtime launcher (`node app.js`,
    /// `dotnet app.dll`). Ignored for native executables.
    pub entry_module: Option<PathBuf>,
}

/// Partial options read from [`OPTIONS_FILE`].
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct OptionsFile {
    #[serde(default)]
    service_name: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    account: Option<AccountType>,
    #[serde(default)]
    start_type: Option<StartType>,
    #[serde(default)]
    write_log: Option<bool>,
    #[serde(default)]
    log_path: Option<String>,
    #[serde(default)]
    entry_module: Option<String>,
}

impl ServiceOptions {
    /// Defaults derived from the executable: the file stem names the service.
    pub fn defaults_for(exe: &Path) -> Self {
        let service_name = exe
            .file_stem()
            .and_then(|stem| stem.to_str())
            .filter(|stem| !stem.is_empty())
            .unwrap_or("svcwrap")
            .to_string();

        Self {
            display_name: service_name.clone(),
            service_name,
            description: DEFAULT_DESCRIPTION.to_string(),
            account: AccountType::default(),
            start_type: StartType::default(),
            write_log: true,
            log_path: None,
            entry_module: None,
        }
    }

    /// Apply every key present in a `service.toml` file.
    ///
    /// A display name left unset in the file follows a renamed service.
    pub fn merge_file(&mut self, path: &Path) -> Result<()> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let file: OptionsFile = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;

        if let Some(name) = file.service_name {
            if file.display_name.is_none() && self.display_name == self.service_name {
                self.display_name = name.clone();
            }
            self.service_name = name;
        }
        if let Some(display_name) = file.display_name {
            self.display_name = display_name;
        }
        if let Some(description) = file.description {
            self.description = description;
        }
        if let Some(account) = file.account {
            self.account = account;
        }
        if let Some(start_type) = file.start_type {
            self.start_type = start_type;
        }
        if let Some(write_log) = file.write_log {
            self.write_log = write_log;
        }
        if let Some(log_path) = file.log_path {
            self.log_path = Some(expand_path(&log_path));
        }
        if let Some(entry_module) = file.entry_module {
            self.entry_module = Some(expand_path(&entry_module));
        }

        tracing::debug!(path = %path.display(), "applied service options file");
        Ok(())
    }

    /// Freeze the options into the snapshot used for this invocation.
    pub fn freeze(self, args: Vec<String>, exe_path: PathBuf) -> ServiceSettings {
        let base_dir = exe_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let log_path = match self.log_path {
            Some(path) if path.is_relative() => base_dir.join(path),
            Some(path) => path,
            None => base_dir.join(DEFAULT_LOG_FILE),
        };
        let entry_module = self.entry_module.map(|module| {
            if module.is_relative() {
                base_dir.join(module)
            } else {
                module
            }
        });

        ServiceSettings {
            name: self.service_name,
            display_name: self.display_name,
            description: self.description,
            account: self.account,
            start_type: self.start_type,
            write_log: self.write_log,
            log_path,
            entry_module,
            args,
            exe_path,
            base_dir,
        }
    }
}

/// Configuration snapshot for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSettings {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub account: AccountType,
    pub start_type: StartType,
    pub write_log: bool,
    pub log_path: PathBuf,
    pub entry_module: Option<PathBuf>,
    /// Arguments left after the command token; replayed to the child.
    pub args: Vec<String>,
    /// The executable this process was started from.
    pub exe_path: PathBuf,
    /// Directory of `exe_path`; the child's working directory.
    pub base_dir: PathBuf,
}

impl ServiceSettings {
    /// Defaults, then `service.toml` beside the executable, then `configure`.
    pub fn build<C>(args: Vec<String>, configure: C) -> Result<Self>
    where
        C: FnOnce(&mut ServiceOptions),
    {
        let exe_path = std::env::current_exe().context("failed to resolve current executable")?;
        let logs_dir = std::env::var_os(LOGS_DIRECTORY_ENV).and_then(|dirs| first_logs_dir(&dirs));
        Self::build_for(exe_path, logs_dir, args, configure)
    }

    /// [`Self::build`] for a known executable.
    ///
    /// `logs_dir` is the directory systemd created for the unit; it replaces
    /// the executable's directory as home of the default log file.
    pub fn build_for<C>(
        exe_path: PathBuf,
        logs_dir: Option<PathBuf>,
        args: Vec<String>,
        configure: C,
    ) -> Result<Self>
    where
        C: FnOnce(&mut ServiceOptions),
    {
        let mut options = ServiceOptions::defaults_for(&exe_path);

        if let Some(dir) = exe_path.parent() {
            let overlay = dir.join(OPTIONS_FILE);
            if overlay.exists() {
                options.merge_file(&overlay)?;
            }
        }
        if options.log_path.is_none() {
            options.log_path = logs_dir.map(|dir| dir.join(DEFAULT_LOG_FILE));
        }

        configure(&mut options);
        Ok(options.freeze(args, exe_path))
    }

    /// `name(display name)` as used in console messages.
    pub fn label(&self) -> String {
        format!("{}({})", self.name, self.display_name)
    }
}

/// `LOGS_DIRECTORY` is colon separated when a unit lists several.
fn first_logs_dir(dirs: &std::ffi::OsStr) -> Option<PathBuf> {
    dirs.to_str()?
        .split(':')
        .find(|dir| !dir.is_empty())
        .map(PathBuf::from)
}

fn expand_path(raw: &str) -> PathBuf {
    let tilde_expanded = shellexpand::tilde(raw).into_owned();
    match shellexpand::env(&tilde_expanded) {
        Ok(val) => PathBuf::from(val.into_owned()),
        Err(_) => PathBuf::from(tilde_expanded),
    }
}
