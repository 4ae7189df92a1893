//! Command lines for relaunching this application.
//!
//! Two are needed: the one the service manager runs (`<exe> supervised-run
//! <args>`) and the one the supervisor spawns as its child (`<exe> <args>`).
//! When the executable is a runtime launcher rather than a native binary the
//! application's entry module is inserted right after it.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};

use crate::cli::Command;
use crate::settings::ServiceSettings;

/// Interpreters and VMs that need an entry module to run an application.
const RUNTIME_LAUNCHERS: &[&str] = &[
    "bun", "deno", "dotnet", "java", "javaw", "node", "python", "python3", "pythonw",
];

/// A program plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// The child the supervisor runs: this application in foreground mode.
    pub fn relaunch(settings: &ServiceSettings) -> Result<Self> {
        Ok(application(settings)?
            .args(settings.args.iter())
            .current_dir(&settings.base_dir))
    }

    /// The command line registered with the service manager.
    pub fn service_command(settings: &ServiceSettings) -> Result<Self> {
        Ok(application(settings)?
            .arg(Command::SupervisedRun.token())
            .args(settings.args.iter())
            .current_dir(&settings.base_dir))
    }

    /// Single string form, quoted for a shell-like parser.
    pub fn command_line(&self) -> String {
        let mut words = Vec::with_capacity(self.args.len() + 1);
        words.push(self.program.to_string_lossy().into_owned());
        words.extend(self.args.iter().map(|a| a.to_string_lossy().into_owned()));
        shell_words::join(words)
    }
}

/// Executable plus, for runtime launchers, the entry module.
fn application(settings: &ServiceSettings) -> Result<LaunchSpec> {
    let spec = LaunchSpec::new(&settings.exe_path);
    if !is_runtime_launcher(&settings.exe_path) {
        return Ok(spec);
    }
    let Some(module) = settings.entry_module.as_ref() else {
        bail!(
            "{} is a runtime launcher; set entry_module so the application can be relaunched",
            settings.exe_path.display()
        );
    };
    Ok(spec.arg(module))
}

pub fn is_runtime_launcher(exe: &Path) -> bool {
    exe.file_stem()
        .and_then(|stem| stem.to_str())
        .map(|stem| {
            let stem = stem.to_ascii_lowercase();
            RUNTIME_LAUNCHERS.contains(&stem.as_str())
        })
        .unwrap_or(false)
}
