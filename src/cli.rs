use clap::ValueEnum;

/// Service management commands recognized as the first argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Command {
    /// Start the service.
    Start,
    /// Stop the service.
    Stop,
    /// Register the service with the service manager.
    Install,
    /// Stop and remove the service registration.
    Uninstall,
    /// Stop, then start the service.
    Reset,
    /// Entry point used by the service manager; supervises the application.
    #[value(alias = "run")]
    SupervisedRun,
}

impl Command {
    /// Case-insensitive match against names and aliases.
    pub fn from_token(token: &str) -> Option<Self> {
        <Self as ValueEnum>::from_str(token.trim(), true).ok()
    }

    pub fn token(self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Install => "install",
            Command::Uninstall => "uninstall",
            Command::Reset => "reset",
            Command::SupervisedRun => "supervised-run",
        }
    }

    pub fn is_management(self) -> bool {
        !matches!(self, Command::SupervisedRun)
    }
}

/// Banner printed before running in the foreground.
pub fn help_text() -> String {
    let mut out = String::new();
    out.push('\n');
    out.push_str("Optional parameters\n");
    for command in Command::value_variants()
        .iter()
        .filter(|c| c.is_management())
    {
        let Some(value) = command.to_possible_value() else {
            continue;
        };
        let help = value.get_help().map(|h| h.to_string()).unwrap_or_default();
        out.push_str(&format!("     {:<18}{}\n", value.get_name(), help));
    }
    out.push('\n');
    out
}

pub fn print_help() {
    println!("{}", help_text());
}
