pub mod cli;
pub mod control;
pub mod host;
pub mod launch;
pub mod log_sink;
pub mod platform;
pub mod registrar;
pub mod router;
pub mod settings;
pub mod shutdown;
pub mod supervisor;

pub use router::run_as_service;
pub use settings::{AccountType, ServiceOptions, ServiceSettings, StartType};
pub use shutdown::ShutdownToken;

/// Initialize tracing with a default filter if `RUST_LOG` is unset.
pub fn init_tracing() {
    let default_filter = "svcwrap=info";
    let filter_layer = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string());

    tracing_subscriber::fmt()
        .with_env_filter(filter_layer)
        .with_target(false)
        .compact()
        .init();
}
