use std::time::Duration;

use anyhow::{Context, Result};
use svcwrap::{AccountType, ShutdownToken, init_tracing, run_as_service};

const HEARTBEAT: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    run_as_service(args, heartbeat, |options| {
        options.display_name = "svcwrap heartbeat".to_string();
        options.description = "Prints a heartbeat until stopped".to_string();
        options.account = AccountType::LocalService;
    })
}

/// Sample workload: tick until shutdown is requested.
fn heartbeat(args: Vec<String>, token: ShutdownToken) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT);
        let mut beats: u64 = 0;
        tracing::info!(?args, "heartbeat worker running");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    beats += 1;
                    println!("heartbeat {beats}");
                }
                _ = token.cancelled() => break,
            }
        }
        tracing::info!(beats, "heartbeat worker stopped");
    });
    Ok(())
}
