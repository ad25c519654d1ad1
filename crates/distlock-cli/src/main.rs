//! Entry point for the `distlock` binary.

use clap::Parser;
use tracing::{info, warn};

use distlock_cli::{Cli, Command, Configuration, init_logging, run_contend};
use distlock_store::MemoryStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let configuration = Configuration::new(&cli)?;
    let _logging_guard = init_logging(&configuration.logging_config())?;

    distlock_core::metrics::describe_metrics();

    let lock_config = configuration.lock_config()?;
    let store = MemoryStore::with_config(configuration.store_config()?);

    match cli.command {
        Command::Contend(_) => {
            let settings = configuration.demo_settings();
            tokio::select! {
                report = run_contend(store, &lock_config, &settings) => {
                    let report = report?;
                    report.print(&settings.resource);
                    if !report.is_consistent() {
                        anyhow::bail!("mutual exclusion violated on '{}'", settings.resource);
                    }
                    info!("Contention demo finished");
                }
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted, abandoning demo");
                }
            }
        }
    }

    Ok(())
}
