/**
 * # Shopfloor - Saga-Coordinated E-Commerce Services
 *
 * One binary hosts four services: the id service (ordered key minting),
 * stock, payment, and order (checkout orchestration + recovery). Which of
 * them run is selected on the command line.
 *
 * ## Usage
 *
 * ```bash
 * # Run everything in one process (the process is also the gateway)
 * shopfloor
 *
 * # Run a single service
 * shopfloor --service stock
 *
 * # Override data directory and base port
 * shopfloor --data-dir /var/lib/shopfloor --port 9000
 *
 * # Run for a specific duration (for testing)
 * shopfloor --duration 10
 * ```
 *
 * ## Lifecycle Behavior
 *
 * On boot each hosted service opens its store and, once the listener is
 * bound, runs a recovery sweep over its write-ahead log so requests cut
 * short by a crash are rolled back before new traffic lands on the old
 * state. The process runs until Ctrl+C or the optional --duration bound.
 */

use std::error::Error;
use clap::Parser;

use shopfloor::config::load_config;
use shopfloor::logging::init_logging;
use shopfloor::server::{run_server_with_duration, ServiceSelection};

// CLI arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Which service(s) to host in this process
    #[arg(long, value_enum, default_value = "all")]
    service: ServiceSelection,

    /// Path to configuration file
    #[arg(long)]
    config: Option<String>,

    /// Override data directory path (defaults to config value)
    #[arg(long)]
    data_dir: Option<String>,

    /// Override base listener port (defaults to config value)
    #[arg(long)]
    port: Option<u16>,

    /// Run for a specific duration in seconds (for testing)
    #[arg(long)]
    duration: Option<u64>,
}

fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    // Create Tokio runtime explicitly for proper shutdown control
    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| Box::<dyn Error + Send + Sync>::from(format!("Failed to create runtime: {e}")))?;

    // Run async main logic
    let result = runtime.block_on(async_main());

    // Force runtime shutdown with timeout
    runtime.shutdown_timeout(std::time::Duration::from_secs(2));

    result
}

async fn async_main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let args = Args::parse();

    init_logging();

    let mut config = load_config(args.config.as_deref());
    if let Some(data_dir) = args.data_dir {
        config.storage.data_dir = data_dir;
    }
    if let Some(port) = args.port {
        config.backend.port = port;
    }

    run_server_with_duration(config, args.service, args.duration).await
}
