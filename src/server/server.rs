//! Server Configuration and Setup
//!
//! This module handles server-specific concerns like HTTP listener setup,
//! port binding, and axum server creation. Runtime lifecycle management
//! (signal handling, duration bounds) is integrated here the same way it
//! is driven from main.rs.
//!
//! A single process can host any subset of the services; with `All`, every
//! router is nested under its canonical prefix on one listener and the
//! process doubles as the gateway the services address each other through.
//! The startup recovery sweep is spawned after the listener is bound, so
//! compensating calls that route back through the gateway can succeed.

use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use clap::ValueEnum;
use tracing::{error, info};

use crate::app_state::ServiceState;
use crate::config::{BackendConfig, Config};
use crate::ids::{self, KeyMinter};
use crate::services::order::{self, OrderValue};
use crate::services::payment::{self, UserValue};
use crate::services::stock::{self, StockValue};
use crate::storage::sweeper;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ServiceSelection {
    Ids,
    Stock,
    Payment,
    Order,
    All,
}

impl ServiceSelection {
    fn runs_ids(self) -> bool {
        matches!(self, Self::Ids | Self::All)
    }

    fn runs_stock(self) -> bool {
        matches!(self, Self::Stock | Self::All)
    }

    fn runs_payment(self) -> bool {
        matches!(self, Self::Payment | Self::All)
    }

    fn runs_order(self) -> bool {
        matches!(self, Self::Order | Self::All)
    }
}

/// The assembled router plus the states behind it, kept so callers (main,
/// tests) can reach the stores and run recovery sweeps directly.
pub struct Gateway {
    pub router: Router,
    pub stock: Option<Arc<ServiceState>>,
    pub payment: Option<Arc<ServiceState>>,
    pub order: Option<Arc<ServiceState>>,
}

// Root endpoint, for load balancer health checks and service discovery.
async fn root() -> &'static str {
    "Shopfloor E-Commerce Backend"
}

/// Build the routers and states for the selected services.
pub fn build(
    config: &Config,
    selection: ServiceSelection,
) -> Result<Gateway, Box<dyn Error + Send + Sync>> {
    let mut router = Router::new().route("/", axum::routing::get(root));
    let mut gateway = Gateway {
        router: Router::new(),
        stock: None,
        payment: None,
        order: None,
    };

    if selection.runs_ids() {
        router = router.nest("/ids", ids::router(Arc::new(KeyMinter::new())));
    }
    if selection.runs_stock() {
        let state = ServiceState::new(config, "stock")?;
        router = router.nest("/stock", stock::router(state.clone()));
        gateway.stock = Some(state);
    }
    if selection.runs_payment() {
        let state = ServiceState::new(config, "payment")?;
        router = router.nest("/payment", payment::router(state.clone()));
        gateway.payment = Some(state);
    }
    if selection.runs_order() {
        let state = ServiceState::new(config, "order")?;
        router = router.nest("/orders", order::router(state.clone()));
        gateway.order = Some(state);
    }

    gateway.router = router;
    Ok(gateway)
}

/// One recovery pass over every hosted service's log.
pub async fn startup_sweep(
    stock: Option<Arc<ServiceState>>,
    payment: Option<Arc<ServiceState>>,
    order: Option<Arc<ServiceState>>,
    window_minutes: i64,
) {
    if let Some(state) = stock {
        report_sweep("stock", sweeper::sweep::<StockValue>(&state, window_minutes).await);
    }
    if let Some(state) = payment {
        report_sweep(
            "payment",
            sweeper::sweep::<UserValue>(&state, window_minutes).await,
        );
    }
    if let Some(state) = order {
        report_sweep("order", sweeper::sweep::<OrderValue>(&state, window_minutes).await);
    }
}

fn report_sweep(service: &str, result: Result<sweeper::SweepReport, crate::error::ServiceError>) {
    match result {
        Ok(report) => {
            if report.groups_swept > 0 || report.groups_deferred > 0 {
                info!(
                    "🧹 {service} recovery: {} group(s) rolled back, {} deferred",
                    report.groups_swept, report.groups_deferred
                );
            }
        }
        Err(e) => error!("Startup recovery sweep failed for {service}: {e}"),
    }
}

/// Run the selected services with all the necessary setup and teardown.
pub async fn run_server_with_duration(
    config: Config,
    selection: ServiceSelection,
    duration: Option<u64>,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let start_time = Instant::now();

    let Gateway {
        router,
        stock,
        payment,
        order,
    } = build(&config, selection)?;

    let port = find_available_port(&config.backend)?;
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Box::<dyn Error + Send + Sync>::from(format!("Listener error: {e}")))?;

    info!("🚀 Shopfloor listening on {}", addr);

    // Sweep after the listener is up: compensating stock/add calls route
    // through the gateway, which in all-in-one mode is this very listener.
    let states: Vec<Arc<ServiceState>> = [&stock, &payment, &order]
        .iter()
        .filter_map(|state| state.as_ref().cloned())
        .collect();
    if config.recovery.sweep_on_startup {
        let window_minutes = config.recovery.window_minutes;
        tokio::spawn(startup_sweep(stock, payment, order, window_minutes));
    }

    // Run server with integrated shutdown handling
    if let Some(duration) = duration {
        tokio::select! {
            result = axum::serve(listener, router) => {
                if let Err(e) = result {
                    error!("Server error: {}", e);
                }
            }
            _ = tokio::time::sleep(Duration::from_secs(duration)) => {
                info!("⏱️ Duration limit reached, shutting down gracefully");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Received shutdown signal, shutting down gracefully");
            }
        }
    } else {
        tokio::select! {
            result = axum::serve(listener, router) => {
                if let Err(e) = result {
                    error!("Server error: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Received shutdown signal, shutting down gracefully");
            }
        }
    }

    // Flush pending store writes before the process exits.
    for state in &states {
        if let Err(e) = state.store.close().await {
            error!("Failed to flush store on shutdown: {e}");
        }
    }

    let total_runtime = start_time.elapsed();
    info!("🧹 Server completed after {:.2}s", total_runtime.as_secs_f64());

    Ok(())
}

fn is_port_available(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Try the configured port first, then fall back to sequential ports up to
/// `max_port_attempts`, enabling multiple instances during development.
pub fn find_available_port(config: &BackendConfig) -> Result<u16, Box<dyn Error + Send + Sync>> {
    for offset in 0..config.max_port_attempts {
        let port = config.port + offset;
        if is_port_available(port) {
            return Ok(port);
        }
    }
    Err(format!(
        "No available port in range {}..{}",
        config.port,
        config.port + config.max_port_attempts
    )
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_build_all_wires_every_service() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.data_dir = temp_dir.path().to_string_lossy().to_string();

        let gateway = build(&config, ServiceSelection::All).unwrap();
        assert!(gateway.stock.is_some());
        assert!(gateway.payment.is_some());
        assert!(gateway.order.is_some());
    }

    #[test]
    fn test_build_single_service() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.data_dir = temp_dir.path().to_string_lossy().to_string();

        let gateway = build(&config, ServiceSelection::Stock).unwrap();
        assert!(gateway.stock.is_some());
        assert!(gateway.payment.is_none());
        assert!(gateway.order.is_none());
    }
}
