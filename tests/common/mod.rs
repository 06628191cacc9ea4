//! Integration test harness
//!
//! Spins up the full service set in-process: every router nested on one
//! ephemeral-port listener, each service backed by its own sled store in a
//! per-test temp directory, and the gateway URL pointed back at the
//! listener so inter-service hops travel over real HTTP.
//!
//! The harness exposes the service states alongside the HTTP client, which
//! is what lets crash-recovery tests stage a post-crash store (entity
//! written, log chain missing its terminal record) through the library API
//! and then drive the sweeper over it.
//!
//! Quiescence is set to zero so freshly staged log groups are immediately
//! eligible for sweeping, and the startup sweep is disabled so tests
//! control every recovery pass.

use std::sync::Arc;

use serde_json::Value;
use tempfile::TempDir;
use tokio::task::JoinHandle;

use shopfloor::app_state::ServiceState;
use shopfloor::config::Config;
use shopfloor::server::{build, ServiceSelection};

pub struct TestCluster {
    pub base: String,
    pub http: reqwest::Client,
    pub stock: Arc<ServiceState>,
    pub payment: Arc<ServiceState>,
    pub order: Arc<ServiceState>,
    server: JoinHandle<()>,
    _data_dir: TempDir,
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        self.server.abort();
    }
}

impl TestCluster {
    pub async fn start() -> Self {
        let data_dir = TempDir::new().expect("temp dir");
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ephemeral port");
        let addr = listener.local_addr().expect("local addr");

        let mut config = Config::default();
        config.storage.data_dir = data_dir.path().to_string_lossy().to_string();
        config.gateway.url = format!("http://{addr}");
        config.recovery.quiescence_secs = 0;
        config.recovery.sweep_on_startup = false;

        let gateway = build(&config, ServiceSelection::All).expect("build services");
        let stock = gateway.stock.clone().expect("stock state");
        let payment = gateway.payment.clone().expect("payment state");
        let order = gateway.order.clone().expect("order state");

        let router = gateway.router;
        let server = tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });

        Self {
            base: format!("http://{addr}"),
            http: reqwest::Client::new(),
            stock,
            payment,
            order,
            server,
            _data_dir: data_dir,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.http.get(self.url(path)).send().await.expect("GET")
    }

    pub async fn post(&self, path: &str) -> reqwest::Response {
        self.http.post(self.url(path)).send().await.expect("POST")
    }

    /// GET expecting 2xx; returns the decoded JSON body.
    pub async fn get_ok(&self, path: &str) -> Value {
        let response = self.get(path).await;
        assert!(
            response.status().is_success(),
            "GET {path} returned {}",
            response.status()
        );
        response.json().await.expect("JSON body")
    }

    /// POST expecting 2xx; returns the decoded JSON body.
    pub async fn post_ok(&self, path: &str) -> Value {
        let response = self.post(path).await;
        assert!(
            response.status().is_success(),
            "POST {path} returned {}",
            response.status()
        );
        response.json().await.expect("JSON body")
    }

    // ----- canonical flows -----

    pub async fn create_user(&self) -> String {
        self.post_ok("/payment/create_user").await["user_id"]
            .as_str()
            .expect("user_id")
            .to_string()
    }

    pub async fn add_funds(&self, user_id: &str, amount: u64) {
        self.post_ok(&format!("/payment/add_funds/{user_id}/{amount}"))
            .await;
    }

    pub async fn create_item(&self, price: u64) -> String {
        self.post_ok(&format!("/stock/item/create/{price}")).await["item_id"]
            .as_str()
            .expect("item_id")
            .to_string()
    }

    pub async fn add_stock(&self, item_id: &str, amount: u64) {
        self.post_ok(&format!("/stock/add/{item_id}/{amount}")).await;
    }

    pub async fn create_order(&self, user_id: &str) -> String {
        self.post_ok(&format!("/orders/create/{user_id}")).await["order_id"]
            .as_str()
            .expect("order_id")
            .to_string()
    }

    pub async fn add_item(&self, order_id: &str, item_id: &str, quantity: u64) {
        self.post_ok(&format!("/orders/addItem/{order_id}/{item_id}/{quantity}"))
            .await;
    }

    // ----- state probes -----

    pub async fn stock_of(&self, item_id: &str) -> u64 {
        self.get_ok(&format!("/stock/find/{item_id}")).await["stock"]
            .as_u64()
            .expect("stock")
    }

    pub async fn credit_of(&self, user_id: &str) -> u64 {
        self.get_ok(&format!("/payment/find_user/{user_id}")).await["credit"]
            .as_u64()
            .expect("credit")
    }

    pub async fn order_of(&self, order_id: &str) -> Value {
        self.get_ok(&format!("/orders/find/{order_id}")).await
    }
}
