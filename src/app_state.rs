//! Application State Management
//!
//! Each running service owns one `ServiceState`: its configuration, its
//! sled store (entities and log records in one key space), a `Wal` view
//! over the log family, and a gateway client for inter-service hops. The
//! state is built once at startup and injected into handlers via axum's
//! `State` extractor; nothing else is process-global.

use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use crate::client::GatewayClient;
use crate::config::Config;
use crate::storage::kv::KvStore;
use crate::storage::wal::Wal;

pub struct ServiceState {
    pub config: Config,
    pub store: Arc<KvStore>,
    pub wal: Wal,
    pub client: GatewayClient,
}

impl ServiceState {
    /// Open (or create) the service's store under
    /// `<data_dir>/<service_name>` and wire up the shared components.
    pub fn new(
        config: &Config,
        service_name: &str,
    ) -> Result<Arc<Self>, Box<dyn Error + Send + Sync>> {
        let data_dir = resolve_data_dir(&config.storage.data_dir)?;
        let store_path = data_dir.join(service_name);

        let store = Arc::new(KvStore::open(&store_path)?);
        let wal = Wal::new(store.clone());
        let client = GatewayClient::new(&config.gateway)?;

        Ok(Arc::new(Self {
            config: config.clone(),
            store,
            wal,
            client,
        }))
    }
}

fn resolve_data_dir(configured: &str) -> Result<PathBuf, Box<dyn Error + Send + Sync>> {
    let data_dir = if std::path::Path::new(configured).is_absolute() {
        PathBuf::from(configured)
    } else {
        std::env::current_dir()
            .map_err(|e| format!("Failed to get current directory: {e}"))?
            .join(configured)
    };
    fs::create_dir_all(&data_dir).map_err(|e| format!("Failed to create data directory: {e}"))?;
    Ok(data_dir)
}
