//! ID Service
//!
//! Mints the ordered keys every other service stores its log records under:
//! `log:<YYYYMMDDhhmmssuuuuuu><counter>`. The counter is process-wide and
//! atomically incremented; the wall-clock prefix advances every microsecond.
//! Together they guarantee strict inequality of minted keys under any
//! concurrency, and lexicographic order matching mint order within one
//! process (the counter is zero-padded so a rollover in digit count cannot
//! reorder keys minted in the same microsecond).
//!
//! Restart semantics: the counter resets to zero, and uniqueness is carried
//! by the advancing timestamp alone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::Router;

use crate::storage::log_record::{now_stamp, LOG_KEY_PREFIX};

pub struct KeyMinter {
    counter: AtomicU64,
}

impl KeyMinter {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Mint one key. Never fails: both inputs are process-local.
    pub fn mint(&self) -> String {
        let sequence = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}{}{:010}", LOG_KEY_PREFIX, now_stamp(), sequence)
    }
}

impl Default for KeyMinter {
    fn default() -> Self {
        Self::new()
    }
}

/// Router for the id service: `GET /create` under the `/ids` prefix.
pub fn router(minter: Arc<KeyMinter>) -> Router {
    Router::new()
        .route("/create", get(create_id))
        .with_state(minter)
}

async fn create_id(State(minter): State<Arc<KeyMinter>>) -> String {
    minter.mint()
}
