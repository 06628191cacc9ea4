//! Stock Service
//!
//! Owns item records `{stock, price}` and their write-ahead log. Every
//! mutation follows the three-log discipline described in the parent
//! module; `subtract` is the one operation with a business-rule failure of
//! its own (`StockUnderflow`), recorded as a terminal `Sent/Failure` so
//! recovery knows the request concluded.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::app_state::ServiceState;
use crate::error::{ApiError, ServiceError};
use crate::services::{
    count_logs, find_one_log, list_logs, referrer, sorted_logs, LogCountResponse, LogEntry,
    LogIdQuery, SweepResponse,
};
use crate::storage::kv::KvStore;
use crate::storage::log_record::{LogRecord, LogStatus};
use crate::storage::sweeper;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockValue {
    pub stock: u64,
    pub price: u64,
}

// ===== API Types =====

#[derive(Debug, Serialize)]
pub struct CreateItemResponse {
    pub item_id: String,
    pub log_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct FindItemResponse {
    pub stock: u64,
    pub price: u64,
    pub log_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct StockLevelResponse {
    pub item_id: String,
    pub stock: u64,
    pub log_id: Uuid,
}

// ===== Route Configuration =====

/// Routes mounted under the `/stock` prefix.
pub fn router(state: Arc<ServiceState>) -> Router {
    Router::new()
        .route("/item/create/:price", post(create_item))
        .route("/find/:item_id", get(find_item))
        .route("/add/:item_id/:amount", post(add_stock))
        .route("/subtract/:item_id/:amount", post(remove_stock))
        .route("/fault_tolerance/:min_diff", get(fault_tolerance))
        .route("/log_count", get(log_count))
        .route("/log/:log_key", get(find_log))
        .route("/logs", get(all_logs))
        .route("/sorted_logs/:min_diff", get(find_sorted_logs))
        .with_state(state)
}

// ===== Handlers =====

// Log order:
// Success: RECEIVED -> CREATE -> SENT (success)
// Failure: RECEIVED -> SENT (failure)
async fn create_item(
    State(state): State<Arc<ServiceState>>,
    Path(price): Path<u64>,
    headers: HeaderMap,
) -> Result<Json<CreateItemResponse>, ApiError> {
    let log_id = Uuid::new_v4();
    let this_url = state.client.url(&format!("/stock/item/create/{price}"));
    let caller = referrer(&headers);

    let key = state.client.mint_key().await?;
    state.wal.append(
        &key,
        &LogRecord::<StockValue>::received(
            log_id,
            LogStatus::Pending,
            None,
            caller.clone(),
            Some(this_url.clone()),
        ),
    )?;

    let item_id = Uuid::new_v4().to_string();
    let value = StockValue { stock: 0, price };
    debug!("Item: {item_id} created");

    let create_record = LogRecord::create(log_id, item_id.clone(), value.clone());
    let log_key = state.client.mint_key().await?;
    let commit = state.store.commit_atomic(&[
        (log_key.as_str(), KvStore::encode(&create_record)?),
        (item_id.as_str(), KvStore::encode(&value)?),
    ]);
    if let Err(e) = commit {
        let key = state.client.mint_key().await?;
        state.wal.append(
            &key,
            &LogRecord::<StockValue>::sent(
                log_id,
                LogStatus::Failure,
                Some(item_id),
                Some(this_url),
                caller,
            ),
        )?;
        return Err(ApiError::with_log(ServiceError::Store(e), log_id));
    }

    let key = state.client.mint_key().await?;
    state.wal.append(
        &key,
        &LogRecord::<StockValue>::sent(
            log_id,
            LogStatus::Success,
            Some(item_id.clone()),
            Some(this_url),
            caller,
        ),
    )?;

    Ok(Json(CreateItemResponse { item_id, log_id }))
}

// Log order: RECEIVED -> SENT
async fn find_item(
    State(state): State<Arc<ServiceState>>,
    Path(item_id): Path<String>,
    Query(query): Query<LogIdQuery>,
    headers: HeaderMap,
) -> Result<Json<FindItemResponse>, ApiError> {
    let log_id = query.resolve();
    let this_url = state.client.url(&format!("/stock/find/{item_id}"));
    let caller = referrer(&headers);

    let key = state.client.mint_key().await?;
    state.wal.append(
        &key,
        &LogRecord::<StockValue>::received(
            log_id,
            LogStatus::Pending,
            Some(item_id.clone()),
            caller.clone(),
            Some(this_url.clone()),
        ),
    )?;

    let value = load_item(&state, &item_id, log_id, &this_url, caller.clone()).await?;

    let key = state.client.mint_key().await?;
    state.wal.append(
        &key,
        &LogRecord::<StockValue>::sent(
            log_id,
            LogStatus::Success,
            Some(item_id),
            Some(this_url),
            caller,
        ),
    )?;

    Ok(Json(FindItemResponse {
        stock: value.stock,
        price: value.price,
        log_id,
    }))
}

// Log order:
// Success: RECEIVED -> UPDATE -> SENT (success)
// Failure: RECEIVED -> SENT (failure)
async fn add_stock(
    State(state): State<Arc<ServiceState>>,
    Path((item_id, amount)): Path<(String, u64)>,
    Query(query): Query<LogIdQuery>,
    headers: HeaderMap,
) -> Result<Json<StockLevelResponse>, ApiError> {
    let log_id = query.resolve();
    let this_url = state.client.url(&format!("/stock/add/{item_id}/{amount}"));
    let caller = referrer(&headers);

    let key = state.client.mint_key().await?;
    state.wal.append(
        &key,
        &LogRecord::<StockValue>::received(
            log_id,
            LogStatus::Pending,
            Some(item_id.clone()),
            caller.clone(),
            Some(this_url.clone()),
        ),
    )?;

    let old_value = load_item(&state, &item_id, log_id, &this_url, caller.clone()).await?;
    let mut new_value = old_value.clone();
    new_value.stock = new_value.stock.saturating_add(amount);

    commit_update(&state, &item_id, old_value, new_value.clone(), log_id, &this_url, caller.clone())
        .await?;

    let key = state.client.mint_key().await?;
    state.wal.append(
        &key,
        &LogRecord::<StockValue>::sent(
            log_id,
            LogStatus::Success,
            Some(item_id.clone()),
            Some(this_url),
            caller,
        ),
    )?;

    debug!("Item: {item_id} stock updated to: {}", new_value.stock);
    Ok(Json(StockLevelResponse {
        item_id,
        stock: new_value.stock,
        log_id,
    }))
}

// Log order:
// Success: RECEIVED -> UPDATE -> SENT (success)
// Failure: RECEIVED -> SENT (failure)
async fn remove_stock(
    State(state): State<Arc<ServiceState>>,
    Path((item_id, amount)): Path<(String, u64)>,
    Query(query): Query<LogIdQuery>,
    headers: HeaderMap,
) -> Result<Json<StockLevelResponse>, ApiError> {
    let log_id = query.resolve();
    let this_url = state
        .client
        .url(&format!("/stock/subtract/{item_id}/{amount}"));
    let caller = referrer(&headers);

    let key = state.client.mint_key().await?;
    state.wal.append(
        &key,
        &LogRecord::<StockValue>::received(
            log_id,
            LogStatus::Pending,
            Some(item_id.clone()),
            caller.clone(),
            Some(this_url.clone()),
        ),
    )?;

    let old_value = load_item(&state, &item_id, log_id, &this_url, caller.clone()).await?;
    let mut new_value = old_value.clone();
    new_value.stock = match new_value.stock.checked_sub(amount) {
        Some(stock) => stock,
        None => {
            let key = state.client.mint_key().await?;
            state.wal.append(
                &key,
                &LogRecord::<StockValue>::sent(
                    log_id,
                    LogStatus::Failure,
                    Some(item_id.clone()),
                    Some(this_url),
                    caller,
                ),
            )?;
            return Err(ApiError::with_log(
                ServiceError::Underflow(format!(
                    "StockUnderflow: item {item_id} stock cannot be reduced below zero"
                )),
                log_id,
            ));
        }
    };

    commit_update(&state, &item_id, old_value, new_value.clone(), log_id, &this_url, caller.clone())
        .await?;

    let key = state.client.mint_key().await?;
    state.wal.append(
        &key,
        &LogRecord::<StockValue>::sent(
            log_id,
            LogStatus::Success,
            Some(item_id.clone()),
            Some(this_url),
            caller,
        ),
    )?;

    debug!("Item: {item_id} stock updated to: {}", new_value.stock);
    Ok(Json(StockLevelResponse {
        item_id,
        stock: new_value.stock,
        log_id,
    }))
}

async fn fault_tolerance(
    State(state): State<Arc<ServiceState>>,
    Path(min_diff): Path<i64>,
) -> Result<Json<SweepResponse>, ApiError> {
    let report = sweeper::sweep::<StockValue>(&state, min_diff).await?;
    Ok(Json(SweepResponse {
        msg: "Fault tolerance sweep complete".to_string(),
        report,
    }))
}

async fn log_count(
    State(state): State<Arc<ServiceState>>,
) -> Result<Json<LogCountResponse>, ApiError> {
    Ok(Json(count_logs(&state)?))
}

async fn find_log(
    State(state): State<Arc<ServiceState>>,
    Path(log_key): Path<String>,
) -> Result<Json<LogEntry<StockValue>>, ApiError> {
    Ok(Json(find_one_log(&state, &log_key)?))
}

async fn all_logs(
    State(state): State<Arc<ServiceState>>,
) -> Result<Json<Vec<LogEntry<StockValue>>>, ApiError> {
    Ok(Json(list_logs(&state)?))
}

async fn find_sorted_logs(
    State(state): State<Arc<ServiceState>>,
    Path(min_diff): Path<i64>,
) -> Result<Json<BTreeMap<Uuid, Vec<LogEntry<StockValue>>>>, ApiError> {
    Ok(Json(sorted_logs(&state, min_diff)?))
}

// ===== Helpers =====

/// Read an item, recording a terminal failure for this chain if it is
/// absent so the caller's trail explains the 400.
async fn load_item(
    state: &ServiceState,
    item_id: &str,
    log_id: Uuid,
    this_url: &str,
    caller: Option<String>,
) -> Result<StockValue, ApiError> {
    match state.store.get::<StockValue>(item_id)? {
        Some(value) => Ok(value),
        None => {
            let key = state.client.mint_key().await?;
            state.wal.append(
                &key,
                &LogRecord::<StockValue>::sent(
                    log_id,
                    LogStatus::Failure,
                    Some(item_id.to_string()),
                    Some(this_url.to_string()),
                    caller,
                ),
            )?;
            Err(ApiError::with_log(
                ServiceError::NotFound(format!("Item: {item_id} not found")),
                log_id,
            ))
        }
    }
}

/// Pipelined commit of the item write and its Update record; on store
/// failure, records the terminal failure before propagating.
async fn commit_update(
    state: &ServiceState,
    item_id: &str,
    old_value: StockValue,
    new_value: StockValue,
    log_id: Uuid,
    this_url: &str,
    caller: Option<String>,
) -> Result<(), ApiError> {
    let update_record = LogRecord::update(log_id, item_id.to_string(), old_value, new_value.clone());
    let log_key = state.client.mint_key().await?;
    let commit = state.store.commit_atomic(&[
        (log_key.as_str(), KvStore::encode(&update_record)?),
        (item_id, KvStore::encode(&new_value)?),
    ]);
    if let Err(e) = commit {
        let key = state.client.mint_key().await?;
        state.wal.append(
            &key,
            &LogRecord::<StockValue>::sent(
                log_id,
                LogStatus::Failure,
                Some(item_id.to_string()),
                Some(this_url.to_string()),
                caller,
            ),
        )?;
        return Err(ApiError::with_log(ServiceError::Store(e), log_id));
    }
    Ok(())
}
