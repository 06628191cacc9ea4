//! Order Service
//!
//! Owns order records and orchestrates checkout. `create` verifies the
//! user against the payment service before committing the order; `addItem`
//! prices the line against the stock service and bumps `total_cost`
//! atomically with its Update record; `checkout` hands off to the saga in
//! `crate::saga`, spawned as its own task so a dropped client connection
//! cannot cancel a half-done distributed transaction.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app_state::ServiceState;
use crate::error::{ApiError, ServiceError};
use crate::saga;
use crate::services::{
    count_logs, find_one_log, list_logs, referrer, sorted_logs, LogCountResponse, LogEntry,
    SweepResponse,
};
use crate::storage::kv::KvStore;
use crate::storage::log_record::{LogRecord, LogStatus};
use crate::storage::sweeper;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderValue {
    pub paid: bool,
    pub items: Vec<(String, u64)>,
    pub user_id: String,
    pub total_cost: u64,
}

// ===== API Types =====

#[derive(Debug, Serialize)]
pub struct CreateOrderResponse {
    pub order_id: String,
    pub log_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct FindOrderResponse {
    pub order_id: String,
    pub paid: bool,
    pub items: Vec<(String, u64)>,
    pub user_id: String,
    pub total_cost: u64,
}

#[derive(Debug, Serialize)]
pub struct AddItemResponse {
    pub order_id: String,
    pub total_cost: u64,
    pub log_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub msg: String,
    pub log_id: Uuid,
}

// ===== Route Configuration =====

/// Routes mounted under the `/orders` prefix.
pub fn router(state: Arc<ServiceState>) -> Router {
    Router::new()
        .route("/create/:user_id", post(create_order))
        .route("/find/:order_id", get(find_order))
        .route("/addItem/:order_id/:item_id/:quantity", post(add_item))
        .route("/checkout/:order_id", post(checkout))
        .route("/fault_tolerance/:min_diff", get(fault_tolerance))
        .route("/log_count", get(log_count))
        .route("/log/:log_key", get(find_log))
        .route("/logs", get(all_logs))
        .route("/sorted_logs/:min_diff", get(find_sorted_logs))
        .with_state(state)
}

// ===== Handlers =====

// Log order:
// Success: CREATE -> SENT (success)
// Failure: SENT (failure)
async fn create_order(
    State(state): State<Arc<ServiceState>>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<CreateOrderResponse>, ApiError> {
    let log_id = Uuid::new_v4();
    let this_url = state.client.url(&format!("/orders/create/{user_id}"));
    let caller = referrer(&headers);

    // The order is only worth creating for a user that exists.
    let find_url = state
        .client
        .url_with_log_id(&format!("/payment/find_user/{user_id}"), log_id);
    let user_reply = state.client.get(&find_url).await;
    if !matches!(&user_reply, Ok(r) if r.ok()) {
        let key = state.client.mint_key().await?;
        state.wal.append(
            &key,
            &LogRecord::<OrderValue>::sent(
                log_id,
                LogStatus::Failure,
                None,
                Some(this_url),
                caller,
            ),
        )?;
        return Err(ApiError::with_log(
            ServiceError::NotFound(format!("User: {user_id} does not exist")),
            log_id,
        ));
    }

    let order_id = Uuid::new_v4().to_string();
    let value = OrderValue {
        paid: false,
        items: Vec::new(),
        user_id,
        total_cost: 0,
    };

    let create_record = LogRecord::create(log_id, order_id.clone(), value.clone());
    let log_key = state.client.mint_key().await?;
    let commit = state.store.commit_atomic(&[
        (log_key.as_str(), KvStore::encode(&create_record)?),
        (order_id.as_str(), KvStore::encode(&value)?),
    ]);
    if let Err(e) = commit {
        let key = state.client.mint_key().await?;
        state.wal.append(
            &key,
            &LogRecord::<OrderValue>::sent(
                log_id,
                LogStatus::Failure,
                Some(order_id),
                Some(this_url),
                caller,
            ),
        )?;
        return Err(ApiError::with_log(ServiceError::Store(e), log_id));
    }

    let key = state.client.mint_key().await?;
    state.wal.append(
        &key,
        &LogRecord::<OrderValue>::sent(
            log_id,
            LogStatus::Success,
            Some(order_id.clone()),
            Some(this_url),
            caller,
        ),
    )?;

    Ok(Json(CreateOrderResponse { order_id, log_id }))
}

// Side-effect-free read; plays no role in recovery, so nothing is logged.
async fn find_order(
    State(state): State<Arc<ServiceState>>,
    Path(order_id): Path<String>,
) -> Result<Json<FindOrderResponse>, ApiError> {
    let Some(value) = state.store.get::<OrderValue>(&order_id)? else {
        return Err(ApiError::new(ServiceError::NotFound(format!(
            "Order: {order_id} not found"
        ))));
    };
    Ok(Json(FindOrderResponse {
        order_id,
        paid: value.paid,
        items: value.items,
        user_id: value.user_id,
        total_cost: value.total_cost,
    }))
}

// Log order:
// Success: RECEIVED -> UPDATE -> SENT (success)
// Failure: RECEIVED -> SENT (failure)
async fn add_item(
    State(state): State<Arc<ServiceState>>,
    Path((order_id, item_id, quantity)): Path<(String, String, u64)>,
    headers: HeaderMap,
) -> Result<Json<AddItemResponse>, ApiError> {
    let log_id = Uuid::new_v4();
    let this_url = state
        .client
        .url(&format!("/orders/addItem/{order_id}/{item_id}/{quantity}"));
    let caller = referrer(&headers);

    let key = state.client.mint_key().await?;
    state.wal.append(
        &key,
        &LogRecord::<OrderValue>::received(
            log_id,
            LogStatus::Pending,
            Some(order_id.clone()),
            caller.clone(),
            Some(this_url.clone()),
        ),
    )?;

    // Price the line against the stock service.
    let find_url = state
        .client
        .url_with_log_id(&format!("/stock/find/{item_id}"), log_id);
    let stock_reply = state.client.get(&find_url).await;
    let price = match &stock_reply {
        Ok(reply) if reply.ok() => reply.field_u64("price"),
        _ => None,
    };
    let Some(price) = price else {
        let key = state.client.mint_key().await?;
        state.wal.append(
            &key,
            &LogRecord::<OrderValue>::sent(
                log_id,
                LogStatus::Failure,
                Some(order_id),
                Some(this_url),
                caller,
            ),
        )?;
        return Err(ApiError::with_log(
            ServiceError::NotFound(format!("Item: {item_id} does not exist")),
            log_id,
        ));
    };

    let old_value = load_order(&state, &order_id, log_id, &this_url, caller.clone()).await?;
    let mut new_value = old_value.clone();
    new_value.items.push((item_id, quantity));
    new_value.total_cost = new_value
        .total_cost
        .saturating_add(quantity.saturating_mul(price));

    let update_record = LogRecord::update(
        log_id,
        order_id.clone(),
        old_value,
        new_value.clone(),
    );
    let log_key = state.client.mint_key().await?;
    let commit = state.store.commit_atomic(&[
        (log_key.as_str(), KvStore::encode(&update_record)?),
        (order_id.as_str(), KvStore::encode(&new_value)?),
    ]);
    if let Err(e) = commit {
        let key = state.client.mint_key().await?;
        state.wal.append(
            &key,
            &LogRecord::<OrderValue>::sent(
                log_id,
                LogStatus::Failure,
                Some(order_id),
                Some(this_url),
                caller,
            ),
        )?;
        return Err(ApiError::with_log(ServiceError::Store(e), log_id));
    }

    let key = state.client.mint_key().await?;
    state.wal.append(
        &key,
        &LogRecord::<OrderValue>::sent(
            log_id,
            LogStatus::Success,
            Some(order_id.clone()),
            Some(this_url),
            caller,
        ),
    )?;

    Ok(Json(AddItemResponse {
        order_id,
        total_cost: new_value.total_cost,
        log_id,
    }))
}

/// The saga runs in its own task: a client disconnect drops this handler's
/// future but not the spawned one, so checkout always runs to completion
/// (success or compensated failure). The whole-checkout budget only stops
/// the caller from waiting; on expiry the saga keeps going and the client
/// must poll the order to learn the outcome.
async fn checkout(
    State(state): State<Arc<ServiceState>>,
    Path(order_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<CheckoutResponse>, ApiError> {
    let caller = referrer(&headers);
    let budget = Duration::from_secs(state.config.gateway.checkout_timeout_secs);

    let task = tokio::spawn(saga::run_checkout(state.clone(), order_id, caller));
    match tokio::time::timeout(budget, task).await {
        Ok(Ok(outcome)) => outcome.map(|success| {
            Json(CheckoutResponse {
                msg: "Checkout successful".to_string(),
                log_id: success.log_id,
            })
        }),
        Ok(Err(join_error)) => Err(ApiError::new(ServiceError::Network(format!(
            "Checkout task failed: {join_error}"
        )))),
        Err(_) => Err(ApiError::new(ServiceError::Network(
            "Checkout timed out; poll the order to learn the outcome".to_string(),
        ))),
    }
}

async fn fault_tolerance(
    State(state): State<Arc<ServiceState>>,
    Path(min_diff): Path<i64>,
) -> Result<Json<SweepResponse>, ApiError> {
    let report = sweeper::sweep::<OrderValue>(&state, min_diff).await?;
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
) -> Result<Json<LogEntry<OrderValue>>, ApiError> {
    Ok(Json(find_one_log(&state, &log_key)?))
}

async fn all_logs(
    State(state): State<Arc<ServiceState>>,
) -> Result<Json<Vec<LogEntry<OrderValue>>>, ApiError> {
    Ok(Json(list_logs(&state)?))
}

async fn find_sorted_logs(
    State(state): State<Arc<ServiceState>>,
    Path(min_diff): Path<i64>,
) -> Result<Json<BTreeMap<Uuid, Vec<LogEntry<OrderValue>>>>, ApiError> {
    Ok(Json(sorted_logs(&state, min_diff)?))
}

// ===== Helpers =====

async fn load_order(
    state: &ServiceState,
    order_id: &str,
    log_id: Uuid,
    this_url: &str,
    caller: Option<String>,
) -> Result<OrderValue, ApiError> {
    match state.store.get::<OrderValue>(order_id)? {
        Some(value) => Ok(value),
        None => {
            let key = state.client.mint_key().await?;
            state.wal.append(
                &key,
                &LogRecord::<OrderValue>::sent(
                    log_id,
                    LogStatus::Failure,
                    Some(order_id.to_string()),
                    Some(this_url.to_string()),
                    caller,
                ),
            )?;
            Err(ApiError::with_log(
                ServiceError::NotFound(format!("Order: {order_id} not found")),
                log_id,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_value_serde_round_trip() {
        let value = OrderValue {
            paid: false,
            items: vec![("item-1".to_string(), 3)],
            user_id: "user-1".to_string(),
            total_cost: 30,
        };
        let bytes = serde_json::to_vec(&value).unwrap();
        let decoded: OrderValue = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_find_order_response_shape() {
        let response = FindOrderResponse {
            order_id: "order-1".to_string(),
            paid: true,
            items: vec![("item-1".to_string(), 2)],
            user_id: "user-1".to_string(),
            total_cost: 20,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["paid"], true);
        assert_eq!(json["items"][0][1], 2);
    }
}
