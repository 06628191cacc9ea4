//! Payment Service
//!
//! Owns user records `{credit}`. Mirrors the stock service: the same
//! three-log discipline on every mutation, with `pay` refusing to push a
//! credit below zero (`InsufficientCredit`, terminal `Sent/Failure`).

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
pub struct UserValue {
    pub credit: u64,
}

// ===== API Types =====

#[derive(Debug, Serialize)]
pub struct CreateUserResponse {
    pub user_id: String,
    pub log_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct FindUserResponse {
    pub user_id: String,
    pub credit: u64,
    pub log_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct CreditResponse {
    pub user_id: String,
    pub credit: u64,
    pub log_id: Uuid,
}

// ===== Route Configuration =====

/// Routes mounted under the `/payment` prefix.
pub fn router(state: Arc<ServiceState>) -> Router {
    Router::new()
        .route("/create_user", post(create_user))
        .route("/find_user/:user_id", get(find_user))
        .route("/add_funds/:user_id/:amount", post(add_funds))
        .route("/pay/:user_id/:amount", post(pay))
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
async fn create_user(
    State(state): State<Arc<ServiceState>>,
    headers: HeaderMap,
) -> Result<Json<CreateUserResponse>, ApiError> {
    let log_id = Uuid::new_v4();
    let this_url = state.client.url("/payment/create_user");
    let caller = referrer(&headers);

    let key = state.client.mint_key().await?;
    state.wal.append(
        &key,
        &LogRecord::<UserValue>::received(
            log_id,
            LogStatus::Pending,
            None,
            caller.clone(),
            Some(this_url.clone()),
        ),
    )?;

    let user_id = Uuid::new_v4().to_string();
    let value = UserValue { credit: 0 };

    let create_record = LogRecord::create(log_id, user_id.clone(), value.clone());
    let log_key = state.client.mint_key().await?;
    let commit = state.store.commit_atomic(&[
        (log_key.as_str(), KvStore::encode(&create_record)?),
        (user_id.as_str(), KvStore::encode(&value)?),
    ]);
    if let Err(e) = commit {
        let key = state.client.mint_key().await?;
        state.wal.append(
            &key,
            &LogRecord::<UserValue>::sent(
                log_id,
                LogStatus::Failure,
                Some(user_id),
                Some(this_url),
                caller,
            ),
        )?;
        return Err(ApiError::with_log(ServiceError::Store(e), log_id));
    }

    let key = state.client.mint_key().await?;
    state.wal.append(
        &key,
        &LogRecord::<UserValue>::sent(
            log_id,
            LogStatus::Success,
            Some(user_id.clone()),
            Some(this_url),
            caller,
        ),
    )?;

    Ok(Json(CreateUserResponse { user_id, log_id }))
}

// Log order: RECEIVED -> SENT
async fn find_user(
    State(state): State<Arc<ServiceState>>,
    Path(user_id): Path<String>,
    Query(query): Query<LogIdQuery>,
    headers: HeaderMap,
) -> Result<Json<FindUserResponse>, ApiError> {
    let log_id = query.resolve();
    let this_url = state.client.url(&format!("/payment/find_user/{user_id}"));
    let caller = referrer(&headers);

    let key = state.client.mint_key().await?;
    state.wal.append(
        &key,
        &LogRecord::<UserValue>::received(
            log_id,
            LogStatus::Pending,
            Some(user_id.clone()),
            caller.clone(),
            Some(this_url.clone()),
        ),
    )?;

    let value = load_user(&state, &user_id, log_id, &this_url, caller.clone()).await?;

    let key = state.client.mint_key().await?;
    state.wal.append(
        &key,
        &LogRecord::<UserValue>::sent(
            log_id,
            LogStatus::Success,
            Some(user_id.clone()),
            Some(this_url),
            caller,
        ),
    )?;

    Ok(Json(FindUserResponse {
        user_id,
        credit: value.credit,
        log_id,
    }))
}

// Log order:
// Success: RECEIVED -> UPDATE -> SENT (success)
// Failure: RECEIVED -> SENT (failure)
async fn add_funds(
    State(state): State<Arc<ServiceState>>,
    Path((user_id, amount)): Path<(String, u64)>,
    Query(query): Query<LogIdQuery>,
    headers: HeaderMap,
) -> Result<Json<CreditResponse>, ApiError> {
    let log_id = query.resolve();
    let this_url = state
        .client
        .url(&format!("/payment/add_funds/{user_id}/{amount}"));
    let caller = referrer(&headers);

    let key = state.client.mint_key().await?;
    state.wal.append(
        &key,
        &LogRecord::<UserValue>::received(
            log_id,
            LogStatus::Pending,
            Some(user_id.clone()),
            caller.clone(),
            Some(this_url.clone()),
        ),
    )?;

    let old_value = load_user(&state, &user_id, log_id, &this_url, caller.clone()).await?;
    let new_value = UserValue {
        credit: old_value.credit.saturating_add(amount),
    };

    commit_update(&state, &user_id, old_value, new_value.clone(), log_id, &this_url, caller.clone())
        .await?;

    let key = state.client.mint_key().await?;
    state.wal.append(
        &key,
        &LogRecord::<UserValue>::sent(
            log_id,
            LogStatus::Success,
            Some(user_id.clone()),
            Some(this_url),
            caller,
        ),
    )?;

    Ok(Json(CreditResponse {
        user_id,
        credit: new_value.credit,
        log_id,
    }))
}

// Log order:
// Success: RECEIVED -> UPDATE -> SENT (success)
// Failure: RECEIVED -> SENT (failure)
async fn pay(
    State(state): State<Arc<ServiceState>>,
    Path((user_id, amount)): Path<(String, u64)>,
    Query(query): Query<LogIdQuery>,
    headers: HeaderMap,
) -> Result<Json<CreditResponse>, ApiError> {
    let log_id = query.resolve();
    let this_url = state.client.url(&format!("/payment/pay/{user_id}/{amount}"));
    let caller = referrer(&headers);
    debug!("Removing {amount} credit from user: {user_id}");

    let key = state.client.mint_key().await?;
    state.wal.append(
        &key,
        &LogRecord::<UserValue>::received(
            log_id,
            LogStatus::Pending,
            Some(user_id.clone()),
            caller.clone(),
            Some(this_url.clone()),
        ),
    )?;

    let old_value = load_user(&state, &user_id, log_id, &this_url, caller.clone()).await?;
    let new_value = match old_value.credit.checked_sub(amount) {
        Some(credit) => UserValue { credit },
        None => {
            let key = state.client.mint_key().await?;
            state.wal.append(
                &key,
                &LogRecord::<UserValue>::sent(
                    log_id,
                    LogStatus::Failure,
                    Some(user_id.clone()),
                    Some(this_url),
                    caller,
                ),
            )?;
            return Err(ApiError::with_log(
                ServiceError::Underflow(format!(
                    "InsufficientCredit: user {user_id} credit cannot be reduced below zero"
                )),
                log_id,
            ));
        }
    };

    commit_update(&state, &user_id, old_value, new_value.clone(), log_id, &this_url, caller.clone())
        .await?;

    let key = state.client.mint_key().await?;
    state.wal.append(
        &key,
        &LogRecord::<UserValue>::sent(
            log_id,
            LogStatus::Success,
            Some(user_id.clone()),
            Some(this_url),
            caller,
        ),
    )?;

    Ok(Json(CreditResponse {
        user_id,
        credit: new_value.credit,
        log_id,
    }))
}

async fn fault_tolerance(
    State(state): State<Arc<ServiceState>>,
    Path(min_diff): Path<i64>,
) -> Result<Json<SweepResponse>, ApiError> {
    let report = sweeper::sweep::<UserValue>(&state, min_diff).await?;
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
) -> Result<Json<LogEntry<UserValue>>, ApiError> {
    Ok(Json(find_one_log(&state, &log_key)?))
}

async fn all_logs(
    State(state): State<Arc<ServiceState>>,
) -> Result<Json<Vec<LogEntry<UserValue>>>, ApiError> {
    Ok(Json(list_logs(&state)?))
}

async fn find_sorted_logs(
    State(state): State<Arc<ServiceState>>,
    Path(min_diff): Path<i64>,
) -> Result<Json<BTreeMap<Uuid, Vec<LogEntry<UserValue>>>>, ApiError> {
    Ok(Json(sorted_logs(&state, min_diff)?))
}

// ===== Helpers =====

async fn load_user(
    state: &ServiceState,
    user_id: &str,
    log_id: Uuid,
    this_url: &str,
    caller: Option<String>,
) -> Result<UserValue, ApiError> {
    match state.store.get::<UserValue>(user_id)? {
        Some(value) => Ok(value),
        None => {
            let key = state.client.mint_key().await?;
            state.wal.append(
                &key,
                &LogRecord::<UserValue>::sent(
                    log_id,
                    LogStatus::Failure,
                    Some(user_id.to_string()),
                    Some(this_url.to_string()),
                    caller,
                ),
            )?;
            Err(ApiError::with_log(
                ServiceError::NotFound(format!("User: {user_id} not found")),
                log_id,
            ))
        }
    }
}

async fn commit_update(
    state: &ServiceState,
    user_id: &str,
    old_value: UserValue,
    new_value: UserValue,
    log_id: Uuid,
    this_url: &str,
    caller: Option<String>,
) -> Result<(), ApiError> {
    let update_record = LogRecord::update(log_id, user_id.to_string(), old_value, new_value.clone());
    let log_key = state.client.mint_key().await?;
    let commit = state.store.commit_atomic(&[
        (log_key.as_str(), KvStore::encode(&update_record)?),
        (user_id, KvStore::encode(&new_value)?),
    ]);
    if let Err(e) = commit {
        let key = state.client.mint_key().await?;
        state.wal.append(
            &key,
            &LogRecord::<UserValue>::sent(
                log_id,
                LogStatus::Failure,
                Some(user_id.to_string()),
                Some(this_url.to_string()),
                caller,
            ),
        )?;
        return Err(ApiError::with_log(ServiceError::Store(e), log_id));
    }
    Ok(())
}
