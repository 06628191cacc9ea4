//! Service Modules
//!
//! One module per business service: stock (items), payment (users), order
//! (orders and the checkout saga). Each exposes an axum `Router` over a
//! `ServiceState`, and all three follow the same write-ahead discipline on
//! mutations:
//!
//! 1. record `Received/Pending`
//! 2. apply the mutation together with its `Create`/`Update` record in one
//!    atomic pipelined commit
//! 3. record a terminal `Sent` with `Success` or `Failure`
//!
//! The absence of step 3 is what the sweeper keys on: it rolls back step 2
//! if it happened, or just drops step 1's record otherwise.
//!
//! The log-inspection endpoints (`log_count`, `log/<key>`, `logs`,
//! `sorted_logs`, `fault_tolerance`) are identical across services except
//! for the entity type inside the records, so their bodies live here as
//! generics and each service wires thin handlers over them.

pub mod order;
pub mod payment;
pub mod stock;

use std::collections::BTreeMap;

use axum::http::{header, HeaderMap};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app_state::ServiceState;
use crate::error::{ApiError, ServiceError};
use crate::storage::log_record::LogRecord;
use crate::storage::sweeper::SweepReport;

/// Correlation id handed along by a calling service, if any.
#[derive(Debug, Deserialize)]
pub struct LogIdQuery {
    pub log_id: Option<Uuid>,
}

impl LogIdQuery {
    /// The caller's correlation id, or a fresh one for a new chain.
    pub fn resolve(&self) -> Uuid {
        self.log_id.unwrap_or_else(Uuid::new_v4)
    }
}

/// Endpoint that called us, as reported by the Referer header.
pub(crate) fn referrer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::REFERER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

#[derive(Debug, Serialize)]
pub struct LogEntry<V> {
    pub key: String,
    pub log: LogRecord<V>,
}

#[derive(Debug, Serialize)]
pub struct LogCountResponse {
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct SweepResponse {
    pub msg: String,
    #[serde(flatten)]
    pub report: SweepReport,
}

pub(crate) fn count_logs(state: &ServiceState) -> Result<LogCountResponse, ApiError> {
    Ok(LogCountResponse {
        count: state.wal.count()?,
    })
}

pub(crate) fn find_one_log<V: DeserializeOwned>(
    state: &ServiceState,
    log_key: &str,
) -> Result<LogEntry<V>, ApiError> {
    match state.wal.get::<V>(log_key)? {
        Some(log) => Ok(LogEntry {
            key: log_key.to_string(),
            log,
        }),
        None => Err(ApiError::new(ServiceError::NotFound(format!(
            "Log: {log_key} not found"
        )))),
    }
}

pub(crate) fn list_logs<V: DeserializeOwned>(
    state: &ServiceState,
) -> Result<Vec<LogEntry<V>>, ApiError> {
    Ok(state
        .wal
        .all::<V>()?
        .into_iter()
        .map(|(key, log)| LogEntry { key, log })
        .collect())
}

pub(crate) fn sorted_logs<V: DeserializeOwned>(
    state: &ServiceState,
    min_diff: i64,
) -> Result<BTreeMap<Uuid, Vec<LogEntry<V>>>, ApiError> {
    let groups = state.wal.grouped::<V>(chrono::Utc::now(), min_diff)?;
    Ok(groups
        .into_iter()
        .map(|(correlation_id, records)| {
            let entries = records
                .into_iter()
                .map(|(key, log)| LogEntry { key, log })
                .collect();
            (correlation_id, entries)
        })
        .collect())
}
