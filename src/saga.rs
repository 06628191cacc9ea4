//! Checkout Saga
//!
//! Checkout spans three stores that cannot share a transaction: stock is
//! decremented per item, credit is decremented once, and the order row
//! flips to `paid=true`. Consistency is kept by compensation, not by
//! prepare/commit — every confirmed stock subtraction is remembered in a
//! `removed` ledger, and any later failure replays those subtractions in
//! reverse as `stock/add` hops.
//!
//! The saga writes its progress to the order service's log under one
//! correlation id, which it also forwards on every hop:
//!
//! ```text
//! Received/Pending                      (checkout accepted)
//! Received/Success|Failure per hop      (each peer's verdict)
//! Update                                (paid=false → paid=true, atomic)
//! Sent/Success|Failure                  (terminal)
//! ```
//!
//! Two failure shapes matter for recovery:
//! - A hop fails and every compensating add goes through: the saga ends
//!   with a terminal `Sent/Failure` and nothing is owed.
//! - A compensating add itself fails: the loop keeps going for the other
//!   items (the add is commutative and the log records which hops landed),
//!   but no terminal record is written, leaving the chain unfinished so
//!   the sweeper retries the missing adds.
//!
//! Transport errors on a hop are indistinguishable from FAILURE replies
//! here; the saga performs no synchronous retries of forward hops.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::app_state::ServiceState;
use crate::error::{ApiError, ServiceError};
use crate::services::order::OrderValue;
use crate::storage::kv::KvStore;
use crate::storage::log_record::{LogRecord, LogStatus};

pub struct CheckoutOutcome {
    pub log_id: Uuid,
}

/// Coalesce an order's item list into one quantity per distinct item, in
/// deterministic (sorted) order. Duplicate lines cannot cause two partial
/// subtractions: each item is decremented exactly once, by the summed
/// quantity.
pub fn coalesce_items(items: &[(String, u64)]) -> BTreeMap<String, u64> {
    let mut quantities: BTreeMap<String, u64> = BTreeMap::new();
    for (item_id, quantity) in items {
        *quantities.entry(item_id.clone()).or_default() += quantity;
    }
    quantities
}

/// Execute the checkout saga for one order. Runs to completion regardless
/// of the caller's connection; the handler spawns this as its own task.
pub async fn run_checkout(
    state: Arc<ServiceState>,
    order_id: String,
    referrer: Option<String>,
) -> Result<CheckoutOutcome, ApiError> {
    let correlation_id = Uuid::new_v4();
    let this_url = state.client.url(&format!("/orders/checkout/{order_id}"));
    debug!("Checking out {order_id}");

    let key = state.client.mint_key().await?;
    state.wal.append(
        &key,
        &LogRecord::<OrderValue>::received(
            correlation_id,
            LogStatus::Pending,
            Some(order_id.clone()),
            referrer.clone(),
            Some(this_url.clone()),
        ),
    )?;

    let Some(order) = state.store.get::<OrderValue>(&order_id)? else {
        let key = state.client.mint_key().await?;
        state.wal.append(
            &key,
            &LogRecord::<OrderValue>::sent(
                correlation_id,
                LogStatus::Failure,
                Some(order_id.clone()),
                Some(this_url),
                referrer,
            ),
        )?;
        return Err(ApiError::with_log(
            ServiceError::NotFound(format!("Order: {order_id} not found")),
            correlation_id,
        ));
    };
    let old_order = order.clone();

    // One atomic decrement per distinct item.
    let quantities = coalesce_items(&order.items);

    // Subtractions already confirmed by the stock service, for rollback.
    let mut removed: Vec<(String, u64)> = Vec::new();

    for (item_id, quantity) in &quantities {
        let url = state
            .client
            .url_with_log_id(&format!("/stock/subtract/{item_id}/{quantity}"), correlation_id);
        let reply = state.client.post(&url).await;
        let ok = matches!(&reply, Ok(r) if r.ok());

        let key = state.client.mint_key().await?;
        state.wal.append(
            &key,
            &LogRecord::<OrderValue>::received(
                correlation_id,
                if ok { LogStatus::Success } else { LogStatus::Failure },
                Some(item_id.clone()),
                Some(url),
                Some(this_url.clone()),
            ),
        )?;

        if !ok {
            if !rollback_stock(&state, &removed, correlation_id, &this_url).await? {
                // No terminal record on purpose: the chain stays
                // unfinished so the sweeper retries the missing adds.
                return Err(ApiError::with_log(
                    ServiceError::Network(
                        "Stock rollback incomplete; recovery will finish it".to_string(),
                    ),
                    correlation_id,
                ));
            }
            let key = state.client.mint_key().await?;
            state.wal.append(
                &key,
                &LogRecord::<OrderValue>::sent(
                    correlation_id,
                    LogStatus::Failure,
                    Some(order_id.clone()),
                    Some(this_url),
                    referrer,
                ),
            )?;
            return Err(ApiError::with_log(
                ServiceError::Underflow(format!("OutOfStock:{item_id}")),
                correlation_id,
            ));
        }
        removed.push((item_id.clone(), *quantity));
    }

    let pay_url = state.client.url_with_log_id(
        &format!("/payment/pay/{}/{}", order.user_id, order.total_cost),
        correlation_id,
    );
    let pay_reply = state.client.post(&pay_url).await;
    let paid_ok = matches!(&pay_reply, Ok(r) if r.ok());

    let key = state.client.mint_key().await?;
    state.wal.append(
        &key,
        &LogRecord::<OrderValue>::received(
            correlation_id,
            if paid_ok { LogStatus::Success } else { LogStatus::Failure },
            Some(order.user_id.clone()),
            Some(pay_url),
            Some(this_url.clone()),
        ),
    )?;

    if !paid_ok {
        if !rollback_stock(&state, &removed, correlation_id, &this_url).await? {
            return Err(ApiError::with_log(
                ServiceError::Network(
                    "Stock rollback incomplete; recovery will finish it".to_string(),
                ),
                correlation_id,
            ));
        }
        let key = state.client.mint_key().await?;
        state.wal.append(
            &key,
            &LogRecord::<OrderValue>::sent(
                correlation_id,
                LogStatus::Failure,
                Some(order_id.clone()),
                Some(this_url),
                referrer,
            ),
        )?;
        return Err(ApiError::with_log(
            ServiceError::Underflow("OutOfCredit".to_string()),
            correlation_id,
        ));
    }

    // Stock and credit have moved; the order row is now the single source
    // of truth for paid-ness. Commit it atomically with its Update record.
    let mut paid_order = order;
    paid_order.paid = true;

    let update_key = state.client.mint_key().await?;
    let update_record = LogRecord::update(
        correlation_id,
        order_id.clone(),
        old_order,
        paid_order.clone(),
    );
    let commit = state.store.commit_atomic(&[
        (update_key.as_str(), KvStore::encode(&update_record)?),
        (order_id.as_str(), KvStore::encode(&paid_order)?),
    ]);
    if let Err(e) = commit {
        let key = state.client.mint_key().await?;
        state.wal.append(
            &key,
            &LogRecord::<OrderValue>::sent(
                correlation_id,
                LogStatus::Failure,
                Some(order_id.clone()),
                Some(this_url),
                referrer,
            ),
        )?;
        return Err(ApiError::with_log(ServiceError::Store(e), correlation_id));
    }

    let key = state.client.mint_key().await?;
    state.wal.append(
        &key,
        &LogRecord::<OrderValue>::sent(
            correlation_id,
            LogStatus::Success,
            Some(order_id.clone()),
            Some(this_url),
            referrer,
        ),
    )?;

    debug!("Checkout successful");
    Ok(CheckoutOutcome {
        log_id: correlation_id,
    })
}

/// Re-add every confirmed subtraction. A failed add does not stop the
/// loop; it flips the return value so the caller leaves the chain
/// unfinished for the sweeper.
async fn rollback_stock(
    state: &ServiceState,
    removed: &[(String, u64)],
    correlation_id: Uuid,
    this_url: &str,
) -> Result<bool, ApiError> {
    let mut all_ok = true;
    for (item_id, quantity) in removed {
        let url = state
            .client
            .url_with_log_id(&format!("/stock/add/{item_id}/{quantity}"), correlation_id);
        let reply = state.client.post(&url).await;
        let ok = matches!(&reply, Ok(r) if r.ok());

        let key = state.client.mint_key().await?;
        state.wal.append(
            &key,
            &LogRecord::<OrderValue>::received(
                correlation_id,
                if ok { LogStatus::Success } else { LogStatus::Failure },
                Some(item_id.clone()),
                Some(url),
                Some(this_url.to_string()),
            ),
        )?;

        if !ok {
            warn!("Rollback add failed for item {item_id}; sweeper will retry");
            all_ok = false;
        }
    }
    Ok(all_ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coalesce_sums_duplicate_items() {
        let items = vec![
            ("b".to_string(), 2),
            ("a".to_string(), 1),
            ("b".to_string(), 3),
        ];
        let coalesced = coalesce_items(&items);
        assert_eq!(coalesced.len(), 2);
        assert_eq!(coalesced["a"], 1);
        assert_eq!(coalesced["b"], 5);
        // Deterministic iteration order.
        let keys: Vec<&String> = coalesced.keys().collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn test_coalesce_empty_order() {
        assert!(coalesce_items(&[]).is_empty());
    }
}
