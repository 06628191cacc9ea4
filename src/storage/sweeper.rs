//! Recovery Sweeper
//!
//! Rolls partially-completed requests back to a consistent state by
//! replaying the write-ahead log. Runs on every service at startup and on
//! demand via `fault_tolerance/<min_diff>`.
//!
//! ## Algorithm
//!
//! 1. Collect log records whose key timestamp lies within the look-back
//!    window, grouped by correlation id and sorted by dateTime.
//! 2. A group whose last record is `Sent` with `Success`/`Failure` finished
//!    cleanly: leave it alone.
//! 3. A group whose newest record is younger than the quiescence threshold
//!    may still have a live handler appending to it: skip it this pass.
//! 4. Otherwise the group is unfinished:
//!    - **Checkout-shaped** (any endpoint mentions `checkout`): the stock
//!      and credit movements recorded by peers are real, so entity writes
//!      are never reverted here. Instead, complete the compensations the
//!      saga still owes: retry every `stock/add` that failed mid-rollback,
//!      and — only if the group holds no `Update` record, i.e. the
//!      `paid=true` commit never landed — re-post the inverse `stock/add`
//!      for every confirmed `stock/subtract` without a successful add on
//!      record. Each hop is counted once, bounded retries, and every hop
//!      that lands is logged before the next is attempted; if an add will
//!      not go through, the group is left for the next pass, which retries
//!      only the hops still outstanding.
//!    - **Non-checkout**: walk the records newest-first, deleting created
//!      entities and restoring updated entities to their `old_value`
//!      snapshots, then delete the group's records.
//!
//! Both paths are idempotent: delete-on-missing and set-to-old are
//! naturally so, and compensation adds are deduplicated per hop via the
//! log trail before any are posted.

use std::collections::HashSet;

use chrono::{Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::app_state::ServiceState;
use crate::error::ServiceError;
use crate::storage::log_record::{key_timestamp, parse_stamp, LogKind, LogRecord, LogStatus};
use crate::storage::wal::KeyedRecord;

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct SweepReport {
    pub groups_examined: usize,
    pub groups_finished: usize,
    pub groups_skipped: usize,
    pub groups_swept: usize,
    pub groups_deferred: usize,
    pub records_deleted: usize,
    pub compensations_posted: usize,
}

/// One recovery pass over the service's log, bounded to records minted in
/// the last `min_diff` minutes.
pub async fn sweep<V>(state: &ServiceState, min_diff: i64) -> Result<SweepReport, ServiceError>
where
    V: Serialize + DeserializeOwned + Send,
{
    let now = Utc::now();
    let quiescence = Duration::seconds(state.config.recovery.quiescence_secs);
    let groups = state.wal.grouped::<V>(now, min_diff)?;

    let mut report = SweepReport::default();
    for (correlation_id, records) in groups {
        report.groups_examined += 1;

        let Some((_, last)) = records.last() else {
            continue;
        };
        if last.is_terminal() {
            report.groups_finished += 1;
            continue;
        }

        // A live handler may still be appending to a fresh group; only
        // quiescent groups are eligible.
        let newest = parse_stamp(&last.date_time)
            .or_else(|| records.last().and_then(|(key, _)| key_timestamp(key)));
        if let Some(newest) = newest {
            if now - newest < quiescence {
                report.groups_skipped += 1;
                continue;
            }
        }

        if is_checkout_group(&records) {
            sweep_checkout_group(state, correlation_id, &records, &mut report).await?;
        } else {
            sweep_plain_group(state, &records, &mut report)?;
            info!("🧹 Rolled back unfinished request {correlation_id}");
        }
    }
    Ok(report)
}

fn is_checkout_group<V>(records: &[KeyedRecord<V>]) -> bool {
    records.iter().any(|(_, record)| {
        record.from_url().is_some_and(|url| url.contains("checkout"))
            || record.to_url().is_some_and(|url| url.contains("checkout"))
    })
}

/// Reverse entity writes of a non-checkout group, then delete its records.
fn sweep_plain_group<V>(
    state: &ServiceState,
    records: &[KeyedRecord<V>],
    report: &mut SweepReport,
) -> Result<(), ServiceError>
where
    V: Serialize,
{
    for (key, record) in records.iter().rev() {
        match &record.kind {
            LogKind::Create { entity_id, .. } => {
                state.store.delete(entity_id)?;
            }
            LogKind::Update {
                entity_id,
                old_value,
                ..
            } => {
                state.store.put(entity_id, old_value)?;
            }
            _ => {}
        }
        state.wal.delete(key)?;
        report.records_deleted += 1;
    }
    report.groups_swept += 1;
    Ok(())
}

/// Complete the stock compensations an unfinished checkout still owes.
/// The order row itself is never reverted: either `paid=true` committed
/// (and stock and credit already moved to justify it), or the order will
/// simply read as unpaid.
///
/// Every hop that goes through is recorded to the log before the next hop
/// is attempted. If a later hop then defers the group, the re-run rebuilds
/// its owed set from disk and sees the earlier hop as already compensated,
/// so no add is ever posted twice across passes.
async fn sweep_checkout_group<V>(
    state: &ServiceState,
    correlation_id: Uuid,
    records: &[KeyedRecord<V>],
    report: &mut SweepReport,
) -> Result<(), ServiceError>
where
    V: Serialize,
{
    // An Update record means the paid=true commit landed: the stock and
    // credit movements are justified, so confirmed subtracts are not owed
    // back. Without it the checkout died before committing and every
    // confirmed subtract must be undone.
    let committed = records
        .iter()
        .any(|(_, record)| matches!(record.kind, LogKind::Update { .. }));

    // Hops that already have a confirmed compensating add.
    let mut compensated: HashSet<String> = HashSet::new();
    for (_, record) in records {
        if record.status() == Some(LogStatus::Success) {
            if let Some(hop) = record.from_url().and_then(|url| hop_suffix(url, "/stock/add/")) {
                compensated.insert(hop.to_string());
            }
        }
    }

    // Hops still owing an add: confirmed subtracts without a confirmed
    // add, and adds that failed mid-rollback. Each hop is queued once.
    let mut queued: HashSet<String> = HashSet::new();
    let mut pending: Vec<String> = Vec::new();
    for (_, record) in records.iter().rev() {
        let (Some(status), Some(url)) = (record.status(), record.from_url()) else {
            continue;
        };
        let owed = match status {
            LogStatus::Failure => hop_suffix(url, "/stock/add/"),
            LogStatus::Success if !committed => hop_suffix(url, "/stock/subtract/"),
            _ => None,
        };
        if let Some(hop) = owed {
            if !compensated.contains(hop) && queued.insert(hop.to_string()) {
                pending.push(hop.to_string());
            }
        }
    }

    let max_attempts = state.config.recovery.max_compensation_attempts;
    let mut progress_keys: Vec<String> = Vec::new();
    for hop in &pending {
        let url = state
            .client
            .url_with_log_id(&format!("/stock/add/{hop}"), correlation_id);
        let mut succeeded = false;
        for _ in 0..max_attempts {
            match state.client.post(&url).await {
                Ok(reply) if reply.ok() => {
                    succeeded = true;
                    break;
                }
                Ok(reply) => {
                    warn!("Compensation add for {hop} rejected with status {}", reply.status);
                }
                Err(e) => {
                    warn!("Compensation add for {hop} failed: {e}");
                }
            }
        }
        if !succeeded {
            // Leave the group's records for the next pass; hops recorded
            // above stay on disk so only the outstanding ones are retried.
            warn!("Deferring checkout group {correlation_id}: compensation for {hop} not through");
            report.groups_deferred += 1;
            return Ok(());
        }
        // Record the landed hop before attempting the next one, so a
        // deferred group never re-posts it on a later pass.
        let key = state.client.mint_key().await?;
        state.wal.append(
            &key,
            &LogRecord::<V>::received(
                correlation_id,
                LogStatus::Success,
                None,
                Some(url),
                None,
            ),
        )?;
        progress_keys.push(key);
        report.compensations_posted += 1;
    }

    for (key, _) in records {
        state.wal.delete(key)?;
        report.records_deleted += 1;
    }
    for key in &progress_keys {
        state.wal.delete(key)?;
    }
    report.groups_swept += 1;
    info!("🧹 Completed compensations for checkout {correlation_id}");
    Ok(())
}

/// Item/quantity path suffix of a stock hop URL, query stripped:
/// `http://gw/stock/subtract/i1/3?log_id=..` → `i1/3`.
fn hop_suffix<'a>(url: &'a str, marker: &str) -> Option<&'a str> {
    let (_, rest) = url.split_once(marker)?;
    rest.split('?').next().filter(|suffix| !suffix.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        stock: u64,
        price: u64,
    }

    fn test_state() -> (std::sync::Arc<ServiceState>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.data_dir = temp_dir.path().to_string_lossy().to_string();
        config.recovery.quiescence_secs = 0;
        let state = ServiceState::new(&config, "sweeper-test").unwrap();
        (state, temp_dir)
    }

    fn append(state: &ServiceState, minter: &crate::ids::KeyMinter, record: &LogRecord<Item>) {
        state.wal.append(&minter.mint(), record).unwrap();
    }

    #[tokio::test]
    async fn test_finished_group_is_untouched() {
        let (state, _temp_dir) = test_state();
        let minter = crate::ids::KeyMinter::new();
        let corr = Uuid::new_v4();

        state.store.put("item-1", &Item { stock: 5, price: 2 }).unwrap();
        append(&state, &minter, &LogRecord::received(corr, LogStatus::Pending, None, None, None));
        append(
            &state,
            &minter,
            &LogRecord::update(corr, "item-1".into(), Item { stock: 4, price: 2 }, Item { stock: 5, price: 2 }),
        );
        append(&state, &minter, &LogRecord::sent(corr, LogStatus::Success, None, None, None));

        let report = sweep::<Item>(&state, 5).await.unwrap();
        assert_eq!(report.groups_finished, 1);
        assert_eq!(report.groups_swept, 0);
        assert_eq!(state.wal.count().unwrap(), 3);
        assert_eq!(
            state.store.get::<Item>("item-1").unwrap(),
            Some(Item { stock: 5, price: 2 })
        );
    }

    #[tokio::test]
    async fn test_unfinished_update_is_reverted() {
        let (state, _temp_dir) = test_state();
        let minter = crate::ids::KeyMinter::new();
        let corr = Uuid::new_v4();

        // Crash between the pipelined commit and the terminal Sent record:
        // the entity holds the new value, the log holds no terminal record.
        state.store.put("item-1", &Item { stock: 9, price: 2 }).unwrap();
        append(&state, &minter, &LogRecord::received(corr, LogStatus::Pending, None, None, None));
        append(
            &state,
            &minter,
            &LogRecord::update(corr, "item-1".into(), Item { stock: 5, price: 2 }, Item { stock: 9, price: 2 }),
        );

        let report = sweep::<Item>(&state, 5).await.unwrap();
        assert_eq!(report.groups_swept, 1);
        assert_eq!(report.records_deleted, 2);
        assert_eq!(state.wal.count().unwrap(), 0);
        assert_eq!(
            state.store.get::<Item>("item-1").unwrap(),
            Some(Item { stock: 5, price: 2 })
        );
    }

    #[tokio::test]
    async fn test_unfinished_create_is_deleted() {
        let (state, _temp_dir) = test_state();
        let minter = crate::ids::KeyMinter::new();
        let corr = Uuid::new_v4();

        state.store.put("item-1", &Item { stock: 0, price: 7 }).unwrap();
        append(&state, &minter, &LogRecord::received(corr, LogStatus::Pending, None, None, None));
        append(
            &state,
            &minter,
            &LogRecord::create(corr, "item-1".into(), Item { stock: 0, price: 7 }),
        );

        sweep::<Item>(&state, 5).await.unwrap();
        assert_eq!(state.store.get::<Item>("item-1").unwrap(), None);
        assert_eq!(state.wal.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let (state, _temp_dir) = test_state();
        let minter = crate::ids::KeyMinter::new();
        let corr = Uuid::new_v4();

        state.store.put("item-1", &Item { stock: 9, price: 2 }).unwrap();
        append(
            &state,
            &minter,
            &LogRecord::update(corr, "item-1".into(), Item { stock: 5, price: 2 }, Item { stock: 9, price: 2 }),
        );

        sweep::<Item>(&state, 5).await.unwrap();
        let second = sweep::<Item>(&state, 5).await.unwrap();
        assert_eq!(second.groups_examined, 0);
        assert_eq!(
            state.store.get::<Item>("item-1").unwrap(),
            Some(Item { stock: 5, price: 2 })
        );
    }

    #[tokio::test]
    async fn test_fresh_group_is_skipped_by_quiescence() {
        let (state, _temp_dir) = test_state();
        let minter = crate::ids::KeyMinter::new();
        let corr = Uuid::new_v4();

        // Raise the quiescence threshold so a just-written group is hot.
        let mut config = state.config.clone();
        config.recovery.quiescence_secs = 300;
        let hot_state = ServiceState {
            config,
            store: state.store.clone(),
            wal: state.wal.clone(),
            client: state.client.clone(),
        };

        state.store.put("item-1", &Item { stock: 9, price: 2 }).unwrap();
        append(&state, &minter, &LogRecord::received(corr, LogStatus::Pending, None, None, None));

        let report = sweep::<Item>(&hot_state, 5).await.unwrap();
        assert_eq!(report.groups_skipped, 1);
        assert_eq!(state.wal.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_checkout_group_without_owed_hops_only_deletes_records() {
        let (state, _temp_dir) = test_state();
        let minter = crate::ids::KeyMinter::new();
        let corr = Uuid::new_v4();

        state.store.put("order-1", &Item { stock: 0, price: 0 }).unwrap();
        append(
            &state,
            &minter,
            &LogRecord::received(
                corr,
                LogStatus::Pending,
                None,
                None,
                Some("http://gw/orders/checkout/order-1".into()),
            ),
        );

        let report = sweep::<Item>(&state, 5).await.unwrap();
        assert_eq!(report.groups_swept, 1);
        assert_eq!(report.compensations_posted, 0);
        assert_eq!(state.wal.count().unwrap(), 0);
        // The entity row is not touched by the checkout path.
        assert!(state.store.get::<Item>("order-1").unwrap().is_some());
    }

    #[test]
    fn test_hop_suffix_extraction() {
        assert_eq!(
            hop_suffix("http://gw/stock/add/i1/3?log_id=abc", "/stock/add/"),
            Some("i1/3")
        );
        assert_eq!(
            hop_suffix("http://gw/stock/subtract/i1/3", "/stock/subtract/"),
            Some("i1/3")
        );
        assert_eq!(hop_suffix("http://gw/stock/find/i1", "/stock/add/"), None);
    }
}
