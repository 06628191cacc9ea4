//! Write-Ahead Log Records
//!
//! Every service records its progress through a request as a chain of log
//! records sharing one correlation id. The chain doubles as an audit trail
//! and as the input to crash recovery: a request that finished cleanly ends
//! in a terminal `Sent` record, and any chain that does not is rolled back
//! (or has its compensations completed) by the sweeper.
//!
//! ## Record shape
//!
//! A record is a correlation id, a wall-clock stamp, and a kind:
//! - `Create` — an entity came into existence; carries the new value
//! - `Update` — an entity changed; carries full before/after snapshots so
//!   the update can be reversed from the record alone
//! - `Delete` — an entity was removed
//! - `Sent` — a reply left this service; `Success`/`Failure` status here
//!   marks the chain as finished
//! - `Received` — a request or a peer reply arrived; `Pending` opens a
//!   chain, `Success`/`Failure` records a peer's verdict mid-saga
//!
//! `Sent` and `Received` carry the two endpoint URLs of the hop they
//! describe; the sweeper uses those URLs to recognize checkout chains and
//! to re-issue failed `stock/add` compensations.
//!
//! ## Key format
//!
//! Records are stored under keys minted by the id service:
//! `log:<YYYYMMDDhhmmssuuuuuu><counter>`. The 20-digit wall-clock prefix
//! makes lexicographic key order chronological, which is what lets the
//! sweeper scan a bounded look-back window with a plain prefix scan.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix shared by every log key; entity keys (UUIDs) never collide with it.
pub const LOG_KEY_PREFIX: &str = "log:";

/// Wall-clock format embedded in keys and records: `YYYYMMDDhhmmssuuuuuu`.
pub const DATE_TIME_FORMAT: &str = "%Y%m%d%H%M%S%6f";

/// Length of a formatted timestamp (4+2+2+2+2+2+6).
pub const DATE_TIME_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStatus {
    Pending,
    Success,
    Failure,
}

/// Per-variant payload of a log record, generic over the owning service's
/// entity value type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogKind<V> {
    Create {
        entity_id: String,
        new_value: V,
    },
    Update {
        entity_id: String,
        old_value: V,
        new_value: V,
    },
    Delete {
        entity_id: String,
    },
    Sent {
        status: LogStatus,
        entity_id: Option<String>,
        from_url: Option<String>,
        to_url: Option<String>,
    },
    Received {
        status: LogStatus,
        entity_id: Option<String>,
        from_url: Option<String>,
        to_url: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord<V> {
    pub correlation_id: Uuid,
    pub date_time: String,
    pub kind: LogKind<V>,
}

impl<V> LogRecord<V> {
    pub fn new(correlation_id: Uuid, kind: LogKind<V>) -> Self {
        Self {
            correlation_id,
            date_time: now_stamp(),
            kind,
        }
    }

    pub fn received(
        correlation_id: Uuid,
        status: LogStatus,
        entity_id: Option<String>,
        from_url: Option<String>,
        to_url: Option<String>,
    ) -> Self {
        Self::new(
            correlation_id,
            LogKind::Received {
                status,
                entity_id,
                from_url,
                to_url,
            },
        )
    }

    pub fn sent(
        correlation_id: Uuid,
        status: LogStatus,
        entity_id: Option<String>,
        from_url: Option<String>,
        to_url: Option<String>,
    ) -> Self {
        Self::new(
            correlation_id,
            LogKind::Sent {
                status,
                entity_id,
                from_url,
                to_url,
            },
        )
    }

    pub fn create(correlation_id: Uuid, entity_id: String, new_value: V) -> Self {
        Self::new(
            correlation_id,
            LogKind::Create {
                entity_id,
                new_value,
            },
        )
    }

    pub fn update(correlation_id: Uuid, entity_id: String, old_value: V, new_value: V) -> Self {
        Self::new(
            correlation_id,
            LogKind::Update {
                entity_id,
                old_value,
                new_value,
            },
        )
    }

    /// Status of the record, if its kind carries one.
    pub fn status(&self) -> Option<LogStatus> {
        match &self.kind {
            LogKind::Sent { status, .. } | LogKind::Received { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// A chain whose last record is terminal finished cleanly and must be
    /// left alone by the sweeper.
    pub fn is_terminal(&self) -> bool {
        matches!(
            &self.kind,
            LogKind::Sent {
                status: LogStatus::Success | LogStatus::Failure,
                ..
            }
        )
    }

    pub fn entity_id(&self) -> Option<&str> {
        match &self.kind {
            LogKind::Create { entity_id, .. }
            | LogKind::Update { entity_id, .. }
            | LogKind::Delete { entity_id } => Some(entity_id),
            LogKind::Sent { entity_id, .. } | LogKind::Received { entity_id, .. } => {
                entity_id.as_deref()
            }
        }
    }

    pub fn from_url(&self) -> Option<&str> {
        match &self.kind {
            LogKind::Sent { from_url, .. } | LogKind::Received { from_url, .. } => {
                from_url.as_deref()
            }
            _ => None,
        }
    }

    pub fn to_url(&self) -> Option<&str> {
        match &self.kind {
            LogKind::Sent { to_url, .. } | LogKind::Received { to_url, .. } => to_url.as_deref(),
            _ => None,
        }
    }
}

/// Current wall clock in the 20-character key/record format.
pub fn now_stamp() -> String {
    stamp(Utc::now())
}

pub fn stamp(at: DateTime<Utc>) -> String {
    at.format(DATE_TIME_FORMAT).to_string()
}

/// Parse a 20-character stamp back into a UTC instant.
pub fn parse_stamp(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, DATE_TIME_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Extract the minting instant embedded in a `log:` key.
pub fn key_timestamp(key: &str) -> Option<DateTime<Utc>> {
    let rest = key.strip_prefix(LOG_KEY_PREFIX)?;
    if rest.len() < DATE_TIME_LEN {
        return None;
    }
    parse_stamp(&rest[..DATE_TIME_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Dummy {
        n: u64,
    }

    #[test]
    fn test_stamp_round_trip() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 14, 30, 9).unwrap()
            + chrono::Duration::microseconds(123456);
        let formatted = stamp(at);
        assert_eq!(formatted, "20240305143009123456");
        assert_eq!(formatted.len(), DATE_TIME_LEN);
        assert_eq!(parse_stamp(&formatted), Some(at));
    }

    #[test]
    fn test_key_timestamp() {
        let key = "log:2024030514300912345642";
        let at = key_timestamp(key).unwrap();
        assert_eq!(stamp(at), "20240305143009123456");

        assert!(key_timestamp("no-prefix").is_none());
        assert!(key_timestamp("log:123").is_none());
    }

    #[test]
    fn test_terminal_detection() {
        let corr = Uuid::new_v4();
        let pending: LogRecord<Dummy> =
            LogRecord::received(corr, LogStatus::Pending, None, None, None);
        assert!(!pending.is_terminal());
        assert_eq!(pending.status(), Some(LogStatus::Pending));

        let update = LogRecord::update(corr, "e".into(), Dummy { n: 1 }, Dummy { n: 2 });
        assert!(!update.is_terminal());
        assert_eq!(update.status(), None);

        let sent: LogRecord<Dummy> = LogRecord::sent(corr, LogStatus::Failure, None, None, None);
        assert!(sent.is_terminal());
    }

    #[test]
    fn test_serde_round_trip() {
        let corr = Uuid::new_v4();
        let record = LogRecord::update(corr, "item-1".into(), Dummy { n: 5 }, Dummy { n: 3 });
        let bytes = serde_json::to_vec(&record).unwrap();
        let decoded: LogRecord<Dummy> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.correlation_id, corr);
        match decoded.kind {
            LogKind::Update {
                entity_id,
                old_value,
                new_value,
            } => {
                assert_eq!(entity_id, "item-1");
                assert_eq!(old_value, Dummy { n: 5 });
                assert_eq!(new_value, Dummy { n: 3 });
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn test_stamps_sort_chronologically() {
        let earlier = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let later = earlier + chrono::Duration::microseconds(1);
        assert!(stamp(earlier) < stamp(later));
    }
}
