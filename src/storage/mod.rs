//! Storage Layer
//!
//! Persistence and recovery for a single service. Each service owns one
//! sled database in which entity records (UUID keys) and write-ahead log
//! records (`log:`-prefixed keys) share the key space; writers rely on the
//! prefix invariant rather than a lock.
//!
//! ## Components
//!
//! ### Key-Value Store (`kv.rs`)
//! Typed get/put/delete over sled plus `commit_atomic`, the pipelined
//! commit coupling an entity mutation with its log record — both land or
//! neither does.
//!
//! ### Log Records (`log_record.rs`)
//! The record sum type (`Create`/`Update`/`Delete`/`Sent`/`Received`), the
//! 20-digit wall-clock stamp format, and key-timestamp parsing.
//!
//! ### Write-Ahead Log (`wal.rs`)
//! Append and query operations over the log family: whole-family listing
//! for the operational endpoints, windowed-and-grouped views for the
//! sweeper.
//!
//! ### Recovery Sweeper (`sweeper.rs`)
//! Groups windowed records by correlation id, detects unfinished requests,
//! and either reverts their entity writes (non-checkout) or completes
//! their outstanding stock compensations (checkout).

pub mod kv;
pub mod log_record;
pub mod sweeper;
pub mod wal;

// Re-export commonly used types
pub use kv::KvStore;
pub use log_record::{LogKind, LogRecord, LogStatus};
pub use sweeper::{sweep, SweepReport};
pub use wal::Wal;
