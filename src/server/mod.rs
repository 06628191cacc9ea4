//! Server Module
//!
//! Listener setup and the serve loop. Routing itself lives with the
//! services; this module assembles the selected routers under their
//! canonical prefixes and owns startup concerns (port search, the
//! boot-time recovery sweep, graceful shutdown).

pub mod server;

pub use server::{build, run_server_with_duration, Gateway, ServiceSelection};
