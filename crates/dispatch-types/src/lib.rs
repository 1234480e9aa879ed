//! Common types for the dispatch synchronization workspace.
//!
//! This crate holds the data model shared by every other crate: orders and
//! partners, the order lifecycle state machine, the typed event taxonomy
//! delivered by the sync channel, the persisted snapshot record and the
//! dashboard metrics record. Keeping them here lets the storage, backend,
//! channel and core crates agree on wire formats without depending on each
//! other.

/// API types for the consumer-facing HTTP endpoints.
pub mod api;
/// Access credentials used against the backend and channel.
pub mod credentials;
/// Typed events delivered over the sync channel.
pub mod events;
/// Derived dashboard counters.
pub mod metrics;
/// Order records, line items and the lifecycle state machine.
pub mod order;
/// Delivery partner records.
pub mod partner;
/// Registry trait for self-registering implementations.
pub mod registry;
/// Redacting wrapper for secrets.
pub mod secret_string;
/// Persisted snapshot record.
pub mod snapshot;
/// Storage namespaces.
pub mod storage;
/// Formatting and time helpers.
pub mod utils;
/// Configuration validation types for implementation-specific TOML tables.
pub mod validation;

pub use api::*;
pub use credentials::Credentials;
pub use events::*;
pub use metrics::DashboardMetrics;
pub use order::*;
pub use partner::*;
pub use registry::ImplementationRegistry;
pub use secret_string::SecretString;
pub use snapshot::{Snapshot, SNAPSHOT_SCHEMA_VERSION};
pub use storage::StorageKey;
pub use utils::{current_timestamp, new_token, truncate_id};
pub use validation::*;
