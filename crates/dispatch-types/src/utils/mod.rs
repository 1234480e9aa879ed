//! Formatting and time helpers shared across crates.

pub mod formatting;
pub mod helpers;

pub use formatting::truncate_id;
pub use helpers::{current_timestamp, new_token};
