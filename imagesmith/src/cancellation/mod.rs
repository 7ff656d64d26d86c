//! Structured cancellation and cleanup utilities.
//!
//! This module provides:
//! - CancellationToken for cooperative cancellation at every suspension point
//! - CleanupRegistry for LIFO release of build resources

mod cleanup;
mod token;

pub use cleanup::{CleanupCallback, CleanupRegistry};
pub use token::CancellationToken;
