#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod error;
pub mod filter;
pub mod metric;

pub use config::{Config, DatabaseConfig, IndexConfig, Strategy};
pub use error::{Result, VecliteError};
pub use filter::{AttrPayload, AttrRecord, AttrValue, Filter, FilterExpr};
pub use metric::Metric;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Maximum size of a per-record metadata blob.
pub const MAX_META_BYTES: usize = 64 * 1024;

/// Cooperative cancellation flag, observed at suspension points of
/// long-running save/rebalance operations.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
