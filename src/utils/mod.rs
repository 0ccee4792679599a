//! # Utility Modules
//!
//! - **Logging**: tracing subscriber setup from [`crate::config::LoggingConfig`]
//! - **Metrics**: atomic counters for sessions and servers

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::{Metrics, MetricsSnapshot};

use crate::error::constants::ERR_LOCK_POISONED;
use std::sync::{Mutex, MutexGuard};

/// Lock a short-lived state mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("{}", ERR_LOCK_POISONED);
        poisoned.into_inner()
    })
}
