//! Cache metrics (feature `metrics`).
//!
//! Recording and reading are kept apart: the cache writes through
//! [`ResourceCacheMetricsRecorder`] while it holds its monitor, and readers take
//! a [`ResourceCacheMetricsSnapshot`] through [`MetricsSnapshotProvider`].

pub mod metrics_impl;
pub mod snapshot;
pub mod traits;

pub use metrics_impl::ResourceCacheMetrics;
pub use snapshot::ResourceCacheMetricsSnapshot;
pub use traits::{MetricsSnapshotProvider, ResourceCacheMetricsRecorder};
