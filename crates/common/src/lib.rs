//! Shared observability primitives for acmevault.
//!
//! Components never touch global metric state. Instead, each constructor
//! receives an `Arc<dyn MetricsCollector>`:
//!
//! - [`PrometheusCollector`] - owns its own Prometheus registry, used by the binary
//! - [`NoopCollector`] - discards everything, used by tests and one-shot commands
//!
//! [`observability::init_tracing`] installs the process-wide tracing subscriber.

// ============================================================================
// Module Declarations
// ============================================================================

pub mod metrics;
pub mod observability;

// ============================================================================
// Public API Re-exports
// ============================================================================

pub use metrics::{MetricsCollector, MetricsError, NoopCollector, PrometheusCollector};
pub use observability::{init_tracing, LogFormat};
