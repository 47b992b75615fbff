//! Telemetry: structured logging, step spans and metrics.
//!
//! The crate never installs a metrics exporter; embedding applications
//! choose one.

mod logging;
mod metrics;
mod spans;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use self::metrics::{record_acceptance, record_bonus_tokens, record_commit, record_step_failure};
pub use spans::{SpanExt, StepSpan};
