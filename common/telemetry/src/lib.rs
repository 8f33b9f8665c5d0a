pub mod metrics;
pub mod signals;
pub mod tracer;

pub use signals::shutdown_signal;
pub use tracer::{init_tracing, shutdown_tracing, OtelConfig, TelemetryError};
