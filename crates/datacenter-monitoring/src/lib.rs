//! Observability for the data center runtime.
//!
//! - `tracing`: console output setup (human or JSON) driven by configuration
//! - `log_layer`: a tracing layer that turns log events into [`LogEntry`]
//!   records for the log history and the live log stream
//!
//! [`LogEntry`]: datacenter_types::LogEntry

pub mod log_layer;
pub mod tracing;

pub use log_layer::{level_filter, LogForwardLayer, LogSinkFn};
pub use self::tracing::{init_tracing, TracingConfig};
