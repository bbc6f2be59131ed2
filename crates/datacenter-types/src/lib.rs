//! Shared types for the data center runtime.
//!
//! Everything that crosses a crate boundary or goes over the wire lives here:
//! log records, the aggregate service state, module snapshots, events carried
//! by the in-process bus and the HTTP response envelope.

pub mod api;
pub mod events;
pub mod logs;
pub mod state;

pub use api::*;
pub use events::*;
pub use logs::*;
pub use state::*;
