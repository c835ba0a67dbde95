//! Live progress distribution.
//!
//! One [`ProgressHub`] per machine owns the loopback port and streams
//! progress events to viewers over SSE; every other instance finds the port
//! taken and forwards its events to that hub's ingest endpoint.

mod forwarder;
pub mod hub;
pub mod operation;
pub mod server;
pub mod viewers;

pub use hub::{HubConfig, HubRole, ProgressHub};
pub use operation::OperationReporter;
pub use viewers::{ViewerId, ViewerRegistry};
