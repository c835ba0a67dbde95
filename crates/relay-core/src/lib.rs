//! Shared vocabulary for the relay crates: identifiers, the progress-event
//! model viewers consume, and the error taxonomy every public operation
//! reports through.

pub mod errors;
pub mod ids;
pub mod progress;
pub mod sandbox;

pub use errors::{ErrorKind, ErrorReport, RelayError};
pub use ids::{OperationId, SessionId};
pub use progress::{ProgressEvent, ProgressKind, LIVENESS_WINDOW};
pub use sandbox::SandboxMode;
