pub mod artifacts;
pub mod error;
pub mod project;
pub mod record;
pub mod store;
mod table;

pub use error::StoreError;
pub use record::{SessionRecord, SessionStatus, SessionType};
pub use store::SessionStore;
