pub mod event_store;
pub mod file_event_store;
pub mod file_snapshot_store;
pub mod snapshot_store;

pub use event_store::*;
pub use file_event_store::*;
pub use file_snapshot_store::*;
pub use snapshot_store::*;
