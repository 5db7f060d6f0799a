pub mod alert;
pub mod publisher;
pub mod snapshot;

pub use alert::*;
pub use publisher::*;
pub use snapshot::*;
