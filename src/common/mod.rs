pub mod aggregate;
pub mod error;
pub mod event;
pub mod snapshot;

pub use aggregate::*;
pub use error::*;
pub use event::*;
pub use snapshot::*;
