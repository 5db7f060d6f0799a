pub mod aggregate;
pub mod assignment;
pub mod events;
pub mod shared;

pub use aggregate::*;
pub use assignment::*;
pub use events::*;
pub use shared::*;
