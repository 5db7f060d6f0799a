pub mod events;
pub mod ports;
pub mod slot;
pub mod supervisor;

pub use events::*;
pub use ports::*;
pub use slot::*;
pub use supervisor::*;
