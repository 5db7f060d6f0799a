pub mod backoff;
pub mod coordinator;
pub mod ports;
pub mod result_buffer;
pub mod session;

pub use backoff::*;
pub use coordinator::*;
pub use ports::*;
pub use result_buffer::*;
pub use session::*;
