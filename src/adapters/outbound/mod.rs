pub mod affinity;
pub mod buffered_journal;
pub mod console_journal;
pub mod file_journal;
pub mod http_transport;
pub mod multi_journal;
pub mod noop_journal;
pub mod simulated_kernel;
pub mod worktodo;

pub use affinity::*;
pub use buffered_journal::*;
pub use console_journal::*;
pub use file_journal::*;
pub use http_transport::*;
pub use multi_journal::*;
pub use noop_journal::*;
pub use simulated_kernel::*;
pub use worktodo::*;
