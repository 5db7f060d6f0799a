pub mod diagnostics;
pub mod journal;
pub mod primenet;
pub mod resources;
pub mod status;
pub mod supervisor;
pub mod work_queue;

pub use journal::*;
