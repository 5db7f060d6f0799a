pub mod engine;
pub mod storage;

pub use engine::*;
pub use storage::*;
