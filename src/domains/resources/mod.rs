pub mod grant;
pub mod hardware;
pub mod schedule;

pub use grant::*;
pub use hardware::*;
pub use schedule::*;
