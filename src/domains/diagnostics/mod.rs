pub mod controller;
pub mod matrix;

pub use controller::*;
pub use matrix::*;
