//! Physical port information.

mod port;

pub use self::port::*;
