pub mod control;
pub mod forwarder;

pub use control::*;
pub use forwarder::*;
