//! Wire types for the proxy's HTTP surface and the policy gateway

mod messages;

pub use messages::*;
