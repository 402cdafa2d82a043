//! HTTP surface of the proxy

mod router;
mod server;

pub use router::{AppState, create_router};
pub use server::ProxyServer;
