//! Gateway server implementation

pub mod auth;
pub mod proxy;
mod router;
mod server;

pub use auth::{AuthError, AuthState, auth_middleware};
pub use proxy::{ProxyError, ReverseProxy, RouteTable, RouteTarget, Upstream};
pub use router::create_router;
pub use server::Gateway;
