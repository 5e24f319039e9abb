//! Administrative control surface.
//!
//! [`AdminService`] holds the operations; the router exposes them over
//! HTTP for operators and automation.

mod auth;
mod router;
mod server;
mod service;

pub use router::{build_router, AppState};
pub use server::AdminServer;
pub use service::{
    AdminService, ConfigUpdate, ConsumerUsage, GlobalStatus, IdentityStatus, WindowStatus,
    ADMIN_STORE_TIMEOUT, DEFAULT_TOP_CONSUMERS,
};
