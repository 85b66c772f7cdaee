//! netdiag gateway: WebSocket sessions over the tool layer
//!
//! A client opens `/ws`, sends JSON requests naming a tool and a target, and
//! receives that tool's output line by line as it runs. The HTTP routes and
//! the server bootstrap live here; validation and process handling live in
//! `netdiag-tools`.

pub mod config;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod rate_limit;
pub mod server;
pub mod session;

pub use error::TransportError;
pub use manager::SessionManager;
pub use metrics::{Metrics, MetricsSnapshot};
pub use server::{router, AppState};
pub use session::{Frame, SessionConfig, SessionEnd, SessionState};
