//! HTTP query API and live span streaming for traced.

pub mod server;

pub use server::live::{Broadcaster, Hub, LiveError, Subscription};
pub use server::{router, serve, AppState};
