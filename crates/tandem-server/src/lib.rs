//! # tandem-server
//!
//! Axum HTTP + WebSocket gateway for the tandem pairing engine.
//!
//! - `GET /ws` upgrades into pairing mode ([`tandem_pairing::SessionController`])
//! - `GET /broadcast` upgrades into broadcast mode ([`tandem_pairing::BroadcastHub`])
//! - `GET /health`, `GET /metrics` and `GET /` for operators
//!
//! Each socket gets a writer task, a heartbeat, and a session driver; all
//! of them stop on [`ShutdownCoordinator`] cancellation.

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use server::{AppState, TandemServer};
pub use shutdown::ShutdownCoordinator;
