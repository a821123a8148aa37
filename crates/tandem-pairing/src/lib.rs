//! # tandem-pairing
//!
//! In-memory pairing engine for anonymous real-time clients.
//!
//! - [`ConnectionRegistry`]: live connections, status and partner, under one lock
//! - [`Matchmaker`]: oldest-waiter-first partner selection with atomic claims
//! - [`Relay`]: forwards application messages to the current partner
//! - [`SessionController`]: the per-connection state machine and driver loop
//! - [`BroadcastHub`]: the separate fan-out mode
//!
//! Transports plug in through a bounded outbound channel and an inbound
//! `Stream` of text frames; nothing here knows about WebSockets.

#![deny(unsafe_code)]

pub mod broadcast;
pub mod connection;
pub mod matchmaker;
pub mod registry;
pub mod relay;
pub mod session;

pub use broadcast::{BroadcastHub, BroadcastReport};
pub use connection::ClientConnection;
pub use matchmaker::Matchmaker;
pub use registry::{ConnectionRegistry, ConnectionSnapshot, ConnectionStatus, RegistryCounts, Removed};
pub use relay::{Relay, RelayOutcome};
pub use session::{SessionConfig, SessionController, SessionEnd};
