//! # tandem-core
//!
//! Foundation types shared by every tandem crate:
//!
//! - **Branded IDs**: [`ConnectionId`] as a newtype for type safety
//! - **Errors**: [`PairingError`], [`ClaimError`], [`ProtocolError`] via `thiserror`
//! - **Wire protocol**: [`ClientCommand`] (inbound), [`ControlSignal`] and
//!   [`Envelope`] (outbound)
//! - **Logging**: `tracing` subscriber initialization
//! - **Metrics**: metric name constants used across crates

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod metrics;
pub mod protocol;

pub use errors::{ClaimError, PairingError, ProtocolError};
pub use ids::ConnectionId;
pub use protocol::{ClientCommand, ControlSignal, Envelope};
