//! # tandem-settings
//!
//! Configuration management with layered sources for the tandem server.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`TandemSettings::default()`]
//! 2. **User file**: `~/.tandem/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `TANDEM_*` overrides (highest priority)
//!
//! CLI flags in the binary are applied on top of the loaded value.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
