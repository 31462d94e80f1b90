//! # consistency-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`ConsistencySettings::default()`]
//! 2. **Settings file**: `~/.consistency/settings.json`, deep-merged over defaults
//! 3. **Environment variables**: `CONSISTENCY_*` overrides
//!
//! Command-line flags are applied on top by the binary.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_path,
};
pub use types::*;
