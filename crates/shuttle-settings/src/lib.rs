//! # shuttle-settings
//!
//! Configuration for the shuttle broadcast server, loaded in three layers
//! (in priority order):
//! 1. **Compiled defaults**: [`ShuttleSettings::default()`]
//! 2. **Settings file**: `~/.shuttle/settings.json` or an explicit path (deep-merged)
//! 3. **Environment variables**: `SHUTTLE_*` overrides (highest priority)
//!
//! There is no global cache: the binary loads settings once and hands the
//! relevant pieces to each component.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::{
    AuthSettings, DEFAULT_MAX_SUBSCRIBERS_PER_BUS, LoggingSettings, SUPPORTED_ALGORITHMS,
    ServerSettings, ShuttleSettings,
};
