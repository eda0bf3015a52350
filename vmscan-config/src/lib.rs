//! Configuration loading for the vmscan orchestrator.
//!
//! Settings come from, in increasing precedence: built-in defaults, a TOML or
//! JSON file (`VMSCAN_CONFIG_PATH`, inline `VMSCAN_CONFIG_JSON` or a
//! `vmscan.toml` next to the binary), then individual `VMSCAN_*` variables.
//! A `.env` file is read first when present.

pub mod env;
pub mod error;
pub mod settings;
pub mod util;

pub use error::ConfigLoadError;
pub use settings::{
    BackendSettings, ProviderSettings, Settings, SettingsLoad, SettingsSource,
};
