//! Shared configuration types for qgate.
//!
//! This crate intentionally does **not** depend on the relay core or any HTTP
//! machinery; it only carries the settings snapshot that every layer reads.

mod settings;

pub use settings::{RelaySettings, RelaySettingsPatch, SettingsError};
