#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]

pub mod api;
pub mod config;
pub mod constants;
pub mod framing;
pub mod hardening;
pub mod health;
pub mod logging;
pub mod main_helper;
pub mod redaction_layer;
pub mod registry;
pub mod relay;
pub mod specs;
pub mod store;
pub mod str_utils;
pub mod streaming;
pub mod types;
pub mod upstream;

pub use types::*;

pub use main_helper::{AppState, Args};
