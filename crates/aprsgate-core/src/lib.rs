//! Core domain + application logic for the Telegram to APRS-IS gateway.
//!
//! This crate is framework-agnostic. Telegram and the APRS-IS socket live
//! behind ports (traits) implemented in adapter crates.

pub mod aprs;
pub mod commands;
pub mod config;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod logging;
pub mod messaging;
pub mod ports;
pub mod relay;
pub mod security;
pub mod store;
pub mod tracking;

pub use errors::{Error, Result};
