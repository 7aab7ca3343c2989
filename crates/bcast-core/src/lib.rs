//! Core domain + dispatch logic for the multi-identity broadcaster.
//!
//! This crate is framework-agnostic. The remote HTTP endpoint and the Telegram
//! control surface live behind ports (traits) implemented in adapter crates.

pub mod accounts;
pub mod classify;
pub mod config;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod messaging;
pub mod progress;
pub mod registry;
pub mod report;
pub mod retry;
pub mod sender;

pub use errors::{Error, Result};
