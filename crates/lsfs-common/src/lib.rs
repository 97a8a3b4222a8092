//! lsfs Common - Shared types and utilities
//!
//! This crate provides the error type, identifiers, timestamps and
//! configuration shared by the lsfs storage crates and tools.

pub mod config;
pub mod error;
pub mod types;

pub use config::AtimeConfig;
pub use error::{Error, Result};
pub use types::*;
