//! LEED Common - Shared types and utilities
//!
//! This crate provides the error type, configuration structures and the
//! identifiers shared by the storage engine and the node layer.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
