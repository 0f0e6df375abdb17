//! Dirlog Common - Shared types and utilities
//!
//! This crate provides the id types, error definitions and store
//! configuration used by the namespace store and its tooling.

pub mod config;
pub mod error;
pub mod types;

pub use config::StoreConfig;
pub use error::{Error, Result};
pub use types::*;
