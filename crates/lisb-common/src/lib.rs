//! LiSB Common - Shared types and configuration
//!
//! This crate provides the configuration model, error type and the small
//! shared vocabulary used by every LiSB component.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::{FilterName, Verdict};
