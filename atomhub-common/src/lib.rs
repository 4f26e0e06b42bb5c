//! # atomhub Common Library
//!
//! Shared code for the atomhub responder service:
//! - Common error types
//! - Configuration loading
//! - Event bus (observability side-channel)
//! - Database initialization and schema

pub mod config;
pub mod db;
pub mod error;
pub mod events;

pub use error::{Error, Result};
