//! notification-service library crate.
//!
//! Exposes the delivery pipeline for embedding and integration testing.

pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod notification;
pub mod utils;

pub use error::{Error, Result};
