//! Repository layer for database access.
//!
//! One trait per table with a SQLx implementation, so the pipeline
//! components can be exercised against in-memory doubles or a real pool.

pub mod dead_letter;
pub mod notification;
pub mod preferences;
pub mod template;

pub use dead_letter::*;
pub use notification::*;
pub use preferences::*;
pub use template::*;
