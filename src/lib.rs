//! Reliable messaging for domain events
//!
//! Producers publish with explicit delivery guarantees; consumers validate,
//! process, retry and dead-letter what they receive. See [`messaging`] for
//! the core API and [`api`] for the ops HTTP surface served by `relayd`.

pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod messaging;

pub use config::Config;
pub use error::{AppError, Result};
