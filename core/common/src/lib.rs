//! Common utilities and types shared across Tether crates.
//!
//! This module provides the request/response model and the error type used
//! by storage, transport, and the offline sync layer.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{ApiRequest, ApiResponse, HttpMethod};
