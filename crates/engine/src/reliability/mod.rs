//! Reliability patterns for step execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Retry limit with capped exponential backoff
//! - [`with_timeout`] - Bounded step attempts

mod retry;
mod timeout;

pub use retry::RetryPolicy;
pub use timeout::{with_timeout, TimeoutError};
