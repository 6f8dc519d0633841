//! Error types for rescache.
//!
//! Nothing on the hot path returns these: misses, reclaimed discardable memory
//! and failed block allocations are reported as `false`/`None`. The types here
//! cover construction-time validation and invariant checks.
//!
//! ## Key Components
//!
//! - [`ConfigError`]: invalid cache configuration (builder / [`CacheConfig`]).
//! - [`KeyError`]: a [`CacheKey`] payload that violates the key layout.
//! - [`InvariantError`]: an internal structure failed `check_invariants`.
//!
//! ## Example Usage
//!
//! ```
//! use rescache::builder::CacheBuilder;
//! use rescache::error::ConfigError;
//!
//! let bad: Result<_, ConfigError> = CacheBuilder::new().count_limit(0).try_build();
//! assert!(bad.unwrap_err().to_string().contains("count"));
//! ```
//!
//! [`CacheConfig`]: crate::builder::CacheConfig
//! [`CacheKey`]: crate::key::CacheKey

use thiserror::Error;

/// Error returned when internal cache invariants are violated.
///
/// Carries a human-readable description of which invariant failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct InvariantError(String);

impl InvariantError {
    #[inline]
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.0
    }
}

/// Error returned when cache configuration parameters are invalid.
///
/// Produced by [`CacheBuilder::try_build`](crate::builder::CacheBuilder::try_build).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ConfigError(String);

impl ConfigError {
    #[inline]
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.0
    }
}

/// Error returned by [`CacheKey::try_new`](crate::key::CacheKey::try_new).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KeyError {
    /// Trailing key bytes must come in whole 32-bit words.
    #[error("key payload is {len} bytes, expected a multiple of 4")]
    UnalignedPayload { len: usize },
}
