// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-rotary.

/// Errors that can occur while building angle tables or rotating tensors.
#[derive(Debug, thiserror::Error)]
pub enum RopeError {
    /// Tensor operation error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Engine configuration violates an invariant (odd rotary dim, bad
    /// scaling factor, rotary dim larger than the head dim, ...).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Input tensors disagree with each other or with the supplied
    /// offsets / packed metadata.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A resolved angle row lies outside the built cache.
    ///
    /// Indicates a defect in the engine's orchestration, never bad input.
    #[error("angle row {index} outside cache of length {cached_len}")]
    CacheRange {
        /// Offending row index.
        index: usize,
        /// Length of the cache at the time of the lookup.
        cached_len: usize,
    },

    /// `config.json` parsing error.
    #[error("config error: {0}")]
    Config(String),
}

/// Result type alias for candle-rotary operations.
pub type Result<T> = std::result::Result<T, RopeError>;
