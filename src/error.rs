// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-align.

/// Errors that can occur while building or running an alignable model.
#[derive(Debug, thiserror::Error)]
pub enum AlignError {
    /// Forward pass or tensor operation error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Configuration error: count mismatches, missing location groups,
    /// unsupported model family, or an intervention point whose module
    /// cannot be located in the model.
    #[error("config error: {0}")]
    Config(String),

    /// Addressing error: a unit location is missing, out of range, or
    /// incompatible with the activation layout.
    #[error("location error: {0}")]
    Location(String),

    /// Call-sequencing error, e.g. a setter fired for a key with no
    /// captured activation.
    #[error("state error: {0}")]
    State(String),

    /// A hooked module call did not carry the expected tensors.
    #[error("hook error: {0}")]
    Hook(String),

    /// Intervention transform failure (shape mismatch, bad subspace).
    #[error("intervention error: {0}")]
    Intervention(String),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for candle-align operations.
pub type Result<T> = std::result::Result<T, AlignError>;
