//! Error types for the value model, codecs and serializer registry.

use thiserror::Error;

/// Result type for BSON operations.
pub type BsonResult<T> = Result<T, BsonError>;

/// Errors raised by the codecs and the serializer registry.
///
/// Every error is surfaced synchronously; nothing here is retried because
/// the transformations are deterministic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BsonError {
    /// Malformed binary or JSON input.
    #[error("format error: {0}")]
    Format(String),

    /// A numeric value does not fit the destination type.
    #[error("overflow: {0}")]
    Overflow(String),

    /// A numeric conversion would lose precision.
    #[error("truncation: {0}")]
    Truncation(String),

    /// No serializer or discriminator could be resolved.
    #[error("mapping error: {0}")]
    Mapping(String),

    /// An operation was attempted in a state that does not allow it.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A document exceeded the configured maximum size.
    #[error("document size {size} exceeds maximum of {max} bytes")]
    DocumentTooLarge {
        /// Actual size in bytes.
        size: usize,
        /// Configured maximum.
        max: usize,
    },
}

impl BsonError {
    /// Create a format error.
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format(message.into())
    }

    /// Create an overflow error.
    pub fn overflow(message: impl Into<String>) -> Self {
        Self::Overflow(message.into())
    }

    /// Create a truncation error.
    pub fn truncation(message: impl Into<String>) -> Self {
        Self::Truncation(message.into())
    }

    /// Create a mapping error.
    pub fn mapping(message: impl Into<String>) -> Self {
        Self::Mapping(message.into())
    }

    /// Create an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation(message.into())
    }

    /// Check if this is a format error.
    pub fn is_format_error(&self) -> bool {
        matches!(self, Self::Format(_) | Self::DocumentTooLarge { .. })
    }

    /// Check if this is an overflow error.
    pub fn is_overflow(&self) -> bool {
        matches!(self, Self::Overflow(_))
    }

    /// Check if this is a truncation error.
    pub fn is_truncation(&self) -> bool {
        matches!(self, Self::Truncation(_))
    }

    /// Check if this is a mapping error.
    pub fn is_mapping_error(&self) -> bool {
        matches!(self, Self::Mapping(_))
    }

    /// Check if this is an invalid operation error.
    pub fn is_invalid_operation(&self) -> bool {
        matches!(self, Self::InvalidOperation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_predicates() {
        assert!(BsonError::format("bad tag").is_format_error());
        assert!(BsonError::DocumentTooLarge { size: 10, max: 5 }.is_format_error());
        assert!(BsonError::overflow("x").is_overflow());
        assert!(BsonError::truncation("x").is_truncation());
        assert!(BsonError::mapping("x").is_mapping_error());
        assert!(!BsonError::mapping("x").is_overflow());
    }

    #[test]
    fn test_error_display() {
        let err = BsonError::DocumentTooLarge { size: 20, max: 16 };
        assert_eq!(err.to_string(), "document size 20 exceeds maximum of 16 bytes");
        assert_eq!(BsonError::format("truncated").to_string(), "format error: truncated");
    }
}
