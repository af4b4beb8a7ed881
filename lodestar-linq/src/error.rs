//! Translation errors.
//!
//! ```rust
//! use lodestar_linq::{ErrorKind, TranslationError};
//!
//! let err = TranslationError::not_supported("x.Foo()", "no translation for method Foo");
//! assert_eq!(err.kind(), ErrorKind::NotSupported);
//! assert!(err.to_string().contains("x.Foo()"));
//! ```

use lodestar_bson::BsonError;
use thiserror::Error;

/// Result type for translation.
pub type TranslationResult<T> = Result<T, TranslationError>;

/// Classification shared with the codec layer so callers can handle
/// errors from either side uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Format,
    Overflow,
    Truncation,
    Mapping,
    NotSupported,
    InvalidOperation,
}

/// Errors raised while lowering a query expression into a pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TranslationError {
    /// The expression has no translation.
    #[error("expression not supported: {expression} because {reason}")]
    NotSupported {
        /// Source form of the offending expression.
        expression: String,
        reason: String,
    },

    /// The translator was used outside the context it expects.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A serializer or member could not be resolved.
    #[error("mapping error: {0}")]
    Mapping(String),

    #[error(transparent)]
    Bson(#[from] BsonError),
}

impl TranslationError {
    pub fn not_supported(expression: impl ToString, reason: impl Into<String>) -> Self {
        Self::NotSupported {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }

    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation(message.into())
    }

    pub fn mapping(message: impl Into<String>) -> Self {
        Self::Mapping(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotSupported { .. } => ErrorKind::NotSupported,
            Self::InvalidOperation(_) => ErrorKind::InvalidOperation,
            Self::Mapping(_) => ErrorKind::Mapping,
            Self::Bson(inner) => match inner {
                BsonError::Format(_) | BsonError::DocumentTooLarge { .. } => ErrorKind::Format,
                BsonError::Overflow(_) => ErrorKind::Overflow,
                BsonError::Truncation(_) => ErrorKind::Truncation,
                BsonError::Mapping(_) => ErrorKind::Mapping,
                BsonError::InvalidOperation(_) => ErrorKind::InvalidOperation,
            },
        }
    }

    pub fn is_not_supported(&self) -> bool {
        self.kind() == ErrorKind::NotSupported
    }

    pub fn is_invalid_operation(&self) -> bool {
        self.kind() == ErrorKind::InvalidOperation
    }

    /// Source form of the expression that could not be translated.
    pub fn expression(&self) -> Option<&str> {
        match self {
            Self::NotSupported { expression, .. } => Some(expression),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_follows_codec_errors() {
        let err: TranslationError = BsonError::truncation("1.5 to Int32").into();
        assert_eq!(err.kind(), ErrorKind::Truncation);
        let err: TranslationError = BsonError::mapping("unknown discriminator").into();
        assert_eq!(err.kind(), ErrorKind::Mapping);
    }

    #[test]
    fn test_not_supported_carries_expression() {
        let err = TranslationError::not_supported("a.Name.Foo()", "no rule");
        assert!(err.is_not_supported());
        assert_eq!(err.expression(), Some("a.Name.Foo()"));
    }
}
