//! Error types for query planning and execution

use crate::point::DataType;
use thiserror::Error;

/// Errors produced while planning or streaming a query.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    /// A projection mixed raw field references with more than one aggregate.
    #[error("cannot select fields when selecting multiple aggregates")]
    MixedAggregateFields,

    /// A selector call received too few arguments.
    #[error("{call}() requires 2 or more arguments, got {got}")]
    SelectorArity {
        /// The selector function name
        call: String,
        /// Number of arguments received
        got: usize,
    },

    /// A selector call's limit argument was not a positive integer.
    #[error("{call}() limit must be at least 1, got {got}")]
    SelectorLimit {
        /// The selector function name
        call: String,
        /// The limit received
        got: i64,
    },

    /// A call argument did not have the expected shape.
    #[error("invalid argument to {call}(): {reason}")]
    InvalidArgument {
        /// The function name
        call: String,
        /// Why the argument was rejected
        reason: String,
    },

    /// The percentile argument was outside `(0, 100]`.
    #[error("percentile must be in (0, 100], got {0}")]
    InvalidPercentile(f64),

    /// The projection referenced a function the engine does not know.
    #[error("unsupported call: {0}")]
    UnsupportedCall(String),

    /// An expression kind that cannot be turned into an iterator.
    #[error("invalid expression type: {0}")]
    InvalidExpression(String),

    /// A binary expression had literals on both sides that did not fold.
    #[error("unable to construct an iterator from two literals")]
    TwoLiterals,

    /// An upstream iterator's type is incompatible with the operator.
    #[error("type mismatch on {side}: unable to use {found} iterator as {want}")]
    TypeMismatch {
        /// Which operand side failed ("LHS" or "RHS")
        side: &'static str,
        /// The type that was found
        found: DataType,
        /// The type that was required
        want: DataType,
    },

    /// An error surfaced from the storage-facing iterator creator.
    #[error("storage error: {0}")]
    Storage(String),

    /// An error building the iterator for one projected field.
    #[error("error constructing iterator for field '{field}': {source}")]
    Field {
        /// Rendered field expression
        field: String,
        /// The underlying error
        source: Box<QueryError>,
    },
}

impl QueryError {
    /// Wrap an error with the projected field it occurred in.
    pub fn for_field(self, field: impl Into<String>) -> QueryError {
        QueryError::Field {
            field: field.into(),
            source: Box::new(self),
        }
    }
}

/// Result type alias for query operations.
pub type Result<T> = std::result::Result<T, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = QueryError::MixedAggregateFields;
        assert_eq!(
            err.to_string(),
            "cannot select fields when selecting multiple aggregates"
        );

        let err = QueryError::SelectorArity {
            call: "top".to_string(),
            got: 1,
        };
        assert_eq!(err.to_string(), "top() requires 2 or more arguments, got 1");

        let err = QueryError::UnsupportedCall("exp".to_string());
        assert_eq!(err.to_string(), "unsupported call: exp");
    }

    #[test]
    fn test_field_wrapping() {
        let err = QueryError::TwoLiterals.for_field("1 + 2");
        assert!(err.to_string().contains("field '1 + 2'"));
        assert!(err.to_string().contains("two literals"));
    }
}
