//! Error types for the plan builder

use thiserror::Error;

/// Result type alias for plan builder operations
pub type Result<T> = std::result::Result<T, QueryError>;

/// Broad classification of a build failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Parse,
    Unsupported,
    Semantic,
    Catalog,
    Structural,
    Internal,
}

/// Main error type for the plan builder
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Not supported: {fragment}{}", suggestion_suffix(.suggestion))]
    NotSupported {
        fragment: String,
        suggestion: Option<String>,
    },

    #[error("Ambiguous column name '{0}'")]
    AmbiguousColumn(String),

    #[error("Invalid column name '{0}'")]
    ColumnNotFound(String),

    #[error("Type error: {0}")]
    TypeMismatch(String),

    #[error("Must declare the scalar variable \"{0}\"")]
    UndeclaredVariable(String),

    #[error("Duplicate {kind} name '{name}'")]
    Duplicate { kind: &'static str, name: String },

    #[error("Semantic error: {0}")]
    Semantic(String),

    #[error("Invalid object name '{name}'{}", did_you_mean(.suggestions))]
    InvalidObjectName {
        name: String,
        suggestions: Vec<String>,
    },

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Structural error: {0}")]
    Structural(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{}", join_messages(.0))]
    Multiple(Vec<QueryError>),
}

fn suggestion_suffix(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(s) => format!(". {}", s),
        None => String::new(),
    }
}

fn did_you_mean(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!(". Did you mean '{}'?", suggestions.join("', '"))
    }
}

fn join_messages(errors: &[QueryError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

impl QueryError {
    pub fn not_supported(fragment: impl Into<String>) -> Self {
        QueryError::NotSupported {
            fragment: fragment.into(),
            suggestion: None,
        }
    }

    pub fn not_supported_with(fragment: impl Into<String>, suggestion: impl Into<String>) -> Self {
        QueryError::NotSupported {
            fragment: fragment.into(),
            suggestion: Some(suggestion.into()),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            QueryError::Parse(_) => ErrorCategory::Parse,
            QueryError::NotSupported { .. } => ErrorCategory::Unsupported,
            QueryError::AmbiguousColumn(_)
            | QueryError::ColumnNotFound(_)
            | QueryError::TypeMismatch(_)
            | QueryError::UndeclaredVariable(_)
            | QueryError::Duplicate { .. }
            | QueryError::Semantic(_) => ErrorCategory::Semantic,
            QueryError::InvalidObjectName { .. } | QueryError::Metadata(_) => {
                ErrorCategory::Catalog
            }
            QueryError::Structural(_) => ErrorCategory::Structural,
            QueryError::Internal(_) => ErrorCategory::Internal,
            QueryError::Multiple(errors) => errors
                .first()
                .map(|e| e.category())
                .unwrap_or(ErrorCategory::Internal),
        }
    }

    /// Merge two errors into one, flattening nested `Multiple` lists
    pub fn combine(self, other: QueryError) -> QueryError {
        let mut errors = self.into_errors();
        errors.extend(other.into_errors());
        if errors.len() == 1 {
            errors.remove(0)
        } else {
            QueryError::Multiple(errors)
        }
    }

    /// Flatten into the individual errors
    pub fn into_errors(self) -> Vec<QueryError> {
        match self {
            QueryError::Multiple(errors) => errors
                .into_iter()
                .flat_map(|e| e.into_errors())
                .collect(),
            other => vec![other],
        }
    }

    pub fn from_errors(mut errors: Vec<QueryError>) -> Option<QueryError> {
        match errors.len() {
            0 => None,
            1 => Some(errors.remove(0)),
            _ => Some(QueryError::Multiple(errors)),
        }
    }
}

/// Combine two independent results, keeping every error
pub fn combine_results<A, B>(a: Result<A>, b: Result<B>) -> Result<(A, B)> {
    match (a, b) {
        (Ok(a), Ok(b)) => Ok((a, b)),
        (Err(e), Ok(_)) | (Ok(_), Err(e)) => Err(e),
        (Err(e1), Err(e2)) => Err(e1.combine(e2)),
    }
}

/// Collects errors from independent clauses without stopping at the first one
#[derive(Debug, Default)]
pub struct ErrorCollector {
    errors: Vec<QueryError>,
}

impl ErrorCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the error of `result`, returning the value when it succeeded
    pub fn check<T>(&mut self, result: Result<T>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::trace!(error = %e, "clause failed, continuing with remaining clauses");
                self.errors.extend(e.into_errors());
                None
            }
        }
    }

    pub fn push(&mut self, error: QueryError) {
        self.errors.extend(error.into_errors());
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn finish(self) -> Result<()> {
        match QueryError::from_errors(self.errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The recorded errors, for callers that cannot continue
    pub fn into_error(self) -> QueryError {
        QueryError::from_errors(self.errors)
            .unwrap_or_else(|| QueryError::Internal("clause failed without an error".into()))
    }
}

impl From<sqlparser::parser::ParserError> for QueryError {
    fn from(e: sqlparser::parser::ParserError) -> Self {
        QueryError::Parse(e.to_string())
    }
}

impl From<sqlparser::tokenizer::TokenizerError> for QueryError {
    fn from(e: sqlparser::tokenizer::TokenizerError) -> Self {
        QueryError::Parse(e.to_string())
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(e: serde_json::Error) -> Self {
        QueryError::Metadata(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_flattens() {
        let a = QueryError::ColumnNotFound("a".into());
        let b = QueryError::Multiple(vec![
            QueryError::ColumnNotFound("b".into()),
            QueryError::AmbiguousColumn("c".into()),
        ]);
        let combined = a.combine(b);
        assert_eq!(combined.into_errors().len(), 3);
    }

    #[test]
    fn test_combine_results_keeps_both_errors() {
        let a: Result<i32> = Err(QueryError::ColumnNotFound("x".into()));
        let b: Result<i32> = Err(QueryError::UndeclaredVariable("@y".into()));
        let err = combine_results(a, b).unwrap_err();
        assert_eq!(err.into_errors().len(), 2);
    }

    #[test]
    fn test_invalid_object_name_message() {
        let err = QueryError::InvalidObjectName {
            name: "acount".into(),
            suggestions: vec!["account".into()],
        };
        assert_eq!(
            err.to_string(),
            "Invalid object name 'acount'. Did you mean 'account'?"
        );
        assert_eq!(err.category(), ErrorCategory::Catalog);
    }

    #[test]
    fn test_not_supported_with_suggestion() {
        let err = QueryError::not_supported_with("RANGE", "Use ROWS instead");
        assert_eq!(err.to_string(), "Not supported: RANGE. Use ROWS instead");
        assert_eq!(err.category(), ErrorCategory::Unsupported);
    }
}
