//! Collations and collation precedence
//!
//! String comparisons and join keys need a single collation. Each string
//! expression carries a label describing how its collation was derived:
//!
//! - explicit: `expr COLLATE name`
//! - implicit: a column reference
//! - coercible default: literals, variables and parameters
//! - none: the result of combining two different implicit collations
//!
//! Combining follows explicit > implicit-if-equal > coercible-default. Two
//! different implicit collations produce no collation, and comparing values
//! with no collation is rejected at build time.

use crate::error::{QueryError, Result};
use serde::Deserialize;
use std::fmt;

/// A named collation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(from = "String")]
pub struct Collation {
    name: String,
}

impl Collation {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_case_sensitive(&self) -> bool {
        self.name.to_ascii_uppercase().contains("_CS")
    }

    pub fn is_accent_sensitive(&self) -> bool {
        !self.name.to_ascii_uppercase().contains("_AI")
    }
}

impl Default for Collation {
    fn default() -> Self {
        Collation::new("Latin1_General_CI_AI")
    }
}

impl From<String> for Collation {
    fn from(name: String) -> Self {
        Collation::new(name)
    }
}

impl fmt::Display for Collation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// How a collation was derived for an expression
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CollationLabel {
    Explicit(Collation),
    Implicit(Collation),
    CoercibleDefault(Collation),
    NoCollation,
}

impl CollationLabel {
    pub fn collation(&self) -> Option<&Collation> {
        match self {
            CollationLabel::Explicit(c)
            | CollationLabel::Implicit(c)
            | CollationLabel::CoercibleDefault(c) => Some(c),
            CollationLabel::NoCollation => None,
        }
    }

    /// Combine the labels of two operands of a string operator
    pub fn combine(&self, other: &CollationLabel) -> Result<CollationLabel> {
        use CollationLabel::*;

        match (self, other) {
            (Explicit(a), Explicit(b)) => {
                if a == b {
                    Ok(Explicit(a.clone()))
                } else {
                    Err(QueryError::Semantic(format!(
                        "Expression type conflict: explicit collations '{}' and '{}' cannot be combined",
                        a, b
                    )))
                }
            }
            (Explicit(a), _) | (_, Explicit(a)) => Ok(Explicit(a.clone())),
            (NoCollation, _) | (_, NoCollation) => Ok(NoCollation),
            (Implicit(a), Implicit(b)) => {
                if a == b {
                    Ok(Implicit(a.clone()))
                } else {
                    Ok(NoCollation)
                }
            }
            (Implicit(a), CoercibleDefault(_)) | (CoercibleDefault(_), Implicit(a)) => {
                Ok(Implicit(a.clone()))
            }
            (CoercibleDefault(a), CoercibleDefault(_)) => Ok(CoercibleDefault(a.clone())),
        }
    }

    /// Resolve the collation used to compare two operands
    pub fn resolve_comparison(&self, other: &CollationLabel) -> Result<Collation> {
        match self.combine(other)? {
            CollationLabel::NoCollation => Err(QueryError::Semantic(format!(
                "Cannot resolve the collation conflict between '{}' and '{}' in the equal to operation",
                self.describe(),
                other.describe()
            ))),
            label => label
                .collation()
                .cloned()
                .ok_or_else(|| QueryError::Internal("collation label without collation".into())),
        }
    }

    fn describe(&self) -> String {
        match self.collation() {
            Some(c) => c.to_string(),
            None => "no collation".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ci() -> Collation {
        Collation::new("Latin1_General_CI_AI")
    }

    fn cs() -> Collation {
        Collation::new("Latin1_General_CS_AS")
    }

    #[test]
    fn test_explicit_wins() {
        let left = CollationLabel::Explicit(cs());
        let right = CollationLabel::Implicit(ci());
        assert_eq!(left.combine(&right).unwrap(), CollationLabel::Explicit(cs()));
    }

    #[test]
    fn test_conflicting_explicit_is_error() {
        let left = CollationLabel::Explicit(cs());
        let right = CollationLabel::Explicit(ci());
        assert!(left.combine(&right).is_err());
    }

    #[test]
    fn test_equal_implicit_is_kept() {
        let left = CollationLabel::Implicit(ci());
        let right = CollationLabel::Implicit(ci());
        assert_eq!(left.combine(&right).unwrap(), CollationLabel::Implicit(ci()));
    }

    #[test]
    fn test_different_implicit_gives_no_collation() {
        let left = CollationLabel::Implicit(ci());
        let right = CollationLabel::Implicit(cs());
        assert_eq!(left.combine(&right).unwrap(), CollationLabel::NoCollation);
        assert!(left.resolve_comparison(&right).is_err());
    }

    #[test]
    fn test_no_collation_rescued_by_explicit() {
        let none = CollationLabel::NoCollation;
        let explicit = CollationLabel::Explicit(cs());
        assert_eq!(none.resolve_comparison(&explicit).unwrap(), cs());
    }

    #[test]
    fn test_implicit_beats_coercible_default() {
        let left = CollationLabel::CoercibleDefault(ci());
        let right = CollationLabel::Implicit(cs());
        assert_eq!(left.resolve_comparison(&right).unwrap(), cs());
    }

    #[test]
    fn test_sensitivity_flags() {
        assert!(!ci().is_case_sensitive());
        assert!(!ci().is_accent_sensitive());
        assert!(cs().is_case_sensitive());
        assert!(cs().is_accent_sensitive());
    }
}
