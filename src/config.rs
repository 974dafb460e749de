//! Plan builder configuration

use crate::error::{QueryError, Result};
use crate::planner::Collation;
use serde::Deserialize;

/// Largest value accepted for `OPTION (MAXRECURSION n)`
pub const MAX_RECURSION_LIMIT: u32 = 32767;

/// Options controlling plan construction
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BuildOptions {
    /// Recursion bound for recursive CTEs without a MAXRECURSION hint
    pub default_max_recursion: u32,
    /// Insert caching spools below correlated joins
    pub enable_spool_insertion: bool,
    /// Minimum estimated outer rows for spool insertion
    pub spool_outer_row_threshold: u64,
    /// Maximum estimated rows of a spooled subtree
    pub spool_inner_row_threshold: u64,
    /// Row estimate for entities without statistics
    pub default_row_estimate: u64,
    /// Fraction of rows assumed to pass a filter
    pub filter_selectivity: f64,
    /// Collation of backend string attributes
    pub default_collation: Collation,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            default_max_recursion: 100,
            enable_spool_insertion: true,
            spool_outer_row_threshold: 100,
            spool_inner_row_threshold: 5000,
            default_row_estimate: 1000,
            filter_selectivity: 0.3,
            default_collation: Collation::default(),
        }
    }
}

impl BuildOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load options from a JSON document, missing keys keep their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let options: BuildOptions = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    pub fn with_default_max_recursion(mut self, max_recursion: u32) -> Self {
        self.default_max_recursion = max_recursion;
        self
    }

    pub fn with_spool_insertion(mut self, enabled: bool) -> Self {
        self.enable_spool_insertion = enabled;
        self
    }

    pub fn with_spool_thresholds(mut self, outer_rows: u64, inner_rows: u64) -> Self {
        self.spool_outer_row_threshold = outer_rows;
        self.spool_inner_row_threshold = inner_rows;
        self
    }

    pub fn with_default_row_estimate(mut self, rows: u64) -> Self {
        self.default_row_estimate = rows.max(1);
        self
    }

    pub fn with_default_collation(mut self, collation: Collation) -> Self {
        self.default_collation = collation;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_max_recursion > MAX_RECURSION_LIMIT {
            return Err(QueryError::Structural(format!(
                "The default MAXRECURSION {} is outside the range 0 to {}",
                self.default_max_recursion, MAX_RECURSION_LIMIT
            )));
        }
        if !(0.0..=1.0).contains(&self.filter_selectivity) {
            return Err(QueryError::Semantic(format!(
                "Filter selectivity {} must be between 0 and 1",
                self.filter_selectivity
            )));
        }
        Ok(())
    }
}

/// Hints from a statement's `OPTION (...)` clause
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryHints {
    pub max_recursion: Option<u32>,
    pub no_performance_spool: bool,
}

impl QueryHints {
    pub fn merge(&mut self, other: QueryHints) {
        if other.max_recursion.is_some() {
            self.max_recursion = other.max_recursion;
        }
        self.no_performance_spool |= other.no_performance_spool;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = BuildOptions::default();
        assert_eq!(options.default_max_recursion, 100);
        assert_eq!(options.spool_outer_row_threshold, 100);
        assert_eq!(options.spool_inner_row_threshold, 5000);
        assert!(options.enable_spool_insertion);
    }

    #[test]
    fn test_from_json_partial() {
        let options =
            BuildOptions::from_json(r#"{"enable_spool_insertion": false, "default_collation": "Latin1_General_CS_AS"}"#)
                .unwrap();
        assert!(!options.enable_spool_insertion);
        assert_eq!(options.default_max_recursion, 100);
        assert!(options.default_collation.is_case_sensitive());
    }

    #[test]
    fn test_from_json_rejects_out_of_range_recursion() {
        assert!(BuildOptions::from_json(r#"{"default_max_recursion": 40000}"#).is_err());
    }
}
