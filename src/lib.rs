//! T-SQL statement plan builder
//!
//! Compiles T-SQL batches into trees of physical operators for an
//! entity/attribute backend that only offers filtered scans and bulk
//! create/update/delete messages. Joins, subqueries, set operations, window
//! functions and recursion are lowered into operators the host evaluates
//! itself; the builder never touches the backend.
//!
//! ```no_run
//! use std::collections::HashMap;
//! use tsql_planner::{InMemoryMetadataCatalog, PlanBuilder, SessionSnapshot};
//!
//! let catalog = InMemoryMetadataCatalog::new();
//! let session = SessionSnapshot::new();
//! let roots = PlanBuilder::new(&catalog, &session).build("SELECT 1", &HashMap::new());
//! ```

pub mod config;
pub mod error;
pub mod metastore;
pub mod optimizer;
pub mod parser;
pub mod physical;
pub mod planner;
pub mod session;

// Re-export main types
pub use config::{BuildOptions, QueryHints};
pub use error::{ErrorCategory, QueryError, Result};
pub use metastore::{EntityMetadata, InMemoryMetadataCatalog, MetadataCatalog};
pub use physical::{PlanOperator, PlanRoot, QueryPlan, RootNode};
pub use planner::PlanBuilder;
pub use session::SessionSnapshot;
