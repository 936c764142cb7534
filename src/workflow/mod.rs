//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, parsing, and
//! validating workflows.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Workflow, Job, Step)
//! - [`condition`]: Condition language parser and evaluator
//! - [`parser`]: YAML parsing and loading
//! - [`validator`]: Structural validation rules
//! - [`graph`]: Dependency resolution into execution layers
//! - [`registry`]: Discovery of workflow files on disk

pub mod condition;
pub mod graph;
pub mod model;
pub mod parser;
pub mod registry;
pub mod validator;

pub use condition::{Condition, Expr};
pub use graph::{resolve, DependencyGraph};
pub use model::{Job, Step, Workflow};
pub use parser::{generate_id, load_workflow, parse_workflow};
pub use registry::{WorkflowEntry, WorkflowOrigin, WorkflowRegistry};
pub use validator::{validate_workflow, ValidationError};
