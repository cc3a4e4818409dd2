//! Data model: issue records, dependency edges, and graph checks.

pub mod graph;
pub mod types;

pub use types::{
    Comment, DepEdge, DepTarget, DepType, Issue, IssueId, StateRegistry, ValidationError,
    BUILTIN_STATUSES, BUILTIN_TYPES,
};
