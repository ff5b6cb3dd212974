//! Error types for the localization engine and its orchestration layer.

use thiserror::Error;

use crate::node::{NodeId, Role};

/// Result type for localization operations.
pub type Result<T> = std::result::Result<T, LocalizationError>;

/// Errors surfaced by the filter engine and the node registry.
///
/// Degenerate weight collapse is not represented here: the filter recovers from it locally by
/// falling back to uniform weights. Peers that are not ready are skipped by the orchestration
/// layer and reported through [`crate::mesh::UpdateOutcome`] instead.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LocalizationError {
    /// A configuration value was rejected (e.g. a particle count of zero).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Direct particle access outside `[0, len)`.
    #[error("particle index {index} out of range for {len} particles")]
    IndexOutOfRange { index: usize, len: usize },

    /// The estimate was queried before any measurement was applied.
    #[error("estimate not available: no measurement has been applied since initialization")]
    NotInitialized,

    /// A measurement or its accompanying parameters were not usable.
    #[error("invalid measurement: {0}")]
    InvalidMeasurement(String),

    /// No node with this id exists in the registry.
    #[error("unknown node id {0}")]
    UnknownNode(NodeId),

    /// The operation is not defined for a node with this role.
    #[error("node {id} is an {role:?} node; operation not permitted")]
    WrongRole { id: NodeId, role: Role },
}
