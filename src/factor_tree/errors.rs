use thiserror::Error;

use crate::message::run::Run;

use super::node::NodeId;

pub type FactorTreeResult<T> = Result<T, FactorTreeError>;

// Everything that can go wrong while wiring, assembling or querying a factor tree.
// Nodes are reported by their display label so that errors read like the fixtures that caused them.
#[derive(Debug, Error)]
pub enum FactorTreeError {
    #[error("cannot assemble a factor tree from an empty node set")]
    EmptyTree,

    #[error("connected nodes contain a cycle")]
    Cyclic,

    #[error("connected nodes form {components} components instead of one")]
    Disconnected { components: usize },

    #[error("node {node} is claimed as a child by more than one parent")]
    MultipleParents { node: String },

    #[error("node {node} cannot be connected to itself")]
    SelfLoop { node: String },

    #[error("node {node} lists {other} as both its parent and its child")]
    ParentIsChild { node: String, other: String },

    #[error("adjacent nodes {first} and {second} are both {kind} nodes")]
    SameKindNeighbors {
        first: String,
        second: String,
        kind: &'static str,
    },

    #[error("variable {node} has an empty domain")]
    EmptyDomain { node: String },

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("{neighbor} is not connected to {node}")]
    NotANeighbor { node: String, neighbor: String },

    #[error("node {node} is not a variable")]
    NotAVariable { node: String },

    #[error("node {node} is not a factor")]
    NotAFactor { node: String },

    #[error("value {value} is outside the domain of variable {node}")]
    DomainMismatch { node: String, value: String },

    #[error("assignment passed to factor {factor} has no value for {node}")]
    MissingAssignment { factor: String, node: String },

    #[error("factor {factor} returned quality {quality}, expected a finite non-negative number")]
    InvalidQuality { factor: String, quality: f64 },

    #[error("message from {from} to {to} at position {position} has not been computed")]
    MissingMessage {
        from: String,
        to: String,
        position: usize,
    },

    #[error("variable {node} has no other neighbors; its message to {neighbor} is always the identity")]
    LeafMessage { node: String, neighbor: String },

    #[error("{0} is not implemented")]
    Unimplemented(&'static str),

    #[error("traversal was recorded for a {expected} run, not {found}")]
    RunMismatch { expected: Run, found: Run },

    #[error("traversal mismatch: {0}")]
    TraversalMismatch(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}
