pub mod factor_tree {
    pub mod assignment;
    pub mod errors;
    pub mod factor;
    pub mod node;
    pub mod tree;
    pub mod variable;
}

pub mod message {
    pub(crate) mod message_passing;
    pub mod messages;
    pub mod run;
}

pub mod path_search {
    pub mod energy_path;
    pub mod field;
    pub mod options;
}

pub use factor_tree::{
    assignment::{Assignment, ConsistentAssignments},
    errors::{FactorTreeError, FactorTreeResult},
    factor::{Factor, QualityFn},
    node::{ConnectedNodes, Node, NodeDisplay, NodeId, NodeKind},
    tree::{FactorTree, MaxSample},
    variable::Variable,
};
pub use message::{
    messages::{MessageKey, Messages},
    run::{Run, Traversal},
};
pub use path_search::{
    energy_path::{EnergyPathSearch, PathCandidate, QualityBreakdown, TransitionModel},
    field::{GaussianField, PotentialField},
    options::PathSearchOptions,
};
