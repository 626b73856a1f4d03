use std::fmt::{self, Display};

use super::{
    errors::{FactorTreeError, FactorTreeResult},
    factor::Factor,
    variable::Variable,
};

/// Index of a node in the arena that owns it
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

impl NodeId {
    pub fn new(index: usize) -> Self {
        NodeId(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub enum NodeKind<V> {
    Variable(Variable<V>),
    Factor(Factor<V>),
}

impl<V> NodeKind<V> {
    /// Placeholder label used for anonymous nodes
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Variable(_) => "Variable",
            NodeKind::Factor(_) => "Factor",
        }
    }
}

pub struct Node<V> {
    name: Option<String>,
    parent: Option<NodeId>,   // back-reference giving the tree its orientation, not ownership
    children: Vec<NodeId>,    // declared order, no duplicates
    kind: NodeKind<V>,
}

impl<V> Node<V> {
    fn new(name: Option<String>, kind: NodeKind<V>) -> Self {
        Node {
            name,
            parent: None,
            children: Vec::new(),
            kind,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Name of the node, or its kind if it was never named
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(self.kind.type_name())
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn kind(&self) -> &NodeKind<V> {
        &self.kind
    }

    pub fn as_variable(&self) -> Option<&Variable<V>> {
        match &self.kind {
            NodeKind::Variable(variable) => Some(variable),
            NodeKind::Factor(_) => None,
        }
    }

    pub fn as_factor(&self) -> Option<&Factor<V>> {
        match &self.kind {
            NodeKind::Factor(factor) => Some(factor),
            NodeKind::Variable(_) => None,
        }
    }

    pub fn is_variable(&self) -> bool {
        self.as_variable().is_some()
    }

    pub fn is_factor(&self) -> bool {
        self.as_factor().is_some()
    }

    /// Number of neighbors (children plus parent)
    pub fn degree(&self) -> usize {
        self.children.len() + self.parent.is_some() as usize
    }

    /// Yields the neighbor set: children in declared order, then the parent, skipping `exclude`
    pub fn connected_nodes(&self, exclude: Option<NodeId>) -> impl Iterator<Item = NodeId> + '_ {
        self.children
            .iter()
            .copied()
            .chain(self.parent)
            .filter(move |node| Some(*node) != exclude)
    }

    pub(crate) fn parent_mut(&mut self) -> &mut Option<NodeId> {
        &mut self.parent
    }

    pub(crate) fn children_mut(&mut self) -> &mut Vec<NodeId> {
        &mut self.children
    }
}

/// Diagnostic rendering of a node: `<label>(parent=<parent label>,<n> children)`
pub struct NodeDisplay<'a, V> {
    nodes: &'a [Node<V>],
    node: NodeId,
}

impl<'a, V> NodeDisplay<'a, V> {
    pub(crate) fn new(nodes: &'a [Node<V>], node: NodeId) -> Self {
        NodeDisplay { nodes, node }
    }
}

impl<V> Display for NodeDisplay<'_, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(node) = self.nodes.get(self.node.index()) else {
            return write!(f, "{}", self.node);
        };
        let parent = node
            .parent
            .and_then(|parent| self.nodes.get(parent.index()))
            .map_or("None", |parent| parent.label());
        write!(
            f,
            "{}(parent={},{} children)",
            node.label(),
            parent,
            node.children.len()
        )
    }
}

/// Arena holding nodes while they are being wired together.
/// Wiring only has to be declared from one side: a node naming its parent,
/// or a parent listing the node as a child, are both enough for assembly.
pub struct ConnectedNodes<V> {
    nodes: Vec<Node<V>>,
}

impl<V> Default for ConnectedNodes<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> ConnectedNodes<V> {
    pub fn new() -> Self {
        ConnectedNodes { nodes: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        ConnectedNodes {
            nodes: Vec::with_capacity(capacity),
        }
    }

    fn push(&mut self, name: Option<String>, kind: NodeKind<V>) -> NodeId {
        self.nodes.push(Node::new(name, kind));
        NodeId(self.nodes.len() - 1)
    }

    pub fn add_variable(&mut self, variable: Variable<V>) -> NodeId {
        self.push(None, NodeKind::Variable(variable))
    }

    pub fn add_named_variable(&mut self, name: &str, variable: Variable<V>) -> NodeId {
        self.push(Some(name.to_string()), NodeKind::Variable(variable))
    }

    pub fn add_factor(&mut self, factor: Factor<V>) -> NodeId {
        self.push(None, NodeKind::Factor(factor))
    }

    pub fn add_named_factor(&mut self, name: &str, factor: Factor<V>) -> NodeId {
        self.push(Some(name.to_string()), NodeKind::Factor(factor))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, node: NodeId) -> FactorTreeResult<&Node<V>> {
        self.nodes
            .get(node.index())
            .ok_or(FactorTreeError::UnknownNode(node))
    }

    fn get_mut(&mut self, node: NodeId) -> FactorTreeResult<&mut Node<V>> {
        self.nodes
            .get_mut(node.index())
            .ok_or(FactorTreeError::UnknownNode(node))
    }

    fn label(&self, node: NodeId) -> String {
        self.nodes
            .get(node.index())
            .map_or_else(|| node.to_string(), |node| node.label().to_string())
    }

    /// Sets the parent of a node, replacing any previous parent
    pub fn set_parent(&mut self, node: NodeId, parent: NodeId) -> FactorTreeResult<&mut Self> {
        self.get(parent)?;
        if node == parent {
            return Err(FactorTreeError::SelfLoop {
                node: self.label(node),
            });
        }
        if self.get(node)?.children.contains(&parent) {
            return Err(FactorTreeError::ParentIsChild {
                node: self.label(node),
                other: self.label(parent),
            });
        }
        self.get_mut(node)?.parent = Some(parent);
        Ok(self)
    }

    fn check_child(&self, node: NodeId, child: NodeId) -> FactorTreeResult<()> {
        self.get(child)?;
        if node == child {
            return Err(FactorTreeError::SelfLoop {
                node: self.label(node),
            });
        }
        if self.get(node)?.parent == Some(child) {
            return Err(FactorTreeError::ParentIsChild {
                node: self.label(node),
                other: self.label(child),
            });
        }
        Ok(())
    }

    /// Adds a child to a node; adding the same child twice is a no-op
    pub fn add_child(&mut self, node: NodeId, child: NodeId) -> FactorTreeResult<&mut Self> {
        self.check_child(node, child)?;
        let children = &mut self.get_mut(node)?.children;
        if !children.contains(&child) {
            children.push(child);
        }
        Ok(self)
    }

    pub fn add_children(
        &mut self,
        node: NodeId,
        children: impl IntoIterator<Item = NodeId>,
    ) -> FactorTreeResult<&mut Self> {
        for child in children {
            self.add_child(node, child)?;
        }
        Ok(self)
    }

    /// Replaces the child list of a node. On error the previous list is kept.
    pub fn set_children(
        &mut self,
        node: NodeId,
        children: impl IntoIterator<Item = NodeId>,
    ) -> FactorTreeResult<&mut Self> {
        let children: Vec<NodeId> = children.into_iter().collect();
        for &child in &children {
            self.check_child(node, child)?;
        }
        self.get_mut(node)?.children.clear();
        self.add_children(node, children)
    }

    pub fn connected_nodes(
        &self,
        node: NodeId,
        exclude: Option<NodeId>,
    ) -> FactorTreeResult<impl Iterator<Item = NodeId> + '_> {
        Ok(self.get(node)?.connected_nodes(exclude))
    }

    pub fn display(&self, node: NodeId) -> NodeDisplay<'_, V> {
        NodeDisplay::new(&self.nodes, node)
    }

    pub(crate) fn into_nodes(self) -> Vec<Node<V>> {
        self.nodes
    }
}
