use std::{
    collections::{btree_map::Entry, BTreeMap},
    fmt::Debug,
    hash::Hash,
    time::Instant,
};

use log::{debug, info};
use petgraph::{
    algo::{connected_components, is_cyclic_undirected},
    graph::{NodeIndex, UnGraph},
};

use crate::message::{
    message_passing::MessagePassing,
    messages::{MessageKey, Messages},
    run::{Run, Traversal},
};

use super::{
    assignment::{Assignment, ConsistentAssignments},
    errors::{FactorTreeError, FactorTreeResult},
    factor::Factor,
    node::{ConnectedNodes, Node, NodeDisplay, NodeId},
    variable::Variable,
};

/// Best value of one bucket, as picked by `get_good_max_samples`
#[derive(Clone, Debug, PartialEq)]
pub struct MaxSample<V> {
    pub value: V,
    pub message: f64,
}

/// A validated factor tree together with the messages computed on it
pub struct FactorTree<V> {
    nodes: Vec<Node<V>>,
    neighbors: Vec<Vec<NodeId>>, // children in declared order, then the parent
    root: NodeId,
    messages: Messages,
}

impl<V> FactorTree<V> {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, node: NodeId) -> FactorTreeResult<&Node<V>> {
        self.nodes
            .get(node.index())
            .ok_or(FactorTreeError::UnknownNode(node))
    }

    pub fn get_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(NodeId::new)
    }

    pub fn get_variables(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.get_nodes()
            .filter(|node| self.nodes[node.index()].is_variable())
    }

    pub fn get_factors(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.get_nodes()
            .filter(|node| self.nodes[node.index()].is_factor())
    }

    pub fn neighbors(&self, node: NodeId) -> FactorTreeResult<&[NodeId]> {
        self.node(node)?;
        Ok(&self.neighbors[node.index()])
    }

    pub fn connected_nodes(
        &self,
        node: NodeId,
        exclude: Option<NodeId>,
    ) -> FactorTreeResult<impl Iterator<Item = NodeId> + '_> {
        Ok(self.node(node)?.connected_nodes(exclude))
    }

    pub fn display(&self, node: NodeId) -> NodeDisplay<'_, V> {
        NodeDisplay::new(&self.nodes, node)
    }

    fn label(&self, node: NodeId) -> String {
        self.nodes
            .get(node.index())
            .map_or_else(|| node.to_string(), |node| node.label().to_string())
    }

    pub fn variable(&self, node: NodeId) -> FactorTreeResult<&Variable<V>> {
        self.node(node)?
            .as_variable()
            .ok_or_else(|| FactorTreeError::NotAVariable {
                node: self.label(node),
            })
    }

    pub fn factor(&self, node: NodeId) -> FactorTreeResult<&Factor<V>> {
        self.node(node)?
            .as_factor()
            .ok_or_else(|| FactorTreeError::NotAFactor {
                node: self.label(node),
            })
    }

    pub fn messages(&self) -> &Messages {
        &self.messages
    }

    /// Drops the messages of one run, e.g. before recomputing it with new data
    pub fn reset_run(&mut self, run: Run) {
        self.messages.clear_run(run);
    }

    pub fn reset_messages(&mut self) {
        self.messages.clear();
    }

    fn check_neighbor(&self, node: NodeId, neighbor: NodeId) -> FactorTreeResult<()> {
        self.node(neighbor)?;
        if self.neighbors(node)?.contains(&neighbor) {
            Ok(())
        } else {
            Err(FactorTreeError::NotANeighbor {
                node: self.label(node),
                neighbor: self.label(neighbor),
            })
        }
    }

    fn is_leaf_variable(&self, node: NodeId) -> bool {
        self.nodes[node.index()].is_variable() && self.neighbors[node.index()].len() == 1
    }

    // The variable endpoint of an edge; its domain indexes messages in both directions
    fn edge_variable(&self, from: NodeId, to: NodeId) -> NodeId {
        if self.nodes[from.index()].is_variable() {
            from
        } else {
            to
        }
    }

    fn engine(&mut self, run: Run) -> MessagePassing<'_, V>
    where
        V: Clone + Eq + Hash + Debug,
    {
        MessagePassing::new(&self.nodes, &self.neighbors, &mut self.messages, run)
    }
}

impl<V: Clone + Eq + Hash + Debug> FactorTree<V> {
    /// Validates the wiring of the given nodes and assembles them into a tree.
    /// Links declared from one side only are mirrored first, then the structure must be
    /// a single connected, acyclic component in which variables and factors alternate.
    pub fn create_from_connected_nodes(connected: ConnectedNodes<V>) -> FactorTreeResult<Self> {
        let time_start = Instant::now();
        let mut nodes = connected.into_nodes();
        if nodes.is_empty() {
            return Err(FactorTreeError::EmptyTree);
        }
        let num_nodes = nodes.len();

        // Mirror parent links into child lists
        for index in 0..num_nodes {
            if let Some(parent) = nodes[index].parent() {
                let child = NodeId::new(index);
                if !nodes[parent.index()].children().contains(&child) {
                    debug!("Adding {} as a child of {}", nodes[index].label(), nodes[parent.index()].label());
                    nodes[parent.index()].children_mut().push(child);
                }
            }
        }

        // Mirror child lists into parent links
        for index in 0..num_nodes {
            let node = NodeId::new(index);
            for position in 0..nodes[index].children().len() {
                let child = nodes[index].children()[position];
                match nodes[child.index()].parent() {
                    None => *nodes[child.index()].parent_mut() = Some(node),
                    Some(parent) if parent == node => {}
                    Some(_) => {
                        return Err(FactorTreeError::MultipleParents {
                            node: nodes[child.index()].label().to_string(),
                        })
                    }
                }
            }
        }

        // Every node except the root contributes the edge to its parent
        let mut graph = UnGraph::<(), (), usize>::with_capacity(num_nodes, num_nodes);
        for _ in 0..num_nodes {
            graph.add_node(());
        }
        for (index, node) in nodes.iter().enumerate() {
            if let Some(parent) = node.parent() {
                graph.add_edge(NodeIndex::new(index), NodeIndex::new(parent.index()), ());
            }
        }
        if is_cyclic_undirected(&graph) {
            return Err(FactorTreeError::Cyclic);
        }
        let components = connected_components(&graph);
        if components != 1 {
            return Err(FactorTreeError::Disconnected { components });
        }

        let roots: Vec<NodeId> = (0..num_nodes)
            .filter(|index| nodes[*index].parent().is_none())
            .map(NodeId::new)
            .collect();
        let root = match roots.as_slice() {
            [root] => *root,
            _ => {
                return Err(FactorTreeError::Disconnected {
                    components: roots.len(),
                })
            }
        };

        for node in nodes.iter() {
            if let Some(variable) = node.as_variable() {
                if variable.domain_size() == 0 {
                    return Err(FactorTreeError::EmptyDomain {
                        node: node.label().to_string(),
                    });
                }
            }
            if let Some(parent) = node.parent() {
                let parent = &nodes[parent.index()];
                if node.is_variable() == parent.is_variable() {
                    return Err(FactorTreeError::SameKindNeighbors {
                        first: node.label().to_string(),
                        second: parent.label().to_string(),
                        kind: node.kind().type_name(),
                    });
                }
            }
        }

        let neighbors = nodes
            .iter()
            .map(|node| node.connected_nodes(None).collect())
            .collect();

        let tree = FactorTree {
            nodes,
            neighbors,
            root,
            messages: Messages::new(),
        };
        info!(
            "Assembled factor tree with {} variables and {} factors rooted at {}. Elapsed time {:?}.",
            tree.get_variables().count(),
            tree.get_factors().count(),
            tree.label(root),
            time_start.elapsed()
        );
        Ok(tree)
    }

    // Position of `value` in the domain of `variable`
    fn position(&self, variable: NodeId, value: &V) -> FactorTreeResult<usize> {
        self.variable(variable)?
            .position(value)
            .ok_or_else(|| FactorTreeError::DomainMismatch {
                node: self.label(variable),
                value: format!("{:?}", value),
            })
    }

    /// Enumerates every assignment of the factor's neighbors in which `fixed_neighbor` takes `fixed_value`.
    /// Neighbors appear in neighbor order (children, then parent) and the last free one varies fastest.
    pub fn get_consistent_assignments(
        &self,
        factor: NodeId,
        fixed_neighbor: NodeId,
        fixed_value: &V,
    ) -> FactorTreeResult<ConsistentAssignments<'_, V>> {
        self.factor(factor)?;
        self.check_neighbor(factor, fixed_neighbor)?;
        let fixed_position = self.position(fixed_neighbor, fixed_value)?;
        let neighbors = &self.neighbors[factor.index()];
        let fixed = neighbors
            .iter()
            .position(|neighbor| *neighbor == fixed_neighbor)
            .unwrap_or_default();
        let variables = neighbors
            .iter()
            .map(|neighbor| self.variable(*neighbor).map(|variable| (*neighbor, variable)))
            .collect::<FactorTreeResult<Vec<_>>>()?;
        Ok(ConsistentAssignments::new(variables, fixed, fixed_position))
    }

    /// Returns the message `from` sends to its neighbor `to` when the edge's variable takes `value`.
    /// A variable whose only neighbor is `to` sends the identity for any value, whatever is cached.
    pub fn create_message(
        &mut self,
        from: NodeId,
        to: NodeId,
        value: &V,
        run: Run,
    ) -> FactorTreeResult<f64> {
        self.node(from)?;
        self.check_neighbor(from, to)?;
        if self.is_leaf_variable(from) {
            return Ok(run.combine_identity());
        }
        let position = self.position(self.edge_variable(from, to), value)?;
        self.engine(run).message(from, Some(to), position)
    }

    /// Product of every message `variable` receives at `value`
    pub fn belief(&mut self, variable: NodeId, value: &V, run: Run) -> FactorTreeResult<f64> {
        let position = self.position(variable, value)?;
        self.engine(run).message(variable, None, position)
    }

    /// Stores a message entry as if it had been computed; existing entries are left untouched.
    /// Returns whether the entry was written. Messages out of leaf variables are fixed and cannot be seeded.
    pub fn seed_message(
        &mut self,
        run: Run,
        from: NodeId,
        to: NodeId,
        value: &V,
        message: f64,
    ) -> FactorTreeResult<bool> {
        self.node(from)?;
        self.check_neighbor(from, to)?;
        if self.is_leaf_variable(from) {
            return Err(FactorTreeError::LeafMessage {
                node: self.label(from),
                neighbor: self.label(to),
            });
        }
        if !message.is_finite() || message < 0. {
            return Err(FactorTreeError::InvalidQuality {
                factor: self.label(from),
                quality: message,
            });
        }
        let variable = self.edge_variable(from, to);
        let position = self.position(variable, value)?;
        let domain_size = self.variable(variable)?.domain_size();
        Ok(self.messages.insert(
            MessageKey::new(run, from, Some(to)),
            domain_size,
            position,
            message,
        ))
    }

    /// Reads a cached entry without computing anything; `to == None` reads a variable's belief
    pub fn cached_message(
        &self,
        run: Run,
        from: NodeId,
        to: Option<NodeId>,
        value: &V,
    ) -> Option<f64> {
        let variable = match to {
            Some(to) => {
                self.check_neighbor(from, to).ok()?;
                self.edge_variable(from, to)
            }
            None => from,
        };
        let position = self.position(variable, value).ok()?;
        self.messages
            .get(&MessageKey::new(run, from, to), position)
    }

    // Restricts an assignment to the neighbors of `factor`, in neighbor order, checking every value
    fn restrict(&self, factor: NodeId, assignment: &Assignment<V>) -> FactorTreeResult<Assignment<V>> {
        self.neighbors(factor)?
            .iter()
            .map(|&neighbor| -> FactorTreeResult<(NodeId, V)> {
                let value = assignment
                    .get(neighbor)
                    .ok_or_else(|| FactorTreeError::MissingAssignment {
                        factor: self.label(factor),
                        node: self.label(neighbor),
                    })?;
                self.position(neighbor, value)?;
                Ok((neighbor, value.clone()))
            })
            .collect()
    }

    /// Evaluates the quality of `factor` on any assignment covering its neighbors
    pub fn quality(&self, factor: NodeId, assignment: &Assignment<V>) -> FactorTreeResult<f64> {
        let weights = self.factor(factor)?;
        let restricted = self.restrict(factor, assignment)?;
        weights.quality(self.nodes[factor.index()].label(), &restricted)
    }

    pub fn diversity(&self, factor: NodeId, assignment: &Assignment<V>) -> FactorTreeResult<f64> {
        let weights = self.factor(factor)?;
        let restricted = self.restrict(factor, assignment)?;
        weights.diversity(&restricted)
    }

    /// Product of the qualities of every factor under a full assignment
    pub fn assignment_quality(&self, assignment: &Assignment<V>) -> FactorTreeResult<f64> {
        let mut product = 1.;
        for factor in self.get_factors() {
            product *= self.quality(factor, assignment)?;
        }
        Ok(product)
    }

    /// Computes every message flowing toward `target` and, for a variable target, its belief at every value
    pub fn run_forward(&mut self, target: NodeId, run: Run) -> FactorTreeResult<Traversal> {
        let time_start = Instant::now();
        self.node(target)?;
        let traversal = Traversal::new(target, run, &self.neighbors);

        if self.node(target)?.is_variable() {
            let domain_size = self.variable(target)?.domain_size();
            let mut engine = self.engine(run);
            for position in 0..domain_size {
                engine.message(target, None, position)?;
            }
        } else {
            let incoming = self.neighbors[target.index()]
                .iter()
                .map(|neighbor| {
                    self.variable(*neighbor)
                        .map(|variable| (*neighbor, variable.domain_size()))
                })
                .collect::<FactorTreeResult<Vec<_>>>()?;
            let mut engine = self.engine(run);
            for (neighbor, domain_size) in incoming {
                for position in 0..domain_size {
                    engine.message(neighbor, Some(target), position)?;
                }
            }
        }

        info!(
            "Forward {} pass toward {} resolved {} edges, {} entries cached. Elapsed time {:?}.",
            run,
            self.label(target),
            traversal.resolved_edges().count(),
            self.messages.num_entries_in_run(run),
            time_start.elapsed()
        );
        Ok(traversal)
    }

    /// Forward pass under max-product: every belief of `target` becomes the best achievable
    /// quality of the whole tree conditioned on that value
    pub fn run_max_quality_forward(&mut self, target: NodeId) -> FactorTreeResult<(Traversal, Run)> {
        let run = Run::MaxProduct;
        let traversal = self.run_forward(target, run)?;
        Ok((traversal, run))
    }

    /// Reconstructs a full assignment attaining the maximum recorded for `start_value`.
    /// Walks outward from the traversal target; at every factor the first consistent assignment
    /// attaining the maximum fixes the factor's remaining neighbors.
    pub fn get_max_from_start_assignment(
        &mut self,
        start: NodeId,
        start_value: &V,
        traversal: &Traversal,
        run: Run,
    ) -> FactorTreeResult<Assignment<V>> {
        if traversal.run() != run {
            return Err(FactorTreeError::RunMismatch {
                expected: traversal.run(),
                found: run,
            });
        }
        if traversal.num_nodes() != self.len() || traversal.num_visited() != self.len() {
            return Err(FactorTreeError::TraversalMismatch(format!(
                "traversal covers {} of {} nodes",
                traversal.num_visited(),
                self.len()
            )));
        }
        if traversal.target() != start {
            return Err(FactorTreeError::TraversalMismatch(format!(
                "traceback starts at {} but the traversal targets {}",
                self.label(start),
                self.label(traversal.target())
            )));
        }
        let start_position = self.position(start, start_value)?;

        let mut positions: Vec<Option<usize>> = vec![None; self.len()];
        positions[start.index()] = Some(start_position);
        {
            let nodes = &self.nodes;
            let neighbors = &self.neighbors;
            let mut engine = MessagePassing::new(nodes, neighbors, &mut self.messages, run);
            let mut stack = vec![start];
            while let Some(node) = stack.pop() {
                let is_variable = nodes[node.index()].is_variable();
                for outward in traversal.outward(node, neighbors) {
                    if is_variable {
                        let fixed_position = positions[node.index()].ok_or_else(|| {
                            FactorTreeError::TraversalMismatch(format!(
                                "{} was reached before its value was fixed",
                                nodes[node.index()].label()
                            ))
                        })?;
                        let (digits, best) =
                            engine.best_consistent_assignment(outward, node, fixed_position)?;
                        debug!(
                            "Traceback through {} from {}: best term {}",
                            nodes[outward.index()].label(),
                            nodes[node.index()].label(),
                            best
                        );
                        for (neighbor, digit) in neighbors[outward.index()].iter().zip(digits) {
                            if *neighbor != node {
                                positions[neighbor.index()] = Some(digit);
                            }
                        }
                    }
                    stack.push(outward);
                }
            }
        }

        self.get_variables()
            .map(|variable| -> FactorTreeResult<(NodeId, V)> {
                let position = positions[variable.index()].ok_or_else(|| {
                    FactorTreeError::TraversalMismatch(format!(
                        "traceback did not reach {}",
                        self.label(variable)
                    ))
                })?;
                Ok((variable, self.variable(variable)?.value(position).clone()))
            })
            .collect()
    }

    /// Groups the values of `variable` by `group_key` and keeps, per group, the value with the
    /// largest belief. The first value in domain order wins ties.
    pub fn get_good_max_samples<K, F>(
        &mut self,
        variable: NodeId,
        run: Run,
        group_key: F,
    ) -> FactorTreeResult<BTreeMap<K, MaxSample<V>>>
    where
        K: Ord,
        F: Fn(&V) -> K,
    {
        let domain_size = self.variable(variable)?.domain_size();
        let mut beliefs = Vec::with_capacity(domain_size);
        {
            let mut engine = self.engine(run);
            for position in 0..domain_size {
                beliefs.push(engine.message(variable, None, position)?);
            }
        }

        let mut groups = BTreeMap::new();
        for (value, message) in self.variable(variable)?.allowed_values().iter().zip(beliefs) {
            let sample = MaxSample {
                value: value.clone(),
                message,
            };
            match groups.entry(group_key(value)) {
                Entry::Vacant(entry) => {
                    entry.insert(sample);
                }
                Entry::Occupied(mut entry) => {
                    if message > entry.get().message {
                        entry.insert(sample);
                    }
                }
            }
        }
        debug!(
            "Grouped {} values of {} into {} buckets",
            domain_size,
            self.label(variable),
            groups.len()
        );
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment<V: Clone>(entries: &[(NodeId, V)]) -> Assignment<V> {
        entries.iter().cloned().collect()
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= 1e-9 * expected.abs().max(1.),
            "expected {}, got {}",
            expected,
            actual
        );
    }

    fn sum_of_values(assignment: &Assignment<i64>) -> f64 {
        assignment.values().sum::<i64>() as f64
    }

    fn square_of_first(assignment: &Assignment<i64>) -> f64 {
        let value = assignment.values().next().copied().unwrap_or_default();
        (value * value) as f64
    }

    #[test]
    fn get_consistent_assignments() {
        let mut nodes = ConnectedNodes::new();
        let parent = nodes.add_variable(Variable::new(['0', '1', '2']));
        let factor = nodes.add_factor(Factor::new(|_| 1.));
        nodes.set_parent(factor, parent).unwrap();
        let tree = FactorTree::create_from_connected_nodes(nodes).unwrap();
        let assignments: Vec<_> = tree
            .get_consistent_assignments(factor, parent, &'1')
            .unwrap()
            .collect();
        assert_eq!(assignments, vec![assignment(&[(parent, '1')])]);

        let mut nodes = ConnectedNodes::new();
        let parent = nodes.add_variable(Variable::new(['0', '1', '2']));
        let factor = nodes.add_factor(Factor::new(|_| 1.));
        let child_1 = nodes.add_variable(Variable::new(['a', 'b']));
        nodes.set_parent(factor, parent).unwrap();
        nodes.add_children(factor, [child_1]).unwrap();
        let tree = FactorTree::create_from_connected_nodes(nodes).unwrap();
        let assignments: Vec<_> = tree
            .get_consistent_assignments(factor, parent, &'1')
            .unwrap()
            .collect();
        assert_eq!(
            assignments,
            vec![
                assignment(&[(parent, '1'), (child_1, 'a')]),
                assignment(&[(parent, '1'), (child_1, 'b')]),
            ]
        );

        let mut nodes = ConnectedNodes::new();
        let parent = nodes.add_variable(Variable::new(['0', '1', '2']));
        let factor = nodes.add_factor(Factor::new(|_| 1.));
        let child_1 = nodes.add_variable(Variable::new(['a', 'b']));
        let child_2 = nodes.add_variable(Variable::new(['c', 'd']));
        nodes.set_parent(factor, parent).unwrap();
        nodes.set_children(factor, [child_1, child_2]).unwrap();
        let tree = FactorTree::create_from_connected_nodes(nodes).unwrap();
        let assignments: Vec<_> = tree
            .get_consistent_assignments(factor, child_1, &'a')
            .unwrap()
            .collect();
        let expected: Vec<_> = [('c', '0'), ('c', '1'), ('c', '2'), ('d', '0'), ('d', '1'), ('d', '2')]
            .into_iter()
            .map(|(second, third)| assignment(&[(child_1, 'a'), (child_2, second), (parent, third)]))
            .collect();
        assert_eq!(assignments, expected);
        assert_eq!(
            assignments[0].nodes().collect::<Vec<_>>(),
            vec![child_1, child_2, parent]
        );

        // Restartable: a second call yields the same sequence
        assert_eq!(
            tree.get_consistent_assignments(factor, child_1, &'a')
                .unwrap()
                .count(),
            6
        );
        assert!(matches!(
            tree.get_consistent_assignments(factor, child_1, &'z'),
            Err(FactorTreeError::DomainMismatch { .. })
        ));
    }

    #[test]
    fn factor_create_message() {
        let mut nodes = ConnectedNodes::new();
        let parent = nodes.add_named_variable("ParentVar", Variable::new([0, 1, 2, 3]));
        let childless = nodes.add_factor(Factor::new(square_of_first));
        nodes.set_parent(childless, parent).unwrap();
        let mut tree = FactorTree::create_from_connected_nodes(nodes).unwrap();
        assert_eq!(
            tree.create_message(childless, parent, &2, Run::SumProduct)
                .unwrap(),
            4.
        );

        let mut nodes = ConnectedNodes::new();
        let parent = nodes.add_named_variable("ParentVar", Variable::new([0, 1, 2, 3]));
        let parentless = nodes.add_factor(Factor::new(square_of_first));
        nodes.add_child(parentless, parent).unwrap();
        let mut tree = FactorTree::create_from_connected_nodes(nodes).unwrap();
        assert_eq!(
            tree.create_message(parentless, parent, &3, Run::MaxProduct)
                .unwrap(),
            9.
        );

        let mut nodes = ConnectedNodes::new();
        let parent = nodes.add_named_variable("ParentVar", Variable::new([0, 1, 2, 3]));
        let children = vec![
            nodes.add_named_variable("Var0", Variable::new([0, 1, 2])),
            nodes.add_named_variable("Var1", Variable::new([0, 1, 2])),
        ];
        let factor = nodes.add_factor(Factor::new(sum_of_values));
        nodes.set_parent(factor, parent).unwrap();
        nodes.add_children(factor, children.clone()).unwrap();
        // Each child relays what its unary factor sends, so seeding the unary side fixes the child's message
        let unaries: Vec<NodeId> = children
            .iter()
            .map(|child| {
                let unary = nodes.add_factor(Factor::new(|_| 1.));
                nodes.set_parent(unary, *child).unwrap();
                unary
            })
            .collect();
        let mut tree = FactorTree::create_from_connected_nodes(nodes).unwrap();
        for (child, unary) in children.iter().zip(&unaries) {
            for value in 0..3 {
                tree.seed_message(Run::SumProduct, *unary, *child, &value, value as f64)
                    .unwrap();
            }
        }
        assert_eq!(
            tree.create_message(children[1], factor, &2, Run::SumProduct)
                .unwrap(),
            2.
        );

        assert_eq!(
            tree.create_message(factor, parent, &0, Run::SumProduct)
                .unwrap(),
            ((1 + 1) * 1 * 1 + (1 + 2) * 1 * 2 * 2 + (2 + 2) * 2 * 2) as f64
        );
        assert_eq!(
            tree.create_message(factor, parent, &2, Run::SumProduct)
                .unwrap(),
            ((2 + 1 + 1) * 1 * 1 + (2 + 1 + 2) * 1 * 2 * 2 + (2 + 2 + 2) * 2 * 2) as f64
        );
        assert_eq!(
            tree.cached_message(Run::SumProduct, factor, Some(parent), &2),
            Some(48.)
        );
    }

    #[test]
    fn variable_create_message() {
        let mut nodes = ConnectedNodes::new();
        let parent = nodes.add_factor(Factor::new(|_| 1.));
        let childless = nodes.add_variable(Variable::new([22]));
        nodes.set_parent(childless, parent).unwrap();
        let mut tree = FactorTree::create_from_connected_nodes(nodes).unwrap();
        for run in [Run::SumProduct, Run::MaxProduct] {
            assert_eq!(tree.create_message(childless, parent, &22, run).unwrap(), 1.);
        }
        for value in [9, 90_000, -22] {
            assert_eq!(
                tree.create_message(childless, parent, &value, Run::SumProduct)
                    .unwrap(),
                1.
            );
        }
        assert!(matches!(
            tree.seed_message(Run::SumProduct, childless, parent, &22, 5.),
            Err(FactorTreeError::LeafMessage { .. })
        ));
        assert_eq!(
            tree.create_message(childless, parent, &22, Run::SumProduct)
                .unwrap(),
            1.
        );

        let mut nodes = ConnectedNodes::new();
        let parent = nodes.add_factor(Factor::new(|_| 1.));
        let children: Vec<NodeId> = (0..4)
            .map(|_| nodes.add_factor(Factor::new(|_| 1.)))
            .collect();
        let variable = nodes.add_variable(Variable::new(['a', 'b']));
        nodes.set_parent(variable, parent).unwrap();
        nodes.add_children(variable, children.clone()).unwrap();
        let mut tree = FactorTree::create_from_connected_nodes(nodes).unwrap();

        let run = Run::MaxProduct;
        for (index, child) in children.iter().enumerate() {
            tree.seed_message(run, *child, variable, &'a', 5.).unwrap();
            tree.seed_message(run, *child, variable, &'b', (index + 1) as f64)
                .unwrap();
        }
        tree.seed_message(run, parent, variable, &'b', 100.).unwrap();

        assert_eq!(
            tree.create_message(variable, parent, &'a', run).unwrap(),
            5f64.powi(4)
        );
        assert_eq!(
            tree.create_message(variable, children[0], &'b', run)
                .unwrap(),
            (2 * 3 * 4 * 100) as f64
        );
    }

    // v0 - f01 - v1 - f12 - v2, with a unary factor u1 on v1
    struct Chain {
        tree: FactorTree<usize>,
        variables: [NodeId; 3],
    }

    const PAIR_01: [[f64; 2]; 3] = [[0.2, 1.5], [0.7, 0.1], [2.0, 0.4]];
    const PAIR_12: [[f64; 3]; 2] = [[1.0, 0.3, 0.6], [0.2, 2.5, 0.9]];
    const UNARY_1: [f64; 2] = [0.8, 1.3];

    fn chain() -> Chain {
        let mut nodes = ConnectedNodes::new();
        let v0 = nodes.add_named_variable("v0", Variable::new(0..3));
        let v1 = nodes.add_named_variable("v1", Variable::new(0..2));
        let v2 = nodes.add_named_variable("v2", Variable::new(0..3));
        let f01 = nodes.add_named_factor(
            "f01",
            Factor::new(move |a: &Assignment<usize>| PAIR_01[a[v0]][a[v1]]),
        );
        let f12 = nodes.add_named_factor(
            "f12",
            Factor::new(move |a: &Assignment<usize>| PAIR_12[a[v1]][a[v2]]),
        );
        let u1 = nodes.add_named_factor(
            "u1",
            Factor::new(move |a: &Assignment<usize>| UNARY_1[a[v1]]),
        );
        nodes.set_parent(f01, v0).unwrap();
        nodes.set_parent(v1, f01).unwrap();
        nodes.set_parent(f12, v1).unwrap();
        nodes.set_parent(v2, f12).unwrap();
        nodes.set_parent(u1, v1).unwrap();
        Chain {
            tree: FactorTree::create_from_connected_nodes(nodes).unwrap(),
            variables: [v0, v1, v2],
        }
    }

    fn joint(x0: usize, x1: usize, x2: usize) -> f64 {
        PAIR_01[x0][x1] * PAIR_12[x1][x2] * UNARY_1[x1]
    }

    #[test]
    fn beliefs_match_brute_force() {
        let Chain {
            mut tree,
            variables,
        } = chain();
        for x1 in 0..2 {
            let terms: Vec<f64> = (0..3)
                .flat_map(|x0| (0..3).map(move |x2| joint(x0, x1, x2)))
                .collect();
            assert_close(
                tree.belief(variables[1], &x1, Run::SumProduct).unwrap(),
                terms.iter().sum(),
            );
            assert_close(
                tree.belief(variables[1], &x1, Run::MaxProduct).unwrap(),
                terms.iter().cloned().fold(0., f64::max),
            );
        }
        for x0 in 0..3 {
            let total: f64 = (0..2)
                .flat_map(|x1| (0..3).map(move |x2| joint(x0, x1, x2)))
                .sum();
            assert_close(tree.belief(variables[0], &x0, Run::SumProduct).unwrap(), total);
        }
    }

    #[test]
    fn traceback_reproduces_maximum() {
        let Chain {
            mut tree,
            variables,
        } = chain();
        let (traversal, run) = tree.run_max_quality_forward(variables[1]).unwrap();
        assert_eq!(run, Run::MaxProduct);
        assert_eq!(traversal.num_visited(), tree.len());

        for x1 in 0..2 {
            let maximum = tree
                .cached_message(run, variables[1], None, &x1)
                .unwrap();
            let best = tree
                .get_max_from_start_assignment(variables[1], &x1, &traversal, run)
                .unwrap();
            assert_eq!(best.len(), 3);
            assert_eq!(best[variables[1]], x1);
            assert_close(tree.assignment_quality(&best).unwrap(), maximum);
            assert_close(joint(best[variables[0]], x1, best[variables[2]]), maximum);
        }

        assert!(matches!(
            tree.get_max_from_start_assignment(variables[0], &0, &traversal, run),
            Err(FactorTreeError::TraversalMismatch(_))
        ));
        assert!(matches!(
            tree.get_max_from_start_assignment(variables[1], &0, &traversal, Run::SumProduct),
            Err(FactorTreeError::RunMismatch { .. })
        ));
    }

    fn star_weight(a: usize, b: usize, c: usize) -> f64 {
        1. + ((a * 7 + b * 3 + c * 5) % 4) as f64 * 0.5
    }

    const UNARY_A: [f64; 3] = [0.5, 2.0, 1.0];
    const UNARY_B: [f64; 2] = [1.5, 0.7];

    // Factor f over children a, b and parent c, with unary factors on a and b
    #[test]
    fn traceback_through_three_neighbors() {
        let mut nodes = ConnectedNodes::new();
        let a = nodes.add_named_variable("a", Variable::new(0..3usize));
        let b = nodes.add_named_variable("b", Variable::new(0..2usize));
        let c = nodes.add_named_variable("c", Variable::new(0..3usize));
        let factor = nodes.add_named_factor(
            "f",
            Factor::new(move |x: &Assignment<usize>| star_weight(x[a], x[b], x[c])),
        );
        let unary_a = nodes.add_factor(Factor::new(move |x: &Assignment<usize>| UNARY_A[x[a]]));
        let unary_b = nodes.add_factor(Factor::new(move |x: &Assignment<usize>| UNARY_B[x[b]]));
        nodes.set_parent(factor, c).unwrap();
        nodes.set_children(factor, [a, b]).unwrap();
        nodes.set_parent(unary_a, a).unwrap();
        nodes.set_parent(unary_b, b).unwrap();
        let mut tree = FactorTree::create_from_connected_nodes(nodes).unwrap();
        assert_eq!(tree.neighbors(factor).unwrap(), &[a, b, c]);

        let (traversal, run) = tree.run_max_quality_forward(c).unwrap();
        for xc in 0..3 {
            let brute_force = (0..3)
                .flat_map(|xa| (0..2).map(move |xb| (xa, xb)))
                .map(|(xa, xb)| star_weight(xa, xb, xc) * UNARY_A[xa] * UNARY_B[xb])
                .fold(0., f64::max);
            let maximum = tree.cached_message(run, c, None, &xc).unwrap();
            assert_close(maximum, brute_force);

            let best = tree
                .get_max_from_start_assignment(c, &xc, &traversal, run)
                .unwrap();
            assert_eq!(best[c], xc);
            assert_close(tree.assignment_quality(&best).unwrap(), maximum);
            assert_close(
                star_weight(best[a], best[b], xc) * UNARY_A[best[a]] * UNARY_B[best[b]],
                brute_force,
            );
        }
    }

    #[test]
    fn max_never_exceeds_best_term() {
        let Chain {
            mut tree,
            variables,
        } = chain();
        let f01 = tree
            .get_factors()
            .find(|factor| tree.node(*factor).unwrap().name() == Some("f01"))
            .unwrap();
        for x0 in 0..3 {
            let message = tree
                .create_message(f01, variables[0], &x0, Run::MaxProduct)
                .unwrap();
            let terms: Vec<f64> = (0..2)
                .map(|x1| {
                    let rest = (0..3)
                        .map(|x2| PAIR_12[x1][x2])
                        .fold(0., f64::max);
                    PAIR_01[x0][x1] * UNARY_1[x1] * rest
                })
                .collect();
            let best = terms.iter().cloned().fold(0., f64::max);
            assert!(message <= best + 1e-12);
            assert_close(message, best);
        }
    }

    #[test]
    fn sum_product_ignores_enumeration_order() {
        let weights = [[0.3, 1.1, 0.4], [2.2, 0.9, 0.05]];
        let mut results = Vec::new();
        for reversed in [false, true] {
            let mut nodes = ConnectedNodes::new();
            let parent = nodes.add_variable(Variable::new(0..4usize));
            let first = nodes.add_variable(Variable::new(0..2usize));
            let second = nodes.add_variable(Variable::new(0..3usize));
            let factor = nodes.add_factor(Factor::new(move |a: &Assignment<usize>| {
                weights[a[first]][a[second]] * (a[parent] + 1) as f64
            }));
            nodes.set_parent(factor, parent).unwrap();
            let children = if reversed { [second, first] } else { [first, second] };
            nodes.add_children(factor, children).unwrap();
            for child in [first, second] {
                let unary = nodes.add_factor(Factor::new(move |a: &Assignment<usize>| {
                    1. + a.values().next().copied().unwrap_or_default() as f64
                }));
                nodes.set_parent(unary, child).unwrap();
            }
            let mut tree = FactorTree::create_from_connected_nodes(nodes).unwrap();
            let messages: Vec<f64> = (0..4)
                .map(|value| {
                    tree.create_message(factor, parent, &value, Run::SumProduct)
                        .unwrap()
                })
                .collect();
            results.push(messages);
        }
        for (forward, backward) in results[0].iter().zip(&results[1]) {
            assert_close(*forward, *backward);
        }
    }

    #[test]
    fn zero_quality_prunes_branch() {
        let mut nodes = ConnectedNodes::new();
        let first = nodes.add_variable(Variable::new(0..3i64));
        let second = nodes.add_variable(Variable::new(0..3i64));
        let factor = nodes.add_factor(Factor::new(move |a: &Assignment<i64>| {
            if (a[first] - a[second]).abs() > 1 {
                0.
            } else {
                1.
            }
        }));
        nodes.set_parent(factor, first).unwrap();
        nodes.add_child(factor, second).unwrap();
        let mut tree = FactorTree::create_from_connected_nodes(nodes).unwrap();
        assert_eq!(tree.belief(first, &0, Run::SumProduct).unwrap(), 2.);
        assert_eq!(tree.belief(first, &1, Run::SumProduct).unwrap(), 3.);
        assert_eq!(tree.belief(first, &2, Run::MaxProduct).unwrap(), 1.);
    }

    #[test]
    fn deep_chain_does_not_recurse() {
        let length = 3000;
        let mut nodes = ConnectedNodes::with_capacity(2 * length);
        let mut current = nodes.add_variable(Variable::new([0u8, 1]));
        let first = current;
        for _ in 1..length {
            let factor = nodes.add_factor(Factor::new(|_| 0.5));
            nodes.set_parent(factor, current).unwrap();
            current = nodes.add_variable(Variable::new([0u8, 1]));
            nodes.set_parent(current, factor).unwrap();
        }
        let mut tree = FactorTree::create_from_connected_nodes(nodes).unwrap();
        assert_eq!(tree.root(), first);

        tree.run_forward(current, Run::SumProduct).unwrap();
        for value in [0u8, 1] {
            assert_close(
                tree.cached_message(Run::SumProduct, current, None, &value)
                    .unwrap(),
                1.,
            );
        }
        assert_eq!(
            tree.messages().num_entries_in_run(Run::SumProduct),
            2 * (2 * length - 2) + 2
        );
    }

    #[test]
    fn runs_are_cached_separately() {
        let Chain {
            mut tree,
            variables,
        } = chain();
        let sum = tree.belief(variables[2], &1, Run::SumProduct).unwrap();
        let max = tree.belief(variables[2], &1, Run::MaxProduct).unwrap();
        assert!(sum > max);
        assert_eq!(tree.cached_message(Run::SumProduct, variables[2], None, &1), Some(sum));

        tree.reset_run(Run::SumProduct);
        assert_eq!(tree.cached_message(Run::SumProduct, variables[2], None, &1), None);
        assert_eq!(tree.cached_message(Run::MaxProduct, variables[2], None, &1), Some(max));

        tree.reset_messages();
        assert_eq!(tree.messages().num_entries(), 0);
    }

    #[test]
    fn forward_toward_factor() {
        let Chain {
            mut tree,
            variables,
        } = chain();
        let f12 = tree
            .get_factors()
            .find(|factor| tree.node(*factor).unwrap().name() == Some("f12"))
            .unwrap();
        let traversal = tree.run_forward(f12, Run::SumProduct).unwrap();
        assert_eq!(traversal.target(), f12);
        for value in 0..3 {
            assert!(tree
                .cached_message(Run::SumProduct, variables[2], Some(f12), &value)
                .is_some());
        }
        for value in 0..2 {
            assert!(tree
                .cached_message(Run::SumProduct, variables[1], Some(f12), &value)
                .is_some());
        }
    }

    #[test]
    fn good_max_samples_keep_best_per_bucket() {
        let qualities = [1., 5., 5., 2., 8., 3., 0.5];
        let mut nodes = ConnectedNodes::new();
        let variable = nodes.add_variable(Variable::new(0..7usize));
        let unary = nodes.add_factor(Factor::new(move |a: &Assignment<usize>| {
            qualities[*a.values().next().unwrap_or(&0)]
        }));
        nodes.set_parent(unary, variable).unwrap();
        let mut tree = FactorTree::create_from_connected_nodes(nodes).unwrap();

        let (_, run) = tree.run_max_quality_forward(variable).unwrap();
        let samples = tree
            .get_good_max_samples(variable, run, |value| value / 3)
            .unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[&0], MaxSample { value: 1, message: 5. });
        assert_eq!(samples[&1], MaxSample { value: 4, message: 8. });
        assert_eq!(samples[&2], MaxSample { value: 6, message: 0.5 });
    }

    #[test]
    fn quality_and_diversity_on_assignments() {
        let Chain { tree, variables } = chain();
        let f01 = tree
            .get_factors()
            .find(|factor| tree.node(*factor).unwrap().name() == Some("f01"))
            .unwrap();

        let full = assignment(&[(variables[2], 0), (variables[1], 1), (variables[0], 2)]);
        assert_eq!(tree.quality(f01, &full).unwrap(), PAIR_01[2][1]);
        assert_close(tree.assignment_quality(&full).unwrap(), joint(2, 1, 0));

        let outside = assignment(&[(variables[0], 5), (variables[1], 0)]);
        assert!(matches!(
            tree.quality(f01, &outside),
            Err(FactorTreeError::DomainMismatch { .. })
        ));
        let partial = assignment(&[(variables[0], 1)]);
        assert!(matches!(
            tree.quality(f01, &partial),
            Err(FactorTreeError::MissingAssignment { .. })
        ));
        assert!(matches!(
            tree.diversity(f01, &full),
            Err(FactorTreeError::Unimplemented(_))
        ));
        assert!(matches!(
            tree.quality(variables[0], &full),
            Err(FactorTreeError::NotAFactor { .. })
        ));
    }

    #[test]
    fn negative_quality_is_rejected() {
        let mut nodes = ConnectedNodes::new();
        let variable = nodes.add_variable(Variable::new([0, 1]));
        let factor = nodes.add_factor(Factor::new(|_| -0.5));
        nodes.set_parent(factor, variable).unwrap();
        let mut tree = FactorTree::create_from_connected_nodes(nodes).unwrap();
        assert!(matches!(
            tree.belief(variable, &0, Run::SumProduct),
            Err(FactorTreeError::InvalidQuality { .. })
        ));
        assert!(tree
            .seed_message(Run::SumProduct, factor, variable, &1, -1.)
            .is_err());
    }

    #[test]
    fn assembly_rejects_invalid_structures() {
        assert!(matches!(
            FactorTree::create_from_connected_nodes(ConnectedNodes::<i32>::new()),
            Err(FactorTreeError::EmptyTree)
        ));

        let mut nodes = ConnectedNodes::new();
        nodes.add_variable(Variable::new([0]));
        nodes.add_variable(Variable::new([1]));
        assert!(matches!(
            FactorTree::create_from_connected_nodes(nodes),
            Err(FactorTreeError::Disconnected { components: 2 })
        ));

        // v0 -> f0 -> v1 -> f1 -> v0
        let mut nodes = ConnectedNodes::new();
        let v0 = nodes.add_variable(Variable::new([0]));
        let v1 = nodes.add_variable(Variable::new([0]));
        let f0 = nodes.add_factor(Factor::new(|_| 1.));
        let f1 = nodes.add_factor(Factor::new(|_| 1.));
        nodes.set_parent(f0, v0).unwrap();
        nodes.set_parent(v1, f0).unwrap();
        nodes.set_parent(f1, v1).unwrap();
        nodes.set_parent(v0, f1).unwrap();
        assert!(matches!(
            FactorTree::create_from_connected_nodes(nodes),
            Err(FactorTreeError::Cyclic)
        ));

        // Two nodes naming each other as parent
        let mut nodes = ConnectedNodes::new();
        let v0 = nodes.add_variable(Variable::new([0]));
        let f0 = nodes.add_factor(Factor::new(|_| 1.));
        nodes.set_parent(v0, f0).unwrap();
        nodes.set_parent(f0, v0).unwrap();
        assert!(matches!(
            FactorTree::create_from_connected_nodes(nodes),
            Err(FactorTreeError::Cyclic)
        ));

        let mut nodes = ConnectedNodes::new();
        let v0 = nodes.add_named_variable("shared", Variable::new([0]));
        let f0 = nodes.add_factor(Factor::new(|_| 1.));
        let f1 = nodes.add_factor(Factor::new(|_| 1.));
        nodes.add_child(f0, v0).unwrap();
        nodes.add_child(f1, v0).unwrap();
        assert!(matches!(
            FactorTree::create_from_connected_nodes(nodes),
            Err(FactorTreeError::MultipleParents { node }) if node == "shared"
        ));

        let mut nodes = ConnectedNodes::new();
        let v0 = nodes.add_variable(Variable::new([0]));
        let v1 = nodes.add_variable(Variable::new([0]));
        nodes.set_parent(v1, v0).unwrap();
        assert!(matches!(
            FactorTree::create_from_connected_nodes(nodes),
            Err(FactorTreeError::SameKindNeighbors { kind: "Variable", .. })
        ));

        let mut nodes = ConnectedNodes::new();
        nodes.add_variable(Variable::new(Vec::<i32>::new()));
        assert!(matches!(
            FactorTree::create_from_connected_nodes(nodes),
            Err(FactorTreeError::EmptyDomain { .. })
        ));
    }

    #[test]
    fn iteration_and_neighbors() {
        let Chain {
            mut tree,
            variables,
        } = chain();
        assert_eq!(tree.len(), 6);
        assert_eq!(tree.get_variables().collect::<Vec<_>>(), variables.to_vec());
        assert_eq!(tree.get_factors().count(), 3);
        assert_eq!(tree.root(), variables[0]);

        // v1: children f12 and u1 in declaration order of the mirrored links, then parent f01
        let neighbors = tree.neighbors(variables[1]).unwrap();
        assert_eq!(neighbors.len(), 3);
        assert_eq!(tree.node(neighbors[2]).unwrap().name(), Some("f01"));
        assert_eq!(tree.display(variables[1]).to_string(), "v1(parent=f01,2 children)");
        assert!(matches!(
            tree.create_message(variables[0], variables[2], &0, Run::SumProduct),
            Err(FactorTreeError::NotANeighbor { .. })
        ));
    }
}
