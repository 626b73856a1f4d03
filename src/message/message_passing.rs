use std::{fmt::Debug, hash::Hash};

use log::debug;

use crate::factor_tree::{
    assignment::{Assignment, Odometer},
    errors::{FactorTreeError, FactorTreeResult},
    factor::Factor,
    node::{Node, NodeId, NodeKind},
    variable::Variable,
};

use super::{
    messages::{MessageKey, Messages},
    run::Run,
};

// A single message entry that has been asked for
#[derive(Clone, Copy, Debug)]
struct Demand {
    key: MessageKey,
    position: usize,
}

/// Computes messages on demand for one run over an assembled tree, memoizing every entry it produces.
/// Missing upstream entries are pulled through an explicit worklist rather than by recursion,
/// so the depth of the tree never translates into call-stack depth.
pub(crate) struct MessagePassing<'a, V> {
    nodes: &'a [Node<V>],
    neighbors: &'a [Vec<NodeId>],
    messages: &'a mut Messages,
    run: Run,
}

impl<'a, V: Clone + Eq + Hash + Debug> MessagePassing<'a, V> {
    // Assumption: `nodes` and `neighbors` describe a validated tree whose variables and factors alternate
    pub(crate) fn new(
        nodes: &'a [Node<V>],
        neighbors: &'a [Vec<NodeId>],
        messages: &'a mut Messages,
        run: Run,
    ) -> Self {
        MessagePassing {
            nodes,
            neighbors,
            messages,
            run,
        }
    }

    fn label(&self, node: NodeId) -> String {
        self.nodes[node.index()].label().to_string()
    }

    fn variable(&self, node: NodeId) -> FactorTreeResult<&'a Variable<V>> {
        let nodes = self.nodes;
        nodes[node.index()]
            .as_variable()
            .ok_or_else(|| FactorTreeError::NotAVariable {
                node: self.label(node),
            })
    }

    fn factor(&self, node: NodeId) -> FactorTreeResult<&'a Factor<V>> {
        let nodes = self.nodes;
        nodes[node.index()]
            .as_factor()
            .ok_or_else(|| FactorTreeError::NotAFactor {
                node: self.label(node),
            })
    }

    // The variable whose domain indexes the message identified by `key`
    fn message_variable(&self, key: &MessageKey) -> FactorTreeResult<&'a Variable<V>> {
        match (self.nodes[key.from.index()].kind(), key.to) {
            (NodeKind::Variable(_), _) => self.variable(key.from),
            (NodeKind::Factor(_), Some(to)) => self.variable(to),
            (NodeKind::Factor(_), None) => Err(FactorTreeError::NotAVariable {
                node: self.label(key.from),
            }),
        }
    }

    fn cached(&self, key: MessageKey, position: usize) -> FactorTreeResult<f64> {
        self.messages
            .get(&key, position)
            .ok_or_else(|| FactorTreeError::MissingMessage {
                from: self.label(key.from),
                to: key.to.map_or("belief".to_string(), |to| self.label(to)),
                position,
            })
    }

    /// Returns the message from `from` to `to` at a domain position, computing whatever it depends on.
    /// `to == None` asks for the belief of variable `from`.
    pub(crate) fn message(
        &mut self,
        from: NodeId,
        to: Option<NodeId>,
        position: usize,
    ) -> FactorTreeResult<f64> {
        let key = MessageKey::new(self.run, from, to);
        let domain_size = self.message_variable(&key)?.domain_size();
        if position >= domain_size {
            return Err(FactorTreeError::DomainMismatch {
                node: self.label(from),
                value: format!("position {}", position),
            });
        }
        self.ensure(Demand { key, position })
    }

    fn ensure(&mut self, demand: Demand) -> FactorTreeResult<f64> {
        if let Some(value) = self.messages.get(&demand.key, demand.position) {
            return Ok(value);
        }

        // Each frame is expanded at most once; when it is revisited its prerequisites are cached
        let mut stack = vec![(demand, false)];
        let mut missing = Vec::new();
        while let Some(&(top, expanded)) = stack.last() {
            if self.messages.contains(&top.key, top.position) {
                stack.pop();
                continue;
            }

            if !expanded {
                self.missing_prerequisites(top, &mut missing)?;
                if !missing.is_empty() {
                    if let Some(frame) = stack.last_mut() {
                        frame.1 = true;
                    }
                    stack.extend(missing.drain(..).map(|prerequisite| (prerequisite, false)));
                    continue;
                }
            }

            let value = self.compute(top)?;
            let domain_size = self.message_variable(&top.key)?.domain_size();
            debug!(
                "Computed {} message from {} to {} at position {}: {}",
                self.run,
                self.label(top.key.from),
                top.key.to.map_or("belief".to_string(), |to| self.label(to)),
                top.position,
                value
            );
            self.messages
                .insert(top.key, domain_size, top.position, value);
            stack.pop();
        }

        self.cached(demand.key, demand.position)
    }

    // Collects the incoming entries `demand` needs that are not cached yet.
    // A variable needs its other neighbors' messages at the same position;
    // a factor needs its other neighbors' messages at every position.
    fn missing_prerequisites(
        &self,
        demand: Demand,
        missing: &mut Vec<Demand>,
    ) -> FactorTreeResult<()> {
        let from = demand.key.from;
        let is_variable = self.nodes[from.index()].is_variable();
        for &neighbor in &self.neighbors[from.index()] {
            if Some(neighbor) == demand.key.to {
                continue;
            }
            let key = MessageKey::new(self.run, neighbor, Some(from));
            if is_variable {
                if !self.messages.contains(&key, demand.position) {
                    missing.push(Demand {
                        key,
                        position: demand.position,
                    });
                }
            } else {
                let domain_size = self.variable(neighbor)?.domain_size();
                missing.extend(
                    (0..domain_size)
                        .filter(|position| !self.messages.contains(&key, *position))
                        .map(|position| Demand { key, position }),
                );
            }
        }
        Ok(())
    }

    // Assumption: every prerequisite of `demand` is cached
    fn compute(&self, demand: Demand) -> FactorTreeResult<f64> {
        let from = demand.key.from;
        match self.nodes[from.index()].kind() {
            NodeKind::Variable(variable) => {
                let incoming = self.neighbors[from.index()]
                    .iter()
                    .filter(|neighbor| Some(**neighbor) != demand.key.to)
                    .map(|neighbor| {
                        self.cached(
                            MessageKey::new(self.run, *neighbor, Some(from)),
                            demand.position,
                        )
                    })
                    .collect::<FactorTreeResult<Vec<f64>>>()?;
                Ok(variable.create_message(self.run, incoming))
            }
            NodeKind::Factor(factor) => {
                let to = demand.key.to.ok_or_else(|| FactorTreeError::NotAVariable {
                    node: self.label(from),
                })?;
                self.factor_message(from, factor, to, demand.position)
            }
        }
    }

    fn factor_message(
        &self,
        factor_node: NodeId,
        factor: &Factor<V>,
        to: NodeId,
        position: usize,
    ) -> FactorTreeResult<f64> {
        if self.neighbors[factor_node.index()].len() == 1 {
            // Nothing to aggregate: the factor only sees the variable it is talking to
            let assignment = [(to, self.variable(to)?.value(position).clone())]
                .into_iter()
                .collect();
            return factor.quality(self.nodes[factor_node.index()].label(), &assignment);
        }

        let mut odometer = self.odometer(factor_node, to, position)?;
        let mut total = self.run.aggregate_identity();
        while let Some(digits) = odometer.advance() {
            let term = self.term(factor_node, factor, to, digits)?;
            total = self.run.aggregate(total, term);
        }
        Ok(total)
    }

    fn odometer(
        &self,
        factor_node: NodeId,
        fixed: NodeId,
        fixed_position: usize,
    ) -> FactorTreeResult<Odometer> {
        let neighbors = &self.neighbors[factor_node.index()];
        let fixed_index = neighbors
            .iter()
            .position(|neighbor| *neighbor == fixed)
            .ok_or_else(|| FactorTreeError::NotANeighbor {
                node: self.label(factor_node),
                neighbor: self.label(fixed),
            })?;
        let radices = neighbors
            .iter()
            .map(|neighbor| self.variable(*neighbor).map(|variable| variable.domain_size()))
            .collect::<FactorTreeResult<Vec<usize>>>()?;
        Ok(Odometer::new(radices, fixed_index, fixed_position))
    }

    // Quality of one consistent assignment times the incoming messages of every non-fixed neighbor
    fn term(
        &self,
        factor_node: NodeId,
        factor: &Factor<V>,
        fixed: NodeId,
        digits: &[usize],
    ) -> FactorTreeResult<f64> {
        let neighbors = &self.neighbors[factor_node.index()];
        let mut assignment = Assignment::with_capacity(neighbors.len());
        for (&neighbor, &digit) in neighbors.iter().zip(digits) {
            assignment.insert(neighbor, self.variable(neighbor)?.value(digit).clone());
        }

        let mut term = factor.quality(self.nodes[factor_node.index()].label(), &assignment)?;
        for (&neighbor, &digit) in neighbors.iter().zip(digits) {
            if neighbor != fixed {
                let incoming = self.cached(MessageKey::new(self.run, neighbor, Some(factor_node)), digit)?;
                term = self.run.combine(term, incoming);
            }
        }
        Ok(term)
    }

    /// Finds the first consistent assignment (in enumeration order) attaining the largest term
    /// when `fixed` is pinned to `fixed_position`. Returns the domain positions of every neighbor,
    /// in neighbor order, together with that term.
    pub(crate) fn best_consistent_assignment(
        &mut self,
        factor_node: NodeId,
        fixed: NodeId,
        fixed_position: usize,
    ) -> FactorTreeResult<(Vec<usize>, f64)> {
        let factor = self.factor(factor_node)?;
        let all_neighbors = self.neighbors;
        let neighbors = &all_neighbors[factor_node.index()];
        for &neighbor in neighbors {
            if neighbor != fixed {
                let domain_size = self.variable(neighbor)?.domain_size();
                for position in 0..domain_size {
                    self.message(neighbor, Some(factor_node), position)?;
                }
            }
        }

        let mut odometer = self.odometer(factor_node, fixed, fixed_position)?;
        let mut best: Option<(Vec<usize>, f64)> = None;
        while let Some(digits) = odometer.advance() {
            let term = self.term(factor_node, factor, fixed, digits)?;
            if best.as_ref().map_or(true, |(_, best_term)| term > *best_term) {
                best = Some((digits.to_vec(), term));
            }
        }
        best.ok_or_else(|| FactorTreeError::EmptyDomain {
            node: self.label(factor_node),
        })
    }
}
