use std::ops::Index;

use super::{node::NodeId, variable::Variable};

/// A mapping from nodes to values, kept in insertion order.
/// For assignments handed to quality functions the order is the factor's neighbor order.
#[derive(Clone, Debug)]
pub struct Assignment<V> {
    entries: Vec<(NodeId, V)>,
}

impl<V> Assignment<V> {
    pub fn new() -> Self {
        Assignment {
            entries: Vec::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Assignment {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Binds `node` to `value`, replacing an earlier binding in place
    pub fn insert(&mut self, node: NodeId, value: V) {
        match self.entries.iter_mut().find(|(bound, _)| *bound == node) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((node, value)),
        }
    }

    pub fn get(&self, node: NodeId) -> Option<&V> {
        self.entries
            .iter()
            .find(|(bound, _)| *bound == node)
            .map(|(_, value)| value)
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.get(node).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &V)> {
        self.entries.iter().map(|(node, value)| (*node, value))
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.entries.iter().map(|(node, _)| *node)
    }

    /// Values in binding order; quality functions over a fixed neighbor layout can read them positionally
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.iter().map(|(_, value)| value)
    }
}

impl<V> Default for Assignment<V> {
    fn default() -> Self {
        Self::new()
    }
}

// Two assignments are equal when they bind the same nodes to the same values, in any order
impl<V: PartialEq> PartialEq for Assignment<V> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|(node, value)| other.get(node) == Some(value))
    }
}

impl<V> FromIterator<(NodeId, V)> for Assignment<V> {
    fn from_iter<I: IntoIterator<Item = (NodeId, V)>>(iter: I) -> Self {
        let mut assignment = Assignment::new();
        for (node, value) in iter {
            assignment.insert(node, value);
        }
        assignment
    }
}

impl<V> Index<NodeId> for Assignment<V> {
    type Output = V;

    fn index(&self, node: NodeId) -> &Self::Output {
        self.get(node)
            .expect("Assignment is undefined on the requested node")
    }
}

// Mixed-radix counter over domain positions with one digit pinned.
// The last free digit varies fastest.
pub(crate) struct Odometer {
    radices: Vec<usize>,
    digits: Vec<usize>,
    fixed: usize,
    started: bool,
    done: bool,
}

impl Odometer {
    // Assumption: every radix is positive and `fixed_digit` < `radices[fixed]`
    pub(crate) fn new(radices: Vec<usize>, fixed: usize, fixed_digit: usize) -> Self {
        let mut digits = vec![0; radices.len()];
        digits[fixed] = fixed_digit;
        Odometer {
            radices,
            digits,
            fixed,
            started: false,
            done: false,
        }
    }

    // Returns the next combination of digits, or None once every combination was produced
    pub(crate) fn advance(&mut self) -> Option<&[usize]> {
        if self.done {
            return None;
        }
        if !self.started {
            self.started = true;
            return Some(&self.digits);
        }
        for position in (0..self.digits.len()).rev() {
            if position == self.fixed {
                continue;
            }
            self.digits[position] += 1;
            if self.digits[position] < self.radices[position] {
                return Some(&self.digits);
            }
            self.digits[position] = 0;
        }
        self.done = true;
        None
    }
}

/// Lazy sequence of the assignments of a factor's neighbors that agree with one fixed binding
pub struct ConsistentAssignments<'a, V> {
    neighbors: Vec<(NodeId, &'a Variable<V>)>,
    odometer: Odometer,
}

impl<'a, V> ConsistentAssignments<'a, V> {
    // Assumption: `fixed` indexes `neighbors`, `fixed_position` is in its domain, and no domain is empty
    pub(crate) fn new(
        neighbors: Vec<(NodeId, &'a Variable<V>)>,
        fixed: usize,
        fixed_position: usize,
    ) -> Self {
        let radices = neighbors
            .iter()
            .map(|(_, variable)| variable.domain_size())
            .collect();
        ConsistentAssignments {
            neighbors,
            odometer: Odometer::new(radices, fixed, fixed_position),
        }
    }
}

impl<V: Clone> Iterator for ConsistentAssignments<'_, V> {
    type Item = Assignment<V>;

    fn next(&mut self) -> Option<Self::Item> {
        let digits = self.odometer.advance()?;
        Some(
            self.neighbors
                .iter()
                .zip(digits)
                .map(|((node, variable), &digit)| (*node, variable.value(digit).clone()))
                .collect(),
        )
    }
}
