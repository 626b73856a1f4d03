use std::collections::HashMap;

use bitvec::prelude::LocalBits;
use bitvec::vec::BitVec;
use log::warn;
use ndarray::Array1;

use crate::factor_tree::node::NodeId;

use super::run::Run;

/// Identifies the message sent from one node to a neighbor within a run.
/// `to == None` stands for the belief of a variable, i.e. the product of everything it receives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub run: Run,
    pub from: NodeId,
    pub to: Option<NodeId>,
}

impl MessageKey {
    pub fn new(run: Run, from: NodeId, to: Option<NodeId>) -> Self {
        MessageKey { run, from, to }
    }
}

// Message along one directed edge, indexed by positions in the domain of the edge's variable endpoint
#[derive(Debug)]
struct EdgeMessage {
    values: Array1<f64>,
    computed: BitVec<usize, LocalBits>,
}

impl EdgeMessage {
    fn new(domain_size: usize) -> Self {
        EdgeMessage {
            values: Array1::zeros(domain_size),
            computed: BitVec::repeat(false, domain_size),
        }
    }

    fn get(&self, position: usize) -> Option<f64> {
        match self.computed.get(position) {
            Some(computed) if *computed => Some(self.values[position]),
            _ => None,
        }
    }
}

/// Stores every message computed so far. Entries are written once and never overwritten;
/// they only disappear when a run (or the whole store) is reset.
#[derive(Debug, Default)]
pub struct Messages {
    table: HashMap<MessageKey, EdgeMessage>,
}

impl Messages {
    pub fn new() -> Self {
        Messages {
            table: HashMap::new(),
        }
    }

    pub fn get(&self, key: &MessageKey, position: usize) -> Option<f64> {
        self.table.get(key).and_then(|edge| edge.get(position))
    }

    pub fn contains(&self, key: &MessageKey, position: usize) -> bool {
        self.get(key, position).is_some()
    }

    /// Writes an entry unless one exists already; returns whether the entry was written
    pub fn insert(&mut self, key: MessageKey, domain_size: usize, position: usize, value: f64) -> bool {
        let edge = self
            .table
            .entry(key)
            .or_insert_with(|| EdgeMessage::new(domain_size));
        if edge.computed[position] {
            if edge.values[position] != value {
                warn!(
                    "Ignoring rewrite of message {:?} at position {}: cached {}, offered {}",
                    key, position, edge.values[position], value
                );
            }
            return false;
        }
        edge.values[position] = value;
        edge.computed.set(position, true);
        true
    }

    /// Returns the whole message along an edge if every entry has been computed
    pub fn edge(&self, key: &MessageKey) -> Option<&Array1<f64>> {
        self.table
            .get(key)
            .filter(|edge| edge.computed.all())
            .map(|edge| &edge.values)
    }

    /// Number of computed entries, over all runs and edges
    pub fn num_entries(&self) -> usize {
        self.table.values().map(|edge| edge.computed.count_ones()).sum()
    }

    pub fn num_entries_in_run(&self, run: Run) -> usize {
        self.table
            .iter()
            .filter(|(key, _)| key.run == run)
            .map(|(_, edge)| edge.computed.count_ones())
            .sum()
    }

    pub fn clear_run(&mut self, run: Run) {
        self.table.retain(|key, _| key.run != run);
    }

    pub fn clear(&mut self) {
        self.table.clear();
    }
}
