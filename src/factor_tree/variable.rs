use std::{collections::HashMap, hash::Hash};

use crate::message::run::Run;

/// Stores the finite domain of a variable node together with a lookup from value to position.
/// Messages touching this variable are vectors indexed by these positions.
#[derive(Debug)]
pub struct Variable<V> {
    allowed_values: Vec<V>,
    positions: HashMap<V, usize>,
}

impl<V: Clone + Eq + Hash> Variable<V> {
    /// Creates a variable over the given values; repeated values are kept once, at their first position
    pub fn new(allowed_values: impl IntoIterator<Item = V>) -> Self {
        let mut values = Vec::new();
        let mut positions = HashMap::new();
        for value in allowed_values {
            if !positions.contains_key(&value) {
                positions.insert(value.clone(), values.len());
                values.push(value);
            }
        }
        Variable {
            allowed_values: values,
            positions,
        }
    }

    pub fn position(&self, value: &V) -> Option<usize> {
        self.positions.get(value).copied()
    }

    pub fn contains(&self, value: &V) -> bool {
        self.positions.contains_key(value)
    }
}

impl<V> Variable<V> {
    pub fn allowed_values(&self) -> &[V] {
        &self.allowed_values
    }

    pub fn domain_size(&self) -> usize {
        self.allowed_values.len()
    }

    /// Value at a given position of the domain
    /// Assumption: `position` < `domain_size()`
    pub fn value(&self, position: usize) -> &V {
        &self.allowed_values[position]
    }

    /// Combines the incoming messages of every other neighbor, all taken at the same value.
    /// A leaf variable has nothing to combine and sends the identity.
    pub fn create_message(&self, run: Run, incoming: impl IntoIterator<Item = f64>) -> f64 {
        incoming
            .into_iter()
            .fold(run.combine_identity(), |product, message| run.combine(product, message))
    }
}
