// Tuning of the minimum-energy path search
#[derive(Clone, Debug, PartialEq)]
pub struct PathSearchOptions {
    n_spanning_gaps: usize, // transitions between the root and the tail
    tuning_strength: f64,
    tuning_strength_diff: f64,
    tuning_grad: f64,
    tuning_dist: f64,
    length_cutoff: f64, // in point distances; longer transitions get zero quality
    bucket_size: usize, // in point distances, per perpendicular coordinate
}

impl Default for PathSearchOptions {
    fn default() -> Self {
        PathSearchOptions {
            n_spanning_gaps: 7,
            tuning_strength: 1.5,
            tuning_strength_diff: 3.,
            tuning_grad: 0.5,
            tuning_dist: 0.25,
            length_cutoff: 4.,
            bucket_size: 4,
        }
    }
}

impl PathSearchOptions {
    pub fn set_n_spanning_gaps(&mut self, value: usize) -> &mut Self {
        self.n_spanning_gaps = value;
        self
    }

    pub fn set_tuning_strength(&mut self, value: f64) -> &mut Self {
        self.tuning_strength = value;
        self
    }

    pub fn set_tuning_strength_diff(&mut self, value: f64) -> &mut Self {
        self.tuning_strength_diff = value;
        self
    }

    pub fn set_tuning_grad(&mut self, value: f64) -> &mut Self {
        self.tuning_grad = value;
        self
    }

    pub fn set_tuning_dist(&mut self, value: f64) -> &mut Self {
        self.tuning_dist = value;
        self
    }

    pub fn set_length_cutoff(&mut self, value: f64) -> &mut Self {
        self.length_cutoff = value;
        self
    }

    pub fn set_bucket_size(&mut self, value: usize) -> &mut Self {
        self.bucket_size = value;
        self
    }

    pub fn n_spanning_gaps(&self) -> usize {
        self.n_spanning_gaps
    }

    /// Number of variables in the chain, root and tail included
    pub fn n_variables(&self) -> usize {
        self.n_spanning_gaps + 1
    }

    pub fn tuning_strength(&self) -> f64 {
        self.tuning_strength
    }

    pub fn tuning_strength_diff(&self) -> f64 {
        self.tuning_strength_diff
    }

    pub fn tuning_grad(&self) -> f64 {
        self.tuning_grad
    }

    pub fn tuning_dist(&self) -> f64 {
        self.tuning_dist
    }

    pub fn length_cutoff(&self) -> f64 {
        self.length_cutoff
    }

    pub fn bucket_size(&self) -> usize {
        self.bucket_size
    }
}
