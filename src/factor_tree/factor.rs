use super::{
    assignment::Assignment,
    errors::{FactorTreeError, FactorTreeResult},
};

pub type QualityFn<V> = Box<dyn Fn(&Assignment<V>) -> f64>;

/// Stores the weight functions of a factor node.
/// The quality is evaluated on assignments covering exactly the factor's neighbors, in neighbor order.
pub struct Factor<V> {
    quality: QualityFn<V>,
    diversity: Option<QualityFn<V>>, // reserved for diversity-weighted sampling, never evaluated
}

impl<V> Factor<V> {
    pub fn new(quality: impl Fn(&Assignment<V>) -> f64 + 'static) -> Self {
        Factor {
            quality: Box::new(quality),
            diversity: None,
        }
    }

    pub fn with_diversity(mut self, diversity: impl Fn(&Assignment<V>) -> f64 + 'static) -> Self {
        self.diversity = Some(Box::new(diversity));
        self
    }

    pub fn has_diversity(&self) -> bool {
        self.diversity.is_some()
    }

    /// Evaluates the quality and rejects anything the semirings cannot aggregate
    pub fn quality(&self, label: &str, assignment: &Assignment<V>) -> FactorTreeResult<f64> {
        let quality = (self.quality)(assignment);
        if quality.is_finite() && quality >= 0. {
            Ok(quality)
        } else {
            Err(FactorTreeError::InvalidQuality {
                factor: label.to_string(),
                quality,
            })
        }
    }

    pub fn diversity(&self, _assignment: &Assignment<V>) -> FactorTreeResult<f64> {
        Err(FactorTreeError::Unimplemented("diversity-weighted sampling"))
    }
}

impl<V> std::fmt::Debug for Factor<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Factor")
            .field("has_diversity", &self.has_diversity())
            .finish_non_exhaustive()
    }
}
