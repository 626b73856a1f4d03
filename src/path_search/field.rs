use ndarray::{Array1, Array2, ArrayView1};

use crate::factor_tree::errors::{FactorTreeError, FactorTreeResult};

/// Scalar potential sampled by the path search. Low strength is cheap to cross.
pub trait PotentialField {
    fn strength(&self, point: ArrayView1<f64>) -> f64;
    fn gradient(&self, point: ArrayView1<f64>) -> Array1<f64>;
}

// Sum of isotropic gaussian bumps, one per row of `centres`
#[derive(Clone, Debug)]
pub struct GaussianField {
    magnitudes: Array1<f64>,
    sigmas: Array1<f64>,
    centres: Array2<f64>,
}

impl GaussianField {
    pub fn new(
        magnitudes: Array1<f64>,
        sigmas: Array1<f64>,
        centres: Array2<f64>,
    ) -> FactorTreeResult<Self> {
        let n = centres.nrows();
        if magnitudes.len() != n || sigmas.len() != n {
            return Err(FactorTreeError::InvalidInput(format!(
                "{} centres but {} magnitudes and {} widths",
                n,
                magnitudes.len(),
                sigmas.len()
            )));
        }
        if sigmas.iter().any(|sigma| !(*sigma > 0.)) {
            return Err(FactorTreeError::InvalidInput(
                "gaussian widths must be positive".to_string(),
            ));
        }
        Ok(GaussianField {
            magnitudes,
            sigmas,
            centres,
        })
    }

    pub fn dim(&self) -> usize {
        self.centres.ncols()
    }

    // Offset from every centre to `point` with the matching bump height
    fn bumps<'a>(
        &'a self,
        point: ArrayView1<'a, f64>,
    ) -> impl Iterator<Item = (Array1<f64>, f64, f64)> + 'a {
        self.centres
            .rows()
            .into_iter()
            .zip(self.magnitudes.iter().zip(self.sigmas.iter()))
            .map(move |(centre, (magnitude, sigma))| {
                let offset = &point - &centre;
                let height = magnitude * (-offset.dot(&offset) / (2. * sigma * sigma)).exp();
                (offset, height, *sigma)
            })
    }
}

impl PotentialField for GaussianField {
    fn strength(&self, point: ArrayView1<f64>) -> f64 {
        self.bumps(point.reborrow()).map(|(_, height, _)| height).sum()
    }

    fn gradient(&self, point: ArrayView1<f64>) -> Array1<f64> {
        let mut gradient = Array1::zeros(point.len());
        for (offset, height, sigma) in self.bumps(point.reborrow()) {
            gradient.scaled_add(-height / (sigma * sigma), &offset);
        }
        gradient
    }
}
