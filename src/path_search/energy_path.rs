use std::{ops::Mul, rc::Rc, time::Instant};

use log::{debug, info, warn};
use ndarray::{Array1, Array2, ArrayView1};

use crate::factor_tree::{
    assignment::Assignment,
    errors::{FactorTreeError, FactorTreeResult},
    factor::Factor,
    node::{ConnectedNodes, NodeId},
    tree::FactorTree,
    variable::Variable,
};

use super::{field::PotentialField, options::PathSearchOptions};

// Individual terms of a transition quality; their product is the quality itself
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QualityBreakdown {
    pub strength: f64,
    pub strength_difference: f64,
    pub distance: f64,
    pub gradient: f64,
}

impl QualityBreakdown {
    pub fn zero() -> Self {
        QualityBreakdown {
            strength: 0.,
            strength_difference: 0.,
            distance: 0.,
            gradient: 0.,
        }
    }

    pub fn one() -> Self {
        QualityBreakdown {
            strength: 1.,
            strength_difference: 1.,
            distance: 1.,
            gradient: 1.,
        }
    }

    pub fn product(&self) -> f64 {
        self.strength * self.strength_difference * self.distance * self.gradient
    }
}

impl Mul for QualityBreakdown {
    type Output = QualityBreakdown;

    fn mul(self, rhs: Self) -> Self::Output {
        QualityBreakdown {
            strength: self.strength * rhs.strength,
            strength_difference: self.strength_difference * rhs.strength_difference,
            distance: self.distance * rhs.distance,
            gradient: self.gradient * rhs.gradient,
        }
    }
}

/// Scores a single step of a path between two sampled points
pub struct TransitionModel<F> {
    field: F,
    points: Array2<f64>, // one point per row
    point_distance: f64,
    options: PathSearchOptions,
}

impl<F: PotentialField> TransitionModel<F> {
    pub fn new(field: F, points: Array2<f64>, point_distance: f64, options: PathSearchOptions) -> Self {
        TransitionModel {
            field,
            points,
            point_distance,
            options,
        }
    }

    pub fn num_points(&self) -> usize {
        self.points.nrows()
    }

    pub fn point(&self, index: usize) -> ArrayView1<f64> {
        self.points.row(index)
    }

    /// `parent` is the endpoint closer to the root. Moving to a stronger point is penalized,
    /// as are long steps, strong surroundings and a gradient pushing across the step.
    pub fn quality_breakdown(&self, child: usize, parent: usize) -> QualityBreakdown {
        if child == parent {
            return QualityBreakdown::zero();
        }
        let first = self.points.row(child);
        let second = self.points.row(parent);
        let direction = &second - &first;
        let length = direction.dot(&direction).sqrt();
        if length >= self.options.length_cutoff() * self.point_distance {
            return QualityBreakdown::zero();
        }
        let direction_normed = &direction / length;
        let midpoint = (&first + &second) / 2.;

        let distance = (-self.options.tuning_dist() * length / (2. * self.point_distance)).exp();

        let strengths = [
            self.field.strength(first),
            self.field.strength(second),
            self.field.strength(midpoint.view()),
        ];
        let strength_diff = strengths[0] - strengths[1];
        let strength_difference = if strength_diff > 0. {
            (-self.options.tuning_strength_diff() * strength_diff).exp()
        } else {
            1.
        };
        let strength = (-self.options.tuning_strength() * strengths.iter().sum::<f64>() / 3.).exp();

        let grad = self.field.gradient(midpoint.view());
        let along = grad.dot(&direction_normed);
        let grad_perp = &grad - &(&direction_normed * along);
        let gradient = (-self.options.tuning_grad() * grad_perp.dot(&grad_perp).sqrt()).exp();

        QualityBreakdown {
            strength,
            strength_difference,
            distance,
            gradient,
        }
    }

    pub fn quality(&self, child: usize, parent: usize) -> f64 {
        self.quality_breakdown(child, parent).product()
    }
}

// Best path found for one bucket of middle points
#[derive(Clone, Debug, PartialEq)]
pub struct PathCandidate {
    pub bucket: Vec<i64>,
    pub quality: f64,
    pub point_indices: Vec<usize>, // root first, tail last
}

/// Searches for low-energy paths between two points of a sampled potential field.
/// The path is a chain of variables whose domains are slices of the samples along the root-to-tail axis;
/// consecutive variables are linked by transition factors.
pub struct EnergyPathSearch<F> {
    model: Rc<TransitionModel<F>>,
    root: usize,
    tail: usize,
    origin: Array1<f64>,
    axis: Array1<f64>,       // unit vector from root to tail
    basis: Vec<Array1<f64>>, // orthonormal, perpendicular to `axis`
    span: f64,
}

impl<F: PotentialField + 'static> EnergyPathSearch<F> {
    pub fn new(
        field: F,
        points: Array2<f64>,
        root: usize,
        tail: usize,
        point_distance: f64,
        options: PathSearchOptions,
    ) -> FactorTreeResult<Self> {
        let num_points = points.nrows();
        if root >= num_points || tail >= num_points {
            return Err(FactorTreeError::InvalidInput(format!(
                "root {} and tail {} must index one of {} points",
                root, tail, num_points
            )));
        }
        if points.ncols() < 2 {
            return Err(FactorTreeError::InvalidInput(
                "points need at least two coordinates".to_string(),
            ));
        }
        if !(point_distance.is_finite() && point_distance > 0.) {
            return Err(FactorTreeError::InvalidInput(format!(
                "point distance {} is not a positive number",
                point_distance
            )));
        }
        if options.n_spanning_gaps() < 2 || options.bucket_size() == 0 {
            return Err(FactorTreeError::InvalidInput(
                "a path needs at least two gaps and a non-empty bucket size".to_string(),
            ));
        }

        let origin = points.row(root).to_owned();
        let direction = &points.row(tail) - &origin;
        let span = direction.dot(&direction).sqrt();
        if !(span > 0.) {
            return Err(FactorTreeError::InvalidInput(
                "root and tail points coincide".to_string(),
            ));
        }
        let axis = direction / span;
        let basis = perpendicular_basis(&axis);

        Ok(EnergyPathSearch {
            model: Rc::new(TransitionModel::new(field, points, point_distance, options)),
            root,
            tail,
            origin,
            axis,
            basis,
            span,
        })
    }

    pub fn model(&self) -> &TransitionModel<F> {
        &self.model
    }

    fn options(&self) -> &PathSearchOptions {
        &self.model.options
    }

    // Position of a point along the root-to-tail axis; 0 at the root, 1 at the tail
    fn progress(&self, index: usize) -> f64 {
        (&self.model.point(index) - &self.origin).dot(&self.axis) / self.span
    }

    /// Coordinates of a point perpendicular to the axis, grouped into buckets of `bucket_size` point distances
    pub fn bucket(&self, index: usize) -> Vec<i64> {
        let offset = &self.model.point(index) - &self.origin;
        let width = self.model.point_distance * self.options().bucket_size() as f64;
        self.basis
            .iter()
            .map(|direction| (offset.dot(direction) / width).floor() as i64)
            .collect()
    }

    /// Candidate points of every variable: the root, one slice per intermediate variable, the tail
    pub fn slices(&self) -> Vec<Vec<usize>> {
        let gaps = self.options().n_spanning_gaps();
        let progress: Vec<f64> = (0..self.model.num_points())
            .map(|index| self.progress(index))
            .collect();
        let tolerance = 1e-9;

        let mut slices = Vec::with_capacity(gaps + 1);
        slices.push(vec![self.root]);
        for slot in 1..gaps {
            let low = (slot as f64 - 1.) / gaps as f64 - tolerance;
            let high = (slot as f64 + 1.) / gaps as f64 + tolerance;
            let slice: Vec<usize> = progress
                .iter()
                .enumerate()
                .filter(|(_, progress)| low <= **progress && **progress <= high)
                .map(|(index, _)| index)
                .collect();
            if slice.is_empty() {
                warn!("Slice {} between {:.3} and {:.3} holds no points", slot, low, high);
            }
            slices.push(slice);
        }
        slices.push(vec![self.tail]);
        slices
    }

    /// Chains the slices into RootVar0 - Fac0-1 - Var1 - ... - TailVar<n>, each factor parented by the
    /// variable closer to the root. Returns the tree with its variables in chain order.
    pub fn build_tree(&self) -> FactorTreeResult<(FactorTree<usize>, Vec<NodeId>)> {
        let slices = self.slices();
        let last = slices.len() - 1;
        let mut nodes = ConnectedNodes::with_capacity(2 * slices.len());
        let mut variables = Vec::with_capacity(slices.len());

        let mut slices = slices.into_iter().enumerate();
        let Some((_, root_slice)) = slices.next() else {
            return Err(FactorTreeError::EmptyTree);
        };
        let mut current = nodes.add_named_variable("RootVar0", Variable::new(root_slice));
        variables.push(current);

        for (slot, slice) in slices {
            let name = if slot == last {
                format!("TailVar{}", slot)
            } else {
                format!("Var{}", slot)
            };
            let next = nodes.add_named_variable(&name, Variable::new(slice));
            let model = Rc::clone(&self.model);
            let parent = current;
            let factor = nodes.add_named_factor(
                &format!("Fac{}-{}", slot - 1, slot),
                Factor::new(move |assignment: &Assignment<usize>| {
                    match (assignment.get(next), assignment.get(parent)) {
                        (Some(child), Some(parent)) => model.quality(*child, *parent),
                        // Not a quality; rejected as InvalidQuality by the factor
                        _ => f64::NAN,
                    }
                }),
            );
            nodes.set_parent(factor, current)?;
            nodes.set_parent(next, factor)?;
            variables.push(next);
            current = next;
        }

        let tree = FactorTree::create_from_connected_nodes(nodes)?;
        Ok((tree, variables))
    }

    /// Runs max-product toward the middle variable, keeps the best middle point per perpendicular bucket
    /// and traces the full path through each. Buckets whose best path has zero quality are skipped.
    pub fn search(&self) -> FactorTreeResult<Vec<PathCandidate>> {
        let time_start = Instant::now();
        let (mut tree, variables) = self.build_tree()?;
        let middle = variables[variables.len() / 2];

        let (traversal, run) = tree.run_max_quality_forward(middle)?;
        let samples = tree.get_good_max_samples(middle, run, |index| self.bucket(*index))?;

        let mut candidates = Vec::with_capacity(samples.len());
        for (bucket, sample) in samples {
            if sample.message <= 0. {
                debug!("Skipping bucket {:?}: no path with positive quality", bucket);
                continue;
            }
            let assignment =
                tree.get_max_from_start_assignment(middle, &sample.value, &traversal, run)?;
            let point_indices = variables
                .iter()
                .map(|variable| {
                    assignment.get(*variable).copied().ok_or_else(|| {
                        FactorTreeError::TraversalMismatch(format!(
                            "traceback left {} unassigned",
                            variable
                        ))
                    })
                })
                .collect::<FactorTreeResult<Vec<usize>>>()?;
            debug!(
                "Bucket {:?}: quality {:e} through point {}",
                bucket, sample.message, sample.value
            );
            candidates.push(PathCandidate {
                bucket,
                quality: sample.message,
                point_indices,
            });
        }

        info!(
            "Path search over {} points found {} candidates. Elapsed time {:?}.",
            self.model.num_points(),
            candidates.len(),
            time_start.elapsed()
        );
        Ok(candidates)
    }

    /// Term-wise product of the transitions along a path given root first
    pub fn breakdown(&self, path: &[usize]) -> QualityBreakdown {
        path.windows(2)
            .map(|step| self.model.quality_breakdown(step[1], step[0]))
            .fold(QualityBreakdown::one(), |total, step| total * step)
    }
}

// Orthonormal basis of the complement of a unit vector, by Gram-Schmidt over the standard basis
fn perpendicular_basis(axis: &Array1<f64>) -> Vec<Array1<f64>> {
    let dim = axis.len();
    let mut basis: Vec<Array1<f64>> = Vec::with_capacity(dim - 1);
    for coordinate in 0..dim {
        if basis.len() + 1 == dim {
            break;
        }
        let mut candidate: Array1<f64> = Array1::zeros(dim);
        candidate[coordinate] = 1.;
        for direction in std::iter::once(axis).chain(basis.iter()) {
            let overlap = candidate.dot(direction);
            candidate.scaled_add(-overlap, direction);
        }
        let norm = candidate.dot(&candidate).sqrt();
        if norm > 1e-6 {
            basis.push(candidate / norm);
        }
    }
    basis
}
