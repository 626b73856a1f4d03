use std::time::Instant;

use factor_tree::{EnergyPathSearch, FactorTreeResult, GaussianField, PathSearchOptions};
use log::info;
use ndarray::{arr1, arr2, Array2};

const NX: usize = 8;
const NY: usize = 5;
const NZ: usize = 5;

// Unit lattice with x varying slowest
fn lattice() -> FactorTreeResult<Array2<f64>> {
    let mut data = Vec::with_capacity(NX * NY * NZ * 3);
    for x in 0..NX {
        for y in 0..NY {
            for z in 0..NZ {
                data.extend([x as f64, y as f64, z as f64]);
            }
        }
    }
    Array2::from_shape_vec((NX * NY * NZ, 3), data).map_err(|error| {
        factor_tree::FactorTreeError::InvalidInput(format!("lattice shape: {}", error))
    })
}

fn index(x: usize, y: usize, z: usize) -> usize {
    (x * NY + y) * NZ + z
}

fn main() -> FactorTreeResult<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info"); // change "info" to "debug" for debug-level logging, etc.
    }
    env_logger::init();

    // A single barrier between the two minima, slightly off the straight line
    let field = GaussianField::new(
        arr1(&[2.0, 0.6]),
        arr1(&[1.2, 0.8]),
        arr2(&[[3.5, 2.2, 2.0], [5.0, 1.0, 3.0]]),
    )?;
    let root = index(0, 2, 2);
    let tail = index(NX - 1, 2, 2);

    let time_start = Instant::now();
    let search = EnergyPathSearch::new(
        field,
        lattice()?,
        root,
        tail,
        1.,
        PathSearchOptions::default(),
    )?;
    let mut candidates = search.search()?;
    candidates.sort_by(|first, second| second.quality.total_cmp(&first.quality));
    info!(
        "Search complete. Elapsed time {:?}.",
        time_start.elapsed()
    );

    for candidate in &candidates {
        let breakdown = search.breakdown(&candidate.point_indices);
        println!(
            "{:?} quality {:.6e} path {:?}",
            candidate.bucket, candidate.quality, candidate.point_indices
        );
        println!(
            "    strength {:.4e}, strength difference {:.4e}, distance {:.4e}, gradient {:.4e}",
            breakdown.strength,
            breakdown.strength_difference,
            breakdown.distance,
            breakdown.gradient
        );
    }
    Ok(())
}
