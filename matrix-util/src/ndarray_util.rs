pub use ndarray::prelude::*;

use crate::traits::*;
use num_traits::{Float, FromPrimitive};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{StandardNormal, Uniform};

impl<T> SampleOps for ndarray::Array2<T>
where
    T: Float + FromPrimitive,
{
    type Mat = Self;
    type Scalar = T;

    fn runif(dd: usize, nn: usize, seed: u64) -> anyhow::Result<Self::Mat> {
        Self::runif_range(dd, nn, (0_f32, 1_f32), seed)
    }

    fn rnorm(dd: usize, nn: usize, seed: u64) -> anyhow::Result<Self::Mat> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let rvec = (0..(dd * nn))
            .map(|_| {
                let x: f32 = rng.sample(StandardNormal);
                T::from_f32(x).ok_or_else(|| anyhow::anyhow!("failed to type {}", x))
            })
            .collect::<anyhow::Result<Vec<T>>>()?;

        Ok(Array2::from_shape_vec((dd, nn), rvec)?)
    }

    fn runif_range(
        dd: usize,
        nn: usize,
        range: (f32, f32),
        seed: u64,
    ) -> anyhow::Result<Self::Mat> {
        let (lb, ub) = range;
        let u = Uniform::new(lb, ub)?;
        let mut rng = SmallRng::seed_from_u64(seed);

        let rvec = (0..(dd * nn))
            .map(|_| {
                let x = rng.sample(u);
                T::from_f32(x).ok_or_else(|| anyhow::anyhow!("failed to type {}", x))
            })
            .collect::<anyhow::Result<Vec<T>>>()?;

        Ok(Array2::from_shape_vec((dd, nn), rvec)?)
    }
}

/// Squared Euclidean distance between every row of `data` and `centre`
pub fn row_sq_distances<T>(data: &ArrayView2<T>, centre: &ArrayView1<T>) -> Array1<T>
where
    T: Float + FromPrimitive,
{
    data.rows()
        .into_iter()
        .map(|x| {
            x.iter()
                .zip(centre.iter())
                .fold(T::zero(), |acc, (&a, &b)| acc + (a - b) * (a - b))
        })
        .collect()
}

/// Index of the smallest element; ties go to the lower index
pub fn argmin<T: Float>(xx: &ArrayView1<T>) -> Option<usize> {
    let mut best: Option<(usize, T)> = None;
    for (j, &x) in xx.iter().enumerate() {
        match best {
            Some((_, b)) if !(x < b) => {}
            _ => best = Some((j, x)),
        }
    }
    best.map(|(j, _)| j)
}
