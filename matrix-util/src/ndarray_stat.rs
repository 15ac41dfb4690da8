use crate::traits::RunningStatOps;
use ndarray::{Array1, Array2, ArrayView1, Axis};

/// A container to keep track of the first two moments of a stream
/// of `d`-dimensional vectors, updated one vector at a time by
/// Welford's recurrence
///
/// * `delta = x - mean`
/// * `mean += delta / n`
/// * `m2 += delta * (x - mean)`
///
/// With `track_covariance` the full co-moment matrix is kept as well.
#[derive(Clone, Debug)]
pub struct RunningMoments {
    count: usize,
    mean: Array1<f64>,
    m2: Array1<f64>,
    comoment: Option<Array2<f64>>,
}

impl RunningMoments {
    /// Create a new accumulator
    ///
    /// # Examples
    ///
    /// ```
    /// use matrix_util::ndarray_stat::RunningMoments;
    /// let stat = RunningMoments::new(3, false);
    /// assert_eq!(stat.dim(), 3);
    /// ```
    pub fn new(dim: usize, track_covariance: bool) -> Self {
        RunningMoments {
            count: 0,
            mean: Array1::zeros(dim),
            m2: Array1::zeros(dim),
            comoment: track_covariance.then(|| Array2::zeros((dim, dim))),
        }
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn add(&mut self, xx: &ArrayView1<f64>) {
        self.count += 1;
        let n = self.count as f64;

        let delta = xx - &self.mean;
        self.mean.scaled_add(1.0 / n, &delta);
        let delta_after = xx - &self.mean;

        self.m2 += &(&delta * &delta_after);

        if let Some(cc) = self.comoment.as_mut() {
            let outer = delta
                .view()
                .insert_axis(Axis(1))
                .dot(&delta_after.view().insert_axis(Axis(0)));
            *cc += &outer;
        }
    }

    /// Add every row of `xx`
    pub fn add_rows(&mut self, xx: &ndarray::ArrayView2<f64>) {
        for x in xx.rows() {
            self.add(&x);
        }
    }

    /// Variance with `ddof` delta degrees of freedom; zero when
    /// fewer than `ddof + 1` vectors have been seen
    pub fn variance_ddof(&self, ddof: usize) -> Array1<f64> {
        if self.count <= ddof {
            return Array1::zeros(self.dim());
        }
        &self.m2 / (self.count - ddof) as f64
    }

    /// Covariance with `ddof` delta degrees of freedom; `None` when
    /// the co-moment matrix is not tracked
    pub fn covariance_ddof(&self, ddof: usize) -> Option<Array2<f64>> {
        let cc = self.comoment.as_ref()?;
        if self.count <= ddof {
            return Some(Array2::zeros(cc.dim()));
        }
        Some(cc / (self.count - ddof) as f64)
    }
}

impl RunningStatOps for RunningMoments {
    type Output = Array1<f64>;

    fn clear(&mut self) {
        self.count = 0;
        self.mean.fill(0.0);
        self.m2.fill(0.0);
        if let Some(cc) = self.comoment.as_mut() {
            cc.fill(0.0);
        }
    }

    fn count(&self) -> usize {
        self.count
    }

    fn mean(&self) -> Self::Output {
        self.mean.clone()
    }

    /// Population variance (`ddof = 0`)
    fn variance(&self) -> Self::Output {
        self.variance_ddof(0)
    }

    fn std(&self) -> Self::Output {
        self.variance().mapv(f64::sqrt)
    }
}
