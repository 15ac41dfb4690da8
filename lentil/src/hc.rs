//! Recursive k-means: every cluster is split again into `k` clusters
//! until `max_step` levels are built.
//!
//! Clusters are stored level by level. Level `l` (1-based) holds `k^l`
//! slots starting at `kmnb(l - 1, k)`, and the children of the slot at
//! position `p` within its level occupy positions `k * p .. k * p + k`
//! of the next level.

use log::{debug, info};
use matrix_util::clustering::{nearest_centroid, Kmeans, KmeansArgs};
use matrix_util::ndarray_stat::RunningMoments;
use matrix_util::utils::partition_by_membership;
use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Number of clusters of a hierarchy with `max_step` levels of `k`
/// children each, `k + k^2 + ... + k^max_step`
pub fn kmnb(max_step: usize, k: usize) -> usize {
    (1..=max_step).map(|s| k.pow(s as u32)).sum()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HcOptions {
    /// Number of levels. Default: 5
    pub max_step: usize,
    /// Children per cluster. Default: 2
    pub k: usize,
    /// Full covariance per cluster instead of per-feature variance. Default: true
    pub full_cov: bool,
    /// Iterations per k-means. Default: 100
    pub max_iter: usize,
    /// Random restarts per k-means. Default: 5
    pub num_restarts: usize,
}

impl Default for HcOptions {
    fn default() -> Self {
        HcOptions {
            max_step: 5,
            k: 2,
            full_cov: true,
            max_iter: 100,
            num_restarts: 5,
        }
    }
}

/// Spread of the members of one cluster
#[derive(Debug, Clone, PartialEq)]
pub enum Covariance {
    /// `d x d` sample covariance; zeros with one member or none
    Full(Array2<f64>),
    /// per-feature variance
    Diagonal(Array1<f64>),
}

impl Covariance {
    fn zeros(dim: usize, full_cov: bool) -> Self {
        if full_cov {
            Covariance::Full(Array2::zeros((dim, dim)))
        } else {
            Covariance::Diagonal(Array1::zeros(dim))
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            Covariance::Full(c) => c.nrows(),
            Covariance::Diagonal(v) => v.len(),
        }
    }

    /// As a `d x d` matrix
    pub fn to_matrix(&self) -> Array2<f64> {
        match self {
            Covariance::Full(c) => c.clone(),
            Covariance::Diagonal(v) => Array2::from_diag(v),
        }
    }
}

/// Centroids, covariances and priors of every cluster, level by level
#[derive(Debug, Clone)]
pub struct HierarchicalClusters {
    pub k: usize,
    pub max_step: usize,
    /// `nb x d`
    pub means: Array2<f64>,
    pub covariances: Vec<Covariance>,
    /// fraction of the data in each cluster; every level sums to one
    pub priors: Array1<f64>,
}

impl HierarchicalClusters {
    pub fn num_clusters(&self) -> usize {
        self.priors.len()
    }

    /// Slots of level `level`, 1-based
    pub fn level(&self, level: usize) -> Range<usize> {
        let start = kmnb(level - 1, self.k);
        start..(start + self.k.pow(level as u32))
    }

    /// Slots of the children of the cluster at `position` within `level`
    pub fn children(&self, level: usize, position: usize) -> Range<usize> {
        let start = kmnb(level, self.k) + self.k * position;
        start..(start + self.k)
    }
}

/// Index of the nearest centroid (squared Euclidean) of every row
pub fn partition(data: &ArrayView2<f64>, means: &ArrayView2<f64>) -> Vec<usize> {
    nearest_centroid(data, means)
}

struct Builder<'a> {
    options: &'a HcOptions,
    means: Array2<f64>,
    covariances: Vec<Covariance>,
    priors: Array1<f64>,
    done: usize,
}

impl Builder<'_> {
    /// Split `data` into `k` clusters at level `step`; `base_idx` is
    /// the first slot of the level and `offset` the position of the
    /// parent within the level above
    fn split(
        &mut self,
        data: &Array2<f64>,
        step: usize,
        base_idx: usize,
        offset: usize,
        prior: f64,
    ) {
        let k = self.options.k;
        let index = base_idx + k * offset;

        let args = KmeansArgs {
            num_clusters: k,
            max_iter: self.options.max_iter,
            num_restarts: self.options.num_restarts,
        };
        let (_, centroids) = data.kmeans_rows_centroids(args);
        let membership = partition(&data.view(), &centroids.view());
        self.means
            .slice_mut(s![index..index + k, ..])
            .assign(&centroids);

        self.done += k;
        debug!("computed {}/{} clusters", self.done, self.priors.len());

        let nn = data.nrows() as f64;
        let groups = partition_by_membership(&membership);
        for i in 0..k {
            let rows = groups.get(&i).cloned().unwrap_or_default();
            let members = data.select(Axis(0), &rows);

            let slot = index + i;
            let child_prior = prior * rows.len() as f64 / nn;
            self.priors[slot] = child_prior;
            self.covariances[slot] = self.spread(&members);

            if step < self.options.max_step && !rows.is_empty() {
                self.split(
                    &members,
                    step + 1,
                    base_idx + k.pow(step as u32),
                    k * offset + i,
                    child_prior,
                );
            }
        }
    }

    fn spread(&self, members: &Array2<f64>) -> Covariance {
        let dim = members.ncols();
        let mut stat = RunningMoments::new(dim, self.options.full_cov);
        stat.add_rows(&members.view());

        if self.options.full_cov {
            match stat.covariance_ddof(1) {
                Some(c) => Covariance::Full(c),
                None => Covariance::zeros(dim, true),
            }
        } else {
            Covariance::Diagonal(stat.variance_ddof(0))
        }
    }
}

/// Build the hierarchy on the rows of `data`
pub fn hc(data: &Array2<f64>, options: &HcOptions) -> anyhow::Result<HierarchicalClusters> {
    let (nn, dd) = data.dim();
    anyhow::ensure!(nn > 0, "no data to cluster");
    anyhow::ensure!(options.k > 0, "k must be positive");
    anyhow::ensure!(options.max_step > 0, "max_step must be positive");

    let nb = kmnb(options.max_step, options.k);
    info!(
        "hierarchical clustering: {} x {} into {} clusters ({} levels of {})",
        nn, dd, nb, options.max_step, options.k
    );

    let mut builder = Builder {
        options,
        means: Array2::zeros((nb, dd)),
        covariances: vec![Covariance::zeros(dd, options.full_cov); nb],
        priors: Array1::zeros(nb),
        done: 0,
    };
    builder.split(data, 1, 0, 0, 1.0);

    Ok(HierarchicalClusters {
        k: options.k,
        max_step: options.max_step,
        means: builder.means,
        covariances: builder.covariances,
        priors: builder.priors,
    })
}
