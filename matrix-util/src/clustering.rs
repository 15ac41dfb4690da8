//! K-means clustering on the rows of a dense matrix
//!
//! Uses the `clustering` crate; the restart with the smallest
//! distortion wins.

use crate::ndarray_util::{argmin, row_sq_distances};
use ndarray::{Array1, Array2, ArrayView2, Axis};

/// Arguments for k-means clustering
#[derive(Debug, Clone)]
pub struct KmeansArgs {
    /// Number of clusters
    pub num_clusters: usize,
    /// Maximum number of iterations
    pub max_iter: usize,
    /// Number of random restarts
    pub num_restarts: usize,
}

impl Default for KmeansArgs {
    fn default() -> Self {
        Self {
            num_clusters: 1,
            max_iter: 100,
            num_restarts: 5,
        }
    }
}

impl KmeansArgs {
    /// Create args with specified number of clusters
    pub fn with_clusters(num_clusters: usize) -> Self {
        Self {
            num_clusters,
            ..Default::default()
        }
    }
}

/// Trait for k-means clustering on matrices
pub trait Kmeans {
    /// Cluster rows and return membership vector
    ///
    /// # Arguments
    /// * `args` - Clustering parameters
    ///
    /// # Returns
    /// Vector of cluster assignments, one per row
    fn kmeans_rows(&self, args: KmeansArgs) -> Vec<usize>;

    /// Cluster rows and return the membership vector together with the
    /// centroids (`k x d`), the mean of each cluster's members.
    ///
    /// A cluster that ends up empty takes the first row as centroid.
    /// With no more distinct rows than clusters, every distinct row
    /// becomes a centroid and the remaining centroids repeat the first
    /// row.
    fn kmeans_rows_centroids(&self, args: KmeansArgs) -> (Vec<usize>, Array2<f64>);
}

impl Kmeans for Array2<f64> {
    fn kmeans_rows(&self, args: KmeansArgs) -> Vec<usize> {
        self.kmeans_rows_centroids(args).0
    }

    fn kmeans_rows_centroids(&self, args: KmeansArgs) -> (Vec<usize>, Array2<f64>) {
        let (nn, dd) = self.dim();
        let kk = args.num_clusters.max(1);

        if nn == 0 {
            return (vec![], Array2::zeros((kk, dd)));
        }

        if kk == 1 {
            let membership = vec![0; nn];
            let centroids = cluster_means(&self.view(), &membership, kk);
            return (membership, centroids);
        }

        let distinct = distinct_rows(&self.view(), kk + 1);
        if distinct.len() <= kk {
            let mut centroids = Array2::zeros((kk, dd));
            for k in 0..kk {
                let src = distinct.get(k).copied().unwrap_or(0);
                centroids.row_mut(k).assign(&self.row(src));
            }
            let membership = nearest_centroid(&self.view(), &centroids.view());
            return (membership, centroids);
        }

        let data: Vec<Vec<f64>> = self
            .axis_iter(Axis(0))
            .map(|x| x.iter().cloned().collect())
            .collect();

        let mut best: Option<(f64, Vec<usize>, Array2<f64>)> = None;

        for _ in 0..args.num_restarts.max(1) {
            let clust = clustering::kmeans(kk, &data, args.max_iter);
            let membership = clust.membership;
            let centroids = cluster_means(&self.view(), &membership, kk);
            let distortion = distortion(&self.view(), &centroids.view(), &membership);

            let better = match &best {
                Some((d, _, _)) => distortion < *d,
                None => true,
            };
            if better {
                best = Some((distortion, membership, centroids));
            }
        }

        match best {
            Some((_, membership, centroids)) => (membership, centroids),
            None => (vec![0; nn], Array2::zeros((kk, dd))),
        }
    }
}

/// Assign each row of `data` to its nearest centroid; ties go to the
/// lower centroid index
pub fn nearest_centroid(data: &ArrayView2<f64>, centroids: &ArrayView2<f64>) -> Vec<usize> {
    let nn = data.nrows();
    let kk = centroids.nrows();

    let mut dist = Array2::<f64>::zeros((nn, kk));
    for (k, c) in centroids.axis_iter(Axis(0)).enumerate() {
        dist.column_mut(k).assign(&row_sq_distances(data, &c));
    }

    dist.axis_iter(Axis(0))
        .map(|d| argmin(&d).unwrap_or(0))
        .collect()
}

/// Indices of the first occurrences of distinct rows, at most `limit`
fn distinct_rows(data: &ArrayView2<f64>, limit: usize) -> Vec<usize> {
    let mut found: Vec<usize> = vec![];
    for (i, x) in data.axis_iter(Axis(0)).enumerate() {
        if found.len() >= limit {
            break;
        }
        if !found.iter().any(|&j| data.row(j) == x) {
            found.push(i);
        }
    }
    found
}

fn cluster_means(data: &ArrayView2<f64>, membership: &[usize], kk: usize) -> Array2<f64> {
    let dd = data.ncols();
    let mut sums = Array2::<f64>::zeros((kk, dd));
    let mut counts = Array1::<f64>::zeros(kk);
    for (x, &k) in data.axis_iter(Axis(0)).zip(membership.iter()) {
        sums.row_mut(k).scaled_add(1.0, &x);
        counts[k] += 1.0;
    }

    for k in 0..kk {
        if counts[k] > 0.0 {
            sums.row_mut(k).mapv_inplace(|s| s / counts[k]);
        } else {
            sums.row_mut(k).assign(&data.row(0));
        }
    }
    sums
}

fn distortion(data: &ArrayView2<f64>, centroids: &ArrayView2<f64>, membership: &[usize]) -> f64 {
    data.axis_iter(Axis(0))
        .zip(membership.iter())
        .map(|(x, &k)| {
            x.iter()
                .zip(centroids.row(k).iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f64>()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_kmeans_rows_single_cluster() {
        let mat = array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0], [7.0, 8.0]];
        let (membership, centroids) = mat.kmeans_rows_centroids(KmeansArgs::with_clusters(1));
        assert!(membership.iter().all(|&x| x == 0));
        assert_abs_diff_eq!(centroids, array![[4.0, 5.0]], epsilon = 1e-12);
    }

    #[test]
    fn test_kmeans_rows_two_clusters() {
        let mat = array![
            [0.0, 0.0],   // cluster A
            [0.1, 0.1],   // cluster A
            [10.0, 10.0], // cluster B
            [10.1, 10.1], // cluster B
        ];

        let membership = mat.kmeans_rows(KmeansArgs::with_clusters(2));

        assert_eq!(membership.len(), 4);
        assert_eq!(membership[0], membership[1]);
        assert_eq!(membership[2], membership[3]);
        assert_ne!(membership[0], membership[2]);
    }

    #[test]
    fn test_kmeans_fewer_rows_than_clusters() {
        let mat = array![[1.0, 1.0], [2.0, 2.0]];
        let (membership, centroids) = mat.kmeans_rows_centroids(KmeansArgs::with_clusters(3));
        assert_eq!(membership, vec![0, 1]);
        assert_eq!(centroids.row(2), mat.row(0));
    }

    #[test]
    fn test_kmeans_empty_matrix() {
        let mat: Array2<f64> = Array2::zeros((0, 3));
        assert!(mat.kmeans_rows(KmeansArgs::with_clusters(2)).is_empty());
    }

    #[test]
    fn test_kmeans_centroids_are_member_means() {
        let mat = array![[0.0, 0.0], [0.2, 0.4], [10.0, 10.0], [10.2, 10.4], [10.4, 10.0]];
        let (membership, centroids) = mat.kmeans_rows_centroids(KmeansArgs::with_clusters(2));
        let a = membership[0];
        let b = membership[2];
        assert_ne!(a, b);
        assert_abs_diff_eq!(centroids.row(a), array![0.1, 0.2], epsilon = 1e-12);
        assert_abs_diff_eq!(centroids.row(b), array![10.2, 30.4 / 3.0], epsilon = 1e-9);
    }

    #[test]
    fn test_empty_cluster_takes_the_first_row() {
        let mat = array![[1.0, 2.0], [3.0, 4.0]];
        let centroids = cluster_means(&mat.view(), &[1, 1], 2);
        assert_eq!(centroids.row(0), mat.row(0));
        assert_abs_diff_eq!(centroids.row(1), array![2.0, 3.0], epsilon = 1e-12);
    }

    #[test]
    fn test_repeated_rows_fill_one_cluster() {
        let mat = array![[1.0, 1.0], [1.0, 1.0], [1.0, 1.0]];
        let (membership, centroids) = mat.kmeans_rows_centroids(KmeansArgs::with_clusters(2));
        assert_eq!(membership, vec![0, 0, 0]);
        assert_eq!(centroids.row(1), mat.row(0));
        assert_eq!(distinct_rows(&mat.view(), 3), vec![0]);
    }
}
