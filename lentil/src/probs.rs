//! Cluster responsibilities under the hierarchy, one Gaussian kernel
//! per cluster.

use crate::hc::{Covariance, HierarchicalClusters};
use log::debug;
use nalgebra::DMatrix;
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;

/// Inverse of a covariance; a singular one becomes `I / eps`, so a
/// zero-spread cluster only keeps rows sitting on its mean
pub fn precision(cov: &Covariance) -> Array2<f64> {
    let dim = cov.dim();
    let singular = || Array2::<f64>::eye(dim) / f64::EPSILON;

    let mat = cov.to_matrix();
    let dm = DMatrix::<f64>::from_fn(dim, dim, |i, j| mat[[i, j]]);
    if dm.determinant() == 0.0 {
        return singular();
    }
    match dm.try_inverse() {
        Some(inv) => Array2::from_shape_fn((dim, dim), |(i, j)| inv[(i, j)]),
        None => singular(),
    }
}

/// `exp(-0.5 * t' P t)` with `t = x - mean` for every row `x`; the
/// normalizing constant is left out
pub fn gaussian_kernel(
    data: &ArrayView2<f64>,
    mean: &ArrayView1<f64>,
    precision: &Array2<f64>,
) -> Array1<f64> {
    let centred = data - &mean.insert_axis(Axis(0));
    let quad = (centred.dot(precision) * &centred).sum_axis(Axis(1));
    quad.mapv(|q| (-0.5 * q).exp())
}

/// Kernel of every row under every cluster, `n x nb`
///
/// * `use_priors` - weight each column by the cluster prior
/// * `normalize_k` - if nonzero, make each level's block of `k^l`
///   columns sum to one per row, as if the hierarchy had `normalize_k`
///   children per cluster; rows with nothing in a block stay zero
pub fn probs(
    data: &ArrayView2<f64>,
    clusters: &HierarchicalClusters,
    use_priors: bool,
    normalize_k: usize,
) -> anyhow::Result<Array2<f64>> {
    let (nn, dd) = data.dim();
    let nb = clusters.num_clusters();
    anyhow::ensure!(
        clusters.means.ncols() == dd,
        "data have {} features, the clusters {}",
        dd,
        clusters.means.ncols()
    );
    anyhow::ensure!(
        clusters.covariances.len() == nb && clusters.means.nrows() == nb,
        "clusters carry {} means, {} covariances and {} priors",
        clusters.means.nrows(),
        clusters.covariances.len(),
        nb
    );

    let columns: Vec<Array1<f64>> = (0..nb)
        .into_par_iter()
        .map(|c| {
            let p = precision(&clusters.covariances[c]);
            let kernel = gaussian_kernel(data, &clusters.means.row(c), &p);
            if use_priors {
                kernel * clusters.priors[c]
            } else {
                kernel
            }
        })
        .collect();

    let mut ret = Array2::<f64>::zeros((nn, nb));
    for (c, col) in columns.iter().enumerate() {
        ret.column_mut(c).assign(col);
    }
    debug!("computed {} x {} cluster kernels", nn, nb);

    if normalize_k > 0 {
        normalize_levels(&mut ret, normalize_k);
    }
    Ok(ret)
}

fn normalize_levels(ps: &mut Array2<f64>, k: usize) {
    let nb = ps.ncols();
    let mut level = 1_u32;
    let (mut lb, mut ub) = (0, k);

    while ub <= nb {
        let mut block = ps.slice_mut(s![.., lb..ub]);
        for mut row in block.rows_mut() {
            let tot = row.sum();
            if tot > 0.0 {
                row /= tot;
            }
        }
        level += 1;
        lb = ub;
        ub += k.pow(level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn singular_covariance_is_a_point_mass() {
        let cov = Covariance::Diagonal(Array1::zeros(2));
        let p = precision(&cov);
        let data = array![[1., 2.], [1.5, 2.]];
        let k = gaussian_kernel(&data.view(), &array![1., 2.].view(), &p);
        assert_eq!(k[0], 1.0);
        assert_eq!(k[1], 0.0);
    }

    #[test]
    fn kernel_matches_the_quadratic_form() {
        let cov = Covariance::Full(array![[2., 0.], [0., 0.5]]);
        let p = precision(&cov);
        assert_abs_diff_eq!(p[[0, 0]], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(p[[1, 1]], 2.0, epsilon = 1e-12);

        let data = array![[1., 1.]];
        let k = gaussian_kernel(&data.view(), &array![0., 0.].view(), &p);
        assert_abs_diff_eq!(k[0], (-0.5_f64 * 2.5).exp(), epsilon = 1e-12);
    }

    #[test]
    fn levels_are_normalized_separately() {
        let mut ps = array![[1., 3., 1., 1., 2., 0.], [0., 0., 0., 0., 0., 0.]];
        normalize_levels(&mut ps, 2);
        assert_abs_diff_eq!(ps[[0, 0]], 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(ps[[0, 1]], 0.75, epsilon = 1e-12);
        assert_abs_diff_eq!(ps[[0, 4]], 0.5, epsilon = 1e-12);
        assert_eq!(ps.row(1).sum(), 0.0);
    }
}
