use approx::assert_abs_diff_eq;
use matrix_util::ndarray_stat::RunningMoments;
use matrix_util::traits::*;
use ndarray::{Array2, Axis};

#[test]
fn running_moments_on_random_stream() -> anyhow::Result<()> {
    let xx = Array2::<f64>::rnorm(500, 4, 1)?;

    let mut stat = RunningMoments::new(4, true);
    for chunk in xx.axis_chunks_iter(Axis(0), 37) {
        stat.add_rows(&chunk);
    }

    assert_eq!(stat.count(), 500);
    assert_abs_diff_eq!(stat.mean(), xx.mean_axis(Axis(0)).unwrap(), epsilon = 1e-10);
    assert_abs_diff_eq!(stat.variance_ddof(1), xx.var_axis(Axis(0), 1.0), epsilon = 1e-10);

    let cov = stat.covariance_ddof(1).unwrap();
    for j in 0..4 {
        assert_abs_diff_eq!(cov[[j, j]], stat.variance_ddof(1)[j], epsilon = 1e-10);
    }
    Ok(())
}
