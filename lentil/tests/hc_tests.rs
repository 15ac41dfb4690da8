use approx::assert_abs_diff_eq;
use lentil::*;
use matrix_util::traits::SampleOps;
use ndarray::{s, Array2, Axis};

/// Four well separated clouds of `n` rows each in 3 dimensions
fn four_clouds(n: usize) -> anyhow::Result<Array2<f64>> {
    let centres = [[-10., -10., 0.], [-10., 10., 0.], [10., -10., 0.], [10., 10., 0.]];
    let noise = Array2::<f64>::rnorm(4 * n, 3, 7)?;
    let mut data = Array2::<f64>::zeros((4 * n, 3));
    for (c, centre) in centres.iter().enumerate() {
        for i in 0..n {
            for j in 0..3 {
                data[[c * n + i, j]] = centre[j] + noise[[c * n + i, j]];
            }
        }
    }
    Ok(data)
}

#[test]
fn second_level_recovers_the_clouds() -> anyhow::Result<()> {
    let data = four_clouds(25)?;
    let options = HcOptions {
        max_step: 2,
        k: 2,
        ..Default::default()
    };
    let clusters = hc(&data, &options)?;
    assert_eq!(clusters.num_clusters(), kmnb(2, 2));

    let level2 = clusters.level(2);
    for slot in level2.clone() {
        assert_abs_diff_eq!(clusters.priors[slot], 0.25, epsilon = 1e-12);
    }

    // every cloud sits in one second-level cluster
    let means = clusters.means.slice(s![level2.clone(), ..]).to_owned();
    let membership = partition(&data.view(), &means.view());
    for c in 0..4 {
        let first = membership[c * 25];
        assert!(membership[c * 25..(c + 1) * 25].iter().all(|&m| m == first));
    }
    Ok(())
}

#[test]
fn responsibilities_sum_to_one_per_level() -> anyhow::Result<()> {
    let data = four_clouds(20)?;
    let options = HcOptions {
        max_step: 2,
        k: 2,
        ..Default::default()
    };
    let clusters = hc(&data, &options)?;
    let ps = probs(&data.view(), &clusters, true, 2)?;
    assert_eq!(ps.dim(), (80, 6));

    for level in 1..=2 {
        let sums = ps.slice(s![.., clusters.level(level)]).sum_axis(Axis(1));
        for x in sums.iter() {
            assert_abs_diff_eq!(*x, 1.0, epsilon = 1e-9);
        }
    }

    let raw = probs(&data.view(), &clusters, false, 0)?;
    assert!(raw.iter().all(|&p| (0.0..=1.0).contains(&p)));
    Ok(())
}

#[test]
fn diagonal_variances_score_like_full_ones_on_round_clouds() -> anyhow::Result<()> {
    let data = four_clouds(30)?;
    let full = hc(&data, &HcOptions { max_step: 1, ..Default::default() })?;
    let diag = hc(
        &data,
        &HcOptions {
            max_step: 1,
            full_cov: false,
            ..Default::default()
        },
    )?;
    assert!(matches!(diag.covariances[0], Covariance::Diagonal(_)));

    let pf = probs(&data.view(), &full, false, 2)?;
    let pd = probs(&data.view(), &diag, false, 2)?;
    for (a, b) in pf.iter().zip(pd.iter()) {
        assert!((a - b).abs() < 0.05, "{} vs {}", a, b);
    }
    Ok(())
}
