use candle_core::{DType, Device, Tensor};
use lupin::annealing::{LinearAnneal, Shrink};
use lupin::monitor::to_f32_vec;
use lupin::traits::{HierarchyModel, VisibleModel};
use lupin::*;
use matrix_util::traits::SampleOps;

fn build(
    nvis: usize,
    nhid: usize,
    layers: &[usize],
    schedule: &str,
    configure: impl FnOnce(&mut PddbmOptions, &mut DbmOptions),
) -> anyhow::Result<Pddbm<S3c, Dbm>> {
    let mut opts = PddbmOptions::default();
    opts.inference = InferenceOptions::default().with_schedule(parse_schedule(schedule)?);
    opts.learning_rate = 0.01;
    opts.print_interval = 0;

    let mut dbm_opts = DbmOptions::new(nhid, layers);
    dbm_opts.negative_chains = 20;
    configure(&mut opts, &mut dbm_opts);

    let s3c = S3c::new(S3cOptions::new(nvis, nhid), DType::F32)?;
    let dbm = Dbm::new(dbm_opts, DType::F32)?;
    Pddbm::new(s3c, dbm, opts)
}

fn channel(channels: &[(String, f32)], name: &str) -> Option<f32> {
    channels.iter().find(|(n, _)| n == name).map(|(_, x)| *x)
}

#[test]
fn learning_reports_every_channel() -> anyhow::Result<()> {
    let mut model = build(6, 4, &[3, 2], "s:1 h:1 g:0 g:1 s:0.5 h:0.5", |o, _| {
        o.monitor_ranges = true;
        o.monitor_neg_chain_marginals = true;
        o.inference.monitor_kl = true;
        o.non_s3c_lr = Some(LinearAnneal::new(0.01, 0.001, 0, 100));
        o.shrink = Some(Shrink {
            start: 0,
            scale: 0.01,
            min_shrink: 0.1,
        });
    })?;

    for seed in 0..3 {
        let v = Tensor::rnorm(10, 6, seed)?;
        model.learn_mini_batch(&v, &Labels::Unlabeled)?;
    }
    assert_eq!(model.examples_seen(), 30);

    let v = Tensor::rnorm(10, 6, 99)?;
    let channels = model.monitoring_channels(&v, &Labels::Unlabeled)?;
    for name in [
        "final_diff_S_hat",
        "final_diff_H_hat",
        "final_diff_G_hat[0]",
        "final_diff_G_hat[1]",
        "simple_recons_error",
        "var_param_grad_norm",
        "shrink",
        "non_s3c_lr",
        "dbm_W[0]_negprop",
        "dbm_W[1]_norms_max",
        "s3c_W_norms_mean",
        "neg_chain_h_mean",
        "neg_chain_g[1]_mean",
        "marginal_V_mean_mean",
        "hs_range_max",
        "g[0]_range_min",
        "trunc_KL_0init",
    ] {
        let x = channel(&channels, name);
        assert!(x.is_some(), "missing channel {}", name);
        assert!(!x.unwrap_or(f32::NAN).is_nan(), "{} is NaN", name);
    }

    let shrink = channel(&channels, "shrink").unwrap_or(0.0);
    assert!((shrink - 1.0 / 1.3).abs() < 1e-4);
    assert!(channel(&channels, "momentum").is_none());
    Ok(())
}

#[test]
fn switching_precision_keeps_the_bias_shared() -> anyhow::Result<()> {
    let mut model = build(5, 4, &[3], "h:1 s:1 g:0", |o, _| {
        o.momentum = Some(LinearAnneal::new(0.5, 0.9, 0, 50));
    })?;
    model.learn_mini_batch(&Tensor::rnorm(8, 5, 1)?, &Labels::Unlabeled)?;

    model.set_dtype(DType::F64)?;
    assert_eq!(model.dtype(), DType::F64);
    assert_eq!(model.hierarchy().weight(0).dtype(), DType::F64);
    assert_eq!(
        model.visible().hidden_bias().id(),
        model.hierarchy().visible_bias().id()
    );

    // an f32 batch no longer fits
    let v32 = Tensor::rnorm(8, 5, 2)?;
    assert!(model.learn_mini_batch(&v32, &Labels::Unlabeled).is_err());

    let v64 = v32.to_dtype(DType::F64)?;
    model.learn_mini_batch(&v64, &Labels::Unlabeled)?;
    assert_eq!(model.visible().dictionary().dtype(), DType::F64);
    assert_eq!(
        to_f32_vec(model.visible().hidden_bias().as_tensor())?,
        to_f32_vec(model.hierarchy().visible_bias().as_tensor())?
    );

    let channels = model.monitoring_channels(&v64, &Labels::Unlabeled)?;
    assert!(channel(&channels, "momentum").is_some());
    Ok(())
}

#[test]
fn natural_gradient_tracks_layer_variances() -> anyhow::Result<()> {
    let mut model = build(5, 4, &[3], "s:1 h:1 g:0", |o, _| {
        o.use_diagonal_natural_gradient = true;
    })?;
    let v = Tensor::rnorm(6, 5, 4)?;
    model.learn_mini_batch(&v, &Labels::Unlabeled)?;

    let channels = model.monitoring_channels(&v, &Labels::Unlabeled)?;
    assert!(channel(&channels, "grad_var_W[0]_mean").is_some());
    assert!(channel(&channels, "grad_var_bias_hid[0]_mean").is_some());
    assert!(channel(&channels, "grad_var_W_mean").is_some());

    let labels = Labels::Clamped(Tensor::zeros((6, 2), DType::F32, &Device::Cpu)?);
    assert!(model.learn_mini_batch(&v, &labels).is_err());
    Ok(())
}

#[test]
fn contrastive_divergence_learns() -> anyhow::Result<()> {
    let mut model = build(5, 4, &[3], "s:1 h:1 g:0", |_, d| {
        d.use_cd = true;
        d.cd_steps = 2;
    })?;
    let before = to_f32_vec(model.hierarchy().weight(0))?;
    model.learn_mini_batch(&Tensor::rnorm(6, 5, 8)?, &Labels::Unlabeled)?;
    assert_ne!(before, to_f32_vec(model.hierarchy().weight(0))?);
    Ok(())
}

#[test]
fn clamped_labels_train_the_label_layer() -> anyhow::Result<()> {
    let mut model = build(5, 4, &[3], "s:1 h:1 g:0 h:1 g:0", |_, d| {
        d.num_classes = 2;
    })?;
    let y = Tensor::new(
        &[[1_f32, 0.], [0., 1.], [1., 0.], [0., 1.]],
        &Device::Cpu,
    )?;
    let v = Tensor::rnorm(4, 5, 6)?;

    let before = to_f32_vec(model.hierarchy().class_weight().expect("label layer"))?;
    model.learn_mini_batch(&v, &Labels::Clamped(y.clone()))?;
    let after = to_f32_vec(model.hierarchy().class_weight().expect("label layer"))?;
    assert_ne!(before, after);

    let obs = model.infer(&v, &Labels::Infer)?;
    let y_hat = obs.y_hat.expect("inferred labels");
    assert_eq!(y_hat.dims(), &[4, 2]);
    for row in y_hat.to_vec2::<f32>()? {
        assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    let short = y.narrow(0, 0, 3)?;
    assert!(model.infer(&v, &Labels::Clamped(short)).is_err());
    Ok(())
}

#[test]
fn projected_weights_and_initializers() -> anyhow::Result<()> {
    let mut model = build(6, 4, &[3], "h:1 g:0", |o, _| {
        o.ss_init = Some(SpikeSlabInit {
            h: 0.3,
            mu: 1.0,
            scale: 0.1,
        });
        o.bayes_precision = true;
    })?;
    assert_eq!(model.visible_weights().dims(), &[6, 4]);
    assert_eq!(model.projected_weights()?.dims(), &[6, 3]);

    let w0 = to_f32_vec(model.hierarchy().weight(0))?;
    assert!(w0.iter().any(|&x| x == 0.0));

    let v = (Tensor::rnorm(20, 6, 3)? * 2.0)?;
    model.learn_mini_batch(&v, &Labels::Unlabeled)?;
    let b = to_f32_vec(model.visible().precision())?;
    assert!(b.iter().all(|&x| x > 0.0 && x < 1.0));

    model.make_pseudo_params()?;
    assert_eq!(
        model.visible().hidden_bias().id(),
        model.hierarchy().visible_bias().id()
    );
    Ok(())
}
