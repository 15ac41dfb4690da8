//! Tests across the S3C visible model, the DBM and the container.

use crate::annealing::LinearAnneal;
use crate::dbm::{Dbm, DbmOptions};
use crate::inference::{InferenceOptions, InferenceProcedure, Labels};
use crate::model::{BiasSource, Pddbm, PddbmOptions};
use crate::monitor::to_f32_vec;
use crate::param::ParamKey;
use crate::s3c::{S3c, S3cOptions};
use crate::schedule::{parse_schedule, InferenceStep};
use crate::traits::{HierarchyModel, VisibleModel};
use approx::assert_abs_diff_eq;
use candle_core::{DType, Device, Tensor};
use matrix_util::traits::SampleOps;

fn options(schedule: &str) -> anyhow::Result<PddbmOptions> {
    let mut opts = PddbmOptions::default();
    opts.inference = InferenceOptions::default().with_schedule(parse_schedule(schedule)?);
    opts.print_interval = 0;
    Ok(opts)
}

fn small_model(schedule: &str, dtype: DType) -> anyhow::Result<Pddbm<S3c, Dbm>> {
    let s3c = S3c::new(S3cOptions::new(4, 3), dtype)?;
    let dbm = Dbm::new(DbmOptions::new(3, &[2]), dtype)?;
    Pddbm::new(s3c, dbm, options(schedule)?)
}

fn assert_unit_interval(name: &str, x: &Tensor) -> anyhow::Result<()> {
    for p in to_f32_vec(x)? {
        assert!((0.0..=1.0).contains(&p), "{} has {}", name, p);
    }
    Ok(())
}

#[test]
fn zero_batch_inference_shapes() -> anyhow::Result<()> {
    let model = small_model("h:1 s:1 g:0", DType::F32)?;
    let v = Tensor::zeros((5, 4), DType::F32, &Device::Cpu)?;
    let obs = model.infer(&v, &Labels::Unlabeled)?;

    assert_eq!(obs.h_hat.dims(), &[5, 3]);
    assert_eq!(obs.s_hat.dims(), &[5, 3]);
    assert_eq!(obs.g_hat.len(), 1);
    assert_eq!(obs.g_hat[0].dims(), &[5, 2]);
    assert_eq!(obs.var_s0_hat.dims(), &[3]);
    assert!(obs.y_hat.is_none());

    assert_unit_interval("H_hat", &obs.h_hat)?;
    assert_unit_interval("G_hat[0]", &obs.g_hat[0])?;
    Ok(())
}

#[test]
fn hidden_layers_stay_probabilities() -> anyhow::Result<()> {
    let s3c = S3c::new(S3cOptions::new(6, 5), DType::F32)?;
    let mut dbm_opts = DbmOptions::new(5, &[4, 3]);
    dbm_opts.irange = 2.0;
    let dbm = Dbm::new(dbm_opts, DType::F32)?;
    let schedule = parse_schedule("s:1 h:0.5 g:0 g:1 h:1 s:0.3 g:0:0.5 g:1:0.5")?;
    let procedure = InferenceProcedure::new(InferenceOptions::default().with_schedule(schedule), 2)?;

    for seed in 0..5 {
        let v = (Tensor::rnorm(8, 6, seed)? * 3.0)?;
        for obs in procedure.infer_history(&s3c, &dbm, &v, &Labels::Unlabeled)? {
            assert_unit_interval("H_hat", &obs.h_hat)?;
            for g in obs.g_hat.iter() {
                assert_unit_interval("G_hat", g)?;
            }
        }
    }
    Ok(())
}

#[test]
fn inferred_labels_follow_the_top_layer() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let s3c = S3c::new(S3cOptions::new(4, 3), DType::F32)?;
    let dbm = Dbm::new(DbmOptions::new(3, &[2]).with_classes(3), DType::F32)?;
    dbm.vars()[&ParamKey::ClassWeight].set(&Tensor::new(&[[4_f32, 0., 0.], [4., 0., 0.]], &dev)?)?;

    let schedule = parse_schedule("h:1 g:0")?;
    let procedure = InferenceProcedure::new(InferenceOptions::default().with_schedule(schedule), 1)?;
    let v = Tensor::rnorm(3, 4, 11)?;
    let history = procedure.infer_history(&s3c, &dbm, &v, &Labels::Infer)?;
    assert_eq!(history.len(), 3);

    let before = &history[1];
    let y0 = before.y_hat.as_ref().expect("label prior");
    let once = dbm.infer_g_hat(0, &before.h_hat, Some(y0))?;
    let y1 = dbm.infer_y_hat(&once)?;
    let twice = dbm.infer_g_hat(0, &before.h_hat, Some(&y1))?;

    let after = &history[2];
    let got_g = to_f32_vec(&after.g_hat[0])?;
    for (a, b) in got_g.iter().zip(to_f32_vec(&twice)?) {
        assert_abs_diff_eq!(*a, b, epsilon = 1e-6);
    }
    let got_y = to_f32_vec(after.y_hat.as_ref().expect("labels"))?;
    for (a, b) in got_y.iter().zip(to_f32_vec(&y1)?) {
        assert_abs_diff_eq!(*a, b, epsilon = 1e-6);
    }

    // the second pass sees the sharpened labels
    let gap = got_g
        .iter()
        .zip(to_f32_vec(&once)?)
        .map(|(a, b)| (a - b).abs())
        .fold(0_f32, f32::max);
    assert!(gap > 1e-2, "top layer was not refreshed after the labels ({})", gap);
    Ok(())
}

#[test]
fn kl_is_visible_plus_hierarchy_without_bias() -> anyhow::Result<()> {
    let model = small_model("s:1 h:1 g:0 s:1 h:1", DType::F64)?;
    let v = Tensor::rnorm(6, 4, 5)?.to_dtype(DType::F64)?;
    let obs = model.infer(&v, &Labels::Unlabeled)?;

    let total = to_f32_vec(&model.truncated_kl(&v, &obs, &Labels::Unlabeled)?)?;
    let visible = to_f32_vec(&model.visible().truncated_kl(&v, &obs)?)?;
    let hierarchy = to_f32_vec(&model.hierarchy().truncated_kl(&obs.h_hat, &obs.g_hat, None, false, true)?)?;

    assert_eq!(total.len(), 6);
    for i in 0..6 {
        assert_abs_diff_eq!(total[i], visible[i] + hierarchy[i], epsilon = 1e-4);
    }
    Ok(())
}

#[test]
fn shared_bias_is_one_parameter() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let mut model = small_model("h:1 s:1 g:0", DType::F32)?;
    assert_eq!(
        model.visible().hidden_bias().id(),
        model.hierarchy().visible_bias().id()
    );

    model
        .visible()
        .hidden_bias()
        .set(&Tensor::new(&[0.5_f32, -1.0, 2.0], &dev)?)?;
    assert_eq!(
        model.hierarchy().visible_bias().to_vec1::<f32>()?,
        vec![0.5, -1.0, 2.0]
    );

    let v = Tensor::rnorm(10, 4, 7)?;
    model.learn_mini_batch(&v, &Labels::Unlabeled)?;
    assert_eq!(
        model.visible().hidden_bias().to_vec1::<f32>()?,
        model.hierarchy().visible_bias().to_vec1::<f32>()?
    );
    assert_eq!(model.params().len(), 7);
    Ok(())
}

#[test]
fn visible_bias_source_is_kept() -> anyhow::Result<()> {
    let mut s3c_opts = S3cOptions::new(4, 3);
    s3c_opts.init_bias_hid = -1.5;
    let s3c = S3c::new(s3c_opts, DType::F32)?;
    let dbm = Dbm::new(DbmOptions::new(3, &[2]), DType::F32)?;

    let mut opts = options("h:1 g:0")?;
    opts.h_bias_src = BiasSource::Visible;
    let model = Pddbm::new(s3c, dbm, opts)?;
    assert_eq!(
        model.hierarchy().visible_bias().to_vec1::<f32>()?,
        vec![-1.5; 3]
    );
    Ok(())
}

#[test]
fn sub_batch_mode_steps() -> anyhow::Result<()> {
    let s3c = S3c::new(S3cOptions::new(4, 3), DType::F32)?;
    let dbm = Dbm::new(DbmOptions::new(3, &[2]), DType::F32)?;
    let mut opts = options("s:1 h:1 g:0")?;
    opts.sub_batch = true;
    opts.learning_rate = 0.01;
    let mut model = Pddbm::new(s3c, dbm, opts)?;

    let w_before = to_f32_vec(model.hierarchy().weight(0))?;
    let v = Tensor::rnorm(4, 4, 3)?;
    model.learn_mini_batch(&v, &Labels::Unlabeled)?;
    assert_eq!(model.examples_seen(), 4);
    assert_ne!(w_before, to_f32_vec(model.hierarchy().weight(0))?);

    assert!(model.commit_gradient_step().is_err());
    assert!(model.accumulate_positive_phase(&v.narrow(0, 0, 1)?).is_err());

    let labels = Labels::Clamped(Tensor::zeros((4, 2), DType::F32, &Device::Cpu)?);
    assert!(model.learn_mini_batch(&v, &labels).is_err());
    Ok(())
}

#[test]
fn frozen_submodels_keep_their_values() -> anyhow::Result<()> {
    let s3c = S3c::new(S3cOptions::new(4, 3), DType::F32)?;
    let dbm = Dbm::new(DbmOptions::new(3, &[2]), DType::F32)?;
    let mut opts = options("s:1 h:1 g:0")?;
    opts.freeze_dbm_params = true;
    opts.learning_rate = 0.05;
    let mut model = Pddbm::new(s3c, dbm, opts)?;

    let w_dbm = to_f32_vec(model.hierarchy().weight(0))?;
    let w_s3c = to_f32_vec(model.visible().dictionary())?;
    model.learn_mini_batch(&Tensor::rnorm(6, 4, 2)?, &Labels::Unlabeled)?;

    assert_eq!(w_dbm, to_f32_vec(model.hierarchy().weight(0))?);
    assert_ne!(w_s3c, to_f32_vec(model.visible().dictionary())?);
    Ok(())
}

#[test]
fn invalid_configurations_are_rejected() -> anyhow::Result<()> {
    let dbm = || Dbm::new(DbmOptions::new(3, &[2]), DType::F32);
    let s3c = || S3c::new(S3cOptions::new(4, 3), DType::F32);

    // widths of h disagree
    let wide = Dbm::new(DbmOptions::new(5, &[2]), DType::F32)?;
    assert!(Pddbm::new(s3c()?, wide, options("h:1")?).is_err());

    // spike prior penalty has no meaning under a DBM prior
    let mut penalized = S3cOptions::new(4, 3);
    penalized.p_penalty = 1.0;
    assert!(Pddbm::new(S3c::new(penalized, DType::F32)?, dbm()?, options("h:1")?).is_err());

    let mut opts = options("h:1 g:0")?;
    opts.use_diagonal_natural_gradient = true;
    opts.momentum = Some(LinearAnneal::new(0.5, 0.9, 0, 100));
    assert!(Pddbm::new(s3c()?, dbm()?, opts).is_err());

    let mut opts = options("h:1 g:0")?;
    opts.sub_batch = true;
    opts.penalties.h_penalty = Some(0.1);
    assert!(Pddbm::new(s3c()?, dbm()?, opts).is_err());

    let mut opts = options("h:1 g:0")?;
    opts.penalties.g_penalties = vec![0.1, 0.1];
    opts.penalties.g_targets = vec![0.1, 0.1];
    assert!(Pddbm::new(s3c()?, dbm()?, opts).is_err());

    assert!(Pddbm::new(s3c()?, dbm()?, options("g:1")?).is_err());

    let model = Pddbm::new(s3c()?, dbm()?, options("h:1 g:0")?)?;
    let v = Tensor::rnorm(2, 4, 1)?;
    assert!(model.infer(&v, &Labels::Infer).is_err());
    Ok(())
}

#[test]
fn nan_inputs_fail_the_numeric_checks() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let s3c = S3c::new(S3cOptions::new(4, 3), DType::F32)?;
    let dbm = Dbm::new(DbmOptions::new(3, &[2]), DType::F32)?;
    let mut opts = options("h:1 s:1 g:0")?;
    opts.inference.check_numerics = true;
    let model = Pddbm::new(s3c, dbm, opts)?;

    let clean = Tensor::rnorm(3, 4, 9)?;
    let obs = model.infer(&clean, &Labels::Unlabeled)?;

    let mask = Tensor::new(&[[f32::NAN, 0., 0., 0.], [0., 0., 0., 0.], [0., 0., 0., 0.]], &dev)?;
    let bad = (&clean + mask)?;

    let err = model.infer(&bad, &Labels::Unlabeled).err().map(|e| e.to_string());
    let err = err.unwrap_or_default();
    assert!(err.contains("H_hat") && err.contains("step 0"), "{}", err);

    let err = model
        .truncated_kl(&bad, &obs, &Labels::Unlabeled)
        .err()
        .map(|e| e.to_string())
        .unwrap_or_default();
    assert!(err.contains("visible KL is NaN at example 0"), "{}", err);
    Ok(())
}

#[test]
fn overshooting_steps_fail_the_probability_check() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let s3c = S3c::new(S3cOptions::new(4, 3), DType::F32)?;
    let dbm = Dbm::new(DbmOptions::new(3, &[2, 2]), DType::F32)?;

    // g[0] starts near 0 and its update from a saturated g[1] is near 1
    let vars = dbm.vars();
    vars[&ParamKey::LayerBias(0)].set(&Tensor::new(&[-20_f32, -20.], &dev)?)?;
    vars[&ParamKey::LayerBias(1)].set(&Tensor::new(&[20_f32, 20.], &dev)?)?;
    vars[&ParamKey::Weight(1)].set(&Tensor::new(&[[20_f32, 20.], [20., 20.]], &dev)?)?;

    let schedule = vec![InferenceStep::G {
        layer: 0,
        coeff: Some(3.0),
    }];
    let mut options = InferenceOptions::default().with_schedule(schedule);
    options.check_numerics = true;
    let procedure = InferenceProcedure::new(options.clone(), 2)?;

    let v = Tensor::rnorm(2, 4, 1)?;
    let err = procedure
        .infer(&s3c, &dbm, &v, &Labels::Unlabeled)
        .err()
        .map(|e| e.to_string())
        .unwrap_or_default();
    assert!(err.contains("G_hat[0] left [0, 1]") && err.contains("step 0"), "{}", err);

    options.check_numerics = false;
    let unchecked = InferenceProcedure::new(options, 2)?;
    let obs = unchecked.infer(&s3c, &dbm, &v, &Labels::Unlabeled)?;
    assert!(to_f32_vec(&obs.g_hat[0])?.iter().all(|&g| g > 2.9));
    Ok(())
}
