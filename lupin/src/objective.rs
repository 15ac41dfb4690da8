//! The tractable part of the variational bound, its penalties and the
//! reconstruction diagnostic.
//!
//! The bound is not differentiated through the inference fixed point:
//! everything inference produced, and every sufficient statistic, is
//! detached before the parameters enter.

use crate::inference::{InferenceProcedure, Observations};
use crate::sufficient_stats::SufficientStatistics;
use crate::traits::{HierarchyModel, VisibleModel};
use candle_core::Tensor;
use candle_nn::ops::sigmoid;
use serde::{Deserialize, Serialize};

const PROB_EPS: f64 = 1e-7;

/// Penalties subtracted from the bound during learning
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PenaltyOptions {
    /// L2 decay of each DBM weight matrix, `coeff * mean(W^2)`. Default: []
    pub dbm_weight_decay: Vec<f64>,
    /// L1 decay of each DBM weight matrix, `coeff * sum|W|`. Default: []
    pub dbm_l1_weight_decay: Vec<f64>,
    /// Sparsity penalty on the mean of `H_hat`. Default: None
    pub h_penalty: Option<f64>,
    /// Target rate of `H_hat`. Default: 0.0
    pub h_target: f64,
    /// Sparsity penalty on the mean of each `G_hat[l]`. Default: []
    pub g_penalties: Vec<f64>,
    /// Target rate of each `G_hat[l]`. Default: []
    pub g_targets: Vec<f64>,
    /// L1 decay of the S3C dictionary, `coeff * mean|W|`. Default: 0.0
    pub s3c_l1_weight_decay: f64,
    /// Weight of the reconstruction error. Default: 0.0
    pub recons_penalty: f64,
}

impl PenaltyOptions {
    pub fn check(&self, num_layers: usize) -> anyhow::Result<()> {
        for (name, coeffs) in [
            ("dbm_weight_decay", &self.dbm_weight_decay),
            ("dbm_l1_weight_decay", &self.dbm_l1_weight_decay),
            ("g_penalties", &self.g_penalties),
        ] {
            anyhow::ensure!(
                coeffs.is_empty() || coeffs.len() == num_layers,
                "{} has {} entries but the hierarchy has {} hidden layers",
                name,
                coeffs.len(),
                num_layers
            );
        }
        anyhow::ensure!(
            self.g_penalties.len() == self.g_targets.len(),
            "g_penalties and g_targets differ in length ({} vs {})",
            self.g_penalties.len(),
            self.g_targets.len()
        );
        for t in std::iter::once(&self.h_target).chain(self.g_targets.iter()) {
            anyhow::ensure!(
                (0.0..=1.0).contains(t),
                "sparsity target {} is outside [0, 1]",
                t
            );
        }
        Ok(())
    }

    /// Penalties that depend on more than one example at a time
    pub fn has_batch_penalties(&self) -> bool {
        self.h_penalty.is_some()
            || !self.g_penalties.is_empty()
            || self.dbm_weight_decay.iter().any(|&c| c != 0.0)
            || self.dbm_l1_weight_decay.iter().any(|&c| c != 0.0)
    }
}

/// The detached positive-phase bound
pub struct PositivePhase {
    /// scalar to be maximized
    pub objective: Tensor,
    /// the values the objective treats as constants
    pub held_constant: Vec<Tensor>,
}

fn detach_observations(obs: &Observations) -> Observations {
    Observations {
        h_hat: obs.h_hat.detach(),
        s_hat: obs.s_hat.detach(),
        g_hat: obs.g_hat.iter().map(|g| g.detach()).collect(),
        y_hat: obs.y_hat.as_ref().map(|y| y.detach()),
        var_s0_hat: obs.var_s0_hat.detach(),
        var_s1_hat: obs.var_s1_hat.detach(),
    }
}

/// `E[log p(v | h, s)] + E[log p(s | h)] - E[energy(h, g, y)]`
pub fn positive_phase<V, H>(
    visible: &V,
    hierarchy: &H,
    v: &Tensor,
    obs: &Observations,
) -> anyhow::Result<PositivePhase>
where
    V: VisibleModel + ?Sized,
    H: HierarchyModel + ?Sized,
{
    let obs = detach_observations(obs);
    let stats = SufficientStatistics::from_observations(&visible.needed_stats(), v, &obs)?;

    let ell_v = visible.expected_log_prob_v_given_hs(&stats)?;
    let ell_s = visible.expected_log_prob_s_given_h(&stats)?;
    let energy = hierarchy.expected_energy(&obs.h_hat, &obs.g_hat, obs.y_hat.as_ref())?;
    let objective = ((ell_v + ell_s)? - energy)?;

    let mut held_constant = vec![
        obs.h_hat.clone(),
        obs.s_hat.clone(),
        obs.var_s0_hat.clone(),
        obs.var_s1_hat.clone(),
    ];
    held_constant.extend(obs.g_hat.iter().cloned());
    held_constant.extend(obs.y_hat.iter().cloned());
    held_constant.extend(stats.iter().map(|(_, x)| x.clone()));

    Ok(PositivePhase {
        objective,
        held_constant,
    })
}

/// `-sum(t log o + (1 - t) log(1 - o))`
fn binary_crossentropy(target: f64, output: &Tensor) -> candle_core::Result<Tensor> {
    let on = output.clamp(PROB_EPS, 1.0 - PROB_EPS)?;
    let off = on.affine(-1.0, 1.0)?;
    let ll = ((on.log()? * target)? + (off.log()? * (1.0 - target))?)?;
    ll.sum_all()?.neg()
}

/// Sum of every penalty in `penalties`, or `None` when there are none
pub fn penalty<V, H>(
    penalties: &PenaltyOptions,
    procedure: &InferenceProcedure,
    visible: &V,
    hierarchy: &H,
    v: &Tensor,
    obs: &Observations,
) -> anyhow::Result<Option<Tensor>>
where
    V: VisibleModel + ?Sized,
    H: HierarchyModel + ?Sized,
{
    let mut terms: Vec<Tensor> = vec![];

    for (l, &coeff) in penalties.dbm_weight_decay.iter().enumerate() {
        if coeff != 0.0 {
            terms.push((hierarchy.weight(l).sqr()?.mean_all()? * coeff)?);
        }
    }
    for (l, &coeff) in penalties.dbm_l1_weight_decay.iter().enumerate() {
        if coeff != 0.0 {
            terms.push((hierarchy.weight(l).abs()?.sum_all()? * coeff)?);
        }
    }

    let obs = detach_observations(obs);

    // the penalized rates are those of a fresh update from the fixed
    // point, so they depend on the parameters
    if let Some(coeff) = penalties.h_penalty {
        let h = procedure.infer_h_hat(visible, hierarchy, v, &obs.h_hat, &obs.s_hat, &obs.g_hat)?;
        let bce = binary_crossentropy(penalties.h_target, &h.mean(0)?)?;
        terms.push((bce * coeff)?);
    }
    for (l, (&coeff, &target)) in penalties
        .g_penalties
        .iter()
        .zip(penalties.g_targets.iter())
        .enumerate()
    {
        // labels never enter the penalized rates
        let g = procedure.infer_g_hat(hierarchy, l, &obs.h_hat, &obs.g_hat, None)?;
        let bce = binary_crossentropy(target, &g.mean(0)?)?;
        terms.push((bce * coeff)?);
    }

    if penalties.s3c_l1_weight_decay != 0.0 {
        let w = visible.dictionary();
        terms.push((w.abs()?.mean_all()? * penalties.s3c_l1_weight_decay)?);
    }
    if let Some(reg) = visible.regularizer()? {
        terms.push(reg);
    }
    if penalties.recons_penalty != 0.0 {
        let top = &obs.g_hat[obs.g_hat.len() - 1];
        let err = simple_recons_error(visible, hierarchy, v, top)?;
        terms.push((err * penalties.recons_penalty)?);
    }

    let mut total: Option<Tensor> = None;
    for t in terms {
        total = Some(match total {
            Some(acc) => (acc + t)?,
            None => t,
        });
    }
    Ok(total)
}

/// The scalar maximized by a learning step: the positive-phase bound
/// minus every penalty
pub fn learning_objective<V, H>(
    penalties: &PenaltyOptions,
    procedure: &InferenceProcedure,
    visible: &V,
    hierarchy: &H,
    v: &Tensor,
    obs: &Observations,
) -> anyhow::Result<Tensor>
where
    V: VisibleModel + ?Sized,
    H: HierarchyModel + ?Sized,
{
    let bound = positive_phase(visible, hierarchy, v, obs)?.objective;
    match penalty(penalties, procedure, visible, hierarchy, v, obs)? {
        Some(p) => Ok((bound - p)?),
        None => Ok(bound),
    }
}

/// Squared error of a deterministic top-down pass from the top hidden
/// layer to `v`.
///
/// The spikes are replaced by their probabilities and the slabs by
/// `mu`, so this is the error of the mean rather than the mean error.
pub fn simple_recons_error<V, H>(
    visible: &V,
    hierarchy: &H,
    v: &Tensor,
    g_top: &Tensor,
) -> anyhow::Result<Tensor>
where
    V: VisibleModel + ?Sized,
    H: HierarchyModel + ?Sized,
{
    let mut x = g_top.clone();
    for l in (1..hierarchy.num_layers()).rev() {
        let pre = x
            .matmul(&hierarchy.weight(l).t()?)?
            .broadcast_add(hierarchy.layer_bias(l - 1))?;
        x = sigmoid(&pre)?;
    }
    let pre_h = x
        .matmul(&hierarchy.weight(0).t()?)?
        .broadcast_add(hierarchy.visible_bias().as_tensor())?;
    let h = sigmoid(&pre_h)?;

    let recons = h
        .broadcast_mul(visible.slab_mean())?
        .matmul(&visible.dictionary().t()?)?;
    Ok((recons - v)?.sqr()?.mean_all()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use crate::dbm::{Dbm, DbmOptions};
    use crate::inference::{InferenceOptions, Labels};
    use crate::param::ParamKey;
    use crate::s3c::{S3c, S3cOptions};
    use crate::schedule::parse_schedule;
    use candle_core::{DType, Device};
    use matrix_util::traits::SampleOps;

    fn labelled_setup() -> anyhow::Result<(S3c, Dbm, InferenceProcedure, Tensor, Observations)> {
        let dev = Device::Cpu;
        let s3c = S3c::new(S3cOptions::new(4, 3), DType::F32)?;
        let dbm = Dbm::new(DbmOptions::new(3, &[2]).with_classes(2), DType::F32)?;
        dbm.vars()[&ParamKey::ClassWeight].set(&Tensor::new(&[[5_f32, -5.], [5., -5.]], &dev)?)?;

        let options = InferenceOptions::default().with_schedule(parse_schedule("s:1 h:1 g:0")?);
        let procedure = InferenceProcedure::new(options, 1)?;
        let v = Tensor::rnorm(5, 4, 3)?;
        let y = Tensor::new(&[[1_f32, 0.], [0., 1.], [1., 0.], [1., 0.], [0., 1.]], &dev)?;
        let obs = procedure.infer(&s3c, &dbm, &v, &Labels::Clamped(y))?;
        Ok((s3c, dbm, procedure, v, obs))
    }

    #[test]
    fn positive_phase_holds_inference_constant() -> anyhow::Result<()> {
        let (s3c, dbm, _, v, obs) = labelled_setup()?;
        let phase = positive_phase(&s3c, &dbm, &v, &obs)?;
        assert!(!phase.held_constant.is_empty());

        let grads = phase.objective.backward()?;
        for x in phase.held_constant.iter() {
            assert!(grads.get(x).is_none());
        }
        assert!(grads.get(s3c.dictionary()).is_some());
        assert!(grads.get(dbm.weight(0)).is_some());
        Ok(())
    }

    #[test]
    fn g_penalty_ignores_the_labels() -> anyhow::Result<()> {
        let (s3c, dbm, procedure, v, obs) = labelled_setup()?;
        let penalties = PenaltyOptions {
            g_penalties: vec![0.5],
            g_targets: vec![0.1],
            ..Default::default()
        };

        let unlabelled = Observations {
            y_hat: None,
            ..obs.clone()
        };
        let with_y = penalty(&penalties, &procedure, &s3c, &dbm, &v, &obs)?;
        let without_y = penalty(&penalties, &procedure, &s3c, &dbm, &v, &unlabelled)?;
        match (with_y, without_y) {
            (Some(a), Some(b)) => {
                assert_abs_diff_eq!(a.to_scalar::<f32>()?, b.to_scalar::<f32>()?, epsilon = 1e-6);
            }
            _ => panic!("the g penalty is missing"),
        }
        Ok(())
    }

    #[test]
    fn crossentropy_at_target_is_entropy() -> anyhow::Result<()> {
        let o = Tensor::new(&[0.25_f64, 0.25], &Device::Cpu)?;
        let bce = binary_crossentropy(0.25, &o)?.to_scalar::<f64>()?;
        let h = -(0.25_f64 * 0.25_f64.ln() + 0.75 * 0.75_f64.ln());
        assert_abs_diff_eq!(bce, 2.0 * h, epsilon = 1e-9);
        Ok(())
    }

    #[test]
    fn batch_penalties_are_detected() {
        let mut p = PenaltyOptions::default();
        assert!(!p.has_batch_penalties());
        p.dbm_weight_decay = vec![0.0, 0.0];
        assert!(!p.has_batch_penalties());
        p.h_penalty = Some(0.1);
        assert!(p.has_batch_penalties());
        assert!(p.check(2).is_ok());
        p.g_penalties = vec![0.1];
        assert!(p.check(2).is_err());
    }
}
