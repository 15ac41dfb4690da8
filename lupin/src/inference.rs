//! Mean-field inference over `S_hat`, `H_hat`, the hidden layers
//! `G_hat` and optionally the labels `Y_hat`.
//!
//! Inference runs a fixed schedule of damped coordinate-ascent steps.
//! There is no convergence test; the number of steps is the length of
//! the schedule.

use crate::damping::{damp, reflection_clip};
use crate::monitor::{range_channels, to_f32_scalar, to_f32_vec};
use crate::objective::simple_recons_error;
use crate::schedule::{check_schedule, InferenceStep};
use crate::traits::{Channels, HierarchyModel, VisibleModel};
use candle_core::{Tensor, Var};
use candle_nn::ops::sigmoid;
use log::warn;
use serde::{Deserialize, Serialize};

/// Variational parameters after one inference step
#[derive(Debug, Clone)]
pub struct Observations {
    /// spike probabilities, `(n, nhid)`
    pub h_hat: Tensor,
    /// slab means given `h = 1`, `(n, nhid)`
    pub s_hat: Tensor,
    /// hidden layer probabilities, bottom first
    pub g_hat: Vec<Tensor>,
    /// label distribution when labels are clamped or inferred
    pub y_hat: Option<Tensor>,
    /// slab variance given `h = 0`, `(nhid,)`
    pub var_s0_hat: Tensor,
    /// slab variance given `h = 1`, `(nhid,)`
    pub var_s1_hat: Tensor,
}

/// How the label layer takes part in inference
#[derive(Debug, Clone, Default)]
pub enum Labels {
    /// no label layer involved
    #[default]
    Unlabeled,
    /// one-hot (or soft) labels held fixed, `(n, num_classes)`
    Clamped(Tensor),
    /// labels are variational parameters like the hidden layers
    Infer,
}

impl Labels {
    pub fn is_inferred(&self) -> bool {
        matches!(self, Labels::Infer)
    }

    pub fn clamped(&self) -> Option<&Tensor> {
        match self {
            Labels::Clamped(y) => Some(y),
            _ => None,
        }
    }
}

/// Options for the inference procedure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceOptions {
    /// Steps run in order, e.g. `["h:1", "s:1", "g:0"]`. Default: []
    pub schedule: Vec<InferenceStep>,
    /// Keep `S_hat` updates from reflecting through zero. Default: false
    pub clip_reflections: bool,
    /// Fraction of `|S_hat|` a reflection may reach. Default: 0.5
    pub rho: f64,
    /// Report the truncated KL after every step. Default: false
    pub monitor_kl: bool,
    /// Check probability ranges and NaN in the KL. Default: on in debug builds
    pub check_numerics: bool,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        InferenceOptions {
            schedule: vec![],
            clip_reflections: false,
            rho: 0.5,
            monitor_kl: false,
            check_numerics: cfg!(debug_assertions),
        }
    }
}

impl InferenceOptions {
    pub fn with_schedule(mut self, schedule: Vec<InferenceStep>) -> Self {
        self.schedule = schedule;
        self
    }
}

/// Runs the schedule against a visible model and a hierarchy
#[derive(Debug, Clone)]
pub struct InferenceProcedure {
    options: InferenceOptions,
}

impl InferenceProcedure {
    /// Build a procedure for a hierarchy with `num_layers` hidden layers
    pub fn new(options: InferenceOptions, num_layers: usize) -> anyhow::Result<Self> {
        check_schedule(&options.schedule, num_layers)?;
        anyhow::ensure!(
            (0.0..=1.0).contains(&options.rho),
            "reflection fraction rho must be in [0, 1], got {}",
            options.rho
        );
        Ok(InferenceProcedure { options })
    }

    pub fn options(&self) -> &InferenceOptions {
        &self.options
    }

    pub fn schedule(&self) -> &[InferenceStep] {
        &self.options.schedule
    }

    /// Only the final variational parameters
    pub fn infer<V, H>(
        &self,
        visible: &V,
        hierarchy: &H,
        v: &Tensor,
        labels: &Labels,
    ) -> anyhow::Result<Observations>
    where
        V: VisibleModel + ?Sized,
        H: HierarchyModel + ?Sized,
    {
        let mut history = self.infer_history(visible, hierarchy, v, labels)?;
        history
            .pop()
            .ok_or_else(|| anyhow::anyhow!("inference produced no state"))
    }

    /// The initialization followed by the state after every step,
    /// `schedule.len() + 1` entries
    pub fn infer_history<V, H>(
        &self,
        visible: &V,
        hierarchy: &H,
        v: &Tensor,
        labels: &Labels,
    ) -> anyhow::Result<Vec<Observations>>
    where
        V: VisibleModel + ?Sized,
        H: HierarchyModel + ?Sized,
    {
        self.check_inputs(visible, hierarchy, v, labels)?;

        let nn = v.dim(0)?;
        let nlayers = hierarchy.num_layers();
        let top = nlayers - 1;

        let var_s0_hat = visible.var_s0_hat()?;
        let var_s1_hat = visible.var_s1_hat()?;

        let mut h_hat = visible.init_h_hat(v)?;
        let mut g_hat = hierarchy.init_g_hat(&h_hat)?;
        let mut s_hat = visible.init_s_hat(v)?;
        let mut y_hat = match labels {
            Labels::Unlabeled => None,
            Labels::Clamped(y) => Some(y.clone()),
            Labels::Infer => Some(hierarchy.init_y_hat(nn)?),
        };

        let snapshot = |h: &Tensor, s: &Tensor, g: &[Tensor], y: &Option<Tensor>| Observations {
            h_hat: h.clone(),
            s_hat: s.clone(),
            g_hat: g.to_vec(),
            y_hat: y.clone(),
            var_s0_hat: var_s0_hat.clone(),
            var_s1_hat: var_s1_hat.clone(),
        };

        let mut history = Vec::with_capacity(self.options.schedule.len() + 1);
        history.push(snapshot(&h_hat, &s_hat, &g_hat, &y_hat));

        for (i, step) in self.options.schedule.iter().enumerate() {
            match *step {
                InferenceStep::S { coeff } => {
                    let mut new_s = visible.infer_s_hat(v, &h_hat, &s_hat)?;
                    if self.options.clip_reflections {
                        new_s = reflection_clip(&s_hat, &new_s, self.options.rho)?;
                    }
                    s_hat = damp(&s_hat, &new_s, coeff)?;
                }
                InferenceStep::H { coeff } => {
                    let new_h = self.infer_h_hat(visible, hierarchy, v, &h_hat, &s_hat, &g_hat)?;
                    h_hat = damp(&h_hat, &new_h, coeff)?;
                    self.check_probability("H_hat", i, step, &h_hat)?;
                }
                InferenceStep::G { layer, coeff } => {
                    let update = |g: &[Tensor], y: Option<&Tensor>| -> anyhow::Result<Tensor> {
                        let new_g = self.infer_g_hat(hierarchy, layer, &h_hat, g, y)?;
                        Ok(match coeff {
                            Some(c) => damp(&g[layer], &new_g, c)?,
                            None => new_g,
                        })
                    };

                    g_hat[layer] = update(&g_hat, y_hat.as_ref())?;

                    // at the top, labels follow the fresh layer and the
                    // layer is refreshed once more against the new labels
                    if labels.is_inferred() && layer == top {
                        if let Some(y) = y_hat.take() {
                            let new_y = hierarchy.infer_y_hat(&g_hat[top])?;
                            y_hat = Some(damp(&y, &new_y, coeff.unwrap_or(1.0))?);
                        }
                        g_hat[layer] = update(&g_hat, y_hat.as_ref())?;
                    }

                    self.check_probability(&format!("G_hat[{}]", layer), i, step, &g_hat[layer])?;
                }
            }
            history.push(snapshot(&h_hat, &s_hat, &g_hat, &y_hat));
        }

        Ok(history)
    }

    /// Spike update: the visible pre-activation plus the top-down
    /// message from `G_hat[0]`
    pub fn infer_h_hat<V, H>(
        &self,
        visible: &V,
        hierarchy: &H,
        v: &Tensor,
        h_hat: &Tensor,
        s_hat: &Tensor,
        g_hat: &[Tensor],
    ) -> anyhow::Result<Tensor>
    where
        V: VisibleModel + ?Sized,
        H: HierarchyModel + ?Sized,
    {
        let bottom_up = visible.infer_h_hat_presigmoid(v, h_hat, s_hat)?;
        let top_down = g_hat[0].matmul(&hierarchy.weight(0).t()?)?;
        Ok(sigmoid(&(bottom_up + top_down)?)?)
    }

    /// Update of `g[layer]` from its neighbours; the top layer sees the
    /// labels when there are any, otherwise only the layer below
    pub fn infer_g_hat<H>(
        &self,
        hierarchy: &H,
        layer: usize,
        h_hat: &Tensor,
        g_hat: &[Tensor],
        y_hat: Option<&Tensor>,
    ) -> anyhow::Result<Tensor>
    where
        H: HierarchyModel + ?Sized,
    {
        let below = if layer == 0 { h_hat } else { &g_hat[layer - 1] };
        let above = if layer + 1 < g_hat.len() {
            Some(&g_hat[layer + 1])
        } else {
            y_hat
        };
        hierarchy.infer_g_hat(layer, below, above)
    }

    /// Per-example KL between the variational posterior and the model,
    /// the visible share plus the hierarchy share without its `h` bias
    pub fn truncated_kl<V, H>(
        &self,
        visible: &V,
        hierarchy: &H,
        v: &Tensor,
        obs: &Observations,
        labels: &Labels,
    ) -> anyhow::Result<Tensor>
    where
        V: VisibleModel + ?Sized,
        H: HierarchyModel + ?Sized,
    {
        let visible_kl = visible.truncated_kl(v, obs)?;
        let hierarchy_kl = hierarchy.truncated_kl(
            &obs.h_hat,
            &obs.g_hat,
            obs.y_hat.as_ref(),
            labels.is_inferred(),
            true,
        )?;

        if self.options.check_numerics {
            check_finite("visible KL", &visible_kl)?;
            check_finite("hierarchy KL", &hierarchy_kl)?;
        }
        Ok((visible_kl + hierarchy_kl)?)
    }

    /// Channels summarizing inference on one batch
    pub fn monitoring_channels<V, H>(
        &self,
        visible: &V,
        hierarchy: &H,
        v: &Tensor,
        labels: &Labels,
        monitor_ranges: bool,
    ) -> anyhow::Result<Channels>
    where
        V: VisibleModel + ?Sized,
        H: HierarchyModel + ?Sized,
    {
        let history = self.infer_history(visible, hierarchy, v, labels)?;
        let mut ret = final_diff(&history)?;

        if self.options.monitor_kl {
            for (i, obs) in history.iter().enumerate() {
                let kl = self.truncated_kl(visible, hierarchy, v, obs, labels)?.mean_all()?;
                let step = match i {
                    0 => "init".to_string(),
                    _ => self.options.schedule[i - 1].to_string(),
                };
                ret.push((format!("trunc_KL_{}{}", i, step), to_f32_scalar(&kl)?));
            }
        }

        let last = history
            .last()
            .ok_or_else(|| anyhow::anyhow!("inference produced no state"))?;

        ret.extend(range_channels("h", &last.h_hat.mean(0)?)?);
        for (i, g) in last.g_hat.iter().enumerate() {
            ret.extend(range_channels(&format!("g[{}]", i), &g.mean(0)?)?);
        }

        ret.push((
            "var_param_grad_norm".to_string(),
            self.var_param_grad_norm(visible, hierarchy, v, last, labels)?,
        ));

        if monitor_ranges {
            let batch_range = |x: &Tensor| -> candle_core::Result<Tensor> { x.max(0)? - x.min(0)? };
            let hs = (&last.h_hat * &last.s_hat)?;
            ret.extend(range_channels("hs_range", &batch_range(&hs)?)?);
            ret.extend(range_channels("h_range", &batch_range(&last.h_hat)?)?);
            for (i, g) in last.g_hat.iter().enumerate() {
                ret.extend(range_channels(&format!("g[{}]_range", i), &batch_range(g)?)?);
            }
        }

        let recons = simple_recons_error(visible, hierarchy, v, &last.g_hat[last.g_hat.len() - 1])?;
        ret.push(("simple_recons_error".to_string(), to_f32_scalar(&recons)?));

        Ok(ret)
    }

    /// Norm of the gradient of the mean KL with respect to `S_hat`,
    /// `H_hat` and every `G_hat`; zero at a fixed point
    fn var_param_grad_norm<V, H>(
        &self,
        visible: &V,
        hierarchy: &H,
        v: &Tensor,
        obs: &Observations,
        labels: &Labels,
    ) -> anyhow::Result<f32>
    where
        V: VisibleModel + ?Sized,
        H: HierarchyModel + ?Sized,
    {
        let s = Var::from_tensor(&obs.s_hat.detach())?;
        let h = Var::from_tensor(&obs.h_hat.detach())?;
        let g = obs
            .g_hat
            .iter()
            .map(|x| Var::from_tensor(&x.detach()))
            .collect::<candle_core::Result<Vec<_>>>()?;

        let tracked = Observations {
            h_hat: h.as_tensor().clone(),
            s_hat: s.as_tensor().clone(),
            g_hat: g.iter().map(|x| x.as_tensor().clone()).collect(),
            y_hat: obs.y_hat.as_ref().map(|y| y.detach()),
            var_s0_hat: obs.var_s0_hat.detach(),
            var_s1_hat: obs.var_s1_hat.detach(),
        };

        let kl = self
            .truncated_kl(visible, hierarchy, v, &tracked, labels)?
            .mean_all()?;
        let grads = kl.backward()?;

        let mut sq = 0_f32;
        for x in std::iter::once(&s).chain(std::iter::once(&h)).chain(g.iter()) {
            if let Some(dx) = grads.get(x.as_tensor()) {
                sq += to_f32_scalar(&dx.sqr()?.sum_all()?)?;
            }
        }
        Ok(sq.sqrt())
    }

    fn check_inputs<V, H>(
        &self,
        visible: &V,
        hierarchy: &H,
        v: &Tensor,
        labels: &Labels,
    ) -> anyhow::Result<()>
    where
        V: VisibleModel + ?Sized,
        H: HierarchyModel + ?Sized,
    {
        anyhow::ensure!(
            v.dtype() == visible.dtype(),
            "input batch is {:?} but the model computes in {:?}",
            v.dtype(),
            visible.dtype()
        );
        let (_, nvis) = v.dims2()?;
        anyhow::ensure!(
            nvis == visible.nvis(),
            "input batch has {} columns, the visible model has {}",
            nvis,
            visible.nvis()
        );
        anyhow::ensure!(
            hierarchy.num_layers() > 0,
            "the hierarchy has no hidden layers"
        );

        match labels {
            Labels::Unlabeled => {}
            Labels::Infer => {
                anyhow::ensure!(
                    hierarchy.num_classes() > 0,
                    "label inference requested but the hierarchy has no label layer"
                );
            }
            Labels::Clamped(y) => {
                anyhow::ensure!(
                    hierarchy.num_classes() > 0,
                    "labels given but the hierarchy has no label layer"
                );
                anyhow::ensure!(
                    y.dims() == [v.dim(0)?, hierarchy.num_classes()],
                    "labels have shape {:?}, expected ({}, {})",
                    y.dims(),
                    v.dim(0)?,
                    hierarchy.num_classes()
                );
                anyhow::ensure!(
                    y.dtype() == visible.dtype(),
                    "labels are {:?} but the model computes in {:?}",
                    y.dtype(),
                    visible.dtype()
                );
            }
        }
        Ok(())
    }

    fn check_probability(
        &self,
        name: &str,
        index: usize,
        step: &InferenceStep,
        x: &Tensor,
    ) -> anyhow::Result<()> {
        if !self.options.check_numerics {
            return Ok(());
        }
        let vals = to_f32_vec(x)?;
        if let Some(bad) = vals.iter().find(|&&p| !(0.0..=1.0).contains(&p)) {
            anyhow::bail!(
                "{} left [0, 1] (found {}) after schedule step {} ({}, family {})",
                name,
                bad,
                index,
                step,
                step.family()
            );
        }
        Ok(())
    }
}

fn check_finite(name: &str, x: &Tensor) -> anyhow::Result<()> {
    let vals = to_f32_vec(x)?;
    if let Some(i) = vals.iter().position(|p| p.is_nan()) {
        anyhow::bail!("{} is NaN at example {}", name, i);
    }
    Ok(())
}

/// Largest change of `final` against the last different value, by
/// tensor identity; zero when a variable was never updated
fn final_diff_of(values: &[&Tensor]) -> anyhow::Result<f32> {
    let Some((last, rest)) = values.split_last() else {
        return Ok(0.0);
    };
    match rest.iter().rev().find(|x| x.id() != last.id()) {
        Some(prev) => {
            let diff = (*last - *prev)?.abs()?.flatten_all()?.max(0)?;
            to_f32_scalar(&diff)
        }
        None => Ok(0.0),
    }
}

/// `final_diff_S_hat`, `final_diff_H_hat` and `final_diff_G_hat[i]`
pub fn final_diff(history: &[Observations]) -> anyhow::Result<Channels> {
    let mut ret = vec![];
    let s: Vec<&Tensor> = history.iter().map(|o| &o.s_hat).collect();
    ret.push(("final_diff_S_hat".to_string(), final_diff_of(&s)?));
    let h: Vec<&Tensor> = history.iter().map(|o| &o.h_hat).collect();
    ret.push(("final_diff_H_hat".to_string(), final_diff_of(&h)?));

    let nlayers = history.first().map(|o| o.g_hat.len()).unwrap_or(0);
    for i in 0..nlayers {
        let g: Vec<&Tensor> = history.iter().map(|o| &o.g_hat[i]).collect();
        ret.push((format!("final_diff_G_hat[{}]", i), final_diff_of(&g)?));
    }
    if nlayers == 0 {
        warn!("no hidden layers to report final differences for");
    }
    Ok(ret)
}
