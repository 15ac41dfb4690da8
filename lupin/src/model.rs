//! The composite model: an S3C visible model under a DBM prior.
//!
//! The bias of the spikes `h` is one parameter seen by both submodels.
//! The container picks whose bias survives, hands the same `Var` to the
//! other one and routes every write through a single update map so
//! the bias is stepped once per learning step.

use crate::annealing::{LinearAnneal, Shrink};
use crate::grad_stats::GradientStatistics;
use crate::inference::{InferenceOptions, InferenceProcedure, Labels, Observations};
use crate::monitor::{log_channels, range_channels, to_f32_vec};
use crate::objective::{learning_objective, PenaltyOptions};
use crate::param::{collect_grads, merge_add, zeros_like, ParamKey, ParamMap, VarMap};
use crate::traits::{Channels, HierarchyModel, VisibleModel};
use crate::updates::{ascent_updates, censor_updates, commit, StepRates};
use candle_core::{DType, Tensor};
use log::{info, warn};
use matrix_util::traits::SampleOps;
use serde::{Deserialize, Serialize};

/// Which submodel's bias of `h` is kept when the two are tied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BiasSource {
    #[default]
    Hierarchy,
    Visible,
}

/// Sparse spike-and-slab draw of the first DBM weight matrix:
/// each entry is nonzero with probability `h`, and then `N(mu, scale^2)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpikeSlabInit {
    pub h: f64,
    pub mu: f64,
    pub scale: f64,
}

/// Options of the composite model
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PddbmOptions {
    /// Base learning rate. Default: 1e-3
    pub learning_rate: f64,
    /// Whose bias of `h` is kept. Default: hierarchy
    pub h_bias_src: BiasSource,
    /// Keep every S3C parameter fixed. Default: false
    pub freeze_s3c_params: bool,
    /// Keep every DBM parameter fixed. Default: false
    pub freeze_dbm_params: bool,
    /// Inference schedule and checks
    pub inference: InferenceOptions,
    /// Penalties on the bound
    pub penalties: PenaltyOptions,
    /// Separate annealed rate of the DBM parameters. Default: None
    pub non_s3c_lr: Option<LinearAnneal>,
    /// Annealed momentum coefficient. Default: None
    pub momentum: Option<LinearAnneal>,
    /// Decay of every learning rate. Default: None
    pub shrink: Option<Shrink>,
    /// Rescale DBM layer gradients by their running variance. Default: false
    pub use_diagonal_natural_gradient: bool,
    /// Accumulate the positive phase one example at a time. Default: false
    pub sub_batch: bool,
    /// Set `B` from the variance of the first minibatch. Default: false
    pub bayes_precision: bool,
    /// Sparse initialization of `W[0]`. Default: None
    pub ss_init: Option<SpikeSlabInit>,
    /// Report batch ranges of the variational parameters. Default: false
    pub monitor_ranges: bool,
    /// Report the mean visible marginal of the negative chains. Default: false
    pub monitor_neg_chain_marginals: bool,
    /// Log a status report every this many examples, 0 for never. Default: 10000
    pub print_interval: usize,
    /// Random seed of `ss_init`. Default: 42
    pub seed: u64,
}

impl Default for PddbmOptions {
    fn default() -> Self {
        PddbmOptions {
            learning_rate: 1e-3,
            h_bias_src: BiasSource::Hierarchy,
            freeze_s3c_params: false,
            freeze_dbm_params: false,
            inference: InferenceOptions::default(),
            penalties: PenaltyOptions::default(),
            non_s3c_lr: None,
            momentum: None,
            shrink: None,
            use_diagonal_natural_gradient: false,
            sub_batch: false,
            bayes_precision: false,
            ss_init: None,
            monitor_ranges: false,
            monitor_neg_chain_marginals: false,
            print_interval: 10000,
            seed: 42,
        }
    }
}

struct SubBatch {
    negative: ParamMap,
    positive: ParamMap,
    count: usize,
}

/// Partially directed deep Boltzmann machine
pub struct Pddbm<V, H> {
    options: PddbmOptions,
    visible: V,
    hierarchy: H,
    inference: InferenceProcedure,
    examples_seen: usize,
    increments: Option<ParamMap>,
    grad_stats: Option<GradientStatistics>,
    sub_batch: Option<SubBatch>,
    precision_pending: bool,
    dtype: DType,
}

impl<V, H> Pddbm<V, H>
where
    V: VisibleModel,
    H: HierarchyModel,
{
    pub fn new(visible: V, hierarchy: H, options: PddbmOptions) -> anyhow::Result<Self> {
        anyhow::ensure!(
            visible.nhid() == hierarchy.nvis(),
            "the shared bias needs S3C nhid ({}) to equal DBM nvis ({})",
            visible.nhid(),
            hierarchy.nvis()
        );
        anyhow::ensure!(
            visible.dtype() == hierarchy.dtype(),
            "S3C is {:?} but the DBM is {:?}",
            visible.dtype(),
            hierarchy.dtype()
        );
        visible.check_composite_support()?;

        let nlayers = hierarchy.num_layers();
        options.penalties.check(nlayers)?;
        if let Some(a) = &options.non_s3c_lr {
            a.check("non_s3c_lr")?;
        }
        if let Some(a) = &options.momentum {
            a.check("momentum")?;
        }
        if let Some(s) = &options.shrink {
            anyhow::ensure!(s.scale >= 0.0, "shrink scale must be non-negative");
        }

        if options.use_diagonal_natural_gradient {
            anyhow::ensure!(
                options.momentum.is_none(),
                "the diagonal natural gradient cannot be combined with momentum"
            );
        }

        if options.sub_batch {
            anyhow::ensure!(
                !options.penalties.has_batch_penalties(),
                "sub-batch mode does not support g/h penalties or DBM weight decay"
            );
            anyhow::ensure!(
                !hierarchy.uses_cd(),
                "sub-batch mode does not support contrastive divergence"
            );
            anyhow::ensure!(
                !options.use_diagonal_natural_gradient,
                "sub-batch mode does not support the diagonal natural gradient"
            );
        }

        let inference = InferenceProcedure::new(options.inference.clone(), nlayers)?;
        let dtype = visible.dtype();

        let mut ret = Pddbm {
            precision_pending: options.bayes_precision,
            options,
            visible,
            hierarchy,
            inference,
            examples_seen: 0,
            increments: None,
            grad_stats: None,
            sub_batch: None,
            dtype,
        };

        if let Some(init) = ret.options.ss_init {
            ret.spike_slab_init(&init)?;
        }
        ret.alias_bias()?;
        if ret.options.momentum.is_some() {
            ret.increments = Some(zeros_like(&ret.params())?);
        }

        info!(
            "PD-DBM: nvis={}, nhid={}, layers={}, schedule=[{}]",
            ret.visible.nvis(),
            ret.visible.nhid(),
            nlayers,
            ret.inference
                .schedule()
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(ret)
    }

    pub fn options(&self) -> &PddbmOptions {
        &self.options
    }

    pub fn visible(&self) -> &V {
        &self.visible
    }

    pub fn hierarchy(&self) -> &H {
        &self.hierarchy
    }

    pub fn inference(&self) -> &InferenceProcedure {
        &self.inference
    }

    pub fn examples_seen(&self) -> usize {
        self.examples_seen
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    fn spike_slab_init(&mut self, init: &SpikeSlabInit) -> anyhow::Result<()> {
        let vars = self.hierarchy.vars();
        let w0 = vars
            .get(&ParamKey::Weight(0))
            .ok_or_else(|| anyhow::anyhow!("the DBM has no first weight matrix"))?;
        let (rows, cols) = w0.dims2()?;

        let on = Tensor::runif(rows, cols, self.options.seed)?
            .lt(init.h)?
            .to_dtype(self.dtype)?;
        let slab = ((Tensor::rnorm(rows, cols, self.options.seed.wrapping_add(1))? * init.scale)?
            + init.mu)?
            .to_dtype(self.dtype)?;
        w0.set(&(on * slab)?)?;
        Ok(())
    }

    /// Tie the bias of `h` and check both submodels now hold the same one
    fn alias_bias(&mut self) -> anyhow::Result<()> {
        match self.options.h_bias_src {
            BiasSource::Hierarchy => {
                let b = self.hierarchy.visible_bias().clone();
                self.visible.set_hidden_bias(b);
            }
            BiasSource::Visible => {
                let b = self.visible.hidden_bias().clone();
                self.hierarchy.set_visible_bias(b);
            }
        }
        self.check_alias()
    }

    fn check_alias(&self) -> anyhow::Result<()> {
        let a = self.visible.hidden_bias();
        let b = self.hierarchy.visible_bias();
        anyhow::ensure!(
            a.id() == b.id(),
            "S3C bias_hid and DBM visible bias are no longer the same parameter"
        );
        Ok(())
    }

    /// Every learnable variable of both submodels honoring the freeze
    /// flags; the shared bias appears once
    pub fn params(&self) -> VarMap {
        let mut ret = VarMap::new();
        if !self.options.freeze_s3c_params {
            ret.extend(self.visible.vars());
        }
        if !self.options.freeze_dbm_params {
            for (key, var) in self.hierarchy.vars() {
                ret.entry(key).or_insert(var);
            }
        }
        ret
    }

    /// Convert every parameter, chain and learning state, then tie the
    /// bias again
    pub fn set_dtype(&mut self, dtype: DType) -> anyhow::Result<()> {
        self.visible.to_dtype(dtype)?;
        self.hierarchy.to_dtype(dtype)?;
        self.dtype = dtype;
        self.alias_bias()?;

        if let Some(inc) = self.increments.take() {
            let mut converted = ParamMap::new();
            for (key, x) in inc {
                converted.insert(key, x.to_dtype(dtype)?);
            }
            self.increments = Some(converted);
        }
        self.grad_stats = None;
        self.sub_batch = None;
        Ok(())
    }

    /// Call on parameters that were built or loaded outside the
    /// container before using them
    pub fn make_pseudo_params(&mut self) -> anyhow::Result<()> {
        self.visible.make_pseudo_params()?;
        self.alias_bias()
    }

    /// The S3C dictionary, `(nvis, nhid)`
    pub fn visible_weights(&self) -> Tensor {
        self.visible.dictionary().clone()
    }

    /// Dictionary columns scaled by `mu`, projected through `W[0]`,
    /// `(nvis, |g[0]|)`
    pub fn projected_weights(&self) -> anyhow::Result<Tensor> {
        let scaled = self
            .visible
            .dictionary()
            .broadcast_mul(self.visible.slab_mean())?;
        Ok(scaled.matmul(self.hierarchy.weight(0))?)
    }

    pub fn infer(&self, v: &Tensor, labels: &Labels) -> anyhow::Result<Observations> {
        self.inference.infer(&self.visible, &self.hierarchy, v, labels)
    }

    pub fn truncated_kl(&self, v: &Tensor, obs: &Observations, labels: &Labels) -> anyhow::Result<Tensor> {
        self.inference
            .truncated_kl(&self.visible, &self.hierarchy, v, obs, labels)
    }

    fn step_rates(&self) -> StepRates {
        let seen = self.examples_seen;
        StepRates {
            learning_rate: self.options.learning_rate,
            non_s3c_lr: self.options.non_s3c_lr.map(|a| a.value(seen)),
            shrink: self.options.shrink.map(|s| s.value(seen)).unwrap_or(1.0),
            momentum: self.options.momentum.map(|a| a.value(seen)),
        }
    }

    /// One learning step on a minibatch `(n, nvis)`
    pub fn learn_mini_batch(&mut self, v: &Tensor, labels: &Labels) -> anyhow::Result<()> {
        anyhow::ensure!(
            v.dtype() == self.dtype,
            "minibatch is {:?} but the model computes in {:?}",
            v.dtype(),
            self.dtype
        );
        let nn = v.dim(0)?;

        if self.precision_pending {
            let centred = v.broadcast_sub(&v.mean(0)?)?;
            let var = centred.sqr()?.mean(0)?;
            self.visible.set_precision(&(var + 0.01)?.recip()?)?;
            self.precision_pending = false;
            info!("set the S3C precision from the first minibatch");
        }

        if self.options.sub_batch {
            anyhow::ensure!(
                matches!(labels, Labels::Unlabeled),
                "sub-batch mode does not support labels"
            );
            self.reset_gradients()?;
            for i in 0..nn {
                self.accumulate_positive_phase(&v.narrow(0, i, 1)?)?;
            }
            self.commit_gradient_step()?;
        } else {
            self.full_batch_step(v, labels)?;
        }

        let before = self.examples_seen;
        self.examples_seen += nn;

        let every = self.options.print_interval;
        if every > 0 && before / every != self.examples_seen / every {
            self.print_status()?;
        }
        Ok(())
    }

    fn exact_grads(&self, v: &Tensor, obs: &Observations, vars: &VarMap) -> anyhow::Result<ParamMap> {
        let objective = learning_objective(
            &self.options.penalties,
            &self.inference,
            &self.visible,
            &self.hierarchy,
            v,
            obs,
        )?;
        let store = objective.backward()?;
        let (grads, disconnected) = collect_grads(&store, vars)?;
        if !disconnected.is_empty() && self.inference.options().check_numerics {
            let names: Vec<String> = disconnected.iter().map(|k| k.to_string()).collect();
            warn!("objective does not depend on {}; using zero gradients", names.join(", "));
        }
        Ok(grads)
    }

    /// The negative-phase gradients restricted to what is being learned
    fn restrict(&self, mut grads: ParamMap, vars: &VarMap) -> ParamMap {
        if self.options.freeze_dbm_params {
            grads.retain(|k, _| vars.contains_key(k));
        }
        grads
    }

    fn full_batch_step(&mut self, v: &Tensor, labels: &Labels) -> anyhow::Result<()> {
        let vars = self.params();
        if vars.is_empty() {
            warn!("every parameter is frozen; nothing to learn");
            return Ok(());
        }

        let grad_stats = if self.options.use_diagonal_natural_gradient {
            anyhow::ensure!(
                matches!(labels, Labels::Unlabeled),
                "the diagonal natural gradient does not support labels"
            );
            let mut stats = GradientStatistics::new(&vars)?;
            for i in 0..v.dim(0)? {
                let x = v.narrow(0, i, 1)?;
                let obs = self.infer(&x, labels)?;
                stats.update(&self.exact_grads(&x, &obs, &vars)?)?;
            }
            Some(stats)
        } else {
            None
        };

        let obs = self.infer(v, labels)?;
        let mut grads = self.exact_grads(v, &obs, &vars)?;

        let (negative, chains) = if self.hierarchy.uses_cd() {
            let y = labels.clamped().cloned().or_else(|| obs.y_hat.clone());
            let neg = self
                .hierarchy
                .cd_neg_phase_grads(&obs.h_hat, &obs.g_hat, y.as_ref())?;
            (neg, None)
        } else {
            let neg = self.hierarchy.neg_phase_grads()?;
            (neg, Some(self.hierarchy.sample_chains()?))
        };
        merge_add(&mut grads, &self.restrict(negative, &vars))?;

        if let Some(stats) = &grad_stats {
            grads = stats.natural_gradient(&grads)?;
        }

        self.apply_gradients(&vars, &grads)?;
        if let Some(chains) = chains {
            self.hierarchy.set_chains(chains)?;
        }
        if grad_stats.is_some() {
            self.grad_stats = grad_stats;
        }
        Ok(())
    }

    fn apply_gradients(&mut self, vars: &VarMap, grads: &ParamMap) -> anyhow::Result<()> {
        let rates = self.step_rates();
        let increments = match rates.momentum {
            Some(_) => self.increments.as_ref(),
            None => None,
        };
        let mut updates = ascent_updates(vars, grads, &rates, &self.visible, increments)?;
        censor_updates(
            &mut updates.values,
            &self.visible,
            &self.hierarchy,
            self.options.freeze_s3c_params,
            self.options.freeze_dbm_params,
        )?;
        commit(vars, &updates.values)?;

        if let (Some(new_inc), Some(inc)) = (updates.increments, self.increments.as_mut()) {
            inc.extend(new_inc);
        }
        Ok(())
    }

    /// Sub-batch mode, first phase: start the accumulator at the
    /// negative phase and advance the chains
    pub fn reset_gradients(&mut self) -> anyhow::Result<()> {
        let vars = self.params();
        let negative = self.restrict(self.hierarchy.neg_phase_grads()?, &vars);

        let mut acc = zeros_like(&vars)?;
        merge_add(&mut acc, &negative)?;
        let positive = zeros_like(&vars)?;

        let chains = self.hierarchy.sample_chains()?;
        self.hierarchy.set_chains(chains)?;

        self.sub_batch = Some(SubBatch {
            negative: acc,
            positive,
            count: 0,
        });
        Ok(())
    }

    /// Sub-batch mode, second phase: add the positive phase of one
    /// example `(1, nvis)`
    pub fn accumulate_positive_phase(&mut self, x: &Tensor) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.sub_batch.is_some(),
            "reset_gradients must run before accumulating"
        );
        let vars = self.params();
        let obs = self.infer(x, &Labels::Unlabeled)?;
        let grads = self.exact_grads(x, &obs, &vars)?;

        if let Some(acc) = self.sub_batch.as_mut() {
            merge_add(&mut acc.positive, &grads)?;
            acc.count += 1;
        }
        Ok(())
    }

    /// Sub-batch mode, last phase: step with the negative phase plus
    /// the average positive phase
    pub fn commit_gradient_step(&mut self) -> anyhow::Result<()> {
        let vars = self.params();
        let grads = {
            let acc = self
                .sub_batch
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("no accumulated gradients to commit"))?;
            anyhow::ensure!(acc.count > 0, "no example was accumulated");

            let mut grads = acc.negative.clone();
            let mut positive = ParamMap::new();
            for (key, g) in &acc.positive {
                positive.insert(*key, (g / acc.count as f64)?);
            }
            merge_add(&mut grads, &positive)?;
            grads
        };

        self.apply_gradients(&vars, &grads)?;
        self.sub_batch = None;
        Ok(())
    }

    pub fn print_status(&self) -> anyhow::Result<()> {
        info!("examples seen: {}", self.examples_seen);
        log_channels("S3C", &self.visible.monitoring_channels()?);
        log_channels("DBM", &self.hierarchy.monitoring_channels()?);
        Ok(())
    }

    /// Every monitoring channel for one batch
    pub fn monitoring_channels(&self, v: &Tensor, labels: &Labels) -> anyhow::Result<Channels> {
        let mut ret = self.visible.monitoring_channels()?;
        ret.extend(self.hierarchy.monitoring_channels()?);

        let w0 = to_f32_vec(self.hierarchy.weight(0))?;
        let negprop = w0.iter().filter(|&&x| x < 0.0).count() as f32 / w0.len().max(1) as f32;
        ret.push(("dbm_W[0]_negprop".to_string(), negprop));

        let rates = self.step_rates();
        ret.push(("shrink".to_string(), rates.shrink as f32));

        let chains = self.hierarchy.chains();
        ret.extend(range_channels("neg_chain_h", &chains.h.mean(0)?)?);
        for (i, g) in chains.g.iter().enumerate() {
            ret.extend(range_channels(&format!("neg_chain_g[{}]", i), &g.mean(0)?)?);
        }
        if let Some(y) = &chains.y {
            ret.extend(range_channels("neg_chain_y", &y.mean(0)?)?);
        }

        if self.options.monitor_neg_chain_marginals {
            let nchains = chains.h.dim(0)?;
            let mu = self
                .visible
                .slab_mean()
                .unsqueeze(0)?
                .broadcast_as((nchains, self.visible.nhid()))?
                .contiguous()?;
            let marginal = self.visible.mean_visible(&chains.h, &mu)?;
            ret.extend(range_channels("marginal_V_mean", &marginal.mean(0)?)?);
        }

        ret.extend(self.inference.monitoring_channels(
            &self.visible,
            &self.hierarchy,
            v,
            labels,
            self.options.monitor_ranges,
        )?);

        if let Some(stats) = &self.grad_stats {
            ret.extend(stats.monitoring_channels()?);
        }
        if let Some(m) = rates.momentum {
            ret.push(("momentum".to_string(), m as f32));
        }
        if let Some(lr) = rates.non_s3c_lr {
            ret.push(("non_s3c_lr".to_string(), lr as f32));
        }
        Ok(ret)
    }
}
