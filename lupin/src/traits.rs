use crate::dbm::ChainState;
use crate::inference::Observations;
use crate::param::{ParamKey, ParamMap, VarMap};
use crate::sufficient_stats::{StatName, SufficientStatistics};
use candle_core::{DType, Device, Tensor, Var};
use std::collections::BTreeSet;

/// Monitoring channels, name and value
pub type Channels = Vec<(String, f32)>;

/// The sparse-coding model of `p(v, s | h)` sitting under the hierarchy
pub trait VisibleModel {
    fn nvis(&self) -> usize;

    fn nhid(&self) -> usize;

    fn dtype(&self) -> DType;

    fn device(&self) -> &Device;

    /// Bias of `h`, the parameter shared with the hierarchy
    fn hidden_bias(&self) -> &Var;

    /// Replace the bias handle; only the composite container calls this
    fn set_hidden_bias(&mut self, bias: Var);

    /// Every learnable variable, the shared bias included
    fn vars(&self) -> VarMap;

    /// Dictionary matrix `W`, `(nvis, nhid)`
    fn dictionary(&self) -> &Tensor;

    /// Slab mean `mu`, `(nhid,)`
    fn slab_mean(&self) -> &Tensor;

    /// Overwrite the conditional precision of `v`
    fn set_precision(&self, precision: &Tensor) -> anyhow::Result<()>;

    /// Posterior variance of `s` when `h = 0`, `(nhid,)`
    fn var_s0_hat(&self) -> anyhow::Result<Tensor>;

    /// Posterior variance of `s` when `h = 1`, `(nhid,)`
    fn var_s1_hat(&self) -> anyhow::Result<Tensor>;

    fn init_h_hat(&self, v: &Tensor) -> anyhow::Result<Tensor>;

    fn init_s_hat(&self, v: &Tensor) -> anyhow::Result<Tensor>;

    /// Closed-form coordinate-ascent update of `S_hat`
    fn infer_s_hat(&self, v: &Tensor, h_hat: &Tensor, s_hat: &Tensor) -> anyhow::Result<Tensor>;

    /// Visible-conditioned pre-activation of `H_hat`
    fn infer_h_hat_presigmoid(
        &self,
        v: &Tensor,
        h_hat: &Tensor,
        s_hat: &Tensor,
    ) -> anyhow::Result<Tensor>;

    /// Per-example KL contribution, `(n,)`
    fn truncated_kl(&self, v: &Tensor, obs: &Observations) -> anyhow::Result<Tensor>;

    /// Statistics needed by the two expected log-likelihood terms
    fn needed_stats(&self) -> BTreeSet<StatName>;

    fn expected_log_prob_v_given_hs(&self, stats: &SufficientStatistics) -> anyhow::Result<Tensor>;

    fn expected_log_prob_s_given_h(&self, stats: &SufficientStatistics) -> anyhow::Result<Tensor>;

    /// Penalties the submodel puts on its own parameters, if any
    fn regularizer(&self) -> anyhow::Result<Option<Tensor>>;

    /// Learning-rate multiplier for the submodel's own parameters
    fn learning_rate_scale(&self, key: ParamKey) -> Option<f64>;

    /// Mean of `v` given `h` and `s`
    fn mean_visible(&self, h: &Tensor, s: &Tensor) -> anyhow::Result<Tensor>;

    /// Rewrite proposed updates of the submodel's own parameters
    fn censor_updates(&self, updates: &mut ParamMap) -> anyhow::Result<()>;

    /// Refuse options that make no sense under a hierarchy prior
    fn check_composite_support(&self) -> anyhow::Result<()>;

    /// Recompute derived quantities from the stored parameters
    fn make_pseudo_params(&mut self) -> anyhow::Result<()>;

    /// Convert every variable; the container re-aliases the bias after
    fn to_dtype(&mut self, dtype: DType) -> anyhow::Result<()>;

    fn monitoring_channels(&self) -> anyhow::Result<Channels>;
}

/// A deep Boltzmann machine over `h` and the layers `g[0..L)`
pub trait HierarchyModel {
    /// Width of `h`
    fn nvis(&self) -> usize;

    fn num_layers(&self) -> usize;

    /// Zero without a label layer
    fn num_classes(&self) -> usize;

    fn dtype(&self) -> DType;

    /// Bias of `h`, the parameter shared with the visible model
    fn visible_bias(&self) -> &Var;

    /// Replace the bias handle; only the composite container calls this
    fn set_visible_bias(&mut self, bias: Var);

    /// Every learnable variable, the shared bias included
    fn vars(&self) -> VarMap;

    /// `W[l]` between the layer below (or `h`) and `g[l]`
    fn weight(&self, layer: usize) -> &Tensor;

    fn layer_bias(&self, layer: usize) -> &Tensor;

    /// Prior initialization of every `G_hat[l]` given `H_hat`
    fn init_g_hat(&self, h_hat: &Tensor) -> anyhow::Result<Vec<Tensor>>;

    /// Label prior broadcast over the batch
    fn init_y_hat(&self, batch_size: usize) -> anyhow::Result<Tensor>;

    /// Block update of `g[layer]` from the layer below and, when
    /// given, the layer above (the labels above the top layer)
    fn infer_g_hat(
        &self,
        layer: usize,
        below: &Tensor,
        above: Option<&Tensor>,
    ) -> anyhow::Result<Tensor>;

    /// Label update from the top hidden layer
    fn infer_y_hat(&self, g_top: &Tensor) -> anyhow::Result<Tensor>;

    /// Batch mean of the energy at the mean-field state
    fn expected_energy(
        &self,
        v_hat: &Tensor,
        g_hat: &[Tensor],
        y_hat: Option<&Tensor>,
    ) -> anyhow::Result<Tensor>;

    /// Per-example KL contribution, `(n,)`
    ///
    /// * `y_entropy` - count the entropy of `y_hat` (inferred labels)
    /// * `no_v_bias` - drop the `h` bias term
    fn truncated_kl(
        &self,
        v_hat: &Tensor,
        g_hat: &[Tensor],
        y_hat: Option<&Tensor>,
        y_entropy: bool,
        no_v_bias: bool,
    ) -> anyhow::Result<Tensor>;

    /// Estimate the negative phase by contrastive divergence instead
    /// of persistent chains
    fn uses_cd(&self) -> bool;

    /// Gradient of `-log Z` from the persistent chains
    fn neg_phase_grads(&self) -> anyhow::Result<ParamMap>;

    /// Gradient of `-log Z` from chains started at the positive phase
    fn cd_neg_phase_grads(
        &mut self,
        v_hat: &Tensor,
        g_hat: &[Tensor],
        y: Option<&Tensor>,
    ) -> anyhow::Result<ParamMap>;

    /// One Gibbs sweep of the persistent chains, not yet committed
    fn sample_chains(&mut self) -> anyhow::Result<ChainState>;

    fn chains(&self) -> &ChainState;

    fn set_chains(&mut self, chains: ChainState) -> anyhow::Result<()>;

    fn regenerate_chains(&mut self) -> anyhow::Result<()>;

    fn censor_updates(&self, updates: &mut ParamMap) -> anyhow::Result<()>;

    /// Convert every variable and chain; the container re-aliases the bias after
    fn to_dtype(&mut self, dtype: DType) -> anyhow::Result<()>;

    fn monitoring_channels(&self) -> anyhow::Result<Channels>;
}
