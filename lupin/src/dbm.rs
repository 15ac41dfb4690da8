//! Deep Boltzmann machine (DBM), the hierarchy over the spikes `h`.
//!
//! Layers are `h` (the DBM's visible layer), hidden layers `g[0..L)` and
//! an optional softmax label layer `y` on top:
//!
//! ```text
//! E(h, g, y) = - h'b_v - sum_l g_l'b_l - sum_l below_l' W_l g_l
//!              - y'c - g_top' W_c y
//! ```
//!
//! where `below_0 = h` and `below_l = g[l-1]`.

use crate::monitor::range_channels;
use crate::param::{collect_grads, ParamKey, ParamMap, VarMap};
use crate::traits::{Channels, HierarchyModel};
use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::ops::{sigmoid, softmax};
use log::{debug, info};
use matrix_util::traits::SampleOps;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{weighted::WeightedIndex, Distribution};
use serde::{Deserialize, Serialize};

const PROB_EPS: f64 = 1e-7;

/// Options for the DBM hierarchy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbmOptions {
    /// Width of `h`; must match the S3C `nhid`. Default: 0 (must be set)
    pub nvis: usize,
    /// Widths of `g[0..L)`, bottom first. Default: [] (must be set)
    pub layer_sizes: Vec<usize>,
    /// Size of the label layer, 0 for none. Default: 0
    pub num_classes: usize,
    /// Weights are drawn from `U(-irange, irange)`. Default: 0.05
    pub irange: f64,
    /// Initial bias of `h`. Default: 0.0
    pub init_bias_vis: f64,
    /// Initial bias of every `g[l]`. Default: 0.0
    pub init_bias_hid: f64,
    /// Initial label bias. Default: 0.0
    pub init_bias_class: f64,
    /// Number of persistent negative chains. Default: 100
    pub negative_chains: usize,
    /// Contrastive divergence instead of persistent chains. Default: false
    pub use_cd: bool,
    /// Gibbs sweeps per contrastive divergence estimate. Default: 1
    pub cd_steps: usize,
    /// Random seed of weights and chains. Default: 42
    pub seed: u64,
}

impl Default for DbmOptions {
    fn default() -> Self {
        DbmOptions {
            nvis: 0,
            layer_sizes: vec![],
            num_classes: 0,
            irange: 0.05,
            init_bias_vis: 0.0,
            init_bias_hid: 0.0,
            init_bias_class: 0.0,
            negative_chains: 100,
            use_cd: false,
            cd_steps: 1,
            seed: 42,
        }
    }
}

impl DbmOptions {
    pub fn new(nvis: usize, layer_sizes: &[usize]) -> Self {
        DbmOptions {
            nvis,
            layer_sizes: layer_sizes.to_vec(),
            ..Default::default()
        }
    }

    pub fn with_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = num_classes;
        self
    }
}

/// Samples of every layer of the negative chains, one row per chain
#[derive(Debug, Clone)]
pub struct ChainState {
    pub h: Tensor,
    pub g: Vec<Tensor>,
    pub y: Option<Tensor>,
}

impl ChainState {
    pub fn num_chains(&self) -> candle_core::Result<usize> {
        self.h.dim(0)
    }

    fn to_dtype(&self, dtype: DType) -> candle_core::Result<Self> {
        Ok(ChainState {
            h: self.h.to_dtype(dtype)?,
            g: self
                .g
                .iter()
                .map(|x| x.to_dtype(dtype))
                .collect::<candle_core::Result<Vec<_>>>()?,
            y: self.y.as_ref().map(|y| y.to_dtype(dtype)).transpose()?,
        })
    }
}

/// Deep Boltzmann machine with Gibbs negative chains
pub struct Dbm {
    options: DbmOptions,
    bias_vis: Var,
    weights: Vec<Var>,
    biases: Vec<Var>,
    class_weight: Option<Var>,
    class_bias: Option<Var>,
    chains: ChainState,
    rng: SmallRng,
    dtype: DType,
    device: Device,
}

impl Dbm {
    pub fn new(options: DbmOptions, dtype: DType) -> anyhow::Result<Self> {
        anyhow::ensure!(options.nvis > 0, "DBM needs a positive nvis");
        anyhow::ensure!(
            !options.layer_sizes.is_empty(),
            "DBM needs at least one hidden layer"
        );
        anyhow::ensure!(
            options.layer_sizes.iter().all(|&n| n > 0),
            "DBM layer sizes must be positive, got {:?}",
            options.layer_sizes
        );
        anyhow::ensure!(
            options.negative_chains > 0,
            "DBM needs at least one negative chain"
        );

        let device = Device::Cpu;
        let r = options.irange as f32;
        let fill = |n: usize, value: f64| -> anyhow::Result<Var> {
            let x = (Tensor::ones(n, dtype, &device)? * value)?;
            Ok(Var::from_tensor(&x)?)
        };

        let mut weights = vec![];
        let mut biases = vec![];
        let mut below = options.nvis;
        for (l, &size) in options.layer_sizes.iter().enumerate() {
            let seed = options.seed.wrapping_add(l as u64 + 1);
            let w = Tensor::runif_range(below, size, (-r, r), seed)?.to_dtype(dtype)?;
            weights.push(Var::from_tensor(&w)?);
            biases.push(fill(size, options.init_bias_hid)?);
            below = size;
        }

        let (class_weight, class_bias) = if options.num_classes > 0 {
            let seed = options.seed.wrapping_add(weights.len() as u64 + 1);
            let w = Tensor::runif_range(below, options.num_classes, (-r, r), seed)?
                .to_dtype(dtype)?;
            (
                Some(Var::from_tensor(&w)?),
                Some(fill(options.num_classes, options.init_bias_class)?),
            )
        } else {
            (None, None)
        };

        let bias_vis = fill(options.nvis, options.init_bias_vis)?;

        // placeholder until the chains are drawn below
        let chains = ChainState {
            h: Tensor::zeros((0, options.nvis), dtype, &device)?,
            g: vec![],
            y: None,
        };

        info!(
            "DBM: nvis={}, layers={:?}, classes={}, chains={}",
            options.nvis, options.layer_sizes, options.num_classes, options.negative_chains
        );

        let mut ret = Dbm {
            rng: SmallRng::seed_from_u64(options.seed),
            options,
            bias_vis,
            weights,
            biases,
            class_weight,
            class_bias,
            chains,
            dtype,
            device,
        };
        ret.regenerate_chains()?;
        Ok(ret)
    }

    pub fn options(&self) -> &DbmOptions {
        &self.options
    }

    pub fn class_weight(&self) -> Option<&Tensor> {
        self.class_weight.as_ref().map(|w| w.as_tensor())
    }

    /// Per-example energy at (possibly fractional) states, `(n,)`
    pub fn energy(
        &self,
        v: &Tensor,
        g: &[Tensor],
        y: Option<&Tensor>,
        with_v_bias: bool,
    ) -> anyhow::Result<Tensor> {
        anyhow::ensure!(
            g.len() == self.weights.len(),
            "DBM has {} hidden layers but {} were given",
            self.weights.len(),
            g.len()
        );

        let n = v.dim(0)?;
        let mut e = Tensor::zeros(n, v.dtype(), v.device())?;
        if with_v_bias {
            e = (e - v.broadcast_mul(&self.bias_vis)?.sum(1)?)?;
        }

        for (l, g_l) in g.iter().enumerate() {
            let below = if l == 0 { v } else { &g[l - 1] };
            e = (e - g_l.broadcast_mul(&self.biases[l])?.sum(1)?)?;
            e = (e - (below.matmul(&self.weights[l])? * g_l)?.sum(1)?)?;
        }

        if let Some(y) = y {
            let (w_c, c) = self.class_layer()?;
            let top = &g[g.len() - 1];
            e = (e - y.broadcast_mul(c)?.sum(1)?)?;
            e = (e - (top.matmul(w_c)? * y)?.sum(1)?)?;
        }
        Ok(e)
    }

    fn class_layer(&self) -> anyhow::Result<(&Tensor, &Tensor)> {
        match (&self.class_weight, &self.class_bias) {
            (Some(w), Some(c)) => Ok((w.as_tensor(), c.as_tensor())),
            _ => anyhow::bail!("the DBM has no label layer"),
        }
    }

    fn bernoulli(&mut self, p: &Tensor) -> anyhow::Result<Tensor> {
        let (n, k) = p.dims2()?;
        let u = Tensor::runif(n, k, self.rng.random())?.to_dtype(p.dtype())?;
        Ok(u.lt(p)?.to_dtype(p.dtype())?)
    }

    /// One-hot rows drawn from the categorical distributions in `p`;
    /// a row with no positive finite weight is an error
    fn categorical(&mut self, p: &Tensor) -> anyhow::Result<Tensor> {
        let (n, k) = p.dims2()?;
        let probs = p.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        let mut onehot = vec![0_f32; n * k];
        for (i, row) in probs.iter().enumerate() {
            let disc = WeightedIndex::new(row)
                .map_err(|e| anyhow::anyhow!("label probabilities of row {}: {}", i, e))?;
            onehot[i * k + disc.sample(&mut self.rng)] = 1.0;
        }
        Ok(Tensor::from_vec(onehot, (n, k), &self.device)?.to_dtype(p.dtype())?)
    }

    /// Block Gibbs sweep: `h | g[0]`, then every `g[l]` bottom-up, then `y`
    fn gibbs_sweep(&mut self, state: &ChainState) -> anyhow::Result<ChainState> {
        let w0 = self.weights[0].as_tensor().clone();
        let p_h = sigmoid(&state.g[0].matmul(&w0.t()?)?.broadcast_add(&self.bias_vis)?)?;
        let h = self.bernoulli(&p_h)?;

        let nlayers = self.weights.len();
        let mut g = state.g.clone();
        for l in 0..nlayers {
            let p = {
                let below = if l == 0 { &h } else { &g[l - 1] };
                let above = if l + 1 < nlayers {
                    Some(&g[l + 1])
                } else {
                    state.y.as_ref()
                };
                self.infer_g_hat(l, below, above)?
            };
            g[l] = self.bernoulli(&p)?;
        }

        let y = match &state.y {
            Some(_) => {
                let p = self.infer_y_hat(&g[nlayers - 1])?;
                Some(self.categorical(&p)?)
            }
            None => None,
        };

        Ok(ChainState { h, g, y })
    }

    /// Gradient of the mean energy over chain states
    fn energy_grads(&self, state: &ChainState) -> anyhow::Result<ParamMap> {
        let g: Vec<Tensor> = state.g.iter().map(|x| x.detach()).collect();
        let y = state.y.as_ref().map(|y| y.detach());
        let energy = self
            .energy(&state.h.detach(), &g, y.as_ref(), true)?
            .mean_all()?;
        let store = energy.backward()?;
        let (grads, disconnected) = collect_grads(&store, &self.vars())?;
        if !disconnected.is_empty() {
            debug!("negative phase does not reach {:?}", disconnected);
        }
        Ok(grads)
    }
}

impl HierarchyModel for Dbm {
    fn nvis(&self) -> usize {
        self.options.nvis
    }

    fn num_layers(&self) -> usize {
        self.weights.len()
    }

    fn num_classes(&self) -> usize {
        self.options.num_classes
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn visible_bias(&self) -> &Var {
        &self.bias_vis
    }

    fn set_visible_bias(&mut self, bias: Var) {
        self.bias_vis = bias;
    }

    fn vars(&self) -> VarMap {
        let mut ret = VarMap::new();
        ret.insert(ParamKey::HiddenBias, self.bias_vis.clone());
        for (l, (w, b)) in self.weights.iter().zip(self.biases.iter()).enumerate() {
            ret.insert(ParamKey::Weight(l), w.clone());
            ret.insert(ParamKey::LayerBias(l), b.clone());
        }
        if let Some(w) = &self.class_weight {
            ret.insert(ParamKey::ClassWeight, w.clone());
        }
        if let Some(c) = &self.class_bias {
            ret.insert(ParamKey::ClassBias, c.clone());
        }
        ret
    }

    fn weight(&self, layer: usize) -> &Tensor {
        self.weights[layer].as_tensor()
    }

    fn layer_bias(&self, layer: usize) -> &Tensor {
        self.biases[layer].as_tensor()
    }

    fn init_g_hat(&self, h_hat: &Tensor) -> anyhow::Result<Vec<Tensor>> {
        let mut ret: Vec<Tensor> = Vec::with_capacity(self.weights.len());
        for (l, (w, b)) in self.weights.iter().zip(self.biases.iter()).enumerate() {
            let below = if l == 0 { h_hat } else { &ret[l - 1] };
            let g = sigmoid(&below.matmul(w)?.broadcast_add(b)?)?;
            ret.push(g);
        }
        Ok(ret)
    }

    fn init_y_hat(&self, batch_size: usize) -> anyhow::Result<Tensor> {
        let (_, c) = self.class_layer()?;
        let p = softmax(&c.unsqueeze(0)?, D::Minus1)?;
        Ok(p.broadcast_as((batch_size, self.options.num_classes))?
            .contiguous()?)
    }

    fn infer_g_hat(
        &self,
        layer: usize,
        below: &Tensor,
        above: Option<&Tensor>,
    ) -> anyhow::Result<Tensor> {
        anyhow::ensure!(
            layer < self.weights.len(),
            "g layer {} out of range, the DBM has {} hidden layers",
            layer,
            self.weights.len()
        );

        let mut pre = below
            .matmul(&self.weights[layer])?
            .broadcast_add(&self.biases[layer])?;

        if let Some(above) = above {
            let w_above = if layer + 1 < self.weights.len() {
                self.weights[layer + 1].as_tensor()
            } else {
                self.class_layer()?.0
            };
            pre = (pre + above.matmul(&w_above.t()?)?)?;
        }
        Ok(sigmoid(&pre)?)
    }

    fn infer_y_hat(&self, g_top: &Tensor) -> anyhow::Result<Tensor> {
        let (w_c, c) = self.class_layer()?;
        let pre = g_top.matmul(w_c)?.broadcast_add(c)?;
        Ok(softmax(&pre, D::Minus1)?)
    }

    fn expected_energy(
        &self,
        v_hat: &Tensor,
        g_hat: &[Tensor],
        y_hat: Option<&Tensor>,
    ) -> anyhow::Result<Tensor> {
        Ok(self.energy(v_hat, g_hat, y_hat, true)?.mean_all()?)
    }

    fn truncated_kl(
        &self,
        v_hat: &Tensor,
        g_hat: &[Tensor],
        y_hat: Option<&Tensor>,
        y_entropy: bool,
        no_v_bias: bool,
    ) -> anyhow::Result<Tensor> {
        let mut kl = self.energy(v_hat, g_hat, y_hat, !no_v_bias)?;

        for g in g_hat {
            let on = g.clamp(PROB_EPS, 1.0)?;
            let off = g.affine(-1.0, 1.0)?.clamp(PROB_EPS, 1.0)?;
            // minus the Bernoulli entropy
            let neg_ent = ((g * on.log()?)? + (g.affine(-1.0, 1.0)? * off.log()?)?)?.sum(1)?;
            kl = (kl + neg_ent)?;
        }

        if let (true, Some(y)) = (y_entropy, y_hat) {
            let neg_ent = (y * y.clamp(PROB_EPS, 1.0)?.log()?)?.sum(1)?;
            kl = (kl + neg_ent)?;
        }
        Ok(kl)
    }

    fn uses_cd(&self) -> bool {
        self.options.use_cd
    }

    fn neg_phase_grads(&self) -> anyhow::Result<ParamMap> {
        self.energy_grads(&self.chains)
    }

    fn cd_neg_phase_grads(
        &mut self,
        v_hat: &Tensor,
        g_hat: &[Tensor],
        y: Option<&Tensor>,
    ) -> anyhow::Result<ParamMap> {
        anyhow::ensure!(
            g_hat.len() == self.weights.len(),
            "contrastive divergence needs {} hidden layers, got {}",
            self.weights.len(),
            g_hat.len()
        );
        let h = self.bernoulli(&v_hat.detach())?;
        let mut g = vec![];
        for x in g_hat {
            g.push(self.bernoulli(&x.detach())?);
        }
        let y = if self.options.num_classes > 0 {
            let p = match y {
                Some(y) => y.detach(),
                None => self.init_y_hat(v_hat.dim(0)?)?,
            };
            Some(self.categorical(&p)?)
        } else {
            anyhow::ensure!(y.is_none(), "labels given to a DBM without a label layer");
            None
        };

        let mut state = ChainState { h, g, y };
        for _ in 0..self.options.cd_steps {
            state = self.gibbs_sweep(&state)?;
        }
        self.energy_grads(&state)
    }

    fn sample_chains(&mut self) -> anyhow::Result<ChainState> {
        let state = self.chains.clone();
        self.gibbs_sweep(&state)
    }

    fn chains(&self) -> &ChainState {
        &self.chains
    }

    fn set_chains(&mut self, chains: ChainState) -> anyhow::Result<()> {
        anyhow::ensure!(
            chains.g.len() == self.weights.len(),
            "chain state has {} hidden layers, expected {}",
            chains.g.len(),
            self.weights.len()
        );
        anyhow::ensure!(
            chains.y.is_some() == (self.options.num_classes > 0),
            "chain label state does not match the label layer"
        );
        self.chains = chains;
        Ok(())
    }

    fn regenerate_chains(&mut self) -> anyhow::Result<()> {
        let m = self.options.negative_chains;
        let rows = |b: &Tensor| -> candle_core::Result<Tensor> {
            let p = sigmoid(&b.unsqueeze(0)?)?;
            p.broadcast_as((m, b.dim(0)?))?.contiguous()
        };

        let p_h = rows(self.bias_vis.as_tensor())?;
        let h = self.bernoulli(&p_h)?;

        let mut g = vec![];
        for l in 0..self.biases.len() {
            let p = rows(self.biases[l].as_tensor())?;
            g.push(self.bernoulli(&p)?);
        }

        let y = if self.options.num_classes > 0 {
            let p = self.init_y_hat(m)?;
            Some(self.categorical(&p)?)
        } else {
            None
        };

        self.chains = ChainState { h, g, y };
        Ok(())
    }

    fn censor_updates(&self, _updates: &mut ParamMap) -> anyhow::Result<()> {
        Ok(())
    }

    fn to_dtype(&mut self, dtype: DType) -> anyhow::Result<()> {
        let convert = |v: &Var| -> candle_core::Result<Var> { Var::from_tensor(&v.to_dtype(dtype)?) };
        self.bias_vis = convert(&self.bias_vis)?;
        for w in self.weights.iter_mut() {
            *w = convert(w)?;
        }
        for b in self.biases.iter_mut() {
            *b = convert(b)?;
        }
        self.class_weight = self.class_weight.as_ref().map(convert).transpose()?;
        self.class_bias = self.class_bias.as_ref().map(convert).transpose()?;
        self.chains = self.chains.to_dtype(dtype)?;
        self.dtype = dtype;
        Ok(())
    }

    fn monitoring_channels(&self) -> anyhow::Result<Channels> {
        let mut ret = vec![];
        for (l, (w, b)) in self.weights.iter().zip(self.biases.iter()).enumerate() {
            let norms = w.sqr()?.sum(0)?.sqrt()?;
            ret.extend(range_channels(&format!("dbm_W[{}]_norms", l), &norms)?);
            ret.extend(range_channels(&format!("dbm_bias_hid[{}]", l), b.as_tensor())?);
        }
        if let Some(c) = &self.class_bias {
            ret.extend(range_channels("dbm_bias_class", c.as_tensor())?);
        }
        Ok(ret)
    }
}
