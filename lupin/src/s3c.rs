//! Spike-and-slab sparse coding (S3C), the visible submodel.
//!
//! * `h_i ~ Bernoulli(sigmoid(b_i))`
//! * `s_i | h_i ~ N(h_i mu_i, 1 / alpha_i)`
//! * `v | h, s ~ N(W (h * s), diag(1 / B))`
//!
//! The posterior factorizes as `Q(h_i) Q(s_i | h_i)` with
//! `Q(s_i | h_i = 1) = N(S_hat_i, var_s1_i)` and
//! `Q(s_i | h_i = 0) = N(0, var_s0_i)`.

use crate::inference::Observations;
use crate::monitor::range_channels;
use crate::param::{ParamKey, ParamMap, VarMap};
use crate::sufficient_stats::{StatName, SufficientStatistics};
use crate::traits::{Channels, VisibleModel};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::ops::sigmoid;
use log::info;
use matrix_util::traits::SampleOps;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

const LN_2PI: f64 = 1.837_877_066_409_345_5;
const PROB_EPS: f64 = 1e-7;

/// Options for the spike-and-slab model
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3cOptions {
    /// Number of visible units. Default: 0 (must be set)
    pub nvis: usize,
    /// Number of spike/slab pairs. Default: 0 (must be set)
    pub nhid: usize,
    /// `W` is drawn from `U(-irange, irange)`. Default: 0.1
    pub irange: f64,
    /// Initial bias of `h`. Default: 0.0
    pub init_bias_hid: f64,
    /// Initial slab mean. Default: 1.0
    pub init_mu: f64,
    /// Initial slab precision. Default: 1.0
    pub init_alpha: f64,
    /// Initial conditional precision of `v`. Default: 1.0
    pub init_precision: f64,
    /// Lower bound of `B` enforced after every update. Default: 1e-6
    pub min_precision: f64,
    /// Upper bound of `B`. Default: 1e6
    pub max_precision: f64,
    /// Lower bound of `alpha`. Default: 1e-3
    pub min_alpha: f64,
    /// Upper bound of `alpha`. Default: 1e6
    pub max_alpha: f64,
    /// Rescale every column of `W` to unit norm after each update. Default: false
    pub constrain_w_norm: bool,
    /// Learning-rate multiplier of `W`. Default: 1.0
    pub w_learning_rate_scale: f64,
    /// Learning-rate multiplier of `B`. Default: 1.0
    pub precision_learning_rate_scale: f64,
    /// Learning-rate multiplier of `alpha`. Default: 1.0
    pub alpha_learning_rate_scale: f64,
    /// Learning-rate multiplier of `mu`. Default: 1.0
    pub mu_learning_rate_scale: f64,
    /// Penalty on `mean(B)`. Default: 0.0
    pub precision_penalty: f64,
    /// Penalty on `mean(alpha)`. Default: 0.0
    pub alpha_penalty: f64,
    /// Penalty on the spike prior; unsupported under a hierarchy. Default: 0.0
    pub p_penalty: f64,
    /// Random seed of the dictionary. Default: 42
    pub seed: u64,
}

impl Default for S3cOptions {
    fn default() -> Self {
        S3cOptions {
            nvis: 0,
            nhid: 0,
            irange: 0.1,
            init_bias_hid: 0.0,
            init_mu: 1.0,
            init_alpha: 1.0,
            init_precision: 1.0,
            min_precision: 1e-6,
            max_precision: 1e6,
            min_alpha: 1e-3,
            max_alpha: 1e6,
            constrain_w_norm: false,
            w_learning_rate_scale: 1.0,
            precision_learning_rate_scale: 1.0,
            alpha_learning_rate_scale: 1.0,
            mu_learning_rate_scale: 1.0,
            precision_penalty: 0.0,
            alpha_penalty: 0.0,
            p_penalty: 0.0,
            seed: 42,
        }
    }
}

impl S3cOptions {
    pub fn new(nvis: usize, nhid: usize) -> Self {
        S3cOptions {
            nvis,
            nhid,
            ..Default::default()
        }
    }
}

/// Spike-and-slab sparse coding model
pub struct S3c {
    options: S3cOptions,
    w: Var,
    precision: Var,
    alpha: Var,
    mu: Var,
    bias_hid: Var,
    dtype: DType,
    device: Device,
}

impl S3c {
    pub fn new(options: S3cOptions, dtype: DType) -> anyhow::Result<Self> {
        let (nvis, nhid) = (options.nvis, options.nhid);
        anyhow::ensure!(
            nvis > 0 && nhid > 0,
            "S3C needs positive nvis and nhid, got {} and {}",
            nvis,
            nhid
        );
        anyhow::ensure!(
            options.min_precision <= options.max_precision && options.min_alpha <= options.max_alpha,
            "S3C bounds are inverted"
        );

        let device = Device::Cpu;
        let r = options.irange as f32;
        let w = Tensor::runif_range(nvis, nhid, (-r, r), options.seed)?.to_dtype(dtype)?;

        let fill = |n: usize, value: f64| -> anyhow::Result<Var> {
            let x = (Tensor::ones(n, dtype, &device)? * value)?;
            Ok(Var::from_tensor(&x)?)
        };

        info!("S3C: nvis={}, nhid={}, dtype={:?}", nvis, nhid, dtype);

        Ok(S3c {
            w: Var::from_tensor(&w)?,
            precision: fill(nvis, options.init_precision)?,
            alpha: fill(nhid, options.init_alpha)?,
            mu: fill(nhid, options.init_mu)?,
            bias_hid: fill(nhid, options.init_bias_hid)?,
            options,
            dtype,
            device,
        })
    }

    pub fn options(&self) -> &S3cOptions {
        &self.options
    }

    pub fn precision(&self) -> &Tensor {
        self.precision.as_tensor()
    }

    pub fn alpha(&self) -> &Tensor {
        self.alpha.as_tensor()
    }

    /// `W` with every row scaled by `B`
    fn bw(&self) -> candle_core::Result<Tensor> {
        self.w.broadcast_mul(&self.precision.unsqueeze(1)?)
    }

    /// `diag(W' diag(B) W)`
    pub fn w_diag(&self) -> candle_core::Result<Tensor> {
        self.w
            .sqr()?
            .broadcast_mul(&self.precision.unsqueeze(1)?)?
            .sum(0)
    }

    fn broadcast_rows(&self, x: &Tensor, nrows: usize) -> candle_core::Result<Tensor> {
        let ncols = x.dim(0)?;
        x.unsqueeze(0)?.broadcast_as((nrows, ncols))?.contiguous()
    }
}

impl VisibleModel for S3c {
    fn nvis(&self) -> usize {
        self.options.nvis
    }

    fn nhid(&self) -> usize {
        self.options.nhid
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn hidden_bias(&self) -> &Var {
        &self.bias_hid
    }

    fn set_hidden_bias(&mut self, bias: Var) {
        self.bias_hid = bias;
    }

    fn vars(&self) -> VarMap {
        VarMap::from([
            (ParamKey::Dictionary, self.w.clone()),
            (ParamKey::Precision, self.precision.clone()),
            (ParamKey::SlabPrecision, self.alpha.clone()),
            (ParamKey::SlabMean, self.mu.clone()),
            (ParamKey::HiddenBias, self.bias_hid.clone()),
        ])
    }

    fn dictionary(&self) -> &Tensor {
        self.w.as_tensor()
    }

    fn slab_mean(&self) -> &Tensor {
        self.mu.as_tensor()
    }

    fn set_precision(&self, precision: &Tensor) -> anyhow::Result<()> {
        anyhow::ensure!(
            precision.dims() == self.precision.dims(),
            "precision shape {:?} does not match {:?}",
            precision.dims(),
            self.precision.dims()
        );
        let precision = precision
            .to_dtype(self.dtype)?
            .clamp(self.options.min_precision, self.options.max_precision)?;
        self.precision.set(&precision)?;
        Ok(())
    }

    fn var_s0_hat(&self) -> anyhow::Result<Tensor> {
        Ok(self.alpha.recip()?)
    }

    fn var_s1_hat(&self) -> anyhow::Result<Tensor> {
        Ok((self.alpha.as_tensor() + self.w_diag()?)?.recip()?)
    }

    fn init_h_hat(&self, v: &Tensor) -> anyhow::Result<Tensor> {
        let p = sigmoid(self.bias_hid.as_tensor())?;
        Ok(self.broadcast_rows(&p, v.dim(0)?)?)
    }

    fn init_s_hat(&self, v: &Tensor) -> anyhow::Result<Tensor> {
        Ok(self.broadcast_rows(self.mu.as_tensor(), v.dim(0)?)?)
    }

    fn infer_s_hat(&self, v: &Tensor, h_hat: &Tensor, s_hat: &Tensor) -> anyhow::Result<Tensor> {
        let bw = self.bw()?;
        let w = self.w_diag()?;
        let alpha = self.alpha.as_tensor();
        let hs = (h_hat * s_hat)?;

        let mean_term = (self.mu.as_tensor() * alpha)?;
        let data_term = v.matmul(&bw)?;
        let interaction = (hs.broadcast_mul(&w)? - hs.matmul(&self.w.t()?)?.matmul(&bw)?)?;

        let scaled = (data_term + interaction)?.broadcast_add(&mean_term)?;
        Ok(scaled.broadcast_div(&(alpha + w)?)?)
    }

    fn infer_h_hat_presigmoid(
        &self,
        v: &Tensor,
        h_hat: &Tensor,
        s_hat: &Tensor,
    ) -> anyhow::Result<Tensor> {
        let bw = self.bw()?;
        let w = self.w_diag()?;
        let alpha = self.alpha.as_tensor();
        let mu = self.mu.as_tensor();
        let hs = (h_hat * s_hat)?;
        let s_sq = s_hat.sqr()?;

        // data and interaction with the other units
        let residual = (v - hs.matmul(&self.w.t()?)?)?;
        let term_1 = ((residual.matmul(&bw)? * s_hat)?
            + h_hat.mul(&s_sq)?.broadcast_mul(&w)?
            - (s_sq.broadcast_mul(&w)? * 0.5)?)?;

        // slab prior
        let term_2 = ((s_sq.broadcast_mul(alpha)? * -0.5)?
            + s_hat.broadcast_mul(&(alpha * mu)?)?)?
        .broadcast_sub(&((alpha * mu.sqr()?)? * 0.5)?)?;

        // spike prior and the change in slab variance
        let term_3 = ((self.bias_hid.as_tensor() - ((alpha + &w)?.log()? * 0.5)?)?
            + (alpha.log()? * 0.5)?)?;

        Ok((term_1 + term_2)?.broadcast_add(&term_3)?)
    }

    fn truncated_kl(&self, v: &Tensor, obs: &Observations) -> anyhow::Result<Tensor> {
        let h = &obs.h_hat;
        let s = &obs.s_hat;
        let var_s0 = &obs.var_s0_hat;
        let var_s1 = &obs.var_s1_hat;

        let bw = self.bw()?;
        let w = self.w_diag()?;
        let precision = self.precision.as_tensor();
        let alpha = self.alpha.as_tensor();
        let mu = self.mu.as_tensor();

        let h_off = h.affine(-1.0, 1.0)?;
        let hs = (h * s)?;
        let s_sq = s.sqr()?;

        // negative entropy of Q(h, s), dropping constants
        let h_c = h.clamp(PROB_EPS, 1.0)?;
        let h_off_c = h_off.clamp(PROB_EPS, 1.0)?;
        let neg_entropy = ((h * h_c.log()?)? + (&h_off * h_off_c.log()?)?)?
            .sub(&(h.broadcast_mul(&var_s1.log()?)? * 0.5)?)?
            .sub(&(h_off.broadcast_mul(&var_s0.log()?)? * 0.5)?)?
            .sum(1)?;

        // E[log p(v | h, s)]
        let recons = hs.matmul(&self.w.t()?)?;
        let gram = self.w.t()?.matmul(&bw)?;
        let e_sq_hs = h.mul(&s_sq.broadcast_add(var_s1)?)?;
        let quad = ((hs.matmul(&gram)? * &hs)?.sum(1)?
            + (e_sq_hs - hs.sqr()?)?.broadcast_mul(&w)?.sum(1)?)?;
        let ell_v = ((v.broadcast_mul(precision)? * &recons)?.sum(1)?
            - (v.sqr()?.broadcast_mul(precision)?.sum(1)? * 0.5)?)?
        .sub(&(quad * 0.5)?)?;

        // E[log p(s | h)]
        let e_sq_s = (h.mul(&s_sq.broadcast_add(var_s1)?)? + h_off.broadcast_mul(var_s0)?)?;
        let e_dev = ((e_sq_s - (hs.broadcast_mul(mu)? * 2.0)?)? + h.broadcast_mul(&mu.sqr()?)?)?;
        let ell_s = (e_dev.broadcast_mul(alpha)?.sum(1)? * -0.5)?;

        // E[log p(h)] up to the log-partition of the spikes
        let ell_h = h.broadcast_mul(self.bias_hid.as_tensor())?.sum(1)?;

        Ok((((neg_entropy - ell_v)? - ell_s)? - ell_h)?)
    }

    fn needed_stats(&self) -> BTreeSet<StatName> {
        BTreeSet::from([
            StatName::MeanSqV,
            StatName::MeanHsv,
            StatName::SecondHs,
            StatName::MeanSqS,
            StatName::MeanHs,
            StatName::MeanH,
        ])
    }

    fn expected_log_prob_v_given_hs(&self, stats: &SufficientStatistics) -> anyhow::Result<Tensor> {
        let mean_sq_v = stats.get(StatName::MeanSqV)?;
        let mean_hsv = stats.get(StatName::MeanHsv)?;
        let second_hs = stats.get(StatName::SecondHs)?;

        let precision = self.precision.as_tensor();
        let bw = self.bw()?;
        let gram = self.w.t()?.matmul(&bw)?;
        let nvis = self.options.nvis as f64;

        let log_det = (precision.log()?.sum_all()? * 0.5)?;
        let data = (precision.mul(mean_sq_v)?.sum_all()? * 0.5)?;
        let cross = bw.mul(&mean_hsv.t()?)?.sum_all()?;
        let interaction = (gram.mul(second_hs)?.sum_all()? * 0.5)?;

        Ok(((((log_det - data)? + cross)? - interaction)? - 0.5 * nvis * LN_2PI)?)
    }

    fn expected_log_prob_s_given_h(&self, stats: &SufficientStatistics) -> anyhow::Result<Tensor> {
        let mean_sq_s = stats.get(StatName::MeanSqS)?;
        let mean_hs = stats.get(StatName::MeanHs)?;
        let mean_h = stats.get(StatName::MeanH)?;

        let alpha = self.alpha.as_tensor();
        let mu = self.mu.as_tensor();
        let nhid = self.options.nhid as f64;

        let e_dev = ((mean_sq_s - (mu * mean_hs)? * 2.0)? + mu.sqr()?.mul(mean_h)?)?;
        let log_det = (alpha.log()?.sum_all()? * 0.5)?;
        let dev = (alpha.mul(&e_dev)?.sum_all()? * 0.5)?;

        Ok(((log_det - dev)? - 0.5 * nhid * LN_2PI)?)
    }

    fn regularizer(&self) -> anyhow::Result<Option<Tensor>> {
        let mut penalty: Option<Tensor> = None;
        let mut add = |x: Tensor| -> candle_core::Result<()> {
            penalty = Some(match penalty.take() {
                Some(p) => (p + x)?,
                None => x,
            });
            Ok(())
        };
        if self.options.precision_penalty != 0.0 {
            add((self.precision.mean_all()? * self.options.precision_penalty)?)?;
        }
        if self.options.alpha_penalty != 0.0 {
            add((self.alpha.mean_all()? * self.options.alpha_penalty)?)?;
        }
        Ok(penalty)
    }

    fn learning_rate_scale(&self, key: ParamKey) -> Option<f64> {
        match key {
            ParamKey::Dictionary => Some(self.options.w_learning_rate_scale),
            ParamKey::Precision => Some(self.options.precision_learning_rate_scale),
            ParamKey::SlabPrecision => Some(self.options.alpha_learning_rate_scale),
            ParamKey::SlabMean => Some(self.options.mu_learning_rate_scale),
            _ => None,
        }
    }

    fn mean_visible(&self, h: &Tensor, s: &Tensor) -> anyhow::Result<Tensor> {
        Ok((h * s)?.matmul(&self.w.t()?)?)
    }

    fn censor_updates(&self, updates: &mut ParamMap) -> anyhow::Result<()> {
        let opts = &self.options;
        if let Some(b) = updates.get_mut(&ParamKey::Precision) {
            *b = b.clamp(opts.min_precision, opts.max_precision)?;
        }
        if let Some(a) = updates.get_mut(&ParamKey::SlabPrecision) {
            *a = a.clamp(opts.min_alpha, opts.max_alpha)?;
        }
        if opts.constrain_w_norm {
            if let Some(w) = updates.get_mut(&ParamKey::Dictionary) {
                let norm = w.sqr()?.sum_keepdim(0)?.sqrt()?.clamp(PROB_EPS, f64::INFINITY)?;
                *w = w.broadcast_div(&norm)?;
            }
        }
        Ok(())
    }

    fn check_composite_support(&self) -> anyhow::Result<()> {
        if self.options.p_penalty != 0.0 {
            anyhow::bail!(
                "S3C p_penalty must be 0 (got {}); the spike prior is not tractable under a hierarchy",
                self.options.p_penalty
            );
        }
        Ok(())
    }

    fn make_pseudo_params(&mut self) -> anyhow::Result<()> {
        let (nvis, nhid) = (self.options.nvis, self.options.nhid);
        anyhow::ensure!(
            self.w.dims() == [nvis, nhid],
            "S3C W has shape {:?}, expected ({}, {})",
            self.w.dims(),
            nvis,
            nhid
        );
        for (name, var, len) in [
            ("B", &self.precision, nvis),
            ("alpha", &self.alpha, nhid),
            ("mu", &self.mu, nhid),
            ("bias_hid", &self.bias_hid, nhid),
        ] {
            anyhow::ensure!(
                var.dims() == [len],
                "S3C {} has shape {:?}, expected ({},)",
                name,
                var.dims(),
                len
            );
            anyhow::ensure!(
                var.dtype() == self.dtype,
                "S3C {} is {:?} but the model is {:?}",
                name,
                var.dtype(),
                self.dtype
            );
        }
        Ok(())
    }

    fn to_dtype(&mut self, dtype: DType) -> anyhow::Result<()> {
        let convert = |v: &Var| -> candle_core::Result<Var> { Var::from_tensor(&v.to_dtype(dtype)?) };
        self.w = convert(&self.w)?;
        self.precision = convert(&self.precision)?;
        self.alpha = convert(&self.alpha)?;
        self.mu = convert(&self.mu)?;
        self.bias_hid = convert(&self.bias_hid)?;
        self.dtype = dtype;
        Ok(())
    }

    fn monitoring_channels(&self) -> anyhow::Result<Channels> {
        let mut ret = vec![];
        let w_norms = self.w.sqr()?.sum(0)?.sqrt()?;
        ret.extend(range_channels("s3c_W_norms", &w_norms)?);
        ret.extend(range_channels("s3c_bias_hid", self.bias_hid.as_tensor())?);
        ret.extend(range_channels("s3c_alpha", self.alpha.as_tensor())?);
        ret.extend(range_channels("s3c_B", self.precision.as_tensor())?);
        ret.extend(range_channels("s3c_mu", self.mu.as_tensor())?);
        Ok(ret)
    }
}
