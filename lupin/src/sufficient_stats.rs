//! Batch-averaged sufficient statistics of the spike-and-slab posterior.
//!
//! Only the requested statistics (and whatever they depend on) are
//! computed, each at most once. Every value is detached, so gradients
//! never flow back into the inference procedure through them.

use crate::inference::Observations;
use candle_core::{Result, Tensor};
use std::collections::{BTreeMap, BTreeSet};

/// Names of the statistics the aggregator knows how to compute
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StatName {
    /// `E[h]`, shape `(nhid,)`
    MeanH,
    /// `E[v]`, shape `(nvis,)`
    MeanV,
    /// `E[v^2]`, shape `(nvis,)`
    MeanSqV,
    /// `E[h s]`, shape `(nhid,)`
    MeanHs,
    /// `E[s^2]` marginalizing over `h`, shape `(nhid,)`
    MeanSqS,
    /// `E[(h s)^2]`, shape `(nhid,)`
    MeanSqHs,
    /// `E[(h s) v']`, shape `(nhid, nvis)`
    MeanHsv,
    /// `E[(h s)(h s)']`, shape `(nhid, nhid)`
    SecondHs,
}

impl StatName {
    fn dependencies(&self) -> &'static [StatName] {
        match self {
            StatName::SecondHs => &[StatName::MeanSqHs],
            _ => &[],
        }
    }
}

impl std::fmt::Display for StatName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StatName::MeanH => "mean_h",
            StatName::MeanV => "mean_v",
            StatName::MeanSqV => "mean_sq_v",
            StatName::MeanHs => "mean_hs",
            StatName::MeanSqS => "mean_sq_s",
            StatName::MeanSqHs => "mean_sq_hs",
            StatName::MeanHsv => "mean_hsv",
            StatName::SecondHs => "second_hs",
        };
        write!(f, "{}", name)
    }
}

/// Sufficient statistics computed from one batch and one posterior
#[derive(Debug, Clone)]
pub struct SufficientStatistics {
    stats: BTreeMap<StatName, Tensor>,
}

impl SufficientStatistics {
    /// Compute `needed` statistics (and their dependencies)
    ///
    /// * `v` - data batch `(n, nvis)`
    /// * `obs` - posterior whose `h_hat`, `s_hat`, `var_s0_hat` and
    ///   `var_s1_hat` are used
    pub fn from_observations(
        needed: &BTreeSet<StatName>,
        v: &Tensor,
        obs: &Observations,
    ) -> Result<Self> {
        let mut builder = StatBuilder {
            v: v.detach(),
            h: obs.h_hat.detach(),
            s: obs.s_hat.detach(),
            var_s0: obs.var_s0_hat.detach(),
            var_s1: obs.var_s1_hat.detach(),
            hs: None,
            stats: BTreeMap::new(),
        };

        for name in needed {
            builder.compute(*name)?;
        }

        Ok(SufficientStatistics {
            stats: builder.stats,
        })
    }

    /// Look up one statistic; asking for one that was not requested
    /// is an error
    pub fn get(&self, name: StatName) -> Result<&Tensor> {
        self.stats
            .get(&name)
            .ok_or_else(|| candle_core::Error::Msg(format!("sufficient statistic {} was not computed", name)))
    }

    pub fn contains(&self, name: StatName) -> bool {
        self.stats.contains_key(&name)
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    /// Every computed value, e.g. to collect what should be held constant
    pub fn iter(&self) -> impl Iterator<Item = (&StatName, &Tensor)> {
        self.stats.iter()
    }
}

struct StatBuilder {
    v: Tensor,
    h: Tensor,
    s: Tensor,
    var_s0: Tensor,
    var_s1: Tensor,
    hs: Option<Tensor>,
    stats: BTreeMap<StatName, Tensor>,
}

impl StatBuilder {
    fn hs(&mut self) -> Result<Tensor> {
        if let Some(hs) = &self.hs {
            return Ok(hs.clone());
        }
        let hs = (&self.h * &self.s)?;
        self.hs = Some(hs.clone());
        Ok(hs)
    }

    fn compute(&mut self, name: StatName) -> Result<Tensor> {
        if let Some(x) = self.stats.get(&name) {
            return Ok(x.clone());
        }

        for dep in name.dependencies() {
            self.compute(*dep)?;
        }

        let nn = self.v.dim(0)? as f64;

        let value = match name {
            StatName::MeanH => self.h.mean(0)?,
            StatName::MeanV => self.v.mean(0)?,
            StatName::MeanSqV => self.v.sqr()?.mean(0)?,
            StatName::MeanHs => self.hs()?.mean(0)?,
            StatName::MeanSqS => {
                // h (s^2 + var_s1) + (1 - h) var_s0
                let on = self.h.mul(&self.s.sqr()?.broadcast_add(&self.var_s1)?)?;
                let off = self.h.affine(-1.0, 1.0)?.broadcast_mul(&self.var_s0)?;
                (on + off)?.mean(0)?
            }
            StatName::MeanSqHs => self
                .h
                .mul(&self.s.sqr()?.broadcast_add(&self.var_s1)?)?
                .mean(0)?,
            StatName::MeanHsv => (self.hs()?.t()?.matmul(&self.v)? / nn)?,
            StatName::SecondHs => {
                let hs = self.hs()?;
                let outer = (hs.t()?.matmul(&hs)? / nn)?;
                let nhid = outer.dim(0)?;
                let eye = Tensor::eye(nhid, outer.dtype(), outer.device())?;
                let off_diag = outer.mul(&eye.affine(-1.0, 1.0)?)?;
                let mean_sq_hs = self.stats[&StatName::MeanSqHs].clone();
                (off_diag + eye.broadcast_mul(&mean_sq_hs)?)?
            }
        };

        let value = value.detach();
        self.stats.insert(name, value.clone());
        Ok(value)
    }
}
