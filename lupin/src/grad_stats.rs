//! Running per-parameter gradient variance (Welford) for the diagonal
//! natural gradient.

use crate::monitor::range_channels;
use crate::param::{ParamKey, ParamMap, VarMap};
use crate::traits::Channels;
use candle_core::Tensor;

/// Added to the variance before dividing a gradient by it
pub const NATURAL_GRADIENT_OFFSET: f64 = 0.5;

/// Welford accumulator over gradient maps, one example at a time
pub struct GradientStatistics {
    count: usize,
    mean: ParamMap,
    m2: ParamMap,
}

impl GradientStatistics {
    pub fn new(vars: &VarMap) -> anyhow::Result<Self> {
        let mut mean = ParamMap::new();
        let mut m2 = ParamMap::new();
        for (key, var) in vars {
            mean.insert(*key, var.as_tensor().zeros_like()?);
            m2.insert(*key, var.as_tensor().zeros_like()?);
        }
        Ok(GradientStatistics { count: 0, mean, m2 })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Forget every gradient seen so far
    pub fn reset(&mut self) -> anyhow::Result<()> {
        for x in self.mean.values_mut().chain(self.m2.values_mut()) {
            *x = x.zeros_like()?;
        }
        self.count = 0;
        Ok(())
    }

    /// Fold in the gradient of one example; keys that are not tracked
    /// are ignored
    pub fn update(&mut self, grads: &ParamMap) -> anyhow::Result<()> {
        self.count += 1;
        let n = self.count as f64;
        for (key, mean) in self.mean.iter_mut() {
            let Some(x) = grads.get(key) else {
                anyhow::bail!("no gradient for {} to add to its running variance", key);
            };
            let delta = (x - &*mean)?;
            let new_mean = (&*mean + (&delta / n)?)?;
            let m2 = self
                .m2
                .get_mut(key)
                .ok_or_else(|| anyhow::anyhow!("no running variance for {}", key))?;
            *m2 = (&*m2 + (&delta * (x - &new_mean)?)?)?;
            *mean = new_mean;
        }
        Ok(())
    }

    pub fn mean(&self) -> &ParamMap {
        &self.mean
    }

    /// Unbiased variance, `m2 / (n - 1)`; zeros before two examples
    pub fn variance(&self) -> anyhow::Result<ParamMap> {
        let mut ret = ParamMap::new();
        for (key, m2) in &self.m2 {
            let var = if self.count < 2 {
                m2.zeros_like()?
            } else {
                (m2 / (self.count as f64 - 1.0))?
            };
            ret.insert(*key, var);
        }
        Ok(ret)
    }

    /// Divide the gradients of the DBM weights and layer biases by
    /// `variance + 0.5`; every other gradient passes through
    pub fn natural_gradient(&self, grads: &ParamMap) -> anyhow::Result<ParamMap> {
        let variance = self.variance()?;
        let mut ret = ParamMap::new();
        for (key, g) in grads {
            let scaled = match (key.is_hierarchy_layer(), variance.get(key)) {
                (true, Some(var)) => scale_by_variance(g, var)?,
                _ => g.clone(),
            };
            ret.insert(*key, scaled);
        }
        Ok(ret)
    }

    /// `grad_var_<param>_{min,mean,max}`
    pub fn monitoring_channels(&self) -> anyhow::Result<Channels> {
        let mut ret = vec![];
        for (key, var) in self.variance()? {
            ret.extend(range_channels(&format!("grad_var_{}", key), &var)?);
        }
        Ok(ret)
    }

    pub fn tracked(&self) -> impl Iterator<Item = &ParamKey> {
        self.mean.keys()
    }
}

fn scale_by_variance(grad: &Tensor, var: &Tensor) -> candle_core::Result<Tensor> {
    grad / (var + NATURAL_GRADIENT_OFFSET)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::{Device, Var};

    fn single_var() -> anyhow::Result<(VarMap, Device)> {
        let dev = Device::Cpu;
        let var = Var::from_tensor(&Tensor::zeros(2, candle_core::DType::F64, &dev)?)?;
        Ok((VarMap::from([(ParamKey::Weight(0), var)]), dev))
    }

    #[test]
    fn constant_stream_has_zero_variance() -> anyhow::Result<()> {
        let (vars, dev) = single_var()?;
        let mut stats = GradientStatistics::new(&vars)?;
        let g = ParamMap::from([(ParamKey::Weight(0), Tensor::new(&[0.3_f64, -2.0], &dev)?)]);
        for _ in 0..5 {
            stats.update(&g)?;
        }
        let var = stats.variance()?[&ParamKey::Weight(0)].to_vec1::<f64>()?;
        assert_eq!(var, vec![0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn alternating_stream_matches_sample_variance() -> anyhow::Result<()> {
        let (vars, dev) = single_var()?;
        let mut stats = GradientStatistics::new(&vars)?;
        let a = ParamMap::from([(ParamKey::Weight(0), Tensor::new(&[1.0_f64, 0.0], &dev)?)]);
        let b = ParamMap::from([(ParamKey::Weight(0), Tensor::new(&[3.0_f64, 0.0], &dev)?)]);
        let n = 1000;
        for i in 0..n {
            stats.update(if i % 2 == 0 { &a } else { &b })?;
        }
        // n / (n - 1) of the population variance 1
        let var = stats.variance()?[&ParamKey::Weight(0)].to_vec1::<f64>()?;
        assert_abs_diff_eq!(var[0], n as f64 / (n as f64 - 1.0), epsilon = 1e-9);
        assert_abs_diff_eq!(var[1], 0.0);
        Ok(())
    }

    #[test]
    fn natural_gradient_only_touches_layers() -> anyhow::Result<()> {
        let (vars, dev) = single_var()?;
        let stats = GradientStatistics::new(&vars)?;
        let grads = ParamMap::from([
            (ParamKey::Weight(0), Tensor::new(&[1.0_f64, -1.0], &dev)?),
            (ParamKey::Dictionary, Tensor::new(&[1.0_f64, -1.0], &dev)?),
        ]);
        let scaled = stats.natural_gradient(&grads)?;
        // variance is zero before two examples, so the divisor is 0.5
        assert_eq!(scaled[&ParamKey::Weight(0)].to_vec1::<f64>()?, vec![2.0, -2.0]);
        assert_eq!(scaled[&ParamKey::Dictionary].to_vec1::<f64>()?, vec![1.0, -1.0]);
        Ok(())
    }
}
