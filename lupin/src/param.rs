use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use std::collections::BTreeMap;

/// Identity of a learnable parameter of the composite model
///
/// `HiddenBias` is the bias of the spike variables `h`; it is the one
/// parameter shared by both submodels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParamKey {
    /// S3C dictionary `W`, `(nvis, nhid)`
    Dictionary,
    /// S3C conditional precision of `v`, `B`
    Precision,
    /// S3C slab precision `alpha`
    SlabPrecision,
    /// S3C slab mean `mu`
    SlabMean,
    /// bias of `h`, shared
    HiddenBias,
    /// DBM weights between layer `l - 1` (or `h`) and `g[l]`
    Weight(usize),
    /// DBM bias of `g[l]`
    LayerBias(usize),
    /// DBM weights between the top layer and the labels
    ClassWeight,
    /// DBM label bias
    ClassBias,
}

impl ParamKey {
    /// Keys owned by the visible (S3C) submodel, including the shared bias
    pub fn is_visible(&self) -> bool {
        matches!(
            self,
            ParamKey::Dictionary
                | ParamKey::Precision
                | ParamKey::SlabPrecision
                | ParamKey::SlabMean
                | ParamKey::HiddenBias
        )
    }

    /// DBM weight and layer-bias keys; these receive the diagonal
    /// natural-gradient rescaling
    pub fn is_hierarchy_layer(&self) -> bool {
        matches!(self, ParamKey::Weight(_) | ParamKey::LayerBias(_))
    }
}

impl std::fmt::Display for ParamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamKey::Dictionary => write!(f, "W"),
            ParamKey::Precision => write!(f, "B"),
            ParamKey::SlabPrecision => write!(f, "alpha"),
            ParamKey::SlabMean => write!(f, "mu"),
            ParamKey::HiddenBias => write!(f, "bias_hid"),
            ParamKey::Weight(l) => write!(f, "W[{}]", l),
            ParamKey::LayerBias(l) => write!(f, "bias_hid[{}]", l),
            ParamKey::ClassWeight => write!(f, "W_class"),
            ParamKey::ClassBias => write!(f, "bias_class"),
        }
    }
}

/// Gradients, updates and accumulators keyed by parameter
pub type ParamMap = BTreeMap<ParamKey, Tensor>;

/// Learnable variables keyed by parameter
pub type VarMap = BTreeMap<ParamKey, Var>;

/// Add `other` into `acc` key-wise; keys missing in `acc` are an error
pub fn merge_add(acc: &mut ParamMap, other: &ParamMap) -> anyhow::Result<()> {
    for (key, grad) in other {
        let Some(current) = acc.get_mut(key) else {
            anyhow::bail!(
                "approximate gradient for {} has no exact-gradient counterpart",
                key
            );
        };
        *current = (&*current + grad)?;
    }
    Ok(())
}

/// Read the gradient of every variable in `vars` off a backward pass.
///
/// Variables the objective does not touch get zeros; their keys are
/// returned alongside so the caller can report them.
pub fn collect_grads(
    store: &GradStore,
    vars: &VarMap,
) -> anyhow::Result<(ParamMap, Vec<ParamKey>)> {
    let mut grads = ParamMap::new();
    let mut disconnected = vec![];
    for (key, var) in vars {
        match store.get(var.as_tensor()) {
            Some(g) => {
                grads.insert(*key, g.detach());
            }
            None => {
                grads.insert(*key, var.as_tensor().zeros_like()?);
                disconnected.push(*key);
            }
        }
    }
    Ok((grads, disconnected))
}

/// Zeros shaped like every variable in `vars`
pub fn zeros_like(vars: &VarMap) -> anyhow::Result<ParamMap> {
    let mut ret = ParamMap::new();
    for (key, var) in vars {
        ret.insert(*key, var.as_tensor().zeros_like()?);
    }
    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn merge_requires_exact_counterpart() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let mut acc = ParamMap::new();
        acc.insert(ParamKey::Weight(0), Tensor::new(&[1.0_f32, 2.0], &dev)?);

        let mut approx = ParamMap::new();
        approx.insert(ParamKey::Weight(0), Tensor::new(&[0.5_f32, 0.5], &dev)?);
        merge_add(&mut acc, &approx)?;
        assert_eq!(acc[&ParamKey::Weight(0)].to_vec1::<f32>()?, vec![1.5, 2.5]);

        approx.insert(ParamKey::ClassBias, Tensor::new(&[0.5_f32], &dev)?);
        assert!(merge_add(&mut acc, &approx).is_err());
        Ok(())
    }

    #[test]
    fn key_names() {
        assert_eq!(ParamKey::Weight(1).to_string(), "W[1]");
        assert!(ParamKey::HiddenBias.is_visible());
        assert!(!ParamKey::HiddenBias.is_hierarchy_layer());
        assert!(ParamKey::LayerBias(0).is_hierarchy_layer());
    }
}
