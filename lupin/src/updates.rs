//! From gradients to new parameter values.
//!
//! New values are computed for every parameter first and written only
//! once all of them are known, so a failing step leaves the model as
//! it was.

use crate::param::{ParamKey, ParamMap, VarMap};
use crate::traits::{HierarchyModel, VisibleModel};
use log::debug;

/// Learning rates in effect for one step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepRates {
    /// base learning rate
    pub learning_rate: f64,
    /// annealed rate of the hierarchy parameters, when configured
    pub non_s3c_lr: Option<f64>,
    /// global multiplier
    pub shrink: f64,
    /// momentum coefficient, when configured
    pub momentum: Option<f64>,
}

impl StepRates {
    /// Rate of one parameter: the visible model scales its own, the
    /// shared bias takes the base rate and the rest take the annealed
    /// rate if there is one
    pub fn rate_of<V>(&self, key: ParamKey, visible: &V) -> f64
    where
        V: VisibleModel + ?Sized,
    {
        let base = match visible.learning_rate_scale(key) {
            Some(scale) => self.learning_rate * scale,
            None if key == ParamKey::HiddenBias => self.learning_rate,
            None => self.non_s3c_lr.unwrap_or(self.learning_rate),
        };
        base * self.shrink
    }
}

/// Proposed new values and, with momentum, the new increments
pub struct Updates {
    pub values: ParamMap,
    pub increments: Option<ParamMap>,
}

/// Gradient ascent, `param + rate * grad`, or with momentum
/// `inc = momentum * inc + rate * grad; param + inc`
pub fn ascent_updates<V>(
    vars: &VarMap,
    grads: &ParamMap,
    rates: &StepRates,
    visible: &V,
    increments: Option<&ParamMap>,
) -> anyhow::Result<Updates>
where
    V: VisibleModel + ?Sized,
{
    let mut values = ParamMap::new();
    let mut new_inc = increments.map(|_| ParamMap::new());

    for (key, var) in vars {
        let grad = grads
            .get(key)
            .ok_or_else(|| anyhow::anyhow!("no gradient for {}", key))?;
        let rate = rates.rate_of(*key, visible);
        let step = (grad * rate)?;

        let step = match (increments, rates.momentum, new_inc.as_mut()) {
            (Some(inc), Some(m), Some(out)) => {
                let old = inc
                    .get(key)
                    .ok_or_else(|| anyhow::anyhow!("no momentum increment for {}", key))?;
                let next = ((old * m)? + step)?;
                out.insert(*key, next.clone());
                next
            }
            _ => step,
        };

        values.insert(*key, (var.as_tensor() + step)?);
    }

    Ok(Updates {
        values,
        increments: new_inc,
    })
}

/// Reject updates to frozen parameters, then let each submodel
/// rewrite its own
pub fn censor_updates<V, H>(
    updates: &mut ParamMap,
    visible: &V,
    hierarchy: &H,
    freeze_visible: bool,
    freeze_hierarchy: bool,
) -> anyhow::Result<()>
where
    V: VisibleModel + ?Sized,
    H: HierarchyModel + ?Sized,
{
    for key in updates.keys() {
        if *key == ParamKey::HiddenBias {
            continue;
        }
        if freeze_visible && key.is_visible() {
            anyhow::bail!("S3C parameters are frozen but an update targets {}", key);
        }
        if freeze_hierarchy && !key.is_visible() {
            anyhow::bail!("DBM parameters are frozen but an update targets {}", key);
        }
    }
    visible.censor_updates(updates)?;
    hierarchy.censor_updates(updates)?;
    Ok(())
}

/// Write every new value; shapes and dtypes are checked for all of
/// them before the first write
pub fn commit(vars: &VarMap, values: &ParamMap) -> anyhow::Result<()> {
    for (key, x) in values {
        let var = vars
            .get(key)
            .ok_or_else(|| anyhow::anyhow!("update of {} has no parameter", key))?;
        anyhow::ensure!(
            var.dims() == x.dims() && var.dtype() == x.dtype(),
            "update of {} is {:?} {:?}, parameter is {:?} {:?}",
            key,
            x.dims(),
            x.dtype(),
            var.dims(),
            var.dtype()
        );
    }
    for (key, x) in values {
        if let Some(var) = vars.get(key) {
            var.set(x)?;
        }
    }
    debug!("committed {} parameter updates", values.len());
    Ok(())
}
