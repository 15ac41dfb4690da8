use candle_core::{Result, Tensor};

/// Damped fixed-point update, `coeff * new + (1 - coeff) * old`
///
/// `coeff = 1` replaces outright and `coeff = 0` keeps `old`.
pub fn damp(old: &Tensor, new: &Tensor, coeff: f64) -> Result<Tensor> {
    (new * coeff)? + (old * (1.0 - coeff))?
}

/// Keep a coordinate-ascent step from reflecting through zero.
///
/// Where `old > 0` the new value may not fall below `-rho * old`;
/// where `old < 0` it may not rise above `-rho * old`. The other side
/// is only bounded by the largest magnitude in `new`, so same-signed
/// moves pass through unchanged.
pub fn reflection_clip(old: &Tensor, new: &Tensor, rho: f64) -> Result<Tensor> {
    let dtype = old.dtype();
    let ceiling = new.abs()?.flatten_all()?.max(0)?;

    let positives = old.gt(0.0)?.to_dtype(dtype)?;
    let negatives = old.lt(0.0)?.to_dtype(dtype)?;
    let non_positives = positives.affine(-1.0, 1.0)?;
    let non_negatives = negatives.affine(-1.0, 1.0)?;

    let low = ((&positives * old)? * (-rho))?.broadcast_sub(&non_positives.broadcast_mul(&ceiling)?)?;
    let high = non_negatives
        .broadcast_mul(&ceiling)?
        .sub(&((&negatives * old)? * rho)?)?;

    new.maximum(&low)?.minimum(&high)
}
