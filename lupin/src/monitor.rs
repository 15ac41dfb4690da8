//! Scalar summaries reported as monitoring channels.

use crate::traits::Channels;
use candle_core::{DType, Tensor};

/// Read a tensor as a flat `f32` vector
pub fn to_f32_vec(x: &Tensor) -> anyhow::Result<Vec<f32>> {
    Ok(x.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?)
}

/// Read a scalar tensor as `f32`
pub fn to_f32_scalar(x: &Tensor) -> anyhow::Result<f32> {
    Ok(x.to_dtype(DType::F32)?.to_scalar::<f32>()?)
}

/// `(min, mean, max)` over every element; NaN when empty
pub fn min_mean_max(x: &Tensor) -> anyhow::Result<(f32, f32, f32)> {
    if x.elem_count() == 0 {
        return Ok((f32::NAN, f32::NAN, f32::NAN));
    }
    let flat = x.flatten_all()?;
    Ok((
        to_f32_scalar(&flat.min(0)?)?,
        to_f32_scalar(&flat.mean_all()?)?,
        to_f32_scalar(&flat.max(0)?)?,
    ))
}

/// `{name}_min`, `{name}_mean` and `{name}_max` channels
pub fn range_channels(name: &str, x: &Tensor) -> anyhow::Result<Channels> {
    let (min, mean, max) = min_mean_max(x)?;
    Ok(vec![
        (format!("{}_min", name), min),
        (format!("{}_mean", name), mean),
        (format!("{}_max", name), max),
    ])
}

/// Log channels one per line at info level
pub fn log_channels(header: &str, channels: &Channels) {
    log::info!("{}:", header);
    for (name, value) in channels {
        log::info!("\t{}: {}", name, value);
    }
}
