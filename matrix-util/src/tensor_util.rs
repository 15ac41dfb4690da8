use crate::traits::*;
use candle_core::{Device, Tensor};
use ndarray::Array2;

impl SampleOps for Tensor {
    type Mat = Self;
    type Scalar = f32;

    fn runif(nrow: usize, ncol: usize, seed: u64) -> anyhow::Result<Self::Mat> {
        let data = Array2::<f32>::runif(nrow, ncol, seed)?;
        data.to_tensor(&Device::Cpu)
    }

    fn rnorm(nrow: usize, ncol: usize, seed: u64) -> anyhow::Result<Self::Mat> {
        let data = Array2::<f32>::rnorm(nrow, ncol, seed)?;
        data.to_tensor(&Device::Cpu)
    }

    fn runif_range(
        nrow: usize,
        ncol: usize,
        range: (f32, f32),
        seed: u64,
    ) -> anyhow::Result<Self::Mat> {
        let data = Array2::<f32>::runif_range(nrow, ncol, range, seed)?;
        data.to_tensor(&Device::Cpu)
    }
}

impl ConvertMatOps for Array2<f32> {
    type Mat = Self;
    type Scalar = f32;

    fn from_tensor(tensor: &Tensor) -> anyhow::Result<Self::Mat> {
        let (nrow, ncol) = tensor.dims2()?;
        let data = tensor
            .to_dtype(candle_core::DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        Ok(Array2::from_shape_vec((nrow, ncol), data)?)
    }

    fn to_tensor(&self, dev: &Device) -> anyhow::Result<Tensor> {
        let (nrow, ncol) = self.dim();
        let data: Vec<f32> = self.iter().cloned().collect();
        Ok(Tensor::from_vec(data, (nrow, ncol), dev)?)
    }
}
