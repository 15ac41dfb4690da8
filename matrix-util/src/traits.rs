use candle_core::{Device, Tensor};

/// Operations to sample random matrices from a seeded generator,
/// only works for `ndarray::Array2` and `candle_core::Tensor`
pub trait SampleOps {
    type Mat;
    type Scalar;

    /// Sample a matrix from a uniform distribution `U(0,1)`
    fn runif(dd: usize, nn: usize, seed: u64) -> anyhow::Result<Self::Mat>;

    /// Sample a matrix from a normal distribution `N(0,1)`
    fn rnorm(dd: usize, nn: usize, seed: u64) -> anyhow::Result<Self::Mat>;

    /// Sample a matrix from a uniform distribution `U(lb, ub)`
    fn runif_range(
        dd: usize,
        nn: usize,
        range: (f32, f32),
        seed: u64,
    ) -> anyhow::Result<Self::Mat>;
}

/// Reading off from `Tensor`
pub trait ConvertMatOps {
    type Mat;
    type Scalar;

    fn from_tensor(_: &Tensor) -> anyhow::Result<Self::Mat>;
    fn to_tensor(&self, dev: &Device) -> anyhow::Result<Tensor>;
}

/// Summaries of a stream of vectors
pub trait RunningStatOps {
    type Output;

    fn clear(&mut self);
    fn count(&self) -> usize;
    fn mean(&self) -> Self::Output;
    fn variance(&self) -> Self::Output;
    fn std(&self) -> Self::Output;
}

/// Delimited text input/output
pub trait IoOps {
    type Scalar;
    type Mat;

    /// Read a matrix, one row per line; whitespace-delimited when
    /// `delim` is `None`, skipping the first `skip` lines
    fn read_file_delim(file: &str, delim: Option<&str>, skip: usize) -> anyhow::Result<Self::Mat>;

    fn from_tsv(tsv_file: &str, skip: usize) -> anyhow::Result<Self::Mat> {
        Self::read_file_delim(tsv_file, Some("\t"), skip)
    }

    fn to_tsv(&self, tsv_file: &str) -> anyhow::Result<()>;
}
