//! Partially directed deep Boltzmann machine (PD-DBM).
//!
//! Spike-and-slab sparse coding (S3C) of the data `v` with a deep
//! Boltzmann machine as the prior over the spikes `h`. Learning
//! maximizes a mean-field variational bound: the tractable part is
//! differentiated exactly through candle autodiff, the log-partition
//! of the DBM is estimated from Gibbs chains or contrastive divergence.
//!
//! # References
//!
//! Goodfellow, Courville & Bengio (2013). "Scaling up spike-and-slab
//! models for unsupervised feature learning." IEEE TPAMI.

/// Damped updates and reflection clipping
pub mod damping;

/// Lazily computed batch statistics of the spike-and-slab posterior
pub mod sufficient_stats;

/// Parameter keys and gradient maps
pub mod param;

/// The visible model and hierarchy seams
pub mod traits;

/// Scalar summaries for monitoring
pub mod monitor;

/// Spike-and-slab sparse coding
pub mod s3c;

/// Deep Boltzmann machine with negative chains
pub mod dbm;

/// Inference schedules
pub mod schedule;

/// Mean-field inference
pub mod inference;

/// Variational bound, penalties, reconstruction error
pub mod objective;

/// Running gradient variance
pub mod grad_stats;

/// Learning-rate and momentum schedules
pub mod annealing;

/// Update construction and commit
pub mod updates;

/// The composite model
pub mod model;

#[cfg(test)]
mod test;

pub use dbm::{Dbm, DbmOptions};
pub use inference::{InferenceOptions, InferenceProcedure, Labels, Observations};
pub use model::{BiasSource, Pddbm, PddbmOptions, SpikeSlabInit};
pub use s3c::{S3c, S3cOptions};
pub use schedule::{parse_schedule, InferenceStep};
