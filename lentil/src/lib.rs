//! Hierarchical mixture density estimation.
//!
//! Recursive k-means builds a tree of clusters, each summarized by its
//! centroid, covariance and share of the data; `probs` then scores new
//! rows against every cluster of every level.

pub mod hc;
pub mod probs;

pub use hc::{hc, kmnb, partition, Covariance, HcOptions, HierarchicalClusters};
pub use probs::probs;
