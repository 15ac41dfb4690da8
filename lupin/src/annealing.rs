//! Schedules over the number of examples seen.

use serde::{Deserialize, Serialize};

/// Linear anneal from `init` to `last`, flat before `start` and after
/// `saturate` examples
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearAnneal {
    pub init: f64,
    pub last: f64,
    #[serde(default)]
    pub start: usize,
    pub saturate: usize,
}

impl LinearAnneal {
    pub fn new(init: f64, last: f64, start: usize, saturate: usize) -> Self {
        LinearAnneal {
            init,
            last,
            start,
            saturate,
        }
    }

    pub fn check(&self, name: &str) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.saturate >= self.start,
            "{} saturates at {} examples, before it starts at {}",
            name,
            self.saturate,
            self.start
        );
        Ok(())
    }

    /// Progress in `[0, 1]`
    pub fn progress(&self, examples_seen: usize) -> f64 {
        if examples_seen <= self.start {
            return 0.0;
        }
        if self.saturate <= self.start || examples_seen >= self.saturate {
            return 1.0;
        }
        (examples_seen - self.start) as f64 / (self.saturate - self.start) as f64
    }

    pub fn value(&self, examples_seen: usize) -> f64 {
        let alpha = self.progress(examples_seen);
        (1.0 - alpha) * self.init + alpha * self.last
    }
}

/// Global multiplier of every learning rate,
/// `max(min_shrink, 1 / (1 + scale * max(0, seen - start)))`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Shrink {
    #[serde(default)]
    pub start: usize,
    pub scale: f64,
    #[serde(default)]
    pub min_shrink: f64,
}

impl Shrink {
    pub fn value(&self, examples_seen: usize) -> f64 {
        let past = examples_seen.saturating_sub(self.start) as f64;
        (1.0 / (1.0 + self.scale * past)).max(self.min_shrink)
    }
}
