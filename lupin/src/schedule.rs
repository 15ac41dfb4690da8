//! Inference schedules.
//!
//! A schedule is written as a list of steps:
//! `s:<coeff>`, `h:<coeff>`, `g:<layer>` or `g:<layer>:<coeff>`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One coordinate-ascent step of the inference procedure
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum InferenceStep {
    /// Update the slabs `S_hat`
    S { coeff: f64 },
    /// Update the spikes `H_hat`
    H { coeff: f64 },
    /// Update hidden layer `g[layer]`, replacing it outright without a coefficient
    G { layer: usize, coeff: Option<f64> },
}

impl InferenceStep {
    pub fn family(&self) -> &'static str {
        match self {
            InferenceStep::S { .. } => "s",
            InferenceStep::H { .. } => "h",
            InferenceStep::G { .. } => "g",
        }
    }
}

fn parse_coeff(step: &str, text: &str) -> anyhow::Result<f64> {
    let coeff: f64 = text
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("step `{}`: damping coefficient `{}` is not a number", step, text))?;
    anyhow::ensure!(
        (0.0..=1.0).contains(&coeff),
        "step `{}`: damping coefficient {} is outside [0, 1]",
        step,
        coeff
    );
    Ok(coeff)
}

impl FromStr for InferenceStep {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let words: Vec<&str> = s.split(':').map(|w| w.trim()).collect();
        match words.as_slice() {
            ["s", c] => Ok(InferenceStep::S {
                coeff: parse_coeff(s, c)?,
            }),
            ["h", c] => Ok(InferenceStep::H {
                coeff: parse_coeff(s, c)?,
            }),
            ["g", l, rest @ ..] if rest.len() <= 1 => {
                let layer: usize = l.parse().map_err(|_| {
                    anyhow::anyhow!("step `{}`: hidden layer index `{}` is not an integer", s, l)
                })?;
                let coeff = rest.first().map(|c| parse_coeff(s, c)).transpose()?;
                Ok(InferenceStep::G { layer, coeff })
            }
            [family, ..] if !matches!(*family, "s" | "h" | "g") => {
                anyhow::bail!("step `{}`: unknown family `{}`, expected s, h or g", s, family)
            }
            _ => anyhow::bail!("step `{}` is malformed", s),
        }
    }
}

impl TryFrom<String> for InferenceStep {
    type Error = anyhow::Error;

    fn try_from(s: String) -> anyhow::Result<Self> {
        s.parse()
    }
}

impl From<InferenceStep> for String {
    fn from(step: InferenceStep) -> String {
        step.to_string()
    }
}

impl fmt::Display for InferenceStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InferenceStep::S { coeff } => write!(f, "s:{}", coeff),
            InferenceStep::H { coeff } => write!(f, "h:{}", coeff),
            InferenceStep::G { layer, coeff: None } => write!(f, "g:{}", layer),
            InferenceStep::G {
                layer,
                coeff: Some(c),
            } => write!(f, "g:{}:{}", layer, c),
        }
    }
}

/// Parse a comma or whitespace separated schedule, e.g. `"h:1, s:1, g:0"`
pub fn parse_schedule(text: &str) -> anyhow::Result<Vec<InferenceStep>> {
    text.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|w| !w.is_empty())
        .map(|w| w.parse())
        .collect()
}

/// Every `g` step must address an existing layer
pub fn check_schedule(schedule: &[InferenceStep], num_layers: usize) -> anyhow::Result<()> {
    for (i, step) in schedule.iter().enumerate() {
        if let InferenceStep::G { layer, .. } = step {
            anyhow::ensure!(
                *layer < num_layers,
                "schedule step {} ({}): layer {} is out of range, the hierarchy has {} hidden layers",
                i,
                step,
                layer,
                num_layers
            );
        }
    }
    Ok(())
}
