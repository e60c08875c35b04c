//! Logprob comparison between an original inference response and its
//! re-execution with enforced tokens.
//!
//! Token streams must match exactly; given that, the verdict is a
//! similarity score over the per-position top-logprob distributions.
//! Scores land in (-inf, 1] with 1 meaning identical distributions;
//! anything above [`PASSING_SIMILARITY`] confirms the original.

use serde::{Deserialize, Serialize};

pub const PASSING_SIMILARITY: f64 = 0.99;

/// Positions are averaged over at least this many slots so that very
/// short responses cannot pass on a handful of lucky tokens.
const MIN_POSITIONS: usize = 100;

const EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopLogprob {
  pub token: String,
  pub logprob: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenLogprob {
  pub token: String,
  pub logprob: f64,
  #[serde(default)]
  pub top_logprobs: Vec<TopLogprob>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
  /// The re-execution produced fewer tokens than the original.
  DifferentLength,
  /// Token mismatch at a position, enforced decoding diverged.
  DifferentTokens { position: usize },
  Similarity(f64),
}

impl Verdict {
  /// The value submitted to the chain; hard mismatches score zero.
  pub fn value(&self) -> f64 {
    match self {
      Verdict::Similarity(s) => *s,
      _ => 0.0,
    }
  }

  pub fn passes(&self) -> bool {
    matches!(self, Verdict::Similarity(s) if *s > PASSING_SIMILARITY)
  }
}

pub fn compare(
  original: &[TokenLogprob],
  validation: &[TokenLogprob],
) -> Verdict {
  if validation.len() < original.len() {
    return Verdict::DifferentLength;
  }
  for (position, (o, v)) in original.iter().zip(validation).enumerate() {
    if o.token != v.token {
      return Verdict::DifferentTokens { position };
    }
  }

  let top_k = original
    .iter()
    .map(|p| p.top_logprobs.len())
    .max()
    .unwrap_or(0)
    .max(1);
  let total: f64 = original
    .iter()
    .zip(validation)
    .map(|(o, v)| position_distance(o, v))
    .sum();
  let normalizer = (original.len().max(MIN_POSITIONS) * top_k) as f64;
  Verdict::Similarity(1.0 - total / normalizer)
}

fn position_distance(original: &TokenLogprob, validation: &TokenLogprob) -> f64 {
  // tokens the original top list does not carry get an extrapolated
  // logprob one step below the observed minimum
  let mut sorted: Vec<f64> =
    original.top_logprobs.iter().map(|t| t.logprob).collect();
  sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
  let min = sorted.first().copied().unwrap_or(0.0);
  let second = sorted.get(1).copied().unwrap_or(min);
  let missing = min - (second - min);

  validation
    .top_logprobs
    .iter()
    .map(|v| {
      let o = original
        .top_logprobs
        .iter()
        .find(|o| o.token == v.token)
        .map(|o| o.logprob)
        .unwrap_or(missing);
      (v.logprob - o).abs() / (EPSILON + v.logprob.abs() + o.abs()) / 2.0
    })
    .sum()
}
