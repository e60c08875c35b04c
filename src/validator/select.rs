use {
  crate::{
    chain::types::InferenceValidationDetails,
    config::ValidationParams,
  },
  rand::{Rng, SeedableRng},
  rand_chacha::ChaCha20Rng,
  sha2::{Digest, Sha256},
};

/// Decides whether this participant must validate a given inference.
///
/// Pure and deterministic: the same `(seed, inference, powers, params)`
/// always yields the same verdict, on this node and on any other node
/// replaying the decision. The draw is seeded from the epoch seed and
/// the inference id, the target probability scales with this
/// validator's share of the non-executor power.
pub fn should_validate(
  seed: i64,
  details: &InferenceValidationDetails,
  validator_power: u64,
  params: &ValidationParams,
) -> bool {
  if details.total_power <= details.executor_power {
    return false;
  }
  let adjusted_total = (details.total_power - details.executor_power) as f64;
  let probability = (params.validations_per_inference * validator_power as f64
    / adjusted_total)
    .min(1.0);

  let mut hasher = Sha256::new();
  hasher.update(seed.to_be_bytes());
  hasher.update(details.inference_id.as_bytes());
  let digest: [u8; 32] = hasher.finalize().into();

  let mut rng = ChaCha20Rng::from_seed(digest);
  rng.gen::<f64>() < probability
}

#[cfg(test)]
mod test {
  use super::*;

  fn details(id: &str) -> InferenceValidationDetails {
    InferenceValidationDetails {
      inference_id: id.into(),
      executor_id: "executor".into(),
      executor_power: 10,
      total_power: 100,
      model: "llama".into(),
    }
  }

  #[test]
  fn verdict_is_deterministic() {
    let params = ValidationParams::default();
    for id in ["inf-a", "inf-b", "inf-c"] {
      let first = should_validate(42, &details(id), 30, &params);
      for _ in 0..10 {
        assert_eq!(first, should_validate(42, &details(id), 30, &params));
      }
    }
  }

  #[test]
  fn full_power_validator_always_selected() {
    let params = ValidationParams::default();
    // validator power covers the whole adjusted total
    assert!(should_validate(7, &details("inf-x"), 90, &params));
  }

  #[test]
  fn executor_majority_never_selected() {
    let params = ValidationParams::default();
    let mut d = details("inf-y");
    d.executor_power = 100;
    assert!(!should_validate(7, &d, 90, &params));
  }

  #[test]
  fn different_seeds_flip_some_verdicts() {
    let params = ValidationParams {
      validations_per_inference: 0.5,
      ..Default::default()
    };
    let flips = (0..100)
      .filter(|i| {
        let d = details(&format!("inf-{i}"));
        should_validate(1, &d, 30, &params)
          != should_validate(2, &d, 30, &params)
      })
      .count();
    assert!(flips > 0);
  }
}
