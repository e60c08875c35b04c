//! PoC batch validation orchestrator.
//!
//! At validation start the chain holds every peer's generation batches
//! for the epoch. Each participant's nonces are deduplicated and
//! joined into one batch, a deterministic sample is drawn from it and
//! the sample is dispatched to one of our nodes currently in the
//! validating stage.

use {
  crate::{
    broker::{client::ValidateBatchDto, NodeBroker},
    chain::ChainClient,
    keys::Pubkey,
    store::ConfigStore,
  },
  indexmap::IndexMap,
  rand::{seq::index, SeedableRng},
  rand_chacha::ChaCha20Rng,
  sha2::{Digest, Sha256},
  std::{collections::HashSet, sync::Arc},
  tracing::{debug, info, warn},
};

/// Attempts per batch, spread over different nodes round-robin.
const DISPATCH_ATTEMPTS: usize = 5;

pub struct PocOrchestrator {
  chain: Arc<dyn ChainClient>,
  broker: NodeBroker,
  store: Arc<ConfigStore>,
  me: Pubkey,
}

impl PocOrchestrator {
  pub fn new(
    chain: Arc<dyn ChainClient>,
    broker: NodeBroker,
    store: Arc<ConfigStore>,
    me: Pubkey,
  ) -> Self {
    Self {
      chain,
      broker,
      store,
      me,
    }
  }

  /// Fetches all batches submitted for the epoch anchored at
  /// `poc_start_height` and dispatches one sampled validation request
  /// per peer participant.
  pub async fn validate_received_batches(&self, poc_start_height: i64) {
    let batches = match self.chain.poc_batches_for_stage(poc_start_height).await
    {
      Ok(batches) => batches,
      Err(e) => {
        warn!("poc batch fetch failed: {e}");
        return;
      }
    };

    // join all batches of a participant into one, nonces deduplicated
    let mut joined: IndexMap<String, Vec<i64>> = IndexMap::new();
    for batch in batches {
      if batch.participant == self.me.to_string() {
        continue;
      }
      let nonces = joined.entry(batch.participant).or_default();
      let mut seen: HashSet<i64> = nonces.iter().copied().collect();
      for nonce in batch.nonces {
        if seen.insert(nonce) {
          nonces.push(nonce);
        }
      }
    }

    let clients = match self.broker.validating_clients().await {
      Ok(clients) => clients,
      Err(e) => {
        warn!("broker unavailable for batch dispatch: {e}");
        return;
      }
    };
    if clients.is_empty() {
      warn!("no nodes in validating stage, skipping batch validation");
      return;
    }

    let sample_size = self.store.validation_params().validation_sample_size;
    info!(
      participants = joined.len(),
      sample_size, "dispatching poc batch validations"
    );

    let mut round_robin = 0usize;
    for (participant, nonces) in joined {
      let sampled = sample_nonces(&self.me, &participant, &nonces, sample_size);
      let dto = ValidateBatchDto {
        participant: participant.clone(),
        poc_stage_start_block_height: poc_start_height,
        nonces: sampled,
      };

      let mut dispatched = false;
      for _ in 0..DISPATCH_ATTEMPTS.min(clients.len().max(1)) {
        let (node_id, client) = &clients[round_robin % clients.len()];
        round_robin += 1;
        match client.validate_batch(&dto).await {
          Ok(()) => {
            debug!(%participant, node = %node_id, "batch dispatched");
            dispatched = true;
            break;
          }
          Err(e) => {
            warn!(%participant, node = %node_id, "batch dispatch failed: {e}");
          }
        }
      }
      if !dispatched {
        warn!(%participant, "giving up on batch after all attempts");
      }
    }
  }
}

/// Deterministic nonce sample: the RNG is seeded from the local public
/// key and the batch owner, so every node of this participant samples
/// the same subset of the same joined batch.
fn sample_nonces(
  me: &Pubkey,
  participant: &str,
  nonces: &[i64],
  sample_size: usize,
) -> Vec<i64> {
  if nonces.len() <= sample_size {
    return nonces.to_vec();
  }
  let mut hasher = Sha256::new();
  hasher.update(me.as_bytes());
  hasher.update(participant.as_bytes());
  let digest: [u8; 32] = hasher.finalize().into();

  let mut rng = ChaCha20Rng::from_seed(digest);
  index::sample(&mut rng, nonces.len(), sample_size)
    .iter()
    .map(|i| nonces[i])
    .collect()
}

#[cfg(test)]
mod test {
  use {super::sample_nonces, crate::keys::Signer};

  #[test]
  fn sampling_is_reproducible_and_bounded() {
    let signer: Signer =
      "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318"
        .parse()
        .unwrap();
    let me = signer.public();
    let nonces: Vec<i64> = (0..1000).collect();

    let a = sample_nonces(&me, "peer-1", &nonces, 200);
    let b = sample_nonces(&me, "peer-1", &nonces, 200);
    assert_eq!(a, b);
    assert_eq!(a.len(), 200);

    // small batches pass through whole
    let few: Vec<i64> = (0..10).collect();
    assert_eq!(sample_nonces(&me, "peer-1", &few, 200), few);

    // different batch owners sample different subsets
    assert_ne!(sample_nonces(&me, "peer-2", &nonces, 200), a);
  }
}
