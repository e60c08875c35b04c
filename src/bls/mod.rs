//! BLS threshold subsystem.
//!
//! Implements this participant's side of the epoch key ceremony:
//! dealing polynomial shares during key generation, aggregating the
//! shares dealt to us during the verifying phase, countersigning the
//! resulting group key, and producing partial signatures whenever the
//! chain requests a threshold signature.
//!
//! Messages are hashed to G1 by keccak-ing the message with an
//! incrementing counter until the digest lands in the scalar field,
//! then multiplying the G1 generator; the chain verifies against the
//! same construction, so the counter walk must match exactly.

pub mod arith;
pub mod ecies;

use {
  crate::{
    chain::{
      types::{
        DkgInfo,
        DkgPhase,
        MsgSubmitDealerPart,
        MsgSubmitGroupKeyValidationSignature,
        MsgSubmitPartialSignature,
        ParticipantShares,
      },
      ChainClient,
    },
    keys::{Pubkey, Signer},
  },
  arith::{eval_poly, Scalar, G1, G2},
  sha3::{Digest, Keccak256},
  std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex},
  },
  tracing::{debug, info, warn},
};

const DEALER_PART_MSG_TYPE: &str = "/inference.bls.MsgSubmitDealerPart";

/// Verification results are kept for the two latest epochs only; the
/// current epoch signs threshold requests, the previous one signs the
/// next group key.
const CACHE_EPOCHS: usize = 2;

/// Aggregated shares this participant holds for one epoch: one scalar
/// per owned slot, summed over all dealers.
struct EpochShares {
  epoch_index: u64,
  slots: Vec<u32>,
  shares: Vec<Scalar>,
}

pub struct BlsSubsystem {
  chain: Arc<dyn ChainClient>,
  signer: Signer,
  me: Pubkey,
  chain_id: String,
  cache: Mutex<VecDeque<EpochShares>>,
  submitted_dealer_parts: Mutex<HashSet<u64>>,
  submitted_group_sigs: Mutex<HashSet<u64>>,
}

impl BlsSubsystem {
  pub fn new(
    chain: Arc<dyn ChainClient>,
    signer: Signer,
    chain_id: String,
  ) -> Self {
    let me = signer.public();
    Self {
      chain,
      signer,
      me,
      chain_id,
      cache: Mutex::new(VecDeque::new()),
      submitted_dealer_parts: Mutex::new(HashSet::new()),
      submitted_group_sigs: Mutex::new(HashSet::new()),
    }
  }

  /// Per-block DKG driver, called for every synced NewBlock. Reads the
  /// ceremony state from the chain and performs whatever step of it is
  /// pending for this participant.
  pub async fn process_new_block(&self, _height: i64) -> anyhow::Result<()> {
    let data = self.chain.current_epoch_group_data().await?;
    let Some(dkg) = data.dkg else {
      return Ok(());
    };
    match dkg.phase {
      DkgPhase::KeyGeneration => {
        self.submit_dealer_part(data.epoch_index, &dkg).await
      }
      DkgPhase::Verifying => {
        self.process_verifying_phase(data.epoch_index, &dkg).await
      }
      DkgPhase::Completed => {
        self
          .submit_group_key_validation(data.epoch_index, &dkg)
          .await
      }
    }
  }

  async fn submit_dealer_part(
    &self,
    epoch_index: u64,
    dkg: &DkgInfo,
  ) -> anyhow::Result<()> {
    let me = self.me.to_string();
    if !dkg.participants.iter().any(|p| p.secp256k1_pub_key == me) {
      return Ok(());
    }
    if self
      .submitted_dealer_parts
      .lock()
      .unwrap()
      .contains(&epoch_index)
    {
      return Ok(());
    }

    // one random polynomial of degree t per ceremony; the group secret
    // is the sum of every dealer's constant term
    let coefficients: Vec<Scalar> = (0..=dkg.t_slots_degree)
      .map(|_| Scalar::random())
      .collect();
    let commitments: Vec<String> = coefficients
      .iter()
      .map(|c| hex::encode(G2::generator().mul(c).compress()))
      .collect();

    let mut shares = Vec::with_capacity(dkg.participants.len());
    for participant in &dkg.participants {
      // every allowed key of the recipient gets the same share sealed
      // separately: their account key plus any warm keys granted for
      // dealer parts
      let mut allowed = vec![participant.secp256k1_pub_key.clone()];
      match self
        .chain
        .grantees_by_message_type(&participant.address, DEALER_PART_MSG_TYPE)
        .await
      {
        Ok(grantees) => allowed.extend(grantees),
        Err(e) => {
          warn!(participant = %participant.address, "grantee query failed: {e}")
        }
      }

      let mut ciphertexts = Vec::new();
      for slot in participant.slot_start..=participant.slot_end {
        let share =
          eval_poly(&coefficients, &Scalar::from_u64(u64::from(slot)));
        let share_bytes = share.to_bytes();
        let mut sealed = Vec::with_capacity(allowed.len());
        for key_hex in &allowed {
          let key = hex::decode(key_hex)?;
          sealed.push(hex::encode(ecies::encrypt(&key, &share_bytes)?));
        }
        ciphertexts.push(sealed);
      }
      shares.push(ParticipantShares {
        participant: participant.address.clone(),
        ciphertexts,
      });
    }

    info!(epoch = epoch_index, "submitting dealer part");
    self
      .chain
      .submit_dealer_part(MsgSubmitDealerPart {
        epoch_index,
        commitments,
        shares,
      })
      .await?;
    self
      .submitted_dealer_parts
      .lock()
      .unwrap()
      .insert(epoch_index);
    Ok(())
  }

  async fn process_verifying_phase(
    &self,
    epoch_index: u64,
    dkg: &DkgInfo,
  ) -> anyhow::Result<()> {
    if self.shares_for_epoch(epoch_index) {
      // already aggregated for this epoch
      return Ok(());
    }
    let me = self.me.to_string();
    let Some(own) = dkg
      .participants
      .iter()
      .find(|p| p.secp256k1_pub_key == me)
    else {
      return Ok(());
    };

    let slots: Vec<u32> = (own.slot_start..=own.slot_end).collect();
    let mut sums = vec![Scalar::zero(); slots.len()];
    let mut dealers = 0usize;
    for part in &dkg.dealer_parts {
      let Some(mine) = part
        .shares
        .iter()
        .find(|s| s.participant == own.address)
      else {
        continue;
      };
      let mut decrypted_any = false;
      for (i, sealed) in mine.ciphertexts.iter().enumerate().take(slots.len()) {
        for ciphertext_hex in sealed {
          let Ok(ciphertext) = hex::decode(ciphertext_hex) else {
            continue;
          };
          let Ok(plain) = ecies::decrypt(&self.signer, &ciphertext) else {
            continue;
          };
          let bytes: [u8; 32] = match plain.try_into() {
            Ok(bytes) => bytes,
            Err(_) => continue,
          };
          if let Some(share) = Scalar::from_bytes(&bytes) {
            sums[i] = sums[i].add(&share);
            decrypted_any = true;
            break;
          }
        }
      }
      if decrypted_any {
        dealers += 1;
      } else {
        warn!(dealer = %part.dealer, "could not decrypt any share from dealer");
      }
    }

    info!(
      epoch = epoch_index,
      dealers,
      slots = slots.len(),
      "aggregated dealt shares"
    );
    let mut cache = self.cache.lock().unwrap();
    cache.push_back(EpochShares {
      epoch_index,
      slots,
      shares: sums,
    });
    while cache.len() > CACHE_EPOCHS {
      cache.pop_front();
    }
    Ok(())
  }

  async fn submit_group_key_validation(
    &self,
    epoch_index: u64,
    dkg: &DkgInfo,
  ) -> anyhow::Result<()> {
    if dkg.group_public_key.is_empty() {
      return Ok(());
    }
    if self
      .submitted_group_sigs
      .lock()
      .unwrap()
      .contains(&epoch_index)
    {
      return Ok(());
    }
    let Some(previous_epoch) = epoch_index.checked_sub(1) else {
      return Ok(());
    };

    // only validators of the previous epoch countersign the new key
    let Some((slots, signature)) = self.sign_with_epoch_shares(
      previous_epoch,
      &group_key_message(
        previous_epoch,
        &self.chain_id,
        &hex::decode(&dkg.group_public_key)?,
      )?,
    ) else {
      debug!(
        epoch = epoch_index,
        "no shares for previous epoch, not countersigning group key"
      );
      return Ok(());
    };

    info!(epoch = epoch_index, "submitting group key validation signature");
    self
      .chain
      .submit_group_key_validation_signature(
        MsgSubmitGroupKeyValidationSignature {
          new_epoch_index: epoch_index,
          slot_indices: slots,
          signature,
        },
      )
      .await?;
    self
      .submitted_group_sigs
      .lock()
      .unwrap()
      .insert(epoch_index);
    Ok(())
  }

  /// Partial signature for a threshold signing request, using the
  /// current epoch's aggregated slot shares.
  pub async fn process_threshold_signing_requested(
    &self,
    request_id: &str,
    data_hex: &str,
  ) -> anyhow::Result<()> {
    let message = hex::decode(data_hex)?;
    let latest_epoch = {
      let cache = self.cache.lock().unwrap();
      match cache.back() {
        Some(entry) => entry.epoch_index,
        None => {
          warn!(request_id, "no aggregated shares, cannot partially sign");
          return Ok(());
        }
      }
    };
    let Some((slots, signature)) =
      self.sign_with_epoch_shares(latest_epoch, &message)
    else {
      return Ok(());
    };

    info!(request_id, "submitting partial signature");
    self
      .chain
      .submit_partial_signature(MsgSubmitPartialSignature {
        request_id: request_id.to_string(),
        slot_indices: slots,
        signature,
      })
      .await?;
    Ok(())
  }

  fn shares_for_epoch(&self, epoch_index: u64) -> bool {
    self
      .cache
      .lock()
      .unwrap()
      .iter()
      .any(|e| e.epoch_index == epoch_index)
  }

  /// Signs `message` with every slot share held for `epoch_index` and
  /// sums the per-slot signatures into one compressed G1 point.
  fn sign_with_epoch_shares(
    &self,
    epoch_index: u64,
    message: &[u8],
  ) -> Option<(Vec<u32>, String)> {
    let cache = self.cache.lock().unwrap();
    let entry = cache.iter().find(|e| e.epoch_index == epoch_index)?;

    let point = hash_to_g1(message);
    let mut aggregate: Option<G1> = None;
    for share in &entry.shares {
      let partial = point.mul(share);
      aggregate = Some(match aggregate {
        Some(acc) => acc.add(&partial),
        None => partial,
      });
    }
    let aggregate = aggregate?;
    Some((entry.slots.clone(), hex::encode(aggregate.compress())))
  }
}

/// The group-key validation preimage: previous epoch, chain id and the
/// 96-byte key split into three 32-byte words, keccak-hashed.
fn group_key_message(
  previous_epoch: u64,
  chain_id: &str,
  group_key: &[u8],
) -> anyhow::Result<Vec<u8>> {
  if group_key.len() != 96 {
    anyhow::bail!("group key must be 96 bytes, got {}", group_key.len());
  }
  let mut hasher = Keccak256::new();
  hasher.update(previous_epoch.to_be_bytes());
  hasher.update(chain_id.as_bytes());
  for word in group_key.chunks(32) {
    hasher.update(word);
  }
  Ok(hasher.finalize().to_vec())
}

/// Deterministic hash-to-curve: keccak the message with an
/// incrementing counter until the digest is a valid scalar, then
/// multiply the G1 generator by it.
fn hash_to_g1(message: &[u8]) -> G1 {
  let mut counter: u32 = 0;
  loop {
    let mut hasher = Keccak256::new();
    hasher.update(message);
    hasher.update(counter.to_be_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    if let Some(scalar) = Scalar::from_bytes(&digest) {
      return G1::generator().mul(&scalar);
    }
    counter += 1;
  }
}

#[cfg(test)]
mod test {
  use super::{
    arith::{eval_poly, Scalar, G2},
    group_key_message,
    hash_to_g1,
  };

  #[test]
  fn hash_to_g1_is_deterministic() {
    let a = hash_to_g1(b"message");
    let b = hash_to_g1(b"message");
    assert_eq!(a.compress(), b.compress());
    assert_ne!(hash_to_g1(b"other").compress(), a.compress());
  }

  #[test]
  fn group_key_message_requires_96_bytes() {
    assert!(group_key_message(1, "chain-1", &[0u8; 96]).is_ok());
    assert!(group_key_message(1, "chain-1", &[0u8; 48]).is_err());
  }

  #[test]
  fn commitments_verify_dealt_shares() {
    // a verifier can check a share f(x) against the coefficient
    // commitments: g2^f(x) must equal prod(commit_j^(x^j))
    let coefficients: Vec<Scalar> =
      (0..3).map(|_| Scalar::random()).collect();
    let commitments: Vec<G2> = coefficients
      .iter()
      .map(|c| G2::generator().mul(c))
      .collect();

    let x = Scalar::from_u64(5);
    let share = eval_poly(&coefficients, &x);

    let mut x_pow = Scalar::from_u64(1);
    let mut expected: Option<G2> = None;
    for commitment in &commitments {
      let term = commitment.mul(&x_pow);
      expected = Some(match expected {
        Some(acc) => acc.add(&term),
        None => term,
      });
      x_pow = x_pow.mul(&x);
    }

    assert_eq!(
      G2::generator().mul(&share).compress(),
      expected.unwrap().compress()
    );
  }
}
