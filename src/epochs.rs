use serde::{Deserialize, Serialize};

/// Number of blocks at the tail of each PoC window during which the
/// node stops issuing fresh commands and lets in-flight work drain.
pub const WIND_DOWN_BLOCKS: i64 = 2;

/// Epoch geometry, snapshotted from chain params. Immutable for the
/// lifetime of a params snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EpochParams {
  pub epoch_length: i64,
  pub epoch_shift: i64,
  pub epoch_multiplier: i64,
  pub poc_stage_duration: i64,
  pub poc_exchange_duration: i64,
  pub poc_validation_delay: i64,
  pub poc_validation_duration: i64,
  pub set_validators_delay: i64,
  pub claim_rewards_delay: i64,
}

impl Default for EpochParams {
  fn default() -> Self {
    Self {
      epoch_length: 100,
      epoch_shift: 0,
      epoch_multiplier: 1,
      poc_stage_duration: 20,
      poc_exchange_duration: 2,
      poc_validation_delay: 2,
      poc_validation_duration: 10,
      set_validators_delay: 2,
      claim_rewards_delay: 5,
    }
  }
}

/// One epoch of the network, anchored at the block where its PoC
/// generation stage begins. All stage edges are derived from that
/// anchor and the chain params; the chain is the authority on both.
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct Epoch {
  pub epoch_index: u64,
  pub poc_start_block_height: i64,
}

impl Epoch {
  fn poc_end(&self, params: &EpochParams) -> i64 {
    self.poc_start_block_height + params.poc_stage_duration
  }

  fn validation_start(&self, params: &EpochParams) -> i64 {
    self.poc_end(params) + params.poc_validation_delay
  }

  fn validation_end(&self, params: &EpochParams) -> i64 {
    self.validation_start(params) + params.poc_validation_duration
  }

  pub fn is_start_of_poc_stage(&self, height: i64) -> bool {
    height == self.poc_start_block_height
  }

  pub fn is_end_of_poc_stage(&self, height: i64, params: &EpochParams) -> bool {
    height == self.poc_end(params)
  }

  pub fn is_start_of_poc_validation(
    &self,
    height: i64,
    params: &EpochParams,
  ) -> bool {
    height == self.validation_start(params)
  }

  pub fn is_end_of_poc_validation(
    &self,
    height: i64,
    params: &EpochParams,
  ) -> bool {
    height == self.validation_end(params)
  }

  pub fn is_set_new_validators(
    &self,
    height: i64,
    params: &EpochParams,
  ) -> bool {
    height == self.validation_end(params) + params.set_validators_delay
  }

  pub fn is_claim_money(&self, height: i64, params: &EpochParams) -> bool {
    height == self.validation_end(params) + params.claim_rewards_delay
  }
}

/// The phase a given block height falls into within its epoch.
///
/// Wind-down variants cover the tail of the PoC windows as well as the
/// exchange gap between generation end and validation start, where the
/// node must not issue new work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EpochPhase {
  PoCGenerate,
  PoCGenerateWindDown,
  PoCValidate,
  PoCValidateWindDown,
  Inference,
}

impl EpochPhase {
  pub fn is_poc(&self) -> bool {
    matches!(
      self,
      EpochPhase::PoCGenerate
        | EpochPhase::PoCGenerateWindDown
        | EpochPhase::PoCValidate
        | EpochPhase::PoCValidateWindDown
    )
  }

  pub fn is_wind_down(&self) -> bool {
    matches!(
      self,
      EpochPhase::PoCGenerateWindDown | EpochPhase::PoCValidateWindDown
    )
  }
}

/// Identity of a single chain block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
  pub height: i64,
  pub hash: String,
}

/// A memoized view of where the node stands in the epoch cycle,
/// recomputed on every observed block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochState {
  pub current_block: BlockInfo,
  pub latest_epoch: Epoch,
  pub epoch_params: EpochParams,
  pub current_phase: EpochPhase,
  pub is_synced: bool,
}

/// Derives the phase for a block. This is a pure mapping with no side
/// effects; stage edges are detected separately with the exact
/// equality predicates on [`Epoch`].
pub fn track(
  block: BlockInfo,
  latest_epoch: Epoch,
  epoch_params: EpochParams,
  is_synced: bool,
) -> EpochState {
  let current_phase = phase_at(block.height, &latest_epoch, &epoch_params);
  EpochState {
    current_block: block,
    latest_epoch,
    epoch_params,
    current_phase,
    is_synced,
  }
}

fn phase_at(height: i64, epoch: &Epoch, params: &EpochParams) -> EpochPhase {
  let poc_start = epoch.poc_start_block_height;
  let poc_end = epoch.poc_end(params);
  let validation_start = epoch.validation_start(params);
  let validation_end = epoch.validation_end(params);

  if height < poc_start {
    // before the anchor of the latest known epoch we are still in the
    // inference phase of the previous one
    return EpochPhase::Inference;
  }
  if height < poc_end {
    if height >= poc_end - WIND_DOWN_BLOCKS {
      return EpochPhase::PoCGenerateWindDown;
    }
    return EpochPhase::PoCGenerate;
  }
  if height < validation_start {
    // exchange gap: batches are in flight between participants, no new
    // commands may be issued
    return EpochPhase::PoCGenerateWindDown;
  }
  if height < validation_end {
    if height >= validation_end - WIND_DOWN_BLOCKS {
      return EpochPhase::PoCValidateWindDown;
    }
    return EpochPhase::PoCValidate;
  }
  EpochPhase::Inference
}
