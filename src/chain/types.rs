use {
  crate::{
    config::Hardware,
    epochs::{Epoch, EpochParams},
  },
  serde::{Deserialize, Serialize},
};

/// Sync status of the chain node this participant is attached to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStatus {
  pub latest_block_height: i64,
  /// Oldest block the node still has; earlier ones are pruned.
  pub earliest_block_height: i64,
  pub catching_up: bool,
}

impl NodeStatus {
  pub fn is_synced(&self) -> bool {
    !self.catching_up
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventAttribute {
  pub key: String,
  pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AbciEvent {
  #[serde(rename = "type")]
  pub kind: String,
  pub attributes: Vec<EventAttribute>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxResult {
  pub events: Vec<AbciEvent>,
}

/// Execution results of every transaction in one block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockResults {
  pub height: i64,
  pub txs_results: Vec<TxResult>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EpochInfo {
  pub latest_epoch: Epoch,
  pub params: EpochParams,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParticipantInfo {
  pub address: String,
  pub power: u64,
}

/// One PoC batch a participant submitted for an epoch's generation
/// stage: the nonces it claims to have computed together with their
/// distances.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PocBatch {
  pub participant: String,
  pub poc_stage_start_block_height: i64,
  pub nonces: Vec<i64>,
  pub distances: Vec<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InferenceSummary {
  pub inference_id: String,
  pub epoch_id: u64,
  pub model: String,
  pub executor_id: String,
}

/// Full inference record as stored on chain, payloads included.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InferenceDetail {
  pub inference_id: String,
  pub epoch_id: u64,
  pub model: String,
  pub executor_id: String,
  pub prompt_payload: String,
  pub response_payload: String,
}

/// The inputs of the validation-selection predicate for one inference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InferenceValidationDetails {
  pub inference_id: String,
  pub executor_id: String,
  pub executor_power: u64,
  pub total_power: u64,
  pub model: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardwareNode {
  pub local_id: String,
  pub hardware: Vec<Hardware>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelInfo {
  pub id: String,
  pub proposed_by: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DkgPhase {
  KeyGeneration,
  Verifying,
  Completed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DkgParticipant {
  pub address: String,
  /// Compressed secp256k1 key, hex. Shares are encrypted to this key
  /// and to any warm keys granted for dealer-part messages.
  pub secp256k1_pub_key: String,
  pub slot_start: u32,
  pub slot_end: u32,
}

/// Ciphertexts one dealer produced for one participant: outer index is
/// the slot within the participant's range, inner index enumerates the
/// allowed public keys the share was encrypted to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParticipantShares {
  pub participant: String,
  pub ciphertexts: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DealerPart {
  pub dealer: String,
  /// Compressed G2 points, 96 bytes each, hex; one per polynomial
  /// coefficient.
  pub commitments: Vec<String>,
  pub shares: Vec<ParticipantShares>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DkgInfo {
  pub phase: DkgPhase,
  pub total_slots: u32,
  pub t_slots_degree: u32,
  pub participants: Vec<DkgParticipant>,
  /// Compressed G2 group key, hex; empty until generated.
  #[serde(default)]
  pub group_public_key: String,
  #[serde(default)]
  pub dealer_parts: Vec<DealerPart>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubGroup {
  pub model_id: String,
  pub members: Vec<String>,
}

/// Composition of the current epoch group: model subgroups plus the
/// DKG state when key generation for the epoch is in progress.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EpochGroupData {
  pub epoch_index: u64,
  pub sub_groups: Vec<SubGroup>,
  pub dkg: Option<DkgInfo>,
}

// transaction messages

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MsgSubmitSeed {
  pub epoch_index: u64,
  pub signature: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MsgClaimRewards {
  pub seed: i64,
  pub epoch_index: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MsgValidation {
  pub inference_id: String,
  pub response_hash: String,
  pub value: f64,
  pub revalidation: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MsgSubmitDealerPart {
  pub epoch_index: u64,
  pub commitments: Vec<String>,
  pub shares: Vec<ParticipantShares>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MsgSubmitGroupKeyValidationSignature {
  pub new_epoch_index: u64,
  pub slot_indices: Vec<u32>,
  /// Compressed G1 point, hex.
  pub signature: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MsgSubmitPartialSignature {
  pub request_id: String,
  pub slot_indices: Vec<u32>,
  pub signature: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MsgSubmitHardwareDiff {
  pub nodes: Vec<HardwareNode>,
}
