//! Chain access contracts.
//!
//! The orchestration core talks to the consensus chain exclusively
//! through [`ChainClient`], which keeps the whole query/transaction
//! surface mockable in tests. The production implementation lives in
//! [`rpc`] (JSON-RPC + query gateway over HTTP) and [`ws`] (NewBlock
//! subscription).

pub mod rpc;
pub mod types;
pub mod ws;

use {async_trait::async_trait, types::*};

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("chain transport error: {0}")]
  Transport(#[from] reqwest::Error),

  #[error("chain rpc error {code}: {message}")]
  Rpc { code: i64, message: String },

  #[error("malformed chain response: {0}")]
  Decode(#[from] serde_json::Error),

  #[error("{0}")]
  Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Everything the node asks of, or submits to, the chain. Methods
/// mirror the chain's query and message surface one to one; all of
/// them are point-in-time calls with per-call timeouts, retries are
/// the caller's business.
#[async_trait]
pub trait ChainClient: Send + Sync {
  // node-level queries
  async fn status(&self) -> Result<NodeStatus>;
  async fn block_results(&self, height: i64) -> Result<BlockResults>;

  // module queries
  async fn epoch_info(&self) -> Result<EpochInfo>;
  async fn validation_params(&self) -> Result<crate::config::ValidationParams>;
  async fn bandwidth_params(&self) -> Result<crate::config::BandwidthParams>;
  async fn participant(&self, address: &str) -> Result<ParticipantInfo>;
  async fn poc_batches_for_stage(&self, height: i64) -> Result<Vec<PocBatch>>;
  async fn inferences_for_epoch(
    &self,
    epoch_index: u64,
  ) -> Result<Vec<InferenceSummary>>;
  async fn inference(&self, inference_id: &str) -> Result<InferenceDetail>;
  async fn inference_validation_details(
    &self,
    inference_ids: &[String],
  ) -> Result<Vec<InferenceValidationDetails>>;
  async fn epoch_group_validations(
    &self,
    participant: &str,
    epoch_index: u64,
  ) -> Result<Vec<String>>;
  async fn grantees_by_message_type(
    &self,
    granter: &str,
    message_type: &str,
  ) -> Result<Vec<String>>;
  async fn hardware_nodes(&self, participant: &str)
    -> Result<Vec<HardwareNode>>;
  async fn ml_node_version(&self) -> Result<String>;
  async fn models_all(&self) -> Result<Vec<ModelInfo>>;
  async fn current_epoch_group_data(&self) -> Result<EpochGroupData>;
  async fn epoch_group_data_by_model(
    &self,
    model_id: &str,
  ) -> Result<EpochGroupData>;

  // transactions
  async fn submit_seed(&self, msg: MsgSubmitSeed) -> Result<()>;
  async fn claim_rewards(&self, msg: MsgClaimRewards) -> Result<()>;
  async fn submit_validation(&self, msg: MsgValidation) -> Result<()>;
  async fn submit_dealer_part(&self, msg: MsgSubmitDealerPart) -> Result<()>;
  async fn submit_group_key_validation_signature(
    &self,
    msg: MsgSubmitGroupKeyValidationSignature,
  ) -> Result<()>;
  async fn submit_partial_signature(
    &self,
    msg: MsgSubmitPartialSignature,
  ) -> Result<()>;
  async fn submit_hardware_diff(
    &self,
    msg: MsgSubmitHardwareDiff,
  ) -> Result<()>;
}
