//! Scriptable in-memory chain client for tests. State is plain data
//! behind a mutex; submitted messages are recorded for assertions.

use {
  crate::{
    chain::{types::*, ChainClient, Error, Result},
    config::{BandwidthParams, ValidationParams},
    epochs::{Epoch, EpochParams},
  },
  async_trait::async_trait,
  std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
  },
};

#[derive(Debug, Clone)]
pub enum Submitted {
  Seed(MsgSubmitSeed),
  Claim(MsgClaimRewards),
  Validation(MsgValidation),
  DealerPart(MsgSubmitDealerPart),
  GroupKeySignature(MsgSubmitGroupKeyValidationSignature),
  PartialSignature(MsgSubmitPartialSignature),
  HardwareDiff(MsgSubmitHardwareDiff),
}

#[derive(Default)]
pub struct MockChainState {
  pub height: i64,
  pub earliest_height: i64,
  pub catching_up: bool,
  pub epoch: Epoch,
  pub params: EpochParams,
  pub validation_params: ValidationParams,
  pub bandwidth_params: BandwidthParams,
  pub block_results: HashMap<i64, BlockResults>,
  /// Heights whose block_results query fails once, then succeeds.
  pub failing_heights: HashSet<i64>,
  pub batches: Vec<PocBatch>,
  pub inferences: HashMap<String, InferenceDetail>,
  pub summaries: Vec<InferenceSummary>,
  pub validation_details: HashMap<String, InferenceValidationDetails>,
  pub validated: Vec<String>,
  pub participant_power: HashMap<String, u64>,
  pub group_data: EpochGroupData,
  pub node_version: String,
}

#[derive(Default)]
pub struct MockChain {
  pub state: Mutex<MockChainState>,
  pub submitted: Mutex<Vec<Submitted>>,
}

impl MockChain {
  pub fn set_height(&self, height: i64) {
    self.state.lock().unwrap().height = height;
  }

  pub fn set_epoch(&self, epoch: Epoch, params: EpochParams) {
    let mut state = self.state.lock().unwrap();
    state.epoch = epoch;
    state.params = params;
  }

  pub fn submitted(&self) -> Vec<Submitted> {
    self.submitted.lock().unwrap().clone()
  }

  pub fn submitted_seeds(&self) -> Vec<MsgSubmitSeed> {
    self
      .submitted()
      .into_iter()
      .filter_map(|m| match m {
        Submitted::Seed(msg) => Some(msg),
        _ => None,
      })
      .collect()
  }

  pub fn submitted_validations(&self) -> Vec<MsgValidation> {
    self
      .submitted()
      .into_iter()
      .filter_map(|m| match m {
        Submitted::Validation(msg) => Some(msg),
        _ => None,
      })
      .collect()
  }

  pub fn submitted_claims(&self) -> Vec<MsgClaimRewards> {
    self
      .submitted()
      .into_iter()
      .filter_map(|m| match m {
        Submitted::Claim(msg) => Some(msg),
        _ => None,
      })
      .collect()
  }

  fn record(&self, msg: Submitted) {
    self.submitted.lock().unwrap().push(msg);
  }
}

#[async_trait]
impl ChainClient for MockChain {
  async fn status(&self) -> Result<NodeStatus> {
    let state = self.state.lock().unwrap();
    Ok(NodeStatus {
      latest_block_height: state.height,
      earliest_block_height: state.earliest_height.max(1),
      catching_up: state.catching_up,
    })
  }

  async fn block_results(&self, height: i64) -> Result<BlockResults> {
    let mut state = self.state.lock().unwrap();
    if state.failing_heights.remove(&height) {
      return Err(Error::Other(format!("scripted failure at {height}")));
    }
    Ok(
      state
        .block_results
        .get(&height)
        .cloned()
        .unwrap_or(BlockResults {
          height,
          txs_results: vec![],
        }),
    )
  }

  async fn epoch_info(&self) -> Result<EpochInfo> {
    let state = self.state.lock().unwrap();
    Ok(EpochInfo {
      latest_epoch: state.epoch,
      params: state.params,
    })
  }

  async fn validation_params(&self) -> Result<ValidationParams> {
    Ok(self.state.lock().unwrap().validation_params.clone())
  }

  async fn bandwidth_params(&self) -> Result<BandwidthParams> {
    Ok(self.state.lock().unwrap().bandwidth_params.clone())
  }

  async fn participant(&self, address: &str) -> Result<ParticipantInfo> {
    let state = self.state.lock().unwrap();
    Ok(ParticipantInfo {
      address: address.to_string(),
      power: state.participant_power.get(address).copied().unwrap_or(1),
    })
  }

  async fn poc_batches_for_stage(&self, height: i64) -> Result<Vec<PocBatch>> {
    let state = self.state.lock().unwrap();
    Ok(
      state
        .batches
        .iter()
        .filter(|b| b.poc_stage_start_block_height == height)
        .cloned()
        .collect(),
    )
  }

  async fn inferences_for_epoch(
    &self,
    epoch_index: u64,
  ) -> Result<Vec<InferenceSummary>> {
    let state = self.state.lock().unwrap();
    Ok(
      state
        .summaries
        .iter()
        .filter(|s| s.epoch_id == epoch_index)
        .cloned()
        .collect(),
    )
  }

  async fn inference(&self, inference_id: &str) -> Result<InferenceDetail> {
    let state = self.state.lock().unwrap();
    state
      .inferences
      .get(inference_id)
      .cloned()
      .ok_or_else(|| Error::Other(format!("unknown inference {inference_id}")))
  }

  async fn inference_validation_details(
    &self,
    inference_ids: &[String],
  ) -> Result<Vec<InferenceValidationDetails>> {
    let state = self.state.lock().unwrap();
    Ok(
      inference_ids
        .iter()
        .filter_map(|id| state.validation_details.get(id).cloned())
        .collect(),
    )
  }

  async fn epoch_group_validations(
    &self,
    _participant: &str,
    _epoch_index: u64,
  ) -> Result<Vec<String>> {
    Ok(self.state.lock().unwrap().validated.clone())
  }

  async fn grantees_by_message_type(
    &self,
    _granter: &str,
    _message_type: &str,
  ) -> Result<Vec<String>> {
    Ok(vec![])
  }

  async fn hardware_nodes(
    &self,
    _participant: &str,
  ) -> Result<Vec<HardwareNode>> {
    Ok(vec![])
  }

  async fn ml_node_version(&self) -> Result<String> {
    Ok(self.state.lock().unwrap().node_version.clone())
  }

  async fn models_all(&self) -> Result<Vec<ModelInfo>> {
    Ok(vec![])
  }

  async fn current_epoch_group_data(&self) -> Result<EpochGroupData> {
    Ok(self.state.lock().unwrap().group_data.clone())
  }

  async fn epoch_group_data_by_model(
    &self,
    _model_id: &str,
  ) -> Result<EpochGroupData> {
    Ok(self.state.lock().unwrap().group_data.clone())
  }

  async fn submit_seed(&self, msg: MsgSubmitSeed) -> Result<()> {
    self.record(Submitted::Seed(msg));
    Ok(())
  }

  async fn claim_rewards(&self, msg: MsgClaimRewards) -> Result<()> {
    self.record(Submitted::Claim(msg));
    Ok(())
  }

  async fn submit_validation(&self, msg: MsgValidation) -> Result<()> {
    self.record(Submitted::Validation(msg));
    Ok(())
  }

  async fn submit_dealer_part(&self, msg: MsgSubmitDealerPart) -> Result<()> {
    self.record(Submitted::DealerPart(msg));
    Ok(())
  }

  async fn submit_group_key_validation_signature(
    &self,
    msg: MsgSubmitGroupKeyValidationSignature,
  ) -> Result<()> {
    self.record(Submitted::GroupKeySignature(msg));
    Ok(())
  }

  async fn submit_partial_signature(
    &self,
    msg: MsgSubmitPartialSignature,
  ) -> Result<()> {
    self.record(Submitted::PartialSignature(msg));
    Ok(())
  }

  async fn submit_hardware_diff(
    &self,
    msg: MsgSubmitHardwareDiff,
  ) -> Result<()> {
    self.record(Submitted::HardwareDiff(msg));
    Ok(())
  }
}
