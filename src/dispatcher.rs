//! New-block dispatcher.
//!
//! One invocation per observed block: refresh chain-derived state,
//! advance the phase tracker, fire the stage actions whose exact
//! heights match, and drive the reconciliation cadence that converges
//! ML nodes onto the active phase.

use {
  crate::{
    broker::NodeBroker,
    chain::ChainClient,
    epochs::{self, BlockInfo, EpochState},
    keys::Pubkey,
    observer::BlockObserver,
    poc::PocOrchestrator,
    seeds::SeedManager,
    store::ConfigStore,
    validator::InferenceValidator,
  },
  std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
  },
  tracing::{debug, info, warn},
};

/// Reconciliation cadence per phase: PoC converges aggressively,
/// inference lazily; a time fallback covers sparse blocks.
const POC_BLOCK_INTERVAL: i64 = 1;
const INFERENCE_BLOCK_INTERVAL: i64 = 5;
const TIME_INTERVAL: Duration = Duration::from_secs(30);

struct PhaseMark {
  last_height: i64,
  last_time: Instant,
}

impl PhaseMark {
  fn new() -> Self {
    Self {
      last_height: 0,
      last_time: Instant::now(),
    }
  }

  fn due(&self, height: i64, block_interval: i64) -> bool {
    height - self.last_height >= block_interval
      || self.last_time.elapsed() >= TIME_INTERVAL
  }

  fn reset(&mut self, height: i64) {
    self.last_height = height;
    self.last_time = Instant::now();
  }
}

struct DispatchState {
  epoch_state: Option<EpochState>,
  poc_mark: PhaseMark,
  inference_mark: PhaseMark,
}

pub struct Dispatcher {
  chain: Arc<dyn ChainClient>,
  store: Arc<ConfigStore>,
  observer: Arc<BlockObserver>,
  broker: NodeBroker,
  seeds: Arc<SeedManager>,
  validator: Arc<InferenceValidator>,
  poc: Arc<PocOrchestrator>,
  me: Pubkey,
  state: Mutex<DispatchState>,
}

impl Dispatcher {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    chain: Arc<dyn ChainClient>,
    store: Arc<ConfigStore>,
    observer: Arc<BlockObserver>,
    broker: NodeBroker,
    seeds: Arc<SeedManager>,
    validator: Arc<InferenceValidator>,
    poc: Arc<PocOrchestrator>,
    me: Pubkey,
  ) -> Self {
    Self {
      chain,
      store,
      observer,
      broker,
      seeds,
      validator,
      poc,
      me,
      state: Mutex::new(DispatchState {
        epoch_state: None,
        poc_mark: PhaseMark::new(),
        inference_mark: PhaseMark::new(),
      }),
    }
  }

  pub fn epoch_state(&self) -> Option<EpochState> {
    self.state.lock().unwrap().epoch_state.clone()
  }

  /// Processes one block. Returns the tracked epoch state, or `None`
  /// when a chain query failed and the block was skipped.
  pub async fn process_new_block(&self, block: BlockInfo) -> Option<EpochState> {
    // chain-derived inputs first; any failure skips this block, the
    // next one retries
    let status = match self.chain.status().await {
      Ok(status) => status,
      Err(e) => {
        warn!(height = block.height, "status query failed, skipping: {e}");
        return None;
      }
    };
    let epoch_info = match self.chain.epoch_info().await {
      Ok(info) => info,
      Err(e) => {
        warn!(height = block.height, "epoch query failed, skipping: {e}");
        return None;
      }
    };

    // params write-through is best effort
    match self.chain.validation_params().await {
      Ok(params) => self.store.set_validation_params(params),
      Err(e) => debug!("validation params refresh failed: {e}"),
    }
    match self.chain.bandwidth_params().await {
      Ok(params) => self.store.set_bandwidth_params(params),
      Err(e) => debug!("bandwidth params refresh failed: {e}"),
    }

    if (status.latest_block_height - block.height).abs() > 1 {
      warn!(
        event_height = block.height,
        network_height = status.latest_block_height,
        "height skew between event and network"
      );
    }

    let epoch_state = epochs::track(
      block.clone(),
      epoch_info.latest_epoch,
      epoch_info.params,
      status.is_synced(),
    );
    self.state.lock().unwrap().epoch_state = Some(epoch_state.clone());
    if !epoch_state.is_synced {
      debug!(height = block.height, "chain node catching up, no transitions");
      return Some(epoch_state);
    }

    self.observer.update_status(block.height, true);
    self.sync_epoch_models(epoch_info.latest_epoch.epoch_index).await;

    let fired_node_action = self.fire_stage_actions(&block, &epoch_state).await;
    self.drive_reconciliation(&block, &epoch_state, fired_node_action);

    self.store.set_height(block.height);
    Some(epoch_state)
  }

  /// Mirrors the participant's model-subgroup membership onto the
  /// broker's per-node epoch model sets.
  async fn sync_epoch_models(&self, epoch_index: u64) {
    let data = match self.chain.current_epoch_group_data().await {
      Ok(data) => data,
      Err(e) => {
        debug!("epoch group query failed: {e}");
        return;
      }
    };
    let me = self.me.to_string();
    let models = data
      .sub_groups
      .iter()
      .filter(|g| g.members.contains(&me))
      .map(|g| g.model_id.clone())
      .collect();
    if let Err(e) = self.broker.update_node_with_epoch_data(epoch_index, models)
    {
      warn!("epoch model sync failed: {e}");
    }
  }

  /// Fires every stage action whose exact-height predicate matches.
  /// Returns whether any of them already commanded the nodes, in which
  /// case reconciliation stands down for this block.
  async fn fire_stage_actions(
    &self,
    block: &BlockInfo,
    epoch_state: &EpochState,
  ) -> bool {
    let epoch = epoch_state.latest_epoch;
    let params = &epoch_state.epoch_params;
    let height = block.height;
    let mut fired_node_action = false;

    if epoch.is_start_of_poc_stage(height) {
      info!(epoch = epoch.epoch_index, height, "poc stage starting");
      if let Err(e) = self.seeds.generate_seed_info(epoch.epoch_index).await {
        warn!("seed generation failed: {e}");
      }
      let seed = self.store.upcoming_seed().seed;
      if let Err(e) = self.broker.start_poc(epoch, block.clone(), seed) {
        warn!("start poc command failed: {e}");
      }
      fired_node_action = true;
    }

    if epoch.is_end_of_poc_stage(height, params) {
      info!(height, "poc generation ending");
      if let Err(e) = self.broker.init_validate(block.clone()) {
        warn!("init validate command failed: {e}");
      }
      fired_node_action = true;
    }

    if epoch.is_start_of_poc_validation(height, params) {
      info!(height, "poc validation window open");
      let poc = Arc::clone(&self.poc);
      let poc_start = epoch.poc_start_block_height;
      tokio::spawn(async move {
        poc.validate_received_batches(poc_start).await;
      });
    }

    if epoch.is_end_of_poc_validation(height, params) {
      info!(height, "poc validation over, inference up");
      if let Err(e) = self.broker.inference_up_all() {
        warn!("inference up command failed: {e}");
      }
      fired_node_action = true;
    }

    if epoch.is_set_new_validators(height, params) {
      info!(height, "validator set rotating, advancing seeds");
      self.seeds.change_current_seed();
    }

    if epoch.is_claim_money(height, params) {
      let previous_epoch = epoch.epoch_index.saturating_sub(1);
      info!(height, epoch = previous_epoch, "claim stage reached");
      let validator = Arc::clone(&self.validator);
      let seeds = Arc::clone(&self.seeds);
      let store = Arc::clone(&self.store);
      let epoch_length = params.epoch_length;
      // recovery strictly precedes the claim; the pair runs off the
      // block path because recovery can take a while
      tokio::spawn(async move {
        let previous_seed = seeds.get_seed_for_epoch(previous_epoch);
        validator
          .execute_missed_validation_recovery(
            previous_epoch,
            &previous_seed,
            epoch_length,
          )
          .await;
        if store.is_previous_seed_claimed() {
          debug!(epoch = previous_epoch, "rewards already claimed");
          return;
        }
        match seeds.request_money(previous_epoch).await {
          Ok(()) => store.mark_previous_seed_claimed(),
          Err(e) => warn!(epoch = previous_epoch, "claim failed: {e}"),
        }
      });
    }

    fired_node_action
  }

  fn drive_reconciliation(
    &self,
    block: &BlockInfo,
    epoch_state: &EpochState,
    fired_node_action: bool,
  ) {
    let phase = epoch_state.current_phase;
    if phase.is_wind_down() {
      return;
    }

    let mut state = self.state.lock().unwrap();
    let (mark, block_interval) = if phase.is_poc() {
      (&mut state.poc_mark, POC_BLOCK_INTERVAL)
    } else {
      (&mut state.inference_mark, INFERENCE_BLOCK_INTERVAL)
    };

    if fired_node_action {
      // a stage action just commanded every node, restart the cadence
      // from here
      mark.reset(block.height);
      return;
    }
    if !mark.due(block.height, block_interval) {
      return;
    }
    mark.reset(block.height);
    drop(state);

    let seed = self.store.upcoming_seed().seed;
    debug!(height = block.height, ?phase, "reconciliation tick");
    if let Err(e) = self.broker.reconcile(phase, block.clone(), seed) {
      warn!("reconcile command failed: {e}");
    }
  }
}
