//! ML node broker.
//!
//! All mutations of worker state flow through one serialized command
//! loop: a single writer owns every [`ManagedNode`], so command
//! ordering per node is total and no lock juggling is needed. Errors
//! from worker calls park the node in FAILED; the dispatcher's
//! reconciliation cadence retries from there.

pub mod client;
pub mod manager;
pub mod node;

use {
  crate::{
    chain::{
      types::{HardwareNode, MsgSubmitHardwareDiff},
      ChainClient,
    },
    config::{Hardware, InferenceNodeConfig, MlNodeKeyConfig},
    epochs::{BlockInfo, Epoch, EpochPhase},
    keys::Pubkey,
    store::ConfigStore,
  },
  client::{InitDto, MlNodeApi, MlNodeClientFactory},
  indexmap::IndexMap,
  node::{ManagedNode, NodeSnapshot, NodeStatus, PocStatus},
  std::{collections::HashSet, sync::Arc},
  tokio::sync::{mpsc, oneshot, watch},
  tracing::{debug, info, warn},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("no nodes available for model {0}")]
  NoNodesAvailable(String),

  #[error("unknown node {0}")]
  NodeNotFound(String),

  #[error("broker is shut down")]
  Closed,
}

enum Command {
  LoadNode(InferenceNodeConfig),
  SetNodes(Vec<InferenceNodeConfig>),
  SetAdminState {
    node_id: String,
    enabled: bool,
    epoch: u64,
    reply: oneshot::Sender<Result<(), Error>>,
  },
  UpdateHardware {
    node_id: String,
    hardware: Vec<Hardware>,
    reply: oneshot::Sender<Result<(), Error>>,
  },
  StartPoc {
    epoch: Epoch,
    block: BlockInfo,
    seed: i64,
  },
  InitValidate {
    block: BlockInfo,
  },
  InferenceUpAll,
  UpdateEpochData {
    epoch_index: u64,
    models: HashSet<String>,
  },
  Reconcile {
    phase: EpochPhase,
    block: BlockInfo,
    seed: i64,
  },
  LockNode {
    model: String,
    reply: oneshot::Sender<Result<LockedNode, Error>>,
  },
  Release {
    node_id: String,
  },
  Snapshot {
    reply: oneshot::Sender<Vec<NodeSnapshot>>,
  },
  Clients {
    reply: oneshot::Sender<Vec<(String, Arc<dyn MlNodeApi>)>>,
  },
  ValidatingClients {
    reply: oneshot::Sender<Vec<(String, Arc<dyn MlNodeApi>)>>,
  },
}

/// A node reserved for exclusive use. Holding this keeps the node out
/// of reconciliation; dropping it releases the node back to the
/// broker.
pub struct LockedNode {
  pub node_id: String,
  pub client: Arc<dyn MlNodeApi>,
  release: mpsc::UnboundedSender<Command>,
}

impl Drop for LockedNode {
  fn drop(&mut self) {
    let _ = self.release.send(Command::Release {
      node_id: self.node_id.clone(),
    });
  }
}

/// Cloneable handle to the broker loop.
#[derive(Clone)]
pub struct NodeBroker {
  tx: mpsc::UnboundedSender<Command>,
}

impl NodeBroker {
  pub fn spawn(
    store: Arc<ConfigStore>,
    chain: Arc<dyn ChainClient>,
    factory: Arc<dyn MlNodeClientFactory>,
    me: Pubkey,
    callback_url: String,
    mut shutdown: watch::Receiver<bool>,
  ) -> (Self, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut task = BrokerTask {
      nodes: IndexMap::new(),
      store,
      chain,
      factory,
      me,
      callback_url,
      command_tx: tx.clone(),
    };
    let handle = tokio::spawn(async move {
      loop {
        tokio::select! {
          command = rx.recv() => match command {
            Some(command) => task.execute(command).await,
            None => break,
          },
          _ = shutdown.changed() => break,
        }
      }
      debug!("broker command loop stopped");
    });
    (Self { tx }, handle)
  }

  fn send(&self, command: Command) -> Result<(), Error> {
    self.tx.send(command).map_err(|_| Error::Closed)
  }

  pub fn load_node(&self, config: InferenceNodeConfig) -> Result<(), Error> {
    self.send(Command::LoadNode(config))
  }

  pub fn set_nodes(
    &self,
    nodes: Vec<InferenceNodeConfig>,
  ) -> Result<(), Error> {
    self.send(Command::SetNodes(nodes))
  }

  pub async fn set_admin_state(
    &self,
    node_id: &str,
    enabled: bool,
    epoch: u64,
  ) -> Result<(), Error> {
    let (reply, response) = oneshot::channel();
    self.send(Command::SetAdminState {
      node_id: node_id.to_string(),
      enabled,
      epoch,
      reply,
    })?;
    response.await.map_err(|_| Error::Closed)?
  }

  pub async fn update_node_hardware(
    &self,
    node_id: &str,
    hardware: Vec<Hardware>,
  ) -> Result<(), Error> {
    let (reply, response) = oneshot::channel();
    self.send(Command::UpdateHardware {
      node_id: node_id.to_string(),
      hardware,
      reply,
    })?;
    response.await.map_err(|_| Error::Closed)?
  }

  pub fn start_poc(
    &self,
    epoch: Epoch,
    block: BlockInfo,
    seed: i64,
  ) -> Result<(), Error> {
    self.send(Command::StartPoc { epoch, block, seed })
  }

  pub fn init_validate(&self, block: BlockInfo) -> Result<(), Error> {
    self.send(Command::InitValidate { block })
  }

  pub fn inference_up_all(&self) -> Result<(), Error> {
    self.send(Command::InferenceUpAll)
  }

  pub fn update_node_with_epoch_data(
    &self,
    epoch_index: u64,
    models: HashSet<String>,
  ) -> Result<(), Error> {
    self.send(Command::UpdateEpochData {
      epoch_index,
      models,
    })
  }

  pub fn reconcile(
    &self,
    phase: EpochPhase,
    block: BlockInfo,
    seed: i64,
  ) -> Result<(), Error> {
    self.send(Command::Reconcile { phase, block, seed })
  }

  /// Reserves an idle inference node serving `model` and returns a
  /// guard for it. Fails with [`Error::NoNodesAvailable`] when no such
  /// node is currently free.
  pub async fn lock_node(&self, model: &str) -> Result<LockedNode, Error> {
    let (reply, response) = oneshot::channel();
    self.send(Command::LockNode {
      model: model.to_string(),
      reply,
    })?;
    response.await.map_err(|_| Error::Closed)?
  }

  pub async fn snapshot(&self) -> Result<Vec<NodeSnapshot>, Error> {
    let (reply, response) = oneshot::channel();
    self.send(Command::Snapshot { reply })?;
    response.await.map_err(|_| Error::Closed)
  }

  /// Clients of every registered node, in registration order.
  pub async fn clients(
    &self,
  ) -> Result<Vec<(String, Arc<dyn MlNodeApi>)>, Error> {
    let (reply, response) = oneshot::channel();
    self.send(Command::Clients { reply })?;
    response.await.map_err(|_| Error::Closed)
  }

  /// Clients of all nodes currently validating PoC batches, in
  /// registration order.
  pub async fn validating_clients(
    &self,
  ) -> Result<Vec<(String, Arc<dyn MlNodeApi>)>, Error> {
    let (reply, response) = oneshot::channel();
    self.send(Command::ValidatingClients { reply })?;
    response.await.map_err(|_| Error::Closed)
  }
}

struct BrokerTask {
  nodes: IndexMap<String, ManagedNode>,
  store: Arc<ConfigStore>,
  chain: Arc<dyn ChainClient>,
  factory: Arc<dyn MlNodeClientFactory>,
  me: Pubkey,
  callback_url: String,
  command_tx: mpsc::UnboundedSender<Command>,
}

impl BrokerTask {
  async fn execute(&mut self, command: Command) {
    match command {
      Command::LoadNode(config) => self.load_node(config),
      Command::SetNodes(nodes) => self.set_nodes(nodes),
      Command::SetAdminState {
        node_id,
        enabled,
        epoch,
        reply,
      } => {
        let result = self.set_admin_state(&node_id, enabled, epoch);
        let _ = reply.send(result);
      }
      Command::UpdateHardware {
        node_id,
        hardware,
        reply,
      } => {
        let result = self.update_hardware(&node_id, hardware).await;
        let _ = reply.send(result);
      }
      Command::StartPoc { epoch, block, seed } => {
        self.start_poc(epoch, block, seed).await
      }
      Command::InitValidate { block } => self.init_validate(block).await,
      Command::InferenceUpAll => self.inference_up_all().await,
      Command::UpdateEpochData {
        epoch_index,
        models,
      } => self.update_epoch_data(epoch_index, models),
      Command::Reconcile { phase, block, seed } => {
        self.reconcile(phase, block, seed).await
      }
      Command::LockNode { model, reply } => {
        let _ = reply.send(self.lock_node(&model));
      }
      Command::Release { node_id } => {
        if let Some(node) = self.nodes.get_mut(&node_id) {
          node.state.locked = false;
        }
      }
      Command::Snapshot { reply } => {
        let _ = reply.send(self.nodes.values().map(NodeSnapshot::from).collect());
      }
      Command::Clients { reply } => {
        let clients = self
          .nodes
          .values()
          .map(|n| (n.config.id.clone(), Arc::clone(&n.client)))
          .collect();
        let _ = reply.send(clients);
      }
      Command::ValidatingClients { reply } => {
        let clients = self
          .nodes
          .values()
          .filter(|n| n.state.poc_current_status == PocStatus::Validating)
          .map(|n| (n.config.id.clone(), Arc::clone(&n.client)))
          .collect();
        let _ = reply.send(clients);
      }
    }
  }

  fn load_node(&mut self, config: InferenceNodeConfig) {
    let client = self
      .factory
      .client(&config, &self.store.current_node_version());
    info!(node = %config.id, "registering ml node");
    self
      .nodes
      .insert(config.id.clone(), ManagedNode::new(config, client));
  }

  /// Replaces the node set. State of surviving nodes is preserved so a
  /// config refresh does not reset their lifecycle.
  fn set_nodes(&mut self, configs: Vec<InferenceNodeConfig>) {
    let mut next = IndexMap::new();
    for config in configs {
      let client = self
        .factory
        .client(&config, &self.store.current_node_version());
      let node = match self.nodes.swap_remove(&config.id) {
        Some(mut existing) => {
          existing.config = config.clone();
          existing.client = client;
          existing
        }
        None => ManagedNode::new(config.clone(), client),
      };
      next.insert(config.id, node);
    }
    for dropped in self.nodes.keys() {
      info!(node = %dropped, "dropping ml node");
    }
    self.nodes = next;
    self
      .store
      .set_nodes(self.nodes.values().map(|n| n.config.clone()).collect());
  }

  fn set_admin_state(
    &mut self,
    node_id: &str,
    enabled: bool,
    epoch: u64,
  ) -> Result<(), Error> {
    let node = self
      .nodes
      .get_mut(node_id)
      .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
    node.state.admin_state = node::AdminState { enabled, epoch };
    info!(node = %node_id, enabled, epoch, "admin state changed");
    Ok(())
  }

  async fn update_hardware(
    &mut self,
    node_id: &str,
    hardware: Vec<Hardware>,
  ) -> Result<(), Error> {
    let node = self
      .nodes
      .get_mut(node_id)
      .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;
    if node.config.hardware == hardware {
      return Ok(());
    }
    node.config.hardware = hardware.clone();
    self.store.upsert_node_config(node.config.clone());

    // best effort: a failed diff submission retries on the next sync
    let diff = MsgSubmitHardwareDiff {
      nodes: vec![HardwareNode {
        local_id: node_id.to_string(),
        hardware,
      }],
    };
    if let Err(e) = self.chain.submit_hardware_diff(diff).await {
      warn!(node = %node_id, "hardware diff submission failed: {e}");
    }
    Ok(())
  }

  async fn start_poc(&mut self, epoch: Epoch, block: BlockInfo, seed: i64) {
    let key_config = self.store.ml_node_key_config();
    for node in self.nodes.values_mut() {
      if !node.participates() || node.state.locked {
        debug!(node = %node.config.id, "excluded from poc generation");
        continue;
      }
      node.state.intended_status = NodeStatus::Poc;
      let dto = build_init_dto(
        &self.me,
        &self.callback_url,
        &key_config,
        node,
        &block,
        seed,
      );
      match node.client.init_generate(&dto).await {
        Ok(()) => {
          info!(node = %node.config.id, epoch = epoch.epoch_index, "poc generation started");
          node.state.current_status = NodeStatus::Poc;
          node.state.poc_current_status = PocStatus::Generating;
          node.state.last_init = Some(dto);
        }
        Err(e) => {
          warn!(node = %node.config.id, "init_generate failed: {e}");
          node.state.current_status = NodeStatus::Failed;
        }
      }
    }
  }

  async fn init_validate(&mut self, block: BlockInfo) {
    let key_config = self.store.ml_node_key_config();
    for node in self.nodes.values_mut() {
      if !node.participates() || node.state.locked {
        continue;
      }
      let generating =
        node.state.poc_current_status == PocStatus::Generating;
      let failed_poc = node.state.current_status == NodeStatus::Failed
        && node.state.intended_status == NodeStatus::Poc;
      if !generating && !failed_poc {
        continue;
      }
      let dto = build_init_dto(
        &self.me,
        &self.callback_url,
        &key_config,
        node,
        &block,
        0,
      );
      match node.client.init_validate(&dto).await {
        Ok(()) => {
          info!(node = %node.config.id, "poc validation started");
          node.state.current_status = NodeStatus::Poc;
          node.state.poc_current_status = PocStatus::Validating;
          node.state.last_init = Some(dto);
        }
        Err(e) => {
          warn!(node = %node.config.id, "init_validate failed: {e}");
          node.state.current_status = NodeStatus::Failed;
        }
      }
    }
  }

  async fn inference_up_all(&mut self) {
    let key_config = self.store.ml_node_key_config();
    for node in self.nodes.values_mut() {
      if !node.participates() || node.state.locked {
        continue;
      }
      node.state.intended_status = NodeStatus::Inference;
      let dto = build_init_dto(
        &self.me,
        &self.callback_url,
        &key_config,
        node,
        &BlockInfo::default(),
        0,
      );
      // other services wind down before the inference server starts
      if let Err(e) = node.client.stop().await {
        debug!(node = %node.config.id, "stop before inference_up: {e}");
      }
      match node.client.inference_up(&dto).await {
        Ok(()) => {
          info!(node = %node.config.id, "inference serving started");
          node.state.current_status = NodeStatus::Inference;
          node.state.poc_current_status = PocStatus::None;
          node.state.last_init = Some(dto);
        }
        Err(e) => {
          warn!(node = %node.config.id, "inference_up failed: {e}");
          node.state.current_status = NodeStatus::Failed;
        }
      }
    }
  }

  fn update_epoch_data(&mut self, epoch_index: u64, models: HashSet<String>) {
    for node in self.nodes.values_mut() {
      node.state.epoch_models = node
        .config
        .models
        .keys()
        .filter(|m| models.contains(*m))
        .cloned()
        .collect();
      debug!(
        node = %node.config.id,
        epoch = epoch_index,
        models = node.state.epoch_models.len(),
        "epoch models synced"
      );
    }
  }

  /// Converges every participating node towards the target state of
  /// the active phase. Only nodes that are off target receive calls,
  /// so a healthy fleet makes this a no-op.
  async fn reconcile(&mut self, phase: EpochPhase, block: BlockInfo, seed: i64) {
    let key_config = self.store.ml_node_key_config();
    for node in self.nodes.values_mut() {
      if !node.participates() || node.state.locked {
        continue;
      }
      match phase {
        EpochPhase::PoCGenerate => {
          if node.state.current_status == NodeStatus::Poc
            && node.state.poc_current_status == PocStatus::Generating
          {
            continue;
          }
          node.state.intended_status = NodeStatus::Poc;
          let dto = build_init_dto(
            &self.me,
            &self.callback_url,
            &key_config,
            node,
            &block,
            seed,
          );
          match node.client.init_generate(&dto).await {
            Ok(()) => {
              info!(node = %node.config.id, "poc generation recovered");
              node.state.current_status = NodeStatus::Poc;
              node.state.poc_current_status = PocStatus::Generating;
              node.state.last_init = Some(dto);
            }
            Err(e) => {
              warn!(node = %node.config.id, "init_generate retry failed: {e}");
              node.state.current_status = NodeStatus::Failed;
            }
          }
        }
        EpochPhase::PoCValidate => {
          if node.state.current_status == NodeStatus::Poc
            && node.state.poc_current_status == PocStatus::Validating
          {
            continue;
          }
          if node.state.current_status != NodeStatus::Poc
            && node.state.current_status != NodeStatus::Failed
          {
            // a node that never entered this epoch's PoC has nothing
            // to validate
            continue;
          }
          let dto = build_init_dto(
            &self.me,
            &self.callback_url,
            &key_config,
            node,
            &block,
            0,
          );
          match node.client.init_validate(&dto).await {
            Ok(()) => {
              info!(node = %node.config.id, "poc validation recovered");
              node.state.current_status = NodeStatus::Poc;
              node.state.poc_current_status = PocStatus::Validating;
              node.state.last_init = Some(dto);
            }
            Err(e) => {
              warn!(node = %node.config.id, "init_validate retry failed: {e}");
              node.state.current_status = NodeStatus::Failed;
            }
          }
        }
        EpochPhase::Inference => {
          if node.state.current_status == NodeStatus::Inference {
            continue;
          }
          node.state.intended_status = NodeStatus::Inference;
          let dto = build_init_dto(
            &self.me,
            &self.callback_url,
            &key_config,
            node,
            &block,
            0,
          );
          if let Err(e) = node.client.stop().await {
            debug!(node = %node.config.id, "stop before inference_up: {e}");
          }
          match node.client.inference_up(&dto).await {
            Ok(()) => {
              info!(node = %node.config.id, "inference serving recovered");
              node.state.current_status = NodeStatus::Inference;
              node.state.poc_current_status = PocStatus::None;
              node.state.last_init = Some(dto);
            }
            Err(e) => {
              warn!(node = %node.config.id, "inference_up retry failed: {e}");
              node.state.current_status = NodeStatus::Failed;
            }
          }
        }
        EpochPhase::PoCGenerateWindDown | EpochPhase::PoCValidateWindDown => {}
      }
    }
  }

  fn lock_node(&mut self, model: &str) -> Result<LockedNode, Error> {
    let candidate = self.nodes.values_mut().find(|node| {
      node.participates()
        && !node.state.locked
        && node.state.current_status == NodeStatus::Inference
        && node.supports_model(model)
    });
    match candidate {
      Some(node) => {
        node.state.locked = true;
        debug!(node = %node.config.id, model, "node locked");
        Ok(LockedNode {
          node_id: node.config.id.clone(),
          client: Arc::clone(&node.client),
          release: self.command_tx.clone(),
        })
      }
      None => Err(Error::NoNodesAvailable(model.to_string())),
    }
  }
}

fn build_init_dto(
  me: &Pubkey,
  callback_url: &str,
  key_config: &Option<MlNodeKeyConfig>,
  node: &ManagedNode,
  block: &BlockInfo,
  seed: i64,
) -> InitDto {
  let models = if node.state.epoch_models.is_empty() {
    node.config.models.clone()
  } else {
    node
      .config
      .models
      .iter()
      .filter(|(m, _)| node.state.epoch_models.contains(*m))
      .map(|(m, args)| (m.clone(), args.clone()))
      .collect()
  };
  InitDto {
    node_id: node.config.id.clone(),
    block_height: block.height,
    block_hash: block.hash.clone(),
    public_key: me.to_string(),
    seed,
    models,
    callback_url: callback_url.to_string(),
    key_config: key_config.clone(),
  }
}
