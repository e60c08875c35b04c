use {
  super::client::{InitDto, MlNodeApi},
  crate::config::InferenceNodeConfig,
  serde::{Deserialize, Serialize},
  std::{collections::HashSet, sync::Arc},
};

/// Lifecycle of one ML worker as the broker sees it.
///
/// ```text
/// UNKNOWN -> STOPPED <-> INFERENCE
///                 \         \
///                  POC (Generating -> Validating)
///                 /
///          FAILED (on command error, retried by reconciliation)
/// ```
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
pub enum NodeStatus {
  #[default]
  Unknown,
  Stopped,
  Failed,
  Poc,
  Inference,
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
pub enum PocStatus {
  #[default]
  None,
  Generating,
  Validating,
}

/// Operator override. A disabled node is excluded from PoC and
/// inference scheduling; `epoch` records when the override was
/// applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminState {
  pub enabled: bool,
  pub epoch: u64,
}

impl Default for AdminState {
  fn default() -> Self {
    Self {
      enabled: true,
      epoch: 0,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
  pub intended_status: NodeStatus,
  pub current_status: NodeStatus,
  pub poc_current_status: PocStatus,
  pub admin_state: AdminState,
  /// Models this node serves in the current epoch (its configured
  /// models intersected with the participant's epoch subgroups).
  pub epoch_models: HashSet<String>,
  pub last_init: Option<InitDto>,
  #[serde(skip)]
  pub locked: bool,
}

/// Broker-owned view of a worker. Mutated only inside the broker's
/// command loop.
pub struct ManagedNode {
  pub config: InferenceNodeConfig,
  pub state: NodeState,
  pub client: Arc<dyn MlNodeApi>,
}

impl ManagedNode {
  pub fn new(
    config: InferenceNodeConfig,
    client: Arc<dyn MlNodeApi>,
  ) -> Self {
    Self {
      config,
      state: NodeState {
        current_status: NodeStatus::Stopped,
        intended_status: NodeStatus::Unknown,
        ..Default::default()
      },
      client,
    }
  }

  /// Whether epoch scheduling may touch this node at all.
  pub fn participates(&self) -> bool {
    self.state.admin_state.enabled
  }

  pub fn supports_model(&self, model: &str) -> bool {
    self.state.epoch_models.contains(model)
      || self.config.models.contains_key(model)
  }
}

/// Owned copy of a node's config and state, for observers outside the
/// command loop.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
  pub config: InferenceNodeConfig,
  pub state: NodeState,
}

impl From<&ManagedNode> for NodeSnapshot {
  fn from(node: &ManagedNode) -> Self {
    Self {
      config: node.config.clone(),
      state: node.state.clone(),
    }
  }
}
