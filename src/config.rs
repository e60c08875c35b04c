use {
  indexmap::IndexMap,
  serde::{Deserialize, Serialize},
  std::path::{Path, PathBuf},
  thiserror::Error,
};

/// Prefix for environment overrides. `DAPI_CHAIN_NODE__URL` overrides
/// the `chain_node.url` key of the YAML file, the double underscore
/// separating nesting levels.
const ENV_PREFIX: &str = "DAPI_";

#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Io(#[from] std::io::Error),

  #[error("malformed config: {0}")]
  Yaml(#[from] serde_yaml::Error),

  #[error("malformed node config: {0}")]
  Json(#[from] serde_json::Error),
}

/// A locally managed ML worker node.
///
/// The inference service and the PoC service of a worker live behind
/// separate `(segment, port)` pairs on the same host. Values of this
/// type are owned by the broker at runtime; everyone else works on
/// copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceNodeConfig {
  pub id: String,
  pub host: String,
  #[serde(default)]
  pub inference_segment: String,
  pub inference_port: u16,
  #[serde(default)]
  pub poc_segment: String,
  pub poc_port: u16,
  #[serde(default = "default_max_concurrent")]
  pub max_concurrent: u32,
  #[serde(default)]
  pub models: IndexMap<String, Vec<String>>,
  #[serde(default)]
  pub hardware: Vec<Hardware>,
}

fn default_max_concurrent() -> u32 {
  1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hardware {
  #[serde(rename = "type")]
  pub kind: String,
  pub count: u32,
}

/// A per-epoch random seed together with the signature that committed
/// it to the chain. A zero seed marks an empty slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeedInfo {
  pub seed: i64,
  pub epoch_index: u64,
  pub signature: String,
  pub claimed: bool,
}

impl SeedInfo {
  pub fn is_empty(&self) -> bool {
    self.seed == 0
  }
}

/// Scheduled binary upgrade announced on chain. When the local height
/// reaches `height` the process writes `upgrade-info.json` and exits
/// so the supervisor can swap binaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradePlan {
  pub name: String,
  pub height: i64,
  #[serde(default)]
  pub binaries: IndexMap<String, String>,
  #[serde(default)]
  pub node_version: String,
}

/// Chain-published validation parameters, cached locally so sampling
/// keeps working across brief chain outages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationParams {
  pub validations_per_inference: f64,
  pub validation_sample_size: usize,
  pub expiration_blocks: i64,
}

impl Default for ValidationParams {
  fn default() -> Self {
    Self {
      validations_per_inference: 1.0,
      validation_sample_size: 200,
      expiration_blocks: 120,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BandwidthParams {
  pub estimated_limits_per_block_kb: u64,
  pub kb_per_input_token: f64,
  pub kb_per_output_token: f64,
}

/// Key material handed to ML nodes so their gRPC callbacks can be
/// authenticated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MlNodeKeyConfig {
  pub key_name: String,
  pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  pub port: u16,
  pub poc_callback_url: String,
  pub ml_grpc_callback_address: String,
  pub public_url: String,
  pub public_server_port: u16,
  pub ml_server_port: u16,
  pub admin_server_port: u16,
  pub ml_grpc_server_port: u16,
  pub test_mode: bool,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      port: 9000,
      poc_callback_url: String::new(),
      ml_grpc_callback_address: String::new(),
      public_url: String::new(),
      public_server_port: 9010,
      ml_server_port: 9020,
      admin_server_port: 9030,
      ml_grpc_server_port: 9040,
      test_mode: false,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainNodeConfig {
  pub url: String,
  pub chain_id: String,
  pub is_genesis: bool,
  pub seed_api_url: String,
  pub account_public_key: String,
  pub signer_key_name: String,
  pub keyring_backend: String,
  pub keyring_dir: String,
}

impl Default for ChainNodeConfig {
  fn default() -> Self {
    Self {
      url: "http://localhost:26657".into(),
      chain_id: String::new(),
      is_genesis: false,
      seed_api_url: String::new(),
      account_public_key: String::new(),
      signer_key_name: String::new(),
      keyring_backend: "file".into(),
      keyring_dir: String::new(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
  pub host: String,
  pub port: u16,
}

impl Default for NatsConfig {
  fn default() -> Self {
    Self {
      host: "localhost".into(),
      port: 4222,
    }
  }
}

/// The whole participant configuration.
///
/// The static sections (`api`, `chain_node`, `nats`) are owned by the
/// YAML file the operator edits. Everything else is dynamic state that
/// the embedded database owns; those fields hydrate from the database
/// on startup and are zeroed whenever the YAML file is rewritten, so
/// the file never turns into a second source of truth for them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
  pub api: ApiConfig,
  pub chain_node: ChainNodeConfig,
  pub nats: NatsConfig,

  // dynamic fields, database-owned
  pub nodes: Vec<InferenceNodeConfig>,
  pub current_seed: SeedInfo,
  pub previous_seed: SeedInfo,
  pub upcoming_seed: SeedInfo,
  pub current_height: i64,
  pub last_processed_height: i64,
  pub upgrade_plan: Option<UpgradePlan>,
  pub ml_node_key_config: Option<MlNodeKeyConfig>,
  pub validation_params: ValidationParams,
  pub bandwidth_params: BandwidthParams,
  pub current_node_version: String,
  pub last_used_version: String,
  pub merged_node_config: bool,
}

impl AppConfig {
  /// Reads the YAML file (an absent file yields the defaults) and then
  /// applies `DAPI_*__*` environment overrides on top of it.
  pub fn load(path: &Path) -> Result<Self, Error> {
    let mut value = match std::fs::read_to_string(path) {
      Ok(contents) => serde_yaml::from_str(&contents)?,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        serde_yaml::Value::Mapping(Default::default())
      }
      Err(e) => return Err(e.into()),
    };
    apply_env_overrides(&mut value, std::env::vars());
    Ok(serde_yaml::from_value(value)?)
  }

  /// Writes the configuration back to disk with every dynamic field
  /// reset to its zero value. The database is the only durable home of
  /// dynamic state.
  pub fn write(&self, path: &Path) -> Result<(), Error> {
    let mut copy = self.clone();
    copy.nodes = Vec::new();
    copy.current_seed = SeedInfo::default();
    copy.previous_seed = SeedInfo::default();
    copy.upcoming_seed = SeedInfo::default();
    copy.current_height = 0;
    copy.last_processed_height = 0;
    copy.upgrade_plan = None;
    copy.ml_node_key_config = None;
    copy.validation_params = ValidationParams::default();
    copy.bandwidth_params = BandwidthParams::default();
    copy.current_node_version = String::new();
    copy.last_used_version = String::new();
    copy.merged_node_config = false;

    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_yaml::to_string(&copy)?)?;
    Ok(())
  }
}

/// Folds `DAPI_SECTION__KEY=value` environment variables into the
/// parsed YAML tree before deserialization. Scalars are parsed as
/// bool, integer or float when they look like one, strings otherwise.
fn apply_env_overrides(
  root: &mut serde_yaml::Value,
  vars: impl Iterator<Item = (String, String)>,
) {
  use serde_yaml::Value;

  for (key, value) in vars {
    let Some(path) = key.strip_prefix(ENV_PREFIX) else {
      continue;
    };
    let segments: Vec<String> =
      path.split("__").map(|s| s.to_lowercase()).collect();
    if segments.iter().any(|s| s.is_empty()) {
      continue;
    }

    let mut cursor = &mut *root;
    for segment in &segments[..segments.len() - 1] {
      if !cursor.is_mapping() {
        *cursor = Value::Mapping(Default::default());
      }
      let map = cursor.as_mapping_mut().unwrap();
      let key = Value::String(segment.clone());
      if !map.contains_key(&key) {
        map.insert(key.clone(), Value::Mapping(Default::default()));
      }
      cursor = map.get_mut(&key).unwrap();
    }

    let leaf = Value::String(segments.last().unwrap().clone());
    let parsed = parse_scalar(&value);
    if !cursor.is_mapping() {
      *cursor = Value::Mapping(Default::default());
    }
    cursor.as_mapping_mut().unwrap().insert(leaf, parsed);
  }
}

fn parse_scalar(raw: &str) -> serde_yaml::Value {
  use serde_yaml::Value;
  if let Ok(b) = raw.parse::<bool>() {
    return Value::Bool(b);
  }
  if let Ok(i) = raw.parse::<i64>() {
    return Value::Number(i.into());
  }
  if let Ok(f) = raw.parse::<f64>() {
    return Value::Number(serde_yaml::Number::from(f));
  }
  Value::String(raw.to_string())
}

/// Parses the standalone node-config file: a JSON array of
/// [`InferenceNodeConfig`] entries that replaces the node set on
/// first-run merges.
pub fn read_node_config(
  path: &PathBuf,
) -> Result<Vec<InferenceNodeConfig>, Error> {
  let contents = std::fs::read_to_string(path)?;
  Ok(serde_json::from_str(&contents)?)
}
