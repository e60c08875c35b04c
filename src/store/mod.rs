//! Dynamic configuration store.
//!
//! Everything the node mutates at runtime (the ML node set, seed
//! lifecycle, processed heights, cached chain params, the upgrade
//! plan) lives in an embedded sqlite database next to an in-memory
//! copy. Reads are served from memory, writes mutate memory first and
//! reach the database on the next flush. The database always wins over
//! YAML-derived values during hydration, so operator edits to dynamic
//! fields in the config file have no effect once a database exists.

use {
  crate::config::{
    AppConfig,
    BandwidthParams,
    InferenceNodeConfig,
    MlNodeKeyConfig,
    SeedInfo,
    UpgradePlan,
    ValidationParams,
  },
  sqlx::{
    sqlite::{
      SqliteConnectOptions,
      SqliteJournalMode,
      SqlitePool,
      SqlitePoolOptions,
      SqliteRow,
    },
    Executor,
    Row,
    Sqlite,
    Transaction,
  },
  std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
  },
  tokio::sync::{watch, RwLock},
  tracing::{debug, error, info, warn},
};

const SCHEMA: &str = include_str!("./schemas/0.1.0.sql");

mod keys {
  pub const CONFIG_MIGRATED: &str = "config_migrated";
  pub const NODE_CONFIG_MERGED: &str = "node_config_merged";
  pub const CURRENT_HEIGHT: &str = "current_height";
  pub const LAST_PROCESSED_HEIGHT: &str = "last_processed_height";
  pub const UPGRADE_PLAN: &str = "upgrade_plan";
  pub const VALIDATION_PARAMS: &str = "validation_params";
  pub const BANDWIDTH_PARAMS: &str = "bandwidth_params";
  pub const ML_NODE_KEY_CONFIG: &str = "ml_node_key_config";
  pub const CURRENT_NODE_VERSION: &str = "current_node_version";
  pub const LAST_USED_VERSION: &str = "last_used_version";
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("database unavailable: {0}")]
  Db(#[from] sqlx::Error),

  #[error("config migration conflict: {0}")]
  MigrationConflict(String),

  #[error("refusing to replace an active seed with an empty one")]
  SeedRowInvalid,

  #[error(transparent)]
  Config(#[from] crate::config::Error),

  #[error(transparent)]
  Json(#[from] serde_json::Error),

  #[error(transparent)]
  Io(#[from] std::io::Error),
}

/// The three seed slots of the rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedSlot {
  Current,
  Previous,
  Upcoming,
}

impl SeedSlot {
  const ALL: [SeedSlot; 3] =
    [SeedSlot::Previous, SeedSlot::Current, SeedSlot::Upcoming];

  fn as_str(&self) -> &'static str {
    match self {
      SeedSlot::Current => "current",
      SeedSlot::Previous => "previous",
      SeedSlot::Upcoming => "upcoming",
    }
  }
}

pub struct ConfigStore {
  pool: RwLock<SqlitePool>,
  state: Mutex<AppConfig>,
  db_path: PathBuf,
  dump_path: PathBuf,
}

impl ConfigStore {
  /// Opens (creating if needed) the database at `db_path`, bootstraps
  /// the schema and installs `initial` as the in-memory state. The
  /// caller is expected to run [`migrate`](Self::migrate) and
  /// [`hydrate`](Self::hydrate) before anything reads from the store.
  pub async fn open(db_path: &Path, initial: AppConfig) -> Result<Self, Error> {
    if let Some(parent) = db_path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    let pool = connect(db_path).await?;
    let dump_path = db_path
      .parent()
      .unwrap_or_else(|| Path::new("."))
      .join("config-dump.json");

    Ok(Self {
      pool: RwLock::new(pool),
      state: Mutex::new(initial),
      db_path: db_path.to_owned(),
      dump_path,
    })
  }

  async fn pool(&self) -> SqlitePool {
    self.pool.read().await.clone()
  }

  /// Pings the database and, when the ping fails, reopens the
  /// connection and re-runs the schema bootstrap before swapping the
  /// handle.
  pub async fn ensure_available(&self) -> Result<(), Error> {
    let pool = self.pool().await;
    if sqlx::query("SELECT 1").execute(&pool).await.is_ok() {
      return Ok(());
    }
    warn!("database ping failed, reopening {}", self.db_path.display());
    let fresh = connect(&self.db_path).await?;
    *self.pool.write().await = fresh;
    Ok(())
  }

  /// One-time import of YAML-derived values into the database, gated
  /// by the `config_migrated` flag. Node rows are upserted, key/value
  /// entries are written only where missing, seeds only when the seed
  /// table is still empty.
  pub async fn migrate(&self) -> Result<(), Error> {
    let pool = self.pool().await;
    match kv_get(&pool, keys::CONFIG_MIGRATED).await? {
      Some(raw) => {
        let migrated: bool = serde_json::from_str(&raw).map_err(|e| {
          Error::MigrationConflict(format!(
            "unreadable {} flag: {e}",
            keys::CONFIG_MIGRATED
          ))
        })?;
        if migrated {
          debug!("config already migrated, skipping");
          return Ok(());
        }
      }
      None => {}
    }

    let snapshot = self.snapshot();
    let mut tx = pool.begin().await?;

    for node in &snapshot.nodes {
      upsert_node(&mut tx, node).await?;
    }

    kv_put_if_missing(
      &mut tx,
      keys::CURRENT_HEIGHT,
      &serde_json::to_string(&snapshot.current_height)?,
    )
    .await?;
    kv_put_if_missing(
      &mut tx,
      keys::LAST_PROCESSED_HEIGHT,
      &serde_json::to_string(&snapshot.last_processed_height)?,
    )
    .await?;
    kv_put_if_missing(
      &mut tx,
      keys::VALIDATION_PARAMS,
      &serde_json::to_string(&snapshot.validation_params)?,
    )
    .await?;
    kv_put_if_missing(
      &mut tx,
      keys::BANDWIDTH_PARAMS,
      &serde_json::to_string(&snapshot.bandwidth_params)?,
    )
    .await?;
    kv_put_if_missing(
      &mut tx,
      keys::CURRENT_NODE_VERSION,
      &serde_json::to_string(&snapshot.current_node_version)?,
    )
    .await?;
    kv_put_if_missing(
      &mut tx,
      keys::LAST_USED_VERSION,
      &serde_json::to_string(&snapshot.last_used_version)?,
    )
    .await?;
    if let Some(plan) = &snapshot.upgrade_plan {
      kv_put_if_missing(
        &mut tx,
        keys::UPGRADE_PLAN,
        &serde_json::to_string(plan)?,
      )
      .await?;
    }
    if let Some(key_config) = &snapshot.ml_node_key_config {
      kv_put_if_missing(
        &mut tx,
        keys::ML_NODE_KEY_CONFIG,
        &serde_json::to_string(key_config)?,
      )
      .await?;
    }

    let seed_rows: i64 = sqlx::query("SELECT COUNT(*) AS n FROM seed_info")
      .fetch_one(&mut tx)
      .await?
      .try_get("n")?;
    if seed_rows == 0 {
      for slot in SeedSlot::ALL {
        let seed = snapshot.seed_in_slot(slot);
        insert_seed(&mut tx, slot, seed).await?;
      }
    }

    if snapshot.merged_node_config {
      kv_put(&mut tx, keys::NODE_CONFIG_MERGED, "true").await?;
    }
    kv_put(&mut tx, keys::CONFIG_MIGRATED, "true").await?;
    tx.commit().await?;

    info!("config migrated into {}", self.db_path.display());
    Ok(())
  }

  /// First-run import of the standalone node-config JSON file. A no-op
  /// once the `node_config_merged` flag is set (either in the database
  /// or in memory). The replacement node set reaches the database on
  /// the next flush, together with the flag.
  pub async fn load_node_config(&self, path: &PathBuf) -> Result<(), Error> {
    let pool = self.pool().await;
    let merged_in_db = match kv_get(&pool, keys::NODE_CONFIG_MERGED).await? {
      Some(raw) => serde_json::from_str(&raw).unwrap_or(false),
      None => false,
    };
    {
      let state = self.state.lock().unwrap();
      if merged_in_db || state.merged_node_config {
        debug!("node config already merged, skipping {}", path.display());
        return Ok(());
      }
    }

    let nodes = crate::config::read_node_config(path)?;
    info!(
      count = nodes.len(),
      "merging node config from {}",
      path.display()
    );
    let mut state = self.state.lock().unwrap();
    state.nodes = nodes;
    state.merged_node_config = true;
    Ok(())
  }

  /// Copies every dynamic field present in the database over the
  /// in-memory state. Called once on startup, after migration.
  pub async fn hydrate(&self) -> Result<(), Error> {
    let pool = self.pool().await;

    let rows = sqlx::query("SELECT * FROM inference_nodes ORDER BY id")
      .fetch_all(&pool)
      .await?;
    let nodes = rows
      .iter()
      .map(node_from_row)
      .collect::<Result<Vec<_>, _>>()?;

    let mut seeds = [None, None, None];
    for (i, slot) in SeedSlot::ALL.iter().enumerate() {
      seeds[i] = active_seed(&pool, *slot).await?;
    }

    let mut state = self.state.lock().unwrap();
    state.nodes = nodes;
    let [previous, current, upcoming] = seeds;
    if let Some(seed) = previous {
      state.previous_seed = seed;
    }
    if let Some(seed) = current {
      state.current_seed = seed;
    }
    if let Some(seed) = upcoming {
      state.upcoming_seed = seed;
    }
    drop(state);

    macro_rules! hydrate_kv {
      ($key:expr, $setter:expr) => {
        if let Some(raw) = kv_get(&pool, $key).await? {
          match serde_json::from_str(&raw) {
            Ok(value) => {
              let mut state = self.state.lock().unwrap();
              $setter(&mut *state, value);
            }
            Err(e) => warn!(key = $key, "skipping unreadable kv entry: {e}"),
          }
        }
      };
    }

    hydrate_kv!(keys::CURRENT_HEIGHT, |s: &mut AppConfig, v| s
      .current_height = v);
    hydrate_kv!(keys::LAST_PROCESSED_HEIGHT, |s: &mut AppConfig, v| s
      .last_processed_height = v);
    hydrate_kv!(keys::VALIDATION_PARAMS, |s: &mut AppConfig, v| s
      .validation_params = v);
    hydrate_kv!(keys::BANDWIDTH_PARAMS, |s: &mut AppConfig, v| s
      .bandwidth_params = v);
    hydrate_kv!(keys::CURRENT_NODE_VERSION, |s: &mut AppConfig, v| s
      .current_node_version = v);
    hydrate_kv!(keys::LAST_USED_VERSION, |s: &mut AppConfig, v| s
      .last_used_version = v);
    // nullable entries round-trip through Option
    hydrate_kv!(keys::UPGRADE_PLAN, |s: &mut AppConfig,
                                     v: Option<UpgradePlan>| {
      s.upgrade_plan = v
    });
    hydrate_kv!(keys::ML_NODE_KEY_CONFIG, |s: &mut AppConfig,
                                           v: Option<MlNodeKeyConfig>| {
      s.ml_node_key_config = v
    });
    hydrate_kv!(keys::NODE_CONFIG_MERGED, |s: &mut AppConfig, v| s
      .merged_node_config = v);

    debug!("store hydrated from {}", self.db_path.display());
    Ok(())
  }

  /// Persists the in-memory state. The snapshot is taken under the
  /// lock, the writes happen outside of it. Seeds are replaced in one
  /// transaction per flush so no reader of the database ever observes
  /// a partially rotated set.
  pub async fn flush_to_db(&self) -> Result<(), Error> {
    self.ensure_available().await?;
    let snapshot = self.snapshot();
    let pool = self.pool().await;

    let mut tx = pool.begin().await?;

    // nodes: upsert everything in the snapshot, drop the rest
    let existing: Vec<String> = sqlx::query("SELECT id FROM inference_nodes")
      .fetch_all(&mut tx)
      .await?
      .iter()
      .map(|row| row.try_get("id"))
      .collect::<Result<_, _>>()?;
    for id in existing {
      if !snapshot.nodes.iter().any(|n| n.id == id) {
        sqlx::query("DELETE FROM inference_nodes WHERE id = ?")
          .bind(&id)
          .execute(&mut tx)
          .await?;
      }
    }
    for node in &snapshot.nodes {
      upsert_node(&mut tx, node).await?;
    }

    kv_put(
      &mut tx,
      keys::CURRENT_HEIGHT,
      &serde_json::to_string(&snapshot.current_height)?,
    )
    .await?;
    kv_put(
      &mut tx,
      keys::LAST_PROCESSED_HEIGHT,
      &serde_json::to_string(&snapshot.last_processed_height)?,
    )
    .await?;
    kv_put(
      &mut tx,
      keys::VALIDATION_PARAMS,
      &serde_json::to_string(&snapshot.validation_params)?,
    )
    .await?;
    kv_put(
      &mut tx,
      keys::BANDWIDTH_PARAMS,
      &serde_json::to_string(&snapshot.bandwidth_params)?,
    )
    .await?;
    kv_put(
      &mut tx,
      keys::CURRENT_NODE_VERSION,
      &serde_json::to_string(&snapshot.current_node_version)?,
    )
    .await?;
    kv_put(
      &mut tx,
      keys::LAST_USED_VERSION,
      &serde_json::to_string(&snapshot.last_used_version)?,
    )
    .await?;
    kv_put(
      &mut tx,
      keys::UPGRADE_PLAN,
      &serde_json::to_string(&snapshot.upgrade_plan)?,
    )
    .await?;
    kv_put(
      &mut tx,
      keys::ML_NODE_KEY_CONFIG,
      &serde_json::to_string(&snapshot.ml_node_key_config)?,
    )
    .await?;
    kv_put(
      &mut tx,
      keys::NODE_CONFIG_MERGED,
      &serde_json::to_string(&snapshot.merged_node_config)?,
    )
    .await?;
    tx.commit().await?;

    // seeds rotate atomically: deactivate the active row of each slot
    // and insert the fresh one inside a single transaction
    let mut tx = pool.begin().await?;
    for slot in SeedSlot::ALL {
      let seed = snapshot.seed_in_slot(slot);
      if seed.is_empty() && slot != SeedSlot::Upcoming {
        if let Some(active) = active_seed_tx(&mut tx, slot).await? {
          if !active.is_empty() {
            warn!(
              slot = slot.as_str(),
              "not replacing active seed with an empty one"
            );
            continue;
          }
        }
      }
      sqlx::query(
        "UPDATE seed_info SET is_active = 0 WHERE type = ? AND is_active = 1",
      )
      .bind(slot.as_str())
      .execute(&mut tx)
      .await?;
      insert_seed(&mut tx, slot, seed).await?;
    }
    tx.commit().await?;

    if let Err(e) = self.write_dump(&snapshot) {
      warn!("failed writing config dump: {e}");
    }
    Ok(())
  }

  fn write_dump(&self, snapshot: &AppConfig) -> Result<(), Error> {
    let dump = serde_json::to_vec_pretty(snapshot)?;
    std::fs::write(&self.dump_path, dump)?;
    Ok(())
  }

  /// Ticker-driven flush loop. Runs until shutdown is signalled, then
  /// returns without a final flush; the shutdown path performs its own
  /// bounded flush.
  pub async fn auto_flush(
    self: Arc<Self>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
  ) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
      tokio::select! {
        _ = ticker.tick() => {
          if let Err(e) = self.flush_to_db().await {
            error!("periodic config flush failed: {e}");
          }
        }
        _ = shutdown.changed() => return,
      }
    }
  }

  // in-memory accessors. getters return copies, setters take the state
  // mutex for the shortest possible scope.

  pub fn snapshot(&self) -> AppConfig {
    self.state.lock().unwrap().clone()
  }

  pub fn get_nodes(&self) -> Vec<InferenceNodeConfig> {
    self.state.lock().unwrap().nodes.clone()
  }

  pub fn set_nodes(&self, nodes: Vec<InferenceNodeConfig>) {
    self.state.lock().unwrap().nodes = nodes;
  }

  pub fn upsert_node_config(&self, node: InferenceNodeConfig) {
    let mut state = self.state.lock().unwrap();
    match state.nodes.iter_mut().find(|n| n.id == node.id) {
      Some(existing) => *existing = node,
      None => state.nodes.push(node),
    }
  }

  /// Models offered by at least one registered node.
  pub fn supported_models(&self) -> Vec<String> {
    let state = self.state.lock().unwrap();
    let mut models: Vec<String> = state
      .nodes
      .iter()
      .flat_map(|n| n.models.keys().cloned())
      .collect();
    models.sort();
    models.dedup();
    models
  }

  pub fn get_height(&self) -> i64 {
    self.state.lock().unwrap().current_height
  }

  /// `current_height` is monotonically nondecreasing; stale writes are
  /// dropped.
  pub fn set_height(&self, height: i64) {
    let mut state = self.state.lock().unwrap();
    if height > state.current_height {
      state.current_height = height;
    }
  }

  pub fn last_processed_height(&self) -> i64 {
    self.state.lock().unwrap().last_processed_height
  }

  /// Advances the barrier watermark. Returns false (leaving the value
  /// untouched) when `height` does not advance it.
  pub fn set_last_processed_height(&self, height: i64) -> bool {
    let mut state = self.state.lock().unwrap();
    if height <= state.last_processed_height {
      return false;
    }
    state.last_processed_height = height;
    true
  }

  pub fn current_seed(&self) -> SeedInfo {
    self.state.lock().unwrap().current_seed.clone()
  }

  pub fn previous_seed(&self) -> SeedInfo {
    self.state.lock().unwrap().previous_seed.clone()
  }

  pub fn upcoming_seed(&self) -> SeedInfo {
    self.state.lock().unwrap().upcoming_seed.clone()
  }

  pub fn set_upcoming_seed(&self, seed: SeedInfo) -> Result<(), Error> {
    if seed.is_empty() {
      return Err(Error::SeedRowInvalid);
    }
    self.state.lock().unwrap().upcoming_seed = seed;
    Ok(())
  }

  #[cfg(test)]
  pub fn set_current_seed(&self, seed: SeedInfo) {
    self.state.lock().unwrap().current_seed = seed;
  }

  /// Rotates the three seed slots: `previous <- current`,
  /// `current <- upcoming`, `upcoming <- empty`. A single mutex
  /// acquisition, so no reader observes a half-rotated set.
  pub fn advance_current_seed(&self) {
    let mut state = self.state.lock().unwrap();
    state.previous_seed =
      std::mem::replace(&mut state.current_seed, SeedInfo::default());
    state.current_seed =
      std::mem::replace(&mut state.upcoming_seed, SeedInfo::default());
  }

  pub fn is_previous_seed_claimed(&self) -> bool {
    self.state.lock().unwrap().previous_seed.claimed
  }

  pub fn mark_previous_seed_claimed(&self) {
    self.state.lock().unwrap().previous_seed.claimed = true;
  }

  pub fn validation_params(&self) -> ValidationParams {
    self.state.lock().unwrap().validation_params.clone()
  }

  pub fn set_validation_params(&self, params: ValidationParams) {
    self.state.lock().unwrap().validation_params = params;
  }

  pub fn bandwidth_params(&self) -> BandwidthParams {
    self.state.lock().unwrap().bandwidth_params.clone()
  }

  pub fn set_bandwidth_params(&self, params: BandwidthParams) {
    self.state.lock().unwrap().bandwidth_params = params;
  }

  pub fn upgrade_plan(&self) -> Option<UpgradePlan> {
    self.state.lock().unwrap().upgrade_plan.clone()
  }

  pub fn set_upgrade_plan(&self, plan: UpgradePlan) {
    self.state.lock().unwrap().upgrade_plan = Some(plan);
  }

  pub fn clear_upgrade_plan(&self) {
    self.state.lock().unwrap().upgrade_plan = None;
  }

  pub fn ml_node_key_config(&self) -> Option<MlNodeKeyConfig> {
    self.state.lock().unwrap().ml_node_key_config.clone()
  }

  pub fn set_ml_node_key_config(&self, config: MlNodeKeyConfig) {
    self.state.lock().unwrap().ml_node_key_config = Some(config);
  }

  pub fn current_node_version(&self) -> String {
    self.state.lock().unwrap().current_node_version.clone()
  }

  pub fn set_current_node_version(&self, version: String) {
    let mut state = self.state.lock().unwrap();
    if state.current_node_version != version {
      state.last_used_version =
        std::mem::replace(&mut state.current_node_version, version);
    }
  }
}

impl AppConfig {
  fn seed_in_slot(&self, slot: SeedSlot) -> &SeedInfo {
    match slot {
      SeedSlot::Current => &self.current_seed,
      SeedSlot::Previous => &self.previous_seed,
      SeedSlot::Upcoming => &self.upcoming_seed,
    }
  }
}

async fn connect(db_path: &Path) -> Result<SqlitePool, Error> {
  let options = SqliteConnectOptions::new()
    .filename(db_path)
    .create_if_missing(true)
    .journal_mode(SqliteJournalMode::Wal);
  // a single connection makes this a single-writer store, sqlite does
  // the rest
  let pool = SqlitePoolOptions::new()
    .max_connections(1)
    .connect_with(options)
    .await?;

  let mut connection = pool.acquire().await?;
  connection.execute(SCHEMA).await?;
  Ok(pool)
}

async fn kv_get(pool: &SqlitePool, key: &str) -> Result<Option<String>, Error> {
  let row = sqlx::query("SELECT value_json FROM kv_config WHERE key = ?")
    .bind(key)
    .fetch_optional(pool)
    .await?;
  Ok(match row {
    Some(row) => Some(row.try_get("value_json")?),
    None => None,
  })
}

async fn kv_put(
  tx: &mut Transaction<'_, Sqlite>,
  key: &str,
  value_json: &str,
) -> Result<(), Error> {
  sqlx::query(
    "INSERT INTO kv_config (key, value_json) VALUES (?, ?) \
     ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, \
     updated_at = datetime('now')",
  )
  .bind(key)
  .bind(value_json)
  .execute(tx)
  .await?;
  Ok(())
}

async fn kv_put_if_missing(
  tx: &mut Transaction<'_, Sqlite>,
  key: &str,
  value_json: &str,
) -> Result<(), Error> {
  sqlx::query("INSERT OR IGNORE INTO kv_config (key, value_json) VALUES (?, ?)")
    .bind(key)
    .bind(value_json)
    .execute(tx)
    .await?;
  Ok(())
}

async fn upsert_node(
  tx: &mut Transaction<'_, Sqlite>,
  node: &InferenceNodeConfig,
) -> Result<(), Error> {
  sqlx::query(
    "INSERT INTO inference_nodes (id, host, inference_segment, \
     inference_port, poc_segment, poc_port, max_concurrent, models_json, \
     hardware_json) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT(id) DO \
     UPDATE SET host = excluded.host, inference_segment = \
     excluded.inference_segment, inference_port = excluded.inference_port, \
     poc_segment = excluded.poc_segment, poc_port = excluded.poc_port, \
     max_concurrent = excluded.max_concurrent, models_json = \
     excluded.models_json, hardware_json = excluded.hardware_json, \
     updated_at = datetime('now')",
  )
  .bind(&node.id)
  .bind(&node.host)
  .bind(&node.inference_segment)
  .bind(node.inference_port as i64)
  .bind(&node.poc_segment)
  .bind(node.poc_port as i64)
  .bind(node.max_concurrent as i64)
  .bind(serde_json::to_string(&node.models)?)
  .bind(serde_json::to_string(&node.hardware)?)
  .execute(tx)
  .await?;
  Ok(())
}

fn node_from_row(row: &SqliteRow) -> Result<InferenceNodeConfig, Error> {
  Ok(InferenceNodeConfig {
    id: row.try_get("id")?,
    host: row.try_get("host")?,
    inference_segment: row.try_get("inference_segment")?,
    inference_port: row.try_get::<i64, _>("inference_port")? as u16,
    poc_segment: row.try_get("poc_segment")?,
    poc_port: row.try_get::<i64, _>("poc_port")? as u16,
    max_concurrent: row.try_get::<i64, _>("max_concurrent")? as u32,
    models: serde_json::from_str(row.try_get::<&str, _>("models_json")?)?,
    hardware: serde_json::from_str(row.try_get::<&str, _>("hardware_json")?)?,
  })
}

fn seed_from_row(row: &SqliteRow) -> Result<SeedInfo, Error> {
  Ok(SeedInfo {
    seed: row.try_get("seed")?,
    epoch_index: row.try_get::<i64, _>("epoch_index")? as u64,
    signature: row.try_get("signature")?,
    claimed: row.try_get::<i64, _>("claimed")? != 0,
  })
}

async fn active_seed(
  pool: &SqlitePool,
  slot: SeedSlot,
) -> Result<Option<SeedInfo>, Error> {
  let row = sqlx::query(
    "SELECT * FROM seed_info WHERE type = ? AND is_active = 1 ORDER BY id \
     DESC LIMIT 1",
  )
  .bind(slot.as_str())
  .fetch_optional(pool)
  .await?;
  row.as_ref().map(seed_from_row).transpose()
}

async fn active_seed_tx(
  tx: &mut Transaction<'_, Sqlite>,
  slot: SeedSlot,
) -> Result<Option<SeedInfo>, Error> {
  let row = sqlx::query(
    "SELECT * FROM seed_info WHERE type = ? AND is_active = 1 ORDER BY id \
     DESC LIMIT 1",
  )
  .bind(slot.as_str())
  .fetch_optional(tx)
  .await?;
  row.as_ref().map(seed_from_row).transpose()
}

async fn insert_seed(
  tx: &mut Transaction<'_, Sqlite>,
  slot: SeedSlot,
  seed: &SeedInfo,
) -> Result<(), Error> {
  sqlx::query(
    "INSERT INTO seed_info (type, seed, epoch_index, signature, claimed, \
     is_active) VALUES (?, ?, ?, ?, ?, 1)",
  )
  .bind(slot.as_str())
  .bind(seed.seed)
  .bind(seed.epoch_index as i64)
  .bind(&seed.signature)
  .bind(seed.claimed as i64)
  .execute(tx)
  .await?;
  Ok(())
}
