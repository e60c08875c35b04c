//! Store lifecycle scenarios: migration idempotence, first-run node
//! config merge, database-wins hydration and atomic seed rotation.

use {
  super::{temp_db_path, test_node},
  crate::{
    config::{AppConfig, SeedInfo},
    store::ConfigStore,
  },
  std::path::PathBuf,
};

fn write_node_config_json(nodes: &[crate::config::InferenceNodeConfig]) -> PathBuf {
  let path = temp_db_path().with_extension("nodes.json");
  std::fs::write(&path, serde_json::to_vec(nodes).unwrap()).unwrap();
  path
}

async fn open_and_bootstrap(
  db: &PathBuf,
  yaml: AppConfig,
  node_config: Option<&PathBuf>,
) -> ConfigStore {
  let store = ConfigStore::open(db, yaml).await.unwrap();
  store.migrate().await.unwrap();
  store.hydrate().await.unwrap();
  if let Some(path) = node_config {
    store.load_node_config(path).await.unwrap();
  }
  store.flush_to_db().await.unwrap();
  store
}

#[tokio::test]
async fn migration_skips_node_config_when_already_merged() {
  let db = temp_db_path();
  let json = write_node_config_json(&[test_node("json-node-1", "llama")]);

  let mut yaml = AppConfig::default();
  yaml.nodes = vec![test_node("yaml-node-1", "llama")];
  yaml.merged_node_config = true;
  yaml.current_height = 393;

  let store = open_and_bootstrap(&db, yaml.clone(), Some(&json)).await;
  let node_ids: Vec<String> =
    store.get_nodes().iter().map(|n| n.id.clone()).collect();
  assert_eq!(node_ids, vec!["yaml-node-1"]);
  assert_eq!(store.get_height(), 393);
  drop(store);

  // a second run with the same inputs changes nothing
  let store = open_and_bootstrap(&db, yaml, Some(&json)).await;
  let node_ids: Vec<String> =
    store.get_nodes().iter().map(|n| n.id.clone()).collect();
  assert_eq!(node_ids, vec!["yaml-node-1"]);
  assert_eq!(store.get_height(), 393);
}

#[tokio::test]
async fn first_run_merges_node_config_file() {
  let db = temp_db_path();
  let json = write_node_config_json(&[test_node("json-node", "llama")]);

  let mut yaml = AppConfig::default();
  yaml.nodes = vec![test_node("yaml-node", "llama")];
  yaml.merged_node_config = false;

  let store = open_and_bootstrap(&db, yaml, Some(&json)).await;
  let node_ids: Vec<String> =
    store.get_nodes().iter().map(|n| n.id.clone()).collect();
  assert_eq!(node_ids, vec!["json-node"]);
  drop(store);

  // the merge is one-shot: reloading with the same file keeps the set
  let store =
    open_and_bootstrap(&db, AppConfig::default(), Some(&json)).await;
  let node_ids: Vec<String> =
    store.get_nodes().iter().map(|n| n.id.clone()).collect();
  assert_eq!(node_ids, vec!["json-node"]);
}

#[tokio::test]
async fn database_wins_over_rewritten_yaml() {
  let db = temp_db_path();
  let yaml_path = temp_db_path().with_extension("yml");

  let mut yaml = AppConfig::default();
  yaml.current_height = 7;
  let store = open_and_bootstrap(&db, yaml, None).await;
  assert_eq!(store.get_height(), 7);

  // write-back zeroes the dynamic fields on disk
  store.snapshot().write(&yaml_path).unwrap();
  let on_disk = AppConfig::load(&yaml_path).unwrap();
  assert_eq!(on_disk.current_height, 0);
  drop(store);

  // reloading from the zeroed YAML hydrates the height from the
  // database, not the file
  let store = open_and_bootstrap(&db, on_disk, None).await;
  assert_eq!(store.get_height(), 7);
}

#[tokio::test]
async fn seed_rotation_is_atomic_across_restarts() {
  let db = temp_db_path();
  let store = open_and_bootstrap(&db, AppConfig::default(), None).await;

  store.set_current_seed(SeedInfo {
    seed: 1,
    epoch_index: 1,
    signature: "aa".into(),
    claimed: false,
  });
  store
    .set_upcoming_seed(SeedInfo {
      seed: 2,
      epoch_index: 2,
      signature: "bb".into(),
      claimed: false,
    })
    .unwrap();
  store.flush_to_db().await.unwrap();

  store.advance_current_seed();
  store.flush_to_db().await.unwrap();
  drop(store);

  let store = open_and_bootstrap(&db, AppConfig::default(), None).await;
  assert_eq!(store.previous_seed().seed, 1);
  assert_eq!(store.previous_seed().epoch_index, 1);
  assert_eq!(store.current_seed().seed, 2);
  assert!(store.upcoming_seed().is_empty());
}

#[tokio::test]
async fn rotation_has_no_observable_intermediate_state() {
  let store = ConfigStore::open(&temp_db_path(), AppConfig::default())
    .await
    .unwrap();
  store.set_current_seed(SeedInfo {
    seed: 10,
    epoch_index: 5,
    signature: String::new(),
    claimed: false,
  });
  store
    .set_upcoming_seed(SeedInfo {
      seed: 20,
      epoch_index: 6,
      signature: String::new(),
      claimed: false,
    })
    .unwrap();

  store.advance_current_seed();
  let (previous, current, upcoming) = (
    store.previous_seed(),
    store.current_seed(),
    store.upcoming_seed(),
  );
  assert_eq!((previous.seed, current.seed), (10, 20));
  assert!(upcoming.is_empty());
}

#[tokio::test]
async fn previous_seed_claim_flag() {
  let store = ConfigStore::open(&temp_db_path(), AppConfig::default())
    .await
    .unwrap();
  assert!(!store.is_previous_seed_claimed());
  store.mark_previous_seed_claimed();
  assert!(store.is_previous_seed_claimed());
}

#[tokio::test]
async fn empty_seed_never_replaces_an_active_current() {
  let db = temp_db_path();
  let store = open_and_bootstrap(&db, AppConfig::default(), None).await;
  store.set_current_seed(SeedInfo {
    seed: 99,
    epoch_index: 3,
    signature: String::new(),
    claimed: false,
  });
  store.flush_to_db().await.unwrap();

  // wipe the in-memory slot and flush again; the database keeps the
  // committed seed
  store.set_current_seed(SeedInfo::default());
  store.flush_to_db().await.unwrap();
  drop(store);

  let store = open_and_bootstrap(&db, AppConfig::default(), None).await;
  assert_eq!(store.current_seed().seed, 99);
}

#[tokio::test]
async fn processed_height_is_monotonic() {
  let store = ConfigStore::open(&temp_db_path(), AppConfig::default())
    .await
    .unwrap();
  assert!(store.set_last_processed_height(5));
  assert!(!store.set_last_processed_height(5));
  assert!(!store.set_last_processed_height(3));
  assert_eq!(store.last_processed_height(), 5);
  assert!(store.set_last_processed_height(6));
}
