//! Scheduled-upgrade exit path.
//!
//! The upgrade plan itself is installed into the store by external
//! tooling; this module only watches heights. Once the local height
//! reaches the plan height it writes `upgrade-info.json` for the
//! process supervisor and exits non-zero so the supervisor swaps the
//! binary and restarts.

use {
  crate::{config::UpgradePlan, store::ConfigStore},
  std::{
    path::PathBuf,
    sync::{
      atomic::{AtomicBool, Ordering},
      Arc,
    },
  },
  tracing::{info, warn},
};

pub struct UpgradeManager {
  store: Arc<ConfigStore>,
  info_path: PathBuf,
  /// Tests flip this off to observe the trigger without dying.
  exit_on_upgrade: bool,
  triggered: AtomicBool,
}

impl UpgradeManager {
  pub fn new(store: Arc<ConfigStore>, info_path: PathBuf) -> Self {
    Self {
      store,
      info_path,
      exit_on_upgrade: true,
      triggered: AtomicBool::new(false),
    }
  }

  #[cfg(test)]
  pub fn without_exit(mut self) -> Self {
    self.exit_on_upgrade = false;
    self
  }

  #[cfg(test)]
  pub fn upgrade_triggered(&self) -> bool {
    self.triggered.load(Ordering::Acquire)
  }

  pub fn record_plan(&self, plan: UpgradePlan) {
    info!(name = %plan.name, height = plan.height, "upgrade plan recorded");
    self.store.set_upgrade_plan(plan);
  }

  /// Per-block bookkeeping: applies the plan once its height is
  /// reached.
  pub async fn check_height(&self, height: i64) -> anyhow::Result<()> {
    let Some(plan) = self.store.upgrade_plan() else {
      return Ok(());
    };
    if height >= plan.height {
      self.apply(&plan)?;
    }
    Ok(())
  }

  /// On websocket closure: the last locally recorded height may
  /// already have crossed the plan height without us acting on it.
  pub async fn check_on_disconnect(&self) {
    let Some(plan) = self.store.upgrade_plan() else {
      return;
    };
    if self.store.get_height() >= plan.height {
      if let Err(e) = self.apply(&plan) {
        warn!("upgrade application failed: {e}");
      }
    }
  }

  fn apply(&self, plan: &UpgradePlan) -> anyhow::Result<()> {
    let contents = serde_json::json!({
      "name": plan.name,
      // the supervisor restarts from the block before the upgrade
      // height so the new binary processes the upgrade block itself
      "height": plan.height - 1,
      "info": { "binaries": plan.binaries },
    });
    if let Some(parent) = self.info_path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&self.info_path, serde_json::to_vec_pretty(&contents)?)?;
    info!(
      name = %plan.name,
      path = %self.info_path.display(),
      "upgrade height reached, handing over to supervisor"
    );

    self.triggered.store(true, Ordering::Release);
    if self.exit_on_upgrade {
      std::process::exit(1);
    }
    Ok(())
  }
}

#[cfg(test)]
mod test {
  use {
    super::UpgradeManager,
    crate::{
      config::{AppConfig, UpgradePlan},
      store::ConfigStore,
      test::temp_db_path,
    },
    std::sync::Arc,
  };

  #[tokio::test]
  async fn plan_height_writes_info_file() {
    let store = Arc::new(
      ConfigStore::open(&temp_db_path(), AppConfig::default())
        .await
        .unwrap(),
    );
    let info_path = temp_db_path().with_extension("upgrade-info.json");
    let manager =
      UpgradeManager::new(Arc::clone(&store), info_path.clone()).without_exit();

    manager.record_plan(UpgradePlan {
      name: "v2".into(),
      height: 500,
      binaries: [("linux/amd64".to_string(), "https://example/bin".to_string())]
        .into_iter()
        .collect(),
      node_version: String::new(),
    });

    manager.check_height(499).await.unwrap();
    assert!(!manager.upgrade_triggered());

    manager.check_height(500).await.unwrap();
    assert!(manager.upgrade_triggered());

    let written: serde_json::Value =
      serde_json::from_slice(&std::fs::read(&info_path).unwrap()).unwrap();
    assert_eq!(written["name"], "v2");
    // the supervisor restarts one block before the upgrade height
    assert_eq!(written["height"], 499);
    assert_eq!(written["info"]["binaries"]["linux/amd64"], "https://example/bin");
  }

  #[tokio::test]
  async fn disconnect_check_uses_local_height() {
    let store = Arc::new(
      ConfigStore::open(&temp_db_path(), AppConfig::default())
        .await
        .unwrap(),
    );
    let info_path = temp_db_path().with_extension("upgrade-info.json");
    let manager =
      UpgradeManager::new(Arc::clone(&store), info_path).without_exit();
    manager.record_plan(UpgradePlan {
      name: "v3".into(),
      height: 100,
      binaries: Default::default(),
      node_version: String::new(),
    });

    store.set_height(99);
    manager.check_on_disconnect().await;
    assert!(!manager.upgrade_triggered());

    store.set_height(100);
    manager.check_on_disconnect().await;
    assert!(manager.upgrade_triggered());
  }
}
