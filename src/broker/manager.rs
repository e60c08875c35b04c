use {
  super::NodeBroker,
  crate::{chain::ChainClient, store::ConfigStore},
  std::{collections::HashMap, sync::Arc, time::Duration},
  tokio::sync::watch,
  tracing::{debug, info, warn},
};

/// Background upkeep of the worker fleet: tracks the advertised ML
/// node version, polls GPU inventories and pre-downloads models nodes
/// are configured to serve but do not have yet. Everything here is
/// best effort, on the next tick we try again.
pub async fn run_node_manager(
  broker: NodeBroker,
  chain: Arc<dyn ChainClient>,
  store: Arc<ConfigStore>,
  interval: Duration,
  mut shutdown: watch::Receiver<bool>,
) {
  let mut ticker = tokio::time::interval(interval);
  ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
  loop {
    tokio::select! {
      _ = ticker.tick() => {}
      _ = shutdown.changed() => return,
    }
    if let Err(e) = tick(&broker, &chain, &store).await {
      warn!("node manager pass failed: {e}");
    }
  }
}

async fn tick(
  broker: &NodeBroker,
  chain: &Arc<dyn ChainClient>,
  store: &Arc<ConfigStore>,
) -> anyhow::Result<()> {
  // version gate: a changed advertised version rebuilds the clients
  // so their path prefix picks it up
  match chain.ml_node_version().await {
    Ok(version) => {
      if version != store.current_node_version() {
        info!(%version, "ml node version changed");
        store.set_current_node_version(version);
        broker.set_nodes(store.get_nodes())?;
      }
    }
    Err(e) => debug!("ml node version query failed: {e}"),
  }

  let snapshots: HashMap<_, _> = broker
    .snapshot()
    .await?
    .into_iter()
    .map(|s| (s.config.id.clone(), s))
    .collect();

  for (node_id, client) in broker.clients().await? {
    let Some(snapshot) = snapshots.get(&node_id) else {
      continue;
    };

    // hardware inventory; the broker submits the diff to the chain
    // when something actually changed
    match client.gpu_devices().await {
      Ok(devices) => {
        if devices != snapshot.config.hardware {
          broker.update_node_hardware(&node_id, devices).await?;
        }
      }
      Err(e) => debug!(node = %node_id, "gpu poll failed: {e}"),
    }

    // model pre-download for configured but missing models
    match client.model_status().await {
      Ok(statuses) => {
        let downloaded: Vec<&str> = statuses
          .iter()
          .filter(|s| s.downloaded)
          .map(|s| s.model.as_str())
          .collect();
        for model in snapshot.config.models.keys() {
          if !downloaded.contains(&model.as_str()) {
            info!(node = %node_id, model = %model, "requesting model download");
            if let Err(e) = client.download_model(model).await {
              debug!(node = %node_id, "model download request failed: {e}");
            }
          }
        }
      }
      Err(e) => debug!(node = %node_id, "model status poll failed: {e}"),
    }
  }
  Ok(())
}
