mod bls;
mod broker;
mod chain;
mod cli;
mod config;
mod dispatcher;
mod epochs;
mod events;
mod keys;
mod observer;
mod poc;
mod seeds;
mod store;
mod upgrade;
mod validator;

#[cfg(test)]
mod test;

use {
  crate::{
    bls::BlsSubsystem,
    broker::{client::HttpMlNodeFactory, manager::run_node_manager, NodeBroker},
    chain::{rpc::HttpChainClient, ws, ChainClient},
    cli::CliOpts,
    config::AppConfig,
    dispatcher::Dispatcher,
    events::{
      handlers::{
        spawn_workers,
        EventHandler,
        InferenceFinishedHandler,
        NewBlockHandler,
        ProposalHandler,
        RevalidationHandler,
        ThresholdSigningHandler,
        TrainingTaskHandler,
      },
      queue::unbounded_queue,
    },
    observer::BlockObserver,
    poc::PocOrchestrator,
    seeds::SeedManager,
    store::ConfigStore,
    upgrade::UpgradeManager,
    validator::InferenceValidator,
  },
  clap::Parser,
  std::{sync::Arc, time::Duration},
  tokio::sync::watch,
  tracing::{error, info, warn, Level},
  tracing_subscriber::{
    filter::filter_fn,
    prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
    Layer,
  },
};

const TX_WORKERS: usize = 10;
const BLOCK_WORKERS: usize = 2;
const FLUSH_INTERVAL: Duration = Duration::from_secs(30);
const SYNC_STATUS_INTERVAL: Duration = Duration::from_secs(30);
const NODE_MANAGER_INTERVAL: Duration = Duration::from_secs(300);
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

fn print_essentials(opts: &CliOpts, config: &AppConfig) {
  info!("Starting decentralized inference participant");
  info!("Version: {}", env!("CARGO_PKG_VERSION"));
  info!("Config file: {}", opts.config.display());
  info!("Database: {}", opts.db.display());
  info!("Chain node: {}", config.chain_node.url);
  info!("Configured ML nodes: {}", config.nodes.len());
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
  let opts = CliOpts::parse();

  let loglevel = match opts.verbose {
    1 => Level::DEBUG,
    2 => Level::TRACE,
    _ => Level::INFO,
  };
  tracing_subscriber::registry()
    .with(
      tracing_subscriber::fmt::layer()
        .with_filter(filter_fn(move |metadata| metadata.level() <= &loglevel)),
    )
    .init();

  // YAML + env overrides describe the static world; the database owns
  // everything dynamic from here on
  let mut yaml_config = AppConfig::load(&opts.config)?;
  opts.apply_to(&mut yaml_config);
  print_essentials(&opts, &yaml_config);

  let signer = opts.signer(&yaml_config)?;
  let me = signer.public();
  info!("Participant identity: {me}");
  if !yaml_config.chain_node.account_public_key.is_empty()
    && yaml_config.chain_node.account_public_key != me.to_string()
  {
    anyhow::bail!(
      "keyring key does not match the configured account public key"
    );
  }

  let store = Arc::new(ConfigStore::open(&opts.db, yaml_config).await?);
  store.migrate().await?;
  store.hydrate().await?;
  if let Some(node_config) = &opts.node_config {
    store.load_node_config(node_config).await?;
  }
  store.flush_to_db().await?;

  // write the YAML back with dynamic fields zeroed so nobody edits
  // stale dynamic state into it
  let snapshot = store.snapshot();
  if let Err(e) = snapshot.write(&opts.config) {
    warn!("config write-back failed: {e}");
  }

  let (shutdown_tx, shutdown_rx) = watch::channel(false);

  let chain: Arc<dyn ChainClient> =
    Arc::new(HttpChainClient::new(&snapshot.chain_node)?);
  let factory = Arc::new(HttpMlNodeFactory::new()?);
  let (broker, broker_handle) = NodeBroker::spawn(
    Arc::clone(&store),
    Arc::clone(&chain),
    factory,
    me,
    snapshot.api.poc_callback_url.clone(),
    shutdown_rx.clone(),
  );
  for node in store.get_nodes() {
    broker.load_node(node)?;
  }

  // the tx queue carries observer-synthesized events plus barriers,
  // the block queue carries websocket NewBlock notifications
  let (tx_queue, tx_receiver) = unbounded_queue(1024);
  let (block_queue, block_receiver) = unbounded_queue(64);

  let observer =
    BlockObserver::new(Arc::clone(&chain), Arc::clone(&store), tx_queue.clone());
  let seeds = Arc::new(SeedManager::new(
    signer.clone(),
    Arc::clone(&chain),
    Arc::clone(&store),
  ));
  let validator = Arc::new(InferenceValidator::new(
    Arc::clone(&chain),
    broker.clone(),
    Arc::clone(&store),
    me,
  ));
  let poc = Arc::new(PocOrchestrator::new(
    Arc::clone(&chain),
    broker.clone(),
    Arc::clone(&store),
    me,
  ));
  let upgrade =
    Arc::new(UpgradeManager::new(Arc::clone(&store), opts.upgrade_info_path()));
  let bls = Arc::new(BlsSubsystem::new(
    Arc::clone(&chain),
    signer.clone(),
    snapshot.chain_node.chain_id.clone(),
  ));
  let dispatcher = Arc::new(Dispatcher::new(
    Arc::clone(&chain),
    Arc::clone(&store),
    Arc::clone(&observer),
    broker.clone(),
    Arc::clone(&seeds),
    Arc::clone(&validator),
    Arc::clone(&poc),
    me,
  ));

  let tx_handlers: Arc<Vec<Arc<dyn EventHandler>>> = Arc::new(vec![
    Arc::new(InferenceFinishedHandler {
      validator: Arc::clone(&validator),
      store: Arc::clone(&store),
    }),
    Arc::new(RevalidationHandler {
      validator: Arc::clone(&validator),
      store: Arc::clone(&store),
    }),
    Arc::new(ThresholdSigningHandler {
      bls: Arc::clone(&bls),
    }),
    Arc::new(TrainingTaskHandler),
    Arc::new(ProposalHandler),
  ]);
  let block_handlers: Arc<Vec<Arc<dyn EventHandler>>> =
    Arc::new(vec![Arc::new(NewBlockHandler {
      dispatcher: Arc::clone(&dispatcher),
      upgrade: Arc::clone(&upgrade),
      bls: Arc::clone(&bls),
    })]);

  let mut tasks = Vec::new();
  // barriers complete through the observer hook on the dequeue task,
  // never through the handler pool
  tasks.push(spawn_workers(
    "tx",
    TX_WORKERS,
    tx_receiver,
    tx_handlers,
    Some(Arc::clone(&observer)),
  ));
  tasks.push(spawn_workers(
    "block",
    BLOCK_WORKERS,
    block_receiver,
    block_handlers,
    None,
  ));
  tasks.push(observer.spawn_worker(shutdown_rx.clone()));
  tasks.push(tokio::spawn(ws::run_block_subscription(
    ws::websocket_url(&snapshot.chain_node.url),
    block_queue.clone(),
    Arc::clone(&upgrade),
    shutdown_rx.clone(),
  )));
  tasks.push(tokio::spawn(
    Arc::clone(&store).auto_flush(FLUSH_INTERVAL, shutdown_rx.clone()),
  ));
  tasks.push(tokio::spawn(run_node_manager(
    broker.clone(),
    Arc::clone(&chain),
    Arc::clone(&store),
    NODE_MANAGER_INTERVAL,
    shutdown_rx.clone(),
  )));
  tasks.push(tokio::spawn(sync_status_ticker(
    Arc::clone(&chain),
    Arc::clone(&observer),
    shutdown_rx.clone(),
  )));
  tasks.push(broker_handle);

  tokio::signal::ctrl_c().await?;
  info!("shutdown requested, draining tasks");
  let _ = shutdown_tx.send(true);
  tx_queue.close();
  block_queue.close();

  match tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, store.flush_to_db()).await
  {
    Ok(Ok(())) => info!("final config flush complete"),
    Ok(Err(e)) => error!("final config flush failed: {e}"),
    Err(_) => error!("final config flush timed out"),
  }

  for task in tasks {
    task.abort();
  }
  Ok(())
}

/// Keeps the observer fed when the websocket stalls: a periodic status
/// query delivers the same `(height, synced)` signal the dispatcher
/// derives from NewBlock events.
async fn sync_status_ticker(
  chain: Arc<dyn ChainClient>,
  observer: Arc<BlockObserver>,
  mut shutdown: watch::Receiver<bool>,
) {
  let mut ticker = tokio::time::interval(SYNC_STATUS_INTERVAL);
  ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
  loop {
    tokio::select! {
      _ = ticker.tick() => {
        match chain.status().await {
          Ok(status) => observer
            .update_status(status.latest_block_height, status.is_synced()),
          Err(e) => warn!("sync status query failed: {e}"),
        }
      }
      _ = shutdown.changed() => return,
    }
  }
}
