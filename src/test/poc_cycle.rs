//! Full epoch-cycle scenarios driving the real dispatcher, broker and
//! seed manager against the in-memory chain and scripted workers.

use {
  super::{chain::MockChain, mlnode::MockNodeFactory, temp_db_path, test_node, test_signer},
  crate::{
    broker::{node::NodeStatus, NodeBroker},
    chain::types::{InferenceDetail, InferenceSummary, InferenceValidationDetails},
    config::{AppConfig, InferenceNodeConfig},
    dispatcher::Dispatcher,
    epochs::{BlockInfo, Epoch, EpochParams},
    events::{queue::unbounded_queue, Event},
    observer::BlockObserver,
    poc::PocOrchestrator,
    seeds::SeedManager,
    store::ConfigStore,
    test::chain::Submitted,
    validator::InferenceValidator,
  },
  std::{sync::Arc, time::Duration},
  tokio::sync::{mpsc, watch},
};

struct Harness {
  chain: Arc<MockChain>,
  store: Arc<ConfigStore>,
  factory: Arc<MockNodeFactory>,
  broker: NodeBroker,
  dispatcher: Arc<Dispatcher>,
  // kept alive so queues and the broker loop stay up
  _tx_events: mpsc::Receiver<Event>,
  _shutdown: watch::Sender<bool>,
  _broker_task: tokio::task::JoinHandle<()>,
}

fn cycle_params() -> EpochParams {
  EpochParams {
    epoch_length: 100,
    poc_stage_duration: 20,
    poc_validation_delay: 2,
    poc_validation_duration: 10,
    ..Default::default()
  }
}

async fn harness(
  nodes: Vec<InferenceNodeConfig>,
  params: EpochParams,
) -> Harness {
  let signer = test_signer();
  let me = signer.public();

  let chain = Arc::new(MockChain::default());
  chain.set_epoch(
    Epoch {
      epoch_index: 7,
      poc_start_block_height: 100,
    },
    params,
  );

  let mut initial = AppConfig::default();
  initial.nodes = nodes.clone();
  let store = Arc::new(
    ConfigStore::open(&temp_db_path(), initial).await.unwrap(),
  );

  let factory = Arc::new(MockNodeFactory::default());
  let (shutdown_tx, shutdown_rx) = watch::channel(false);
  let (broker, broker_task) = NodeBroker::spawn(
    Arc::clone(&store),
    chain.clone(),
    Arc::clone(&factory) as _,
    me,
    String::new(),
    shutdown_rx,
  );
  for node in nodes {
    broker.load_node(node).unwrap();
  }

  let (tx_queue, tx_events) = unbounded_queue(64);
  let observer =
    BlockObserver::new(chain.clone(), Arc::clone(&store), tx_queue);
  let seeds = Arc::new(SeedManager::new(
    signer.clone(),
    chain.clone(),
    Arc::clone(&store),
  ));
  let validator = Arc::new(
    InferenceValidator::new(
      chain.clone(),
      broker.clone(),
      Arc::clone(&store),
      me,
    )
    .with_retry(2, Duration::from_millis(50)),
  );
  let poc = Arc::new(PocOrchestrator::new(
    chain.clone(),
    broker.clone(),
    Arc::clone(&store),
    me,
  ));
  let dispatcher = Arc::new(Dispatcher::new(
    chain.clone(),
    Arc::clone(&store),
    observer,
    broker.clone(),
    seeds,
    validator,
    poc,
    me,
  ));

  Harness {
    chain,
    store,
    factory,
    broker,
    dispatcher,
    _tx_events: tx_events,
    _shutdown: shutdown_tx,
    _broker_task: broker_task,
  }
}

async fn run_blocks(h: &Harness, range: std::ops::RangeInclusive<i64>) {
  for height in range {
    h.chain.set_height(height);
    let state = h
      .dispatcher
      .process_new_block(BlockInfo {
        height,
        hash: format!("hash-{height}"),
      })
      .await;
    assert!(state.is_some(), "block {height} was skipped");
  }
  // a snapshot round-trip guarantees every queued broker command has
  // been executed
  let _ = h.broker.snapshot().await.unwrap();
}

#[tokio::test]
async fn full_poc_cycle_moves_both_nodes_through_all_stages() {
  let h = harness(
    vec![test_node("node-1", "llama"), test_node("node-2", "llama")],
    cycle_params(),
  )
  .await;
  run_blocks(&h, 100..=132).await;

  for id in ["node-1", "node-2"] {
    let node = h.factory.node(id);

    let generates = node.init_generates();
    assert_eq!(generates.len(), 1, "{id} init_generate count");
    assert_eq!(generates[0].block_height, 100);
    assert_ne!(generates[0].seed, 0, "poc runs with the epoch seed");

    let validates = node.init_validates();
    assert_eq!(validates.len(), 1, "{id} init_validate count");
    assert_eq!(validates[0].block_height, 120);
    assert_eq!(validates[0].block_hash, "hash-120");

    assert_eq!(node.inference_ups(), 1, "{id} inference_up count");
  }

  for snapshot in h.broker.snapshot().await.unwrap() {
    assert_eq!(snapshot.state.current_status, NodeStatus::Inference);
  }

  // the epoch seed was committed to the chain exactly once
  let seeds = h.chain.submitted_seeds();
  assert_eq!(seeds.len(), 1);
  assert_eq!(seeds[0].epoch_index, 7);
  assert_ne!(h.store.upcoming_seed().seed, 0);
}

#[tokio::test]
async fn disabled_node_is_excluded_from_the_epoch() {
  let h = harness(
    vec![test_node("node-1", "llama"), test_node("node-2", "llama")],
    cycle_params(),
  )
  .await;
  h.broker.set_admin_state("node-1", false, 7).await.unwrap();
  run_blocks(&h, 100..=132).await;

  let node1 = h.factory.node("node-1");
  assert!(node1.init_generates().is_empty());
  assert!(node1.init_validates().is_empty());
  assert_eq!(node1.inference_ups(), 0);

  let node2 = h.factory.node("node-2");
  assert_eq!(node2.init_generates().len(), 1);
  assert_eq!(node2.init_validates().len(), 1);
  assert_eq!(node2.inference_ups(), 1);
}

#[tokio::test]
async fn transient_init_failure_is_retried_next_block_only() {
  let h = harness(
    vec![test_node("node-1", "llama"), test_node("node-2", "llama")],
    cycle_params(),
  )
  .await;
  // node-1 fails its first init_generate
  h.factory
    .node("node-1")
    .fail_init_generate
    .store(1, std::sync::atomic::Ordering::SeqCst);

  run_blocks(&h, 100..=110).await;

  // one failed attempt at 100 plus exactly one retry at the next
  // reconciliation, nothing after the error cleared
  let node1 = h.factory.node("node-1");
  let generates = node1.init_generates();
  assert_eq!(generates.len(), 2);
  assert_eq!(generates[0].block_height, 100);
  assert_eq!(generates[1].block_height, 101);

  assert_eq!(h.factory.node("node-2").init_generates().len(), 1);
}

#[tokio::test]
async fn recovery_completes_before_rewards_are_claimed() {
  // epoch_length 0 keeps the post-recovery settle sleep at zero
  let params = EpochParams {
    epoch_length: 0,
    ..cycle_params()
  };
  let h = harness(vec![test_node("node-1", "llama")], params).await;

  let response_payload = serde_json::json!({
    "choices": [{
      "message": { "content": "hello" },
      "logprobs": { "content": [{
        "token": "hello",
        "logprob": -0.1,
        "top_logprobs": [{ "token": "hello", "logprob": -0.1 }]
      }]}
    }]
  })
  .to_string();

  {
    let me = test_signer().public().to_string();
    let mut state = h.chain.state.lock().unwrap();
    state.participant_power.insert(me, 90);
    state.summaries.push(InferenceSummary {
      inference_id: "inf-1".into(),
      epoch_id: 6,
      model: "llama".into(),
      executor_id: "peer".into(),
    });
    state.validation_details.insert("inf-1".into(), InferenceValidationDetails {
      inference_id: "inf-1".into(),
      executor_id: "peer".into(),
      executor_power: 10,
      total_power: 100,
      model: "llama".into(),
    });
    state.inferences.insert("inf-1".into(), InferenceDetail {
      inference_id: "inf-1".into(),
      epoch_id: 6,
      model: "llama".into(),
      executor_id: "peer".into(),
      prompt_payload: serde_json::json!({
        "model": "llama",
        "messages": [{ "role": "user", "content": "hi" }],
        "stream": true,
        "stream_options": { "include_usage": true }
      })
      .to_string(),
      response_payload: response_payload.clone(),
    });
  }
  // the re-execution returns the original stream, similarity 1.0
  *h.factory.node("node-1").completion.lock().unwrap() =
    Some(serde_json::from_str(&response_payload).unwrap());

  run_blocks(&h, 100..=137).await;

  // the claim stage runs recovery + claim on a background task
  let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
  while h.chain.submitted_claims().is_empty() {
    assert!(
      tokio::time::Instant::now() < deadline,
      "claim never submitted"
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
  }

  let submitted = h.chain.submitted();
  let validation_at = submitted
    .iter()
    .position(|m| matches!(m, Submitted::Validation(_)))
    .expect("missed validation was recovered");
  let claim_at = submitted
    .iter()
    .position(|m| matches!(m, Submitted::Claim(_)))
    .unwrap();
  assert!(
    validation_at < claim_at,
    "recovery must complete before the claim"
  );

  let claims = h.chain.submitted_claims();
  assert_eq!(claims[0].epoch_index, 6);
  assert_ne!(claims[0].seed, 0);
  assert!(h.store.is_previous_seed_claimed());

  let validations = h.chain.submitted_validations();
  assert_eq!(validations[0].inference_id, "inf-1");
  assert!(validations[0].value > 0.99);
}
