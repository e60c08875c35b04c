//! Block observer pipeline properties: per-block ordering, barrier
//! uniqueness, idempotent barrier consumption and halt-on-error.

use {
  super::{chain::MockChain, temp_db_path},
  crate::{
    chain::types::{AbciEvent, BlockResults, EventAttribute, TxResult},
    config::AppConfig,
    events::{
      handlers::{spawn_workers, EventHandler},
      queue::unbounded_queue,
      Event,
      TxEvent,
    },
    observer::BlockObserver,
    store::ConfigStore,
  },
  async_trait::async_trait,
  std::{
    sync::{
      atomic::{AtomicBool, Ordering},
      Arc,
    },
    time::Duration,
  },
  tokio::sync::watch,
};

fn block_with_tx(height: i64) -> BlockResults {
  BlockResults {
    height,
    txs_results: vec![TxResult {
      events: vec![AbciEvent {
        kind: "inference_finished".into(),
        attributes: vec![EventAttribute {
          key: "inference_id".into(),
          value: format!("inf-{height}"),
        }],
      }],
    }],
  }
}

async fn recv(
  rx: &mut tokio::sync::mpsc::Receiver<Event>,
) -> Event {
  tokio::time::timeout(Duration::from_secs(5), rx.recv())
    .await
    .expect("timed out waiting for event")
    .expect("queue closed")
}

#[tokio::test]
async fn events_precede_their_barrier_and_barriers_are_ordered() {
  let chain = Arc::new(MockChain::default());
  {
    let mut state = chain.state.lock().unwrap();
    state.height = 3;
    state.earliest_height = 1;
    for height in 1..=3 {
      state.block_results.insert(height, block_with_tx(height));
    }
  }
  let store = Arc::new(
    ConfigStore::open(&temp_db_path(), AppConfig::default())
      .await
      .unwrap(),
  );
  let (queue, mut rx) = unbounded_queue(16);
  let observer =
    BlockObserver::new(chain.clone(), Arc::clone(&store), queue);
  let (_shutdown_tx, shutdown_rx) = watch::channel(false);
  let _worker = observer.spawn_worker(shutdown_rx);

  observer.update_status(3, true);

  let mut barriers = Vec::new();
  let mut pending_tx_height = None;
  for _ in 0..6 {
    match recv(&mut rx).await {
      Event::Tx(tx) => {
        assert!(pending_tx_height.is_none(), "two txs for one block");
        pending_tx_height = Some(tx.height);
      }
      Event::Barrier { height } => {
        // the tx for this block must already have been delivered
        assert_eq!(pending_tx_height.take(), Some(height));
        barriers.push(height);
        observer.complete_barrier(height);
      }
      other => panic!("unexpected event {other:?}"),
    }
  }
  assert_eq!(barriers, vec![1, 2, 3]);
  assert_eq!(store.last_processed_height(), 3);

  // a replayed barrier is dropped, the watermark never regresses
  observer.complete_barrier(3);
  observer.complete_barrier(2);
  assert_eq!(store.last_processed_height(), 3);
}

#[tokio::test]
async fn fetch_failure_halts_until_next_status_update() {
  let chain = Arc::new(MockChain::default());
  {
    let mut state = chain.state.lock().unwrap();
    state.height = 2;
    state.earliest_height = 1;
    state.block_results.insert(1, block_with_tx(1));
    state.block_results.insert(2, block_with_tx(2));
    // height 2 fails once, then serves
    state.failing_heights.insert(2);
  }
  let store = Arc::new(
    ConfigStore::open(&temp_db_path(), AppConfig::default())
      .await
      .unwrap(),
  );
  let (queue, mut rx) = unbounded_queue(16);
  let observer =
    BlockObserver::new(chain.clone(), Arc::clone(&store), queue);
  let (_shutdown_tx, shutdown_rx) = watch::channel(false);
  let _worker = observer.spawn_worker(shutdown_rx);

  observer.update_status(2, true);

  // block 1 drains, block 2 halts the loop
  assert!(matches!(recv(&mut rx).await, Event::Tx(_)));
  assert!(matches!(recv(&mut rx).await, Event::Barrier { height: 1 }));
  assert!(
    tokio::time::timeout(Duration::from_millis(300), rx.recv())
      .await
      .is_err(),
    "no events may be delivered past a failed fetch"
  );

  // the next status change retries from where it stopped
  chain.set_height(3);
  {
    let mut state = chain.state.lock().unwrap();
    state.block_results.insert(3, block_with_tx(3));
  }
  observer.update_status(3, true);
  assert!(matches!(recv(&mut rx).await, Event::Tx(_)));
  assert!(matches!(recv(&mut rx).await, Event::Barrier { height: 2 }));
  assert!(matches!(recv(&mut rx).await, Event::Tx(_)));
  assert!(matches!(recv(&mut rx).await, Event::Barrier { height: 3 }));
}

/// Holds its event for a while, then flips `done`. Stands in for a tx
/// handler stuck in the height-race spin or a slow validation path.
struct SlowTxHandler {
  done: Arc<AtomicBool>,
}

#[async_trait]
impl EventHandler for SlowTxHandler {
  fn can_handle(&self, event: &Event) -> bool {
    matches!(event, Event::Tx(_))
  }

  async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
    tokio::time::sleep(Duration::from_millis(300)).await;
    self.done.store(true, Ordering::Release);
    Ok(())
  }
}

#[tokio::test]
async fn barrier_completion_waits_for_in_flight_tx_handlers() {
  let chain = Arc::new(MockChain::default());
  let store = Arc::new(
    ConfigStore::open(&temp_db_path(), AppConfig::default())
      .await
      .unwrap(),
  );
  let (queue, receiver) = unbounded_queue(16);
  let observer =
    BlockObserver::new(chain, Arc::clone(&store), queue.clone());

  let done = Arc::new(AtomicBool::new(false));
  let handlers: Arc<Vec<Arc<dyn EventHandler>>> =
    Arc::new(vec![Arc::new(SlowTxHandler {
      done: Arc::clone(&done),
    })]);
  let _pool =
    spawn_workers("tx", 4, receiver, handlers, Some(Arc::clone(&observer)));

  // the tx event for block 1 precedes its barrier; with four workers
  // the barrier is dequeued while the handler is still sleeping
  queue.push(Event::Tx(TxEvent {
    height: 1,
    ..Default::default()
  }));
  queue.push(Event::Barrier { height: 1 });

  let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
  while store.last_processed_height() < 1 {
    assert!(
      tokio::time::Instant::now() < deadline,
      "barrier never completed"
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  // the watermark moved only after the slow handler finished
  assert!(done.load(Ordering::Acquire));
}

#[tokio::test]
async fn unsynced_status_is_ignored() {
  let chain = Arc::new(MockChain::default());
  {
    let mut state = chain.state.lock().unwrap();
    state.height = 1;
    state.earliest_height = 1;
    state.block_results.insert(1, block_with_tx(1));
  }
  let store = Arc::new(
    ConfigStore::open(&temp_db_path(), AppConfig::default())
      .await
      .unwrap(),
  );
  let (queue, mut rx) = unbounded_queue(16);
  let observer = BlockObserver::new(chain, Arc::clone(&store), queue);
  let (_shutdown_tx, shutdown_rx) = watch::channel(false);
  let _worker = observer.spawn_worker(shutdown_rx);

  observer.update_status(1, false);
  assert!(
    tokio::time::timeout(Duration::from_millis(300), rx.recv())
      .await
      .is_err()
  );

  observer.update_status(1, true);
  assert!(matches!(recv(&mut rx).await, Event::Tx(_)));
  assert!(matches!(recv(&mut rx).await, Event::Barrier { height: 1 }));
}
