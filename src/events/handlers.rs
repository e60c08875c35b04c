use {
  super::Event,
  crate::{
    bls::BlsSubsystem,
    dispatcher::Dispatcher,
    observer::BlockObserver,
    store::ConfigStore,
    upgrade::UpgradeManager,
    validator::InferenceValidator,
  },
  async_trait::async_trait,
  std::{
    sync::{
      atomic::{AtomicUsize, Ordering},
      Arc,
    },
    time::Duration,
  },
  tokio::sync::{mpsc, Notify, Semaphore},
  tracing::{debug, error, info, warn},
};

/// One routed event consumer. The router walks handlers in
/// registration order and hands the event to the first one whose
/// `can_handle` matches.
#[async_trait]
pub trait EventHandler: Send + Sync {
  fn can_handle(&self, event: &Event) -> bool;
  async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// Drains `receiver` on a single dequeue task, running handlers on up
/// to `count` concurrent tasks.
///
/// Barriers never enter the handler pool: the dequeue task consumes
/// them itself, and only after every previously dispatched handler has
/// finished. All tx events of a block sit before its barrier in the
/// queue, so by the time the barrier's turn comes they are all at
/// least in flight; waiting for the in-flight count to drain is what
/// keeps the processed-height watermark from overtaking a handler that
/// is still working on that block. Advancing it early would let a
/// crash-restart resume past events that were never handled.
pub fn spawn_workers(
  name: &'static str,
  count: usize,
  mut receiver: mpsc::Receiver<Event>,
  handlers: Arc<Vec<Arc<dyn EventHandler>>>,
  completion: Option<Arc<BlockObserver>>,
) -> tokio::task::JoinHandle<()> {
  tokio::spawn(async move {
    let limiter = Arc::new(Semaphore::new(count));
    let in_flight = Arc::new(AtomicUsize::new(0));
    let drained = Arc::new(Notify::new());

    while let Some(event) = receiver.recv().await {
      if let Event::Barrier { height } = &event {
        loop {
          let notified = drained.notified();
          if in_flight.load(Ordering::Acquire) == 0 {
            break;
          }
          notified.await;
        }
        match &completion {
          Some(observer) => observer.complete_barrier(*height),
          None => debug!(name, height, "barrier without a completion hook"),
        }
        continue;
      }

      let Ok(permit) = Arc::clone(&limiter).acquire_owned().await else {
        break;
      };
      in_flight.fetch_add(1, Ordering::AcqRel);
      let handlers = Arc::clone(&handlers);
      let in_flight = Arc::clone(&in_flight);
      let drained = Arc::clone(&drained);
      tokio::spawn(async move {
        dispatch(&handlers, &event).await;
        drop(permit);
        if in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
          drained.notify_waiters();
        }
      });
    }
    debug!(name, "event workers drained");
  })
}

async fn dispatch(handlers: &[Arc<dyn EventHandler>], event: &Event) {
  for handler in handlers {
    if handler.can_handle(event) {
      if let Err(e) = handler.handle(event).await {
        error!("event handler failed: {e:#}");
      }
      return;
    }
  }
  debug!("no handler for event: {event:?}");
}

/// Transaction events reference chain state at their height; when the
/// local view lags behind, wait for it to catch up instead of querying
/// state the node has not seen yet. Bounded spin so a stuck observer
/// cannot wedge a worker forever.
pub async fn wait_for_height(store: &ConfigStore, height: i64) {
  for _ in 0..300 {
    if store.get_height() >= height {
      return;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
  }
  warn!(
    height,
    local = store.get_height(),
    "giving up waiting for local height to catch up"
  );
}

pub struct InferenceFinishedHandler {
  pub validator: Arc<InferenceValidator>,
  pub store: Arc<ConfigStore>,
}

#[async_trait]
impl EventHandler for InferenceFinishedHandler {
  fn can_handle(&self, event: &Event) -> bool {
    matches!(event, Event::Tx(tx) if tx.has("inference_finished.inference_id"))
  }

  async fn handle(&self, event: &Event) -> anyhow::Result<()> {
    let Event::Tx(tx) = event else { unreachable!() };
    wait_for_height(&self.store, tx.height).await;
    let ids = vec![tx
      .get("inference_finished.inference_id")
      .unwrap()
      .to_string()];
    self.validator.sample_inferences_to_validate(ids).await;
    Ok(())
  }
}

pub struct RevalidationHandler {
  pub validator: Arc<InferenceValidator>,
  pub store: Arc<ConfigStore>,
}

#[async_trait]
impl EventHandler for RevalidationHandler {
  fn can_handle(&self, event: &Event) -> bool {
    matches!(
      event,
      Event::Tx(tx)
        if tx.get("inference_validation.needs_revalidation") == Some("true")
    )
  }

  async fn handle(&self, event: &Event) -> anyhow::Result<()> {
    let Event::Tx(tx) = event else { unreachable!() };
    let Some(id) = tx.get("inference_validation.inference_id") else {
      warn!("revalidation event without an inference id");
      return Ok(());
    };
    wait_for_height(&self.store, tx.height).await;
    self.validator.verify_invalidation(id.to_string()).await;
    Ok(())
  }
}

pub struct ThresholdSigningHandler {
  pub bls: Arc<BlsSubsystem>,
}

#[async_trait]
impl EventHandler for ThresholdSigningHandler {
  fn can_handle(&self, event: &Event) -> bool {
    matches!(
      event,
      Event::Tx(tx)
        if tx.has("inference.bls.EventThresholdSigningRequested.request_id")
    )
  }

  async fn handle(&self, event: &Event) -> anyhow::Result<()> {
    let Event::Tx(tx) = event else { unreachable!() };
    let request_id = tx
      .get("inference.bls.EventThresholdSigningRequested.request_id")
      .unwrap();
    let data = tx
      .get("inference.bls.EventThresholdSigningRequested.data")
      .unwrap_or_default();
    self
      .bls
      .process_threshold_signing_requested(request_id, data)
      .await?;
    Ok(())
  }
}

/// Training tasks are executed by an external component; the node only
/// acknowledges the assignment here.
pub struct TrainingTaskHandler;

#[async_trait]
impl EventHandler for TrainingTaskHandler {
  fn can_handle(&self, event: &Event) -> bool {
    matches!(event, Event::Tx(tx) if tx.has("training_task_assigned.task_id"))
  }

  async fn handle(&self, event: &Event) -> anyhow::Result<()> {
    let Event::Tx(tx) = event else { unreachable!() };
    info!(
      task_id = tx.get("training_task_assigned.task_id").unwrap(),
      "training task assigned to this participant"
    );
    Ok(())
  }
}

pub struct ProposalHandler;

#[async_trait]
impl EventHandler for ProposalHandler {
  fn can_handle(&self, event: &Event) -> bool {
    matches!(event, Event::Tx(tx) if tx.has("submit_proposal.proposal_id"))
  }

  async fn handle(&self, event: &Event) -> anyhow::Result<()> {
    let Event::Tx(tx) = event else { unreachable!() };
    info!(
      proposal_id = tx.get("submit_proposal.proposal_id").unwrap(),
      "governance proposal submitted"
    );
    Ok(())
  }
}

/// The per-block fan-out: epoch orchestration, upgrade bookkeeping and
/// the DKG phase handlers, the latter only while the chain node is
/// synced.
pub struct NewBlockHandler {
  pub dispatcher: Arc<Dispatcher>,
  pub upgrade: Arc<UpgradeManager>,
  pub bls: Arc<BlsSubsystem>,
}

#[async_trait]
impl EventHandler for NewBlockHandler {
  fn can_handle(&self, event: &Event) -> bool {
    matches!(event, Event::NewBlock(_))
  }

  async fn handle(&self, event: &Event) -> anyhow::Result<()> {
    let Event::NewBlock(block) = event else {
      unreachable!()
    };
    let state = self.dispatcher.process_new_block(block.clone()).await;
    self.upgrade.check_height(block.height).await?;
    if state.map(|s| s.is_synced).unwrap_or(false) {
      if let Err(e) = self.bls.process_new_block(block.height).await {
        warn!("dkg processing failed at height {}: {e:#}", block.height);
      }
    }
    Ok(())
  }
}
