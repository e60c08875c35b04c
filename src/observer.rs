//! Block observer.
//!
//! Turns chain blocks into an ordered stream of synthetic transaction
//! events with a barrier marker per height. The websocket only tells
//! us that a block exists; the observer re-reads every block's
//! transaction results over JSON-RPC, so events survive websocket
//! reconnects and always arrive in block order, at least once.

use {
  crate::{
    chain::{types::TxResult, ChainClient},
    events::{queue::QueueSender, Event, TxEvent},
    store::ConfigStore,
  },
  std::sync::Arc,
  tokio::sync::watch,
  tracing::{debug, info, warn},
};

/// Falling further behind than this many blocks (a restart after
/// downtime, typically) switches to snapshot catch-up so we never ask
/// the node for blocks it has already pruned.
const CATCHUP_THRESHOLD: i64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct ObservedStatus {
  height: i64,
  is_synced: bool,
}

pub struct BlockObserver {
  chain: Arc<dyn ChainClient>,
  store: Arc<ConfigStore>,
  queue: QueueSender<Event>,
  status: watch::Sender<ObservedStatus>,
}

impl BlockObserver {
  pub fn new(
    chain: Arc<dyn ChainClient>,
    store: Arc<ConfigStore>,
    queue: QueueSender<Event>,
  ) -> Arc<Self> {
    let (status, _) = watch::channel(ObservedStatus::default());
    Arc::new(Self {
      chain,
      store,
      queue,
      status,
    })
  }

  /// Called on every processed NewBlock. Duplicate notifications
  /// coalesce in the single watch slot; an unchanged status is a
  /// no-op and does not wake the worker.
  pub fn update_status(&self, height: i64, is_synced: bool) {
    self.status.send_if_modified(|current| {
      let next = ObservedStatus { height, is_synced };
      if *current == next {
        return false;
      }
      *current = next;
      true
    });
  }

  /// Barrier consumption hook: advances the processed-height
  /// watermark. Replayed barriers (at-least-once delivery) are dropped
  /// here.
  pub fn complete_barrier(&self, height: i64) {
    if !self.store.set_last_processed_height(height) {
      warn!(
        height,
        watermark = self.store.last_processed_height(),
        "dropping barrier for an already processed height"
      );
    }
  }

  /// The single observer worker. Owns the `last_queried` cursor; only
  /// this task fetches block results and enqueues events, which is
  /// what makes the per-block ordering guarantee hold.
  pub fn spawn_worker(
    self: &Arc<Self>,
    mut shutdown: watch::Receiver<bool>,
  ) -> tokio::task::JoinHandle<()> {
    let observer = Arc::clone(self);
    let mut status_rx = observer.status.subscribe();
    tokio::spawn(async move {
      let mut last_queried = observer.store.last_processed_height();
      loop {
        tokio::select! {
          changed = status_rx.changed() => {
            if changed.is_err() {
              return;
            }
          }
          _ = shutdown.changed() => return,
        }
        let status = *status_rx.borrow();
        if !status.is_synced {
          continue;
        }
        observer.drain_to(status.height, &mut last_queried).await;
      }
    })
  }

  async fn drain_to(&self, target: i64, last_queried: &mut i64) {
    if *last_queried == 0 || target - *last_queried > CATCHUP_THRESHOLD {
      match self.chain.status().await {
        Ok(status) => {
          let resume = (target - CATCHUP_THRESHOLD)
            .max(status.earliest_block_height)
            .max(1);
          info!(
            from = *last_queried,
            resume, "catching up from snapshot height"
          );
          *last_queried = resume - 1;
        }
        Err(e) => {
          warn!("status query for catch-up failed: {e}");
          return;
        }
      }
    }

    while *last_queried < target {
      let next = *last_queried + 1;
      let results = match self.chain.block_results(next).await {
        Ok(results) => results,
        Err(e) => {
          // no silent retry; the next status update resumes from here
          warn!(height = next, "block results fetch failed: {e}");
          return;
        }
      };

      for tx in &results.txs_results {
        self.queue.push(Event::Tx(flatten_tx(next, tx)));
      }
      self.queue.push(Event::Barrier { height: next });
      debug!(height = next, txs = results.txs_results.len(), "block drained");

      // the cursor only moves once the barrier is enqueued
      *last_queried = next;
    }
  }
}

/// Flattens all attributes of all events of one transaction into a
/// single map keyed `event_type.attribute_key`, tagged with the block
/// height.
fn flatten_tx(height: i64, tx: &TxResult) -> TxEvent {
  let mut event = TxEvent {
    height,
    ..Default::default()
  };
  event
    .attributes
    .insert("tx.height".into(), height.to_string());
  for abci_event in &tx.events {
    for attribute in &abci_event.attributes {
      event.attributes.insert(
        format!("{}.{}", abci_event.kind, attribute.key),
        attribute.value.clone(),
      );
    }
  }
  event
}

#[cfg(test)]
mod test {
  use {
    super::flatten_tx,
    crate::chain::types::{AbciEvent, EventAttribute, TxResult},
  };

  #[test]
  fn flattening_prefixes_attribute_keys() {
    let tx = TxResult {
      events: vec![AbciEvent {
        kind: "inference_finished".into(),
        attributes: vec![EventAttribute {
          key: "inference_id".into(),
          value: "inf-1".into(),
        }],
      }],
    };
    let event = flatten_tx(42, &tx);
    assert_eq!(event.height, 42);
    assert_eq!(event.get("tx.height"), Some("42"));
    assert_eq!(event.get("inference_finished.inference_id"), Some("inf-1"));
  }
}
