//! Chain event pipeline.
//!
//! A single websocket subscription delivers NewBlock notifications;
//! transaction events are synthesized by the block observer from
//! per-height block results rather than subscribed directly, which
//! sidesteps missed-transaction races across websocket reconnects.
//! Both flow through [`queue::unbounded_queue`] FIFOs into small
//! worker pools that route each event to the first matching handler.
//! Barrier events bypass the handler pool: the dequeue task completes
//! them against the block observer only once every in-flight handler
//! has finished, so the processed-height watermark never runs ahead of
//! work still being done for that block.

pub mod handlers;
pub mod queue;

use {crate::epochs::BlockInfo, std::collections::HashMap};

/// A transaction event as flattened by the block observer: one entry
/// per event attribute, keyed `type.attribute_key`, plus the height of
/// the enclosing block under `tx.height`.
#[derive(Debug, Clone, Default)]
pub struct TxEvent {
  pub height: i64,
  pub attributes: HashMap<String, String>,
}

impl TxEvent {
  pub fn get(&self, key: &str) -> Option<&str> {
    self.attributes.get(key).map(String::as_str)
  }

  pub fn has(&self, key: &str) -> bool {
    self.attributes.contains_key(key)
  }
}

#[derive(Debug, Clone)]
pub enum Event {
  /// A block announced over the websocket subscription.
  NewBlock(BlockInfo),
  /// A synthetic per-transaction event from the block observer.
  Tx(TxEvent),
  /// End-of-block marker: all tx events of `height` precede it.
  Barrier { height: i64 },
}
