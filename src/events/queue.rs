use {
  std::{
    collections::VecDeque,
    sync::{
      atomic::{AtomicBool, Ordering},
      Arc,
    },
  },
  tokio::sync::mpsc,
};

/// A FIFO whose producer side never blocks and never drops.
///
/// Between the unbounded intake and the bounded consumer channel sits
/// a manager task with an internal buffer, so producers (the websocket
/// reader and the block observer) stay decoupled from however slowly
/// workers drain the queue. A bounded channel with a drop policy is
/// not an option here: losing or reordering a barrier event would
/// corrupt the processed-height bookkeeping.
pub struct QueueSender<T> {
  tx: mpsc::UnboundedSender<T>,
  closed: Arc<AtomicBool>,
}

impl<T> Clone for QueueSender<T> {
  fn clone(&self) -> Self {
    Self {
      tx: self.tx.clone(),
      closed: Arc::clone(&self.closed),
    }
  }
}

impl<T> QueueSender<T> {
  /// Enqueues an item. Returns false once the queue is closed.
  pub fn push(&self, item: T) -> bool {
    if self.closed.load(Ordering::Acquire) {
      return false;
    }
    self.tx.send(item).is_ok()
  }

  /// Closing is idempotent; buffered items still drain to the
  /// consumer.
  pub fn close(&self) {
    self.closed.store(true, Ordering::Release);
  }
}

/// Creates the queue. `capacity` bounds only the consumer-facing
/// channel; the intake side is unbounded.
pub fn unbounded_queue<T: Send + 'static>(
  capacity: usize,
) -> (QueueSender<T>, mpsc::Receiver<T>) {
  let (in_tx, mut in_rx) = mpsc::unbounded_channel::<T>();
  let (out_tx, out_rx) = mpsc::channel::<T>(capacity);
  let closed = Arc::new(AtomicBool::new(false));

  tokio::spawn(async move {
    let mut buffer: VecDeque<T> = VecDeque::new();
    loop {
      if buffer.is_empty() {
        match in_rx.recv().await {
          Some(item) => buffer.push_back(item),
          None => break,
        }
      } else {
        tokio::select! {
          incoming = in_rx.recv() => match incoming {
            Some(item) => buffer.push_back(item),
            None => break,
          },
          permit = out_tx.reserve() => match permit {
            Ok(permit) => permit.send(buffer.pop_front().unwrap()),
            // consumer went away, nothing left to do
            Err(_) => return,
          },
        }
      }
    }
    // intake closed, drain whatever is buffered
    while let Some(item) = buffer.pop_front() {
      if out_tx.send(item).await.is_err() {
        return;
      }
    }
  });

  (
    QueueSender {
      tx: in_tx,
      closed,
    },
    out_rx,
  )
}

#[cfg(test)]
mod test {
  use super::unbounded_queue;

  #[tokio::test]
  async fn preserves_order_past_consumer_capacity() {
    let (tx, mut rx) = unbounded_queue::<u32>(2);
    for i in 0..100 {
      assert!(tx.push(i));
    }
    for i in 0..100 {
      assert_eq!(rx.recv().await, Some(i));
    }
  }

  #[tokio::test]
  async fn close_is_idempotent_and_stops_intake() {
    let (tx, mut rx) = unbounded_queue::<u32>(4);
    assert!(tx.push(1));
    tx.close();
    tx.close();
    assert!(!tx.push(2));
    assert_eq!(rx.recv().await, Some(1));
  }
}
