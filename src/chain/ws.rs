use {
  crate::{
    epochs::BlockInfo,
    events::{queue::QueueSender, Event},
    upgrade::UpgradeManager,
  },
  futures::{SinkExt, StreamExt},
  std::{sync::Arc, time::Duration},
  tokio::sync::watch,
  tokio_tungstenite::{connect_async, tungstenite::Message},
  tracing::{debug, info, warn},
};

const RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Derives the websocket endpoint from the chain node's RPC url.
pub fn websocket_url(rpc_url: &str) -> String {
  let base = rpc_url.trim_end_matches('/');
  let base = base
    .replacen("https://", "wss://", 1)
    .replacen("http://", "ws://", 1);
  format!("{base}/websocket")
}

/// Maintains the single NewBlock subscription for the lifetime of the
/// process. Any read failure or closure tears the connection down,
/// gives the pending-upgrade check a chance to stop the process, and
/// reconnects after a fixed delay. Transaction events are not
/// subscribed here on purpose; the block observer re-derives them from
/// block results so reconnect gaps cannot lose any.
pub async fn run_block_subscription(
  url: String,
  queue: QueueSender<Event>,
  upgrade: Arc<UpgradeManager>,
  mut shutdown: watch::Receiver<bool>,
) {
  loop {
    if *shutdown.borrow() {
      return;
    }

    let connection = tokio::select! {
      connection = connect_async(&url) => connection,
      _ = shutdown.changed() => return,
    };
    let (mut stream, _) = match connection {
      Ok(ok) => ok,
      Err(e) => {
        warn!("websocket connect to {url} failed: {e}");
        tokio::time::sleep(RECONNECT_DELAY).await;
        continue;
      }
    };

    let subscribe = serde_json::json!({
      "jsonrpc": "2.0",
      "id": 1,
      "method": "subscribe",
      "params": { "query": "tm.event='NewBlock'" },
    });
    if let Err(e) = stream.send(Message::Text(subscribe.to_string())).await {
      warn!("websocket subscribe failed: {e}");
      tokio::time::sleep(RECONNECT_DELAY).await;
      continue;
    }
    info!("subscribed to NewBlock events at {url}");

    loop {
      let message = tokio::select! {
        message = stream.next() => message,
        _ = shutdown.changed() => return,
      };
      match message {
        Some(Ok(Message::Text(text))) => {
          if let Some(block) = parse_new_block(&text) {
            debug!(height = block.height, "new block");
            queue.push(Event::NewBlock(block));
          }
        }
        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
        Some(Ok(Message::Close(_))) | None => {
          warn!("websocket closed by remote");
          break;
        }
        Some(Ok(_)) => {}
        Some(Err(e)) => {
          warn!("websocket read error: {e}");
          break;
        }
      }
    }

    // a scheduled upgrade whose height we already reached is applied
    // on disconnect, it terminates the process
    upgrade.check_on_disconnect().await;
    tokio::time::sleep(RECONNECT_DELAY).await;
  }
}

fn parse_new_block(raw: &str) -> Option<BlockInfo> {
  let value: serde_json::Value = serde_json::from_str(raw).ok()?;
  let block = &value["result"]["data"]["value"];
  let height = block["block"]["header"]["height"].as_str()?.parse().ok()?;
  let hash = block["block_id"]["hash"].as_str().unwrap_or("").to_string();
  Some(BlockInfo { height, hash })
}

#[cfg(test)]
mod test {
  use super::{parse_new_block, websocket_url};

  #[test]
  fn derives_websocket_url() {
    assert_eq!(
      websocket_url("http://localhost:26657"),
      "ws://localhost:26657/websocket"
    );
    assert_eq!(
      websocket_url("https://chain.example.com/"),
      "wss://chain.example.com/websocket"
    );
  }

  #[test]
  fn parses_new_block_notification() {
    let raw = r#"{
      "result": {
        "data": {
          "value": {
            "block": { "header": { "height": "1203" } },
            "block_id": { "hash": "C0FFEE" }
          }
        }
      }
    }"#;
    let block = parse_new_block(raw).unwrap();
    assert_eq!(block.height, 1203);
    assert_eq!(block.hash, "C0FFEE");

    assert!(parse_new_block("{}").is_none());
    assert!(parse_new_block("not json").is_none());
  }
}
