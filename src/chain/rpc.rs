use {
  super::{types::*, ChainClient, Error, Result},
  crate::config::{BandwidthParams, ChainNodeConfig, ValidationParams},
  async_trait::async_trait,
  serde::{de::DeserializeOwned, Deserialize, Serialize},
  std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
  },
  tracing::debug,
};

/// Production chain client: tendermint JSON-RPC for node-level calls,
/// the chain's HTTP query gateway for module queries and message
/// submission. Transaction signing happens in the gateway's signer
/// sidecar keyed by the participant account, so messages go out as
/// plain JSON here.
pub struct HttpChainClient {
  http: reqwest::Client,
  rpc_url: String,
  api_url: String,
  request_id: AtomicU64,
}

impl HttpChainClient {
  pub fn new(chain: &ChainNodeConfig) -> Result<Self> {
    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(10))
      .build()?;
    let api_url = if chain.seed_api_url.is_empty() {
      chain.url.clone()
    } else {
      chain.seed_api_url.clone()
    };
    Ok(Self {
      http,
      rpc_url: chain.url.trim_end_matches('/').to_string(),
      api_url: api_url.trim_end_matches('/').to_string(),
      request_id: AtomicU64::new(1),
    })
  }

  async fn rpc_call<P: Serialize, T: DeserializeOwned>(
    &self,
    method: &str,
    params: P,
  ) -> Result<T> {
    #[derive(Deserialize)]
    struct Envelope<T> {
      result: Option<T>,
      error: Option<RpcError>,
    }
    #[derive(Deserialize)]
    struct RpcError {
      code: i64,
      message: String,
    }

    let id = self.request_id.fetch_add(1, Ordering::Relaxed);
    let body = serde_json::json!({
      "jsonrpc": "2.0",
      "id": id,
      "method": method,
      "params": params,
    });
    let envelope: Envelope<T> = self
      .http
      .post(&self.rpc_url)
      .json(&body)
      .send()
      .await?
      .json()
      .await?;
    if let Some(error) = envelope.error {
      return Err(Error::Rpc {
        code: error.code,
        message: error.message,
      });
    }
    envelope.result.ok_or_else(|| Error::Rpc {
      code: -1,
      message: format!("empty {method} response"),
    })
  }

  async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
    let url = format!("{}{path}", self.api_url);
    let response = self.http.get(&url).send().await?;
    if !response.status().is_success() {
      return Err(Error::Rpc {
        code: response.status().as_u16() as i64,
        message: url,
      });
    }
    Ok(response.json().await?)
  }

  async fn post_json<B: Serialize, T: DeserializeOwned>(
    &self,
    path: &str,
    body: &B,
  ) -> Result<T> {
    let url = format!("{}{path}", self.api_url);
    let response = self.http.post(&url).json(body).send().await?;
    if !response.status().is_success() {
      return Err(Error::Rpc {
        code: response.status().as_u16() as i64,
        message: url,
      });
    }
    Ok(response.json().await?)
  }

  async fn broadcast<B: Serialize>(&self, msg_name: &str, body: &B) -> Result<()> {
    #[derive(Deserialize)]
    struct Ack {
      #[serde(default)]
      code: i64,
      #[serde(default)]
      raw_log: String,
    }
    let ack: Ack = self.post_json(&format!("/v1/tx/{msg_name}"), body).await?;
    if ack.code != 0 {
      return Err(Error::Rpc {
        code: ack.code,
        message: ack.raw_log,
      });
    }
    debug!(msg_name, "transaction accepted");
    Ok(())
  }
}

#[async_trait]
impl ChainClient for HttpChainClient {
  async fn status(&self) -> Result<NodeStatus> {
    #[derive(Deserialize)]
    struct SyncInfo {
      latest_block_height: String,
      #[serde(default)]
      earliest_block_height: String,
      catching_up: bool,
    }
    #[derive(Deserialize)]
    struct Status {
      sync_info: SyncInfo,
    }

    let status: Status =
      self.rpc_call("status", serde_json::json!({})).await?;
    Ok(NodeStatus {
      latest_block_height: parse_height(&status.sync_info.latest_block_height)?,
      earliest_block_height: parse_height(
        &status.sync_info.earliest_block_height,
      )
      .unwrap_or(1),
      catching_up: status.sync_info.catching_up,
    })
  }

  async fn block_results(&self, height: i64) -> Result<BlockResults> {
    #[derive(Deserialize)]
    struct Raw {
      height: String,
      #[serde(default)]
      txs_results: Option<Vec<TxResult>>,
    }

    let raw: Raw = self
      .rpc_call(
        "block_results",
        serde_json::json!({ "height": height.to_string() }),
      )
      .await?;
    Ok(BlockResults {
      height: parse_height(&raw.height)?,
      txs_results: raw.txs_results.unwrap_or_default(),
    })
  }

  async fn epoch_info(&self) -> Result<EpochInfo> {
    self.get_json("/v1/epochs/current").await
  }

  async fn validation_params(&self) -> Result<ValidationParams> {
    self.get_json("/v1/inference/params/validation").await
  }

  async fn bandwidth_params(&self) -> Result<BandwidthParams> {
    self.get_json("/v1/inference/params/bandwidth").await
  }

  async fn participant(&self, address: &str) -> Result<ParticipantInfo> {
    self.get_json(&format!("/v1/participants/{address}")).await
  }

  async fn poc_batches_for_stage(&self, height: i64) -> Result<Vec<PocBatch>> {
    self.get_json(&format!("/v1/poc/batches/{height}")).await
  }

  async fn inferences_for_epoch(
    &self,
    epoch_index: u64,
  ) -> Result<Vec<InferenceSummary>> {
    self
      .get_json(&format!("/v1/inference/epoch/{epoch_index}"))
      .await
  }

  async fn inference(&self, inference_id: &str) -> Result<InferenceDetail> {
    self.get_json(&format!("/v1/inference/{inference_id}")).await
  }

  async fn inference_validation_details(
    &self,
    inference_ids: &[String],
  ) -> Result<Vec<InferenceValidationDetails>> {
    self
      .post_json(
        "/v1/inference/validation-details",
        &serde_json::json!({ "inference_ids": inference_ids }),
      )
      .await
  }

  async fn epoch_group_validations(
    &self,
    participant: &str,
    epoch_index: u64,
  ) -> Result<Vec<String>> {
    self
      .get_json(&format!("/v1/epochs/{epoch_index}/validations/{participant}"))
      .await
  }

  async fn grantees_by_message_type(
    &self,
    granter: &str,
    message_type: &str,
  ) -> Result<Vec<String>> {
    self
      .get_json(&format!(
        "/v1/authz/grantees?granter={granter}&msg_type={message_type}"
      ))
      .await
  }

  async fn hardware_nodes(
    &self,
    participant: &str,
  ) -> Result<Vec<HardwareNode>> {
    self.get_json(&format!("/v1/hardware/{participant}")).await
  }

  async fn ml_node_version(&self) -> Result<String> {
    #[derive(Deserialize)]
    struct Version {
      version: String,
    }
    let version: Version = self.get_json("/v1/ml-node-version").await?;
    Ok(version.version)
  }

  async fn models_all(&self) -> Result<Vec<ModelInfo>> {
    self.get_json("/v1/models").await
  }

  async fn current_epoch_group_data(&self) -> Result<EpochGroupData> {
    self.get_json("/v1/epochs/current/group").await
  }

  async fn epoch_group_data_by_model(
    &self,
    model_id: &str,
  ) -> Result<EpochGroupData> {
    self
      .get_json(&format!("/v1/epochs/current/group/{model_id}"))
      .await
  }

  async fn submit_seed(&self, msg: MsgSubmitSeed) -> Result<()> {
    self.broadcast("submit-seed", &msg).await
  }

  async fn claim_rewards(&self, msg: MsgClaimRewards) -> Result<()> {
    self.broadcast("claim-rewards", &msg).await
  }

  async fn submit_validation(&self, msg: MsgValidation) -> Result<()> {
    self.broadcast("validation", &msg).await
  }

  async fn submit_dealer_part(&self, msg: MsgSubmitDealerPart) -> Result<()> {
    self.broadcast("submit-dealer-part", &msg).await
  }

  async fn submit_group_key_validation_signature(
    &self,
    msg: MsgSubmitGroupKeyValidationSignature,
  ) -> Result<()> {
    self
      .broadcast("submit-group-key-validation-signature", &msg)
      .await
  }

  async fn submit_partial_signature(
    &self,
    msg: MsgSubmitPartialSignature,
  ) -> Result<()> {
    self.broadcast("submit-partial-signature", &msg).await
  }

  async fn submit_hardware_diff(
    &self,
    msg: MsgSubmitHardwareDiff,
  ) -> Result<()> {
    self.broadcast("submit-hardware-diff", &msg).await
  }
}

fn parse_height(raw: &str) -> Result<i64> {
  raw
    .parse()
    .map_err(|_| Error::Other(format!("unparseable height: {raw:?}")))
}
