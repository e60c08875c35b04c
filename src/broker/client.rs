use {
  crate::config::{Hardware, InferenceNodeConfig, MlNodeKeyConfig},
  async_trait::async_trait,
  indexmap::IndexMap,
  serde::{Deserialize, Serialize},
  std::{sync::Arc, time::Duration},
  tracing::debug,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("ml node unreachable: {0}")]
  Http(#[from] reqwest::Error),

  #[error("ml node returned status {0}")]
  Status(u16),

  #[error("malformed ml node response: {0}")]
  Decode(#[from] serde_json::Error),
}

/// Payload of the three service-switching calls. Commands are
/// self-contained, so everything a node needs to enter a stage rides
/// along here instead of being re-read from shared state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InitDto {
  pub node_id: String,
  pub block_height: i64,
  pub block_hash: String,
  pub public_key: String,
  #[serde(default)]
  pub seed: i64,
  pub models: IndexMap<String, Vec<String>>,
  #[serde(default)]
  pub callback_url: String,
  #[serde(default)]
  pub key_config: Option<MlNodeKeyConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidateBatchDto {
  pub participant: String,
  pub poc_stage_start_block_height: i64,
  pub nonces: Vec<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelStatus {
  pub model: String,
  pub downloaded: bool,
}

/// The HTTP surface of one local ML worker. Split in a trait so tests
/// can script workers without sockets.
#[async_trait]
pub trait MlNodeApi: Send + Sync {
  async fn init_generate(&self, dto: &InitDto) -> Result<(), Error>;
  async fn init_validate(&self, dto: &InitDto) -> Result<(), Error>;
  async fn inference_up(&self, dto: &InitDto) -> Result<(), Error>;
  async fn stop(&self) -> Result<(), Error>;
  async fn validate_batch(&self, dto: &ValidateBatchDto) -> Result<(), Error>;
  async fn model_status(&self) -> Result<Vec<ModelStatus>, Error>;
  async fn download_model(&self, model_id: &str) -> Result<(), Error>;
  async fn gpu_devices(&self) -> Result<Vec<Hardware>, Error>;
  async fn chat_completion(
    &self,
    body: serde_json::Value,
  ) -> Result<serde_json::Value, Error>;
}

/// Builds per-node clients. The broker resolves a client once per
/// registered node and again whenever the advertised node version
/// changes (the version becomes a path segment).
pub trait MlNodeClientFactory: Send + Sync {
  fn client(
    &self,
    node: &InferenceNodeConfig,
    version: &str,
  ) -> Arc<dyn MlNodeApi>;
}

pub struct HttpMlNodeFactory {
  http: reqwest::Client,
}

impl HttpMlNodeFactory {
  pub fn new() -> Result<Self, Error> {
    Ok(Self {
      http: reqwest::Client::builder()
        .timeout(Duration::from_secs(300))
        .build()?,
    })
  }
}

impl MlNodeClientFactory for HttpMlNodeFactory {
  fn client(
    &self,
    node: &InferenceNodeConfig,
    version: &str,
  ) -> Arc<dyn MlNodeApi> {
    Arc::new(HttpMlNodeClient {
      http: self.http.clone(),
      inference_base: service_base(
        &node.host,
        node.inference_port,
        &node.inference_segment,
        version,
      ),
      poc_base: service_base(&node.host, node.poc_port, &node.poc_segment, version),
    })
  }
}

fn service_base(host: &str, port: u16, segment: &str, version: &str) -> String {
  let mut base = format!("http://{host}:{port}");
  for part in [segment, version] {
    if !part.is_empty() {
      base.push('/');
      base.push_str(part.trim_matches('/'));
    }
  }
  base
}

/// Talks to one worker over plain HTTP. Management endpoints live on
/// the PoC service, completions on the inference service.
pub struct HttpMlNodeClient {
  http: reqwest::Client,
  inference_base: String,
  poc_base: String,
}

impl HttpMlNodeClient {
  async fn post<B: Serialize>(&self, url: String, body: &B) -> Result<(), Error> {
    debug!(%url, "ml node call");
    let response = self.http.post(&url).json(body).send().await?;
    if !response.status().is_success() {
      return Err(Error::Status(response.status().as_u16()));
    }
    Ok(())
  }
}

#[async_trait]
impl MlNodeApi for HttpMlNodeClient {
  async fn init_generate(&self, dto: &InitDto) -> Result<(), Error> {
    self.post(format!("{}/init_generate", self.poc_base), dto).await
  }

  async fn init_validate(&self, dto: &InitDto) -> Result<(), Error> {
    self.post(format!("{}/init_validate", self.poc_base), dto).await
  }

  async fn inference_up(&self, dto: &InitDto) -> Result<(), Error> {
    self.post(format!("{}/inference_up", self.poc_base), dto).await
  }

  async fn stop(&self) -> Result<(), Error> {
    self
      .post(format!("{}/stop", self.poc_base), &serde_json::json!({}))
      .await
  }

  async fn validate_batch(&self, dto: &ValidateBatchDto) -> Result<(), Error> {
    self.post(format!("{}/validate_batch", self.poc_base), dto).await
  }

  async fn model_status(&self) -> Result<Vec<ModelStatus>, Error> {
    let url = format!("{}/model_status", self.poc_base);
    let response = self.http.get(&url).send().await?;
    if !response.status().is_success() {
      return Err(Error::Status(response.status().as_u16()));
    }
    Ok(response.json().await?)
  }

  async fn download_model(&self, model_id: &str) -> Result<(), Error> {
    self
      .post(
        format!("{}/download_model", self.poc_base),
        &serde_json::json!({ "model": model_id }),
      )
      .await
  }

  async fn gpu_devices(&self) -> Result<Vec<Hardware>, Error> {
    let url = format!("{}/gpu_devices", self.poc_base);
    let response = self.http.get(&url).send().await?;
    if !response.status().is_success() {
      return Err(Error::Status(response.status().as_u16()));
    }
    Ok(response.json().await?)
  }

  async fn chat_completion(
    &self,
    body: serde_json::Value,
  ) -> Result<serde_json::Value, Error> {
    let url = format!("{}/v1/chat/completions", self.inference_base);
    let response = self.http.post(&url).json(&body).send().await?;
    if !response.status().is_success() {
      return Err(Error::Status(response.status().as_u16()));
    }
    Ok(response.json().await?)
  }
}

#[cfg(test)]
mod test {
  use super::service_base;

  #[test]
  fn base_url_includes_segment_and_version() {
    assert_eq!(
      service_base("10.0.0.5", 8080, "", ""),
      "http://10.0.0.5:8080"
    );
    assert_eq!(
      service_base("10.0.0.5", 8080, "poc", ""),
      "http://10.0.0.5:8080/poc"
    );
    assert_eq!(
      service_base("10.0.0.5", 8080, "poc", "v0.2.1"),
      "http://10.0.0.5:8080/poc/v0.2.1"
    );
  }
}
