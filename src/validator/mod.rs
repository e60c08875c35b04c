//! Inference validator.
//!
//! Two entry paths share one validation primitive: real-time sampling
//! on `inference_finished` events, and the missed-validation recovery
//! sweep that runs right before rewards are claimed for an epoch. Both
//! decide what to validate with the same deterministic selection
//! predicate, differing only in which epoch seed they feed it.

pub mod exec;
pub mod select;
pub mod similarity;

use {
  crate::{
    broker::{self, NodeBroker},
    chain::{types::MsgValidation, ChainClient},
    config::SeedInfo,
    keys::Pubkey,
    store::ConfigStore,
  },
  dashmap::DashMap,
  futures::future::join_all,
  std::{collections::HashSet, sync::Arc, time::Duration},
  tracing::{debug, info, warn},
};

const RETRY_ATTEMPTS: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_secs(240);

enum ValidateError {
  /// No registered node can serve the model right now.
  NoNodes,
  Transient(anyhow::Error),
}

pub struct InferenceValidator {
  chain: Arc<dyn ChainClient>,
  broker: NodeBroker,
  store: Arc<ConfigStore>,
  me: Pubkey,
  in_flight: DashMap<String, ()>,
  retry_attempts: u32,
  retry_delay: Duration,
}

impl InferenceValidator {
  pub fn new(
    chain: Arc<dyn ChainClient>,
    broker: NodeBroker,
    store: Arc<ConfigStore>,
    me: Pubkey,
  ) -> Self {
    Self {
      chain,
      broker,
      store,
      me,
      in_flight: DashMap::new(),
      retry_attempts: RETRY_ATTEMPTS,
      retry_delay: RETRY_DELAY,
    }
  }

  /// Shrinks the retry schedule; test fixtures use this to avoid
  /// multi-minute sleeps.
  pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
    self.retry_attempts = attempts;
    self.retry_delay = delay;
    self
  }

  /// Real-time sampling path for freshly finished inferences. Selected
  /// ids validate on background tasks so event workers are never held
  /// up by node locks or retry backoff.
  pub async fn sample_inferences_to_validate(
    self: &Arc<Self>,
    inference_ids: Vec<String>,
  ) {
    let details = match self
      .chain
      .inference_validation_details(&inference_ids)
      .await
    {
      Ok(details) => details,
      Err(e) => {
        warn!("validation details query failed: {e}");
        return;
      }
    };
    let my_power = match self.chain.participant(&self.me.to_string()).await {
      Ok(participant) => participant.power,
      Err(e) => {
        warn!("own participant query failed: {e}");
        return;
      }
    };

    let supported = self.store.supported_models();
    let seed = self.store.current_seed();
    let params = self.store.validation_params();
    let me = self.me.to_string();

    for detail in details {
      if detail.executor_id == me {
        continue;
      }
      if detail.total_power <= detail.executor_power {
        continue;
      }
      if !supported.contains(&detail.model) {
        continue;
      }
      if !select::should_validate(seed.seed, &detail, my_power, &params) {
        continue;
      }
      debug!(inference = %detail.inference_id, "selected for validation");
      let validator = Arc::clone(self);
      tokio::spawn(async move {
        validator
          .validate_with_retry(detail.inference_id, false)
          .await;
      });
    }
  }

  /// Re-validation requested by the chain for a contested inference.
  pub async fn verify_invalidation(self: &Arc<Self>, inference_id: String) {
    info!(inference = %inference_id, "revalidation requested");
    let validator = Arc::clone(self);
    tokio::spawn(async move {
      validator.validate_with_retry(inference_id, true).await;
    });
  }

  /// Runs the primitive with the configured retry schedule. Node
  /// shortage aborts quietly after the budget (the model simply is not
  /// served here); other failures are logged on every attempt.
  pub async fn validate_with_retry(
    self: &Arc<Self>,
    inference_id: String,
    revalidation: bool,
  ) {
    if self.in_flight.insert(inference_id.clone(), ()).is_some() {
      debug!(inference = %inference_id, "validation already in flight");
      return;
    }
    for attempt in 1..=self.retry_attempts {
      match self.validate_once(&inference_id, revalidation).await {
        Ok(()) => break,
        Err(ValidateError::NoNodes) => {
          debug!(
            inference = %inference_id,
            attempt,
            "no node available for validation"
          );
        }
        Err(ValidateError::Transient(e)) => {
          warn!(inference = %inference_id, attempt, "validation failed: {e:#}");
        }
      }
      if attempt < self.retry_attempts {
        tokio::time::sleep(self.retry_delay).await;
      }
    }
    self.in_flight.remove(&inference_id);
  }

  async fn validate_once(
    &self,
    inference_id: &str,
    revalidation: bool,
  ) -> Result<(), ValidateError> {
    let detail = self
      .chain
      .inference(inference_id)
      .await
      .map_err(|e| ValidateError::Transient(e.into()))?;

    let locked =
      self
        .broker
        .lock_node(&detail.model)
        .await
        .map_err(|e| match e {
          broker::Error::NoNodesAvailable(_) => ValidateError::NoNodes,
          other => ValidateError::Transient(other.into()),
        })?;
    let outcome = exec::execute_validation(&locked.client, &detail)
      .await
      .map_err(|e| ValidateError::Transient(e.into()))?;
    drop(locked);

    info!(
      inference = %inference_id,
      value = outcome.verdict.value(),
      passes = outcome.verdict.passes(),
      revalidation,
      "validation verdict"
    );
    self
      .chain
      .submit_validation(MsgValidation {
        inference_id: inference_id.to_string(),
        response_hash: outcome.response_hash,
        value: outcome.verdict.value(),
        revalidation,
      })
      .await
      .map_err(|e| ValidateError::Transient(e.into()))
  }

  /// Deterministic sweep over the previous epoch: every inference the
  /// previous seed selects but we never reported gets validated now,
  /// before rewards for that epoch are claimed. The caller must not
  /// claim until this returns.
  pub async fn execute_missed_validation_recovery(
    self: &Arc<Self>,
    previous_epoch: u64,
    previous_seed: &SeedInfo,
    epoch_length: i64,
  ) {
    const DETAIL_BATCH: usize = 1000;

    let summaries = match self.chain.inferences_for_epoch(previous_epoch).await
    {
      Ok(summaries) => summaries,
      Err(e) => {
        warn!("inference enumeration for recovery failed: {e}");
        return;
      }
    };
    let ids: Vec<String> = summaries
      .into_iter()
      .filter(|s| s.epoch_id == previous_epoch)
      .map(|s| s.inference_id)
      .collect();

    let mut details = Vec::with_capacity(ids.len());
    for chunk in ids.chunks(DETAIL_BATCH) {
      match self.chain.inference_validation_details(chunk).await {
        Ok(mut batch) => details.append(&mut batch),
        Err(e) => warn!("validation details batch failed: {e}"),
      }
    }

    let validated: HashSet<String> = match self
      .chain
      .epoch_group_validations(&self.me.to_string(), previous_epoch)
      .await
    {
      Ok(ids) => ids.into_iter().collect(),
      Err(e) => {
        warn!("validated-set query failed, assuming none: {e}");
        HashSet::new()
      }
    };
    let my_power = match self.chain.participant(&self.me.to_string()).await {
      Ok(participant) => participant.power,
      Err(e) => {
        warn!("own participant query failed, skipping recovery: {e}");
        return;
      }
    };

    let supported = self.store.supported_models();
    let params = self.store.validation_params();
    let me = self.me.to_string();

    let mut pending = Vec::new();
    for detail in details {
      if detail.executor_id == me {
        continue;
      }
      if detail.total_power <= detail.executor_power {
        continue;
      }
      if !select::should_validate(
        previous_seed.seed,
        &detail,
        my_power,
        &params,
      ) {
        continue;
      }
      if validated.contains(&detail.inference_id) {
        continue;
      }
      if !supported.contains(&detail.model) {
        // the chain may still hold this against us, nothing to do
        // about it locally
        warn!(
          inference = %detail.inference_id,
          model = %detail.model,
          "missed validation for unsupported model, skipping"
        );
        continue;
      }
      pending.push(detail.inference_id);
    }

    info!(
      epoch = previous_epoch,
      count = pending.len(),
      "executing missed validation recovery"
    );
    join_all(pending.into_iter().map(|id| {
      let validator = Arc::clone(self);
      async move { validator.validate_with_retry(id, false).await }
    }))
    .await;

    // give submitted validations time to land in blocks before the
    // claim goes out
    let settle = (epoch_length / 10).clamp(0, 60) as u64;
    tokio::time::sleep(Duration::from_secs(settle)).await;
  }
}
