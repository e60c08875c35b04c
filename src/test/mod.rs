//! Shared test fixtures: an in-memory chain client, scripted ML
//! workers and end-to-end scenarios wiring real components together.

pub mod chain;

mod pipeline;
mod poc_cycle;
mod store_scenarios;

use {
  crate::{config::InferenceNodeConfig, keys::Signer},
  std::{
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
  },
};

/// Fresh database path per call; unique within and across processes.
pub fn temp_db_path() -> PathBuf {
  static COUNTER: AtomicU64 = AtomicU64::new(0);
  let n = COUNTER.fetch_add(1, Ordering::Relaxed);
  std::env::temp_dir().join(format!(
    "dapi-test-{}-{n}.db",
    std::process::id()
  ))
}

pub fn test_signer() -> Signer {
  "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318"
    .parse()
    .unwrap()
}

pub fn test_node(id: &str, model: &str) -> InferenceNodeConfig {
  InferenceNodeConfig {
    id: id.into(),
    host: "10.0.0.1".into(),
    inference_segment: String::new(),
    inference_port: 8080,
    poc_segment: String::new(),
    poc_port: 8081,
    max_concurrent: 1,
    models: [(model.to_string(), vec![])].into_iter().collect(),
    hardware: vec![],
  }
}
