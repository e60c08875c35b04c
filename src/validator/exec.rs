//! The validation primitive: re-run a peer's inference with the
//! original token stream enforced and compare logprob distributions.

use {
  super::similarity::{self, TokenLogprob, Verdict},
  crate::{broker::client::MlNodeApi, chain::types::InferenceDetail},
  serde::Deserialize,
  sha2::{Digest, Sha256},
  std::sync::Arc,
  thiserror::Error,
};

#[derive(Debug, Error)]
pub enum Error {
  #[error("malformed inference payload: {0}")]
  Payload(#[from] serde_json::Error),

  #[error("inference request payload is not a JSON object")]
  RequestNotObject,

  #[error("inference response carries no logprobs")]
  MissingLogprobs,

  #[error("ml node call failed: {0}")]
  Node(#[from] crate::broker::client::Error),
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
  choices: Vec<Choice>,
}

#[derive(Debug, Clone, Deserialize)]
struct Choice {
  #[serde(default)]
  message: Option<Message>,
  #[serde(default)]
  logprobs: Option<Logprobs>,
}

#[derive(Debug, Clone, Deserialize)]
struct Message {
  #[serde(default)]
  content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Logprobs {
  #[serde(default)]
  content: Vec<TokenLogprob>,
}

pub struct ValidationOutcome {
  pub verdict: Verdict,
  /// sha256 over the joined message contents of the original
  /// response, hex. Binds the submitted value to the exact response
  /// that was validated.
  pub response_hash: String,
}

/// Runs the primitive against a locked node's inference service.
pub async fn execute_validation(
  client: &Arc<dyn MlNodeApi>,
  detail: &InferenceDetail,
) -> Result<ValidationOutcome, Error> {
  let mut request: serde_json::Value =
    serde_json::from_str(&detail.prompt_payload)?;
  let original: ChatResponse = serde_json::from_str(&detail.response_payload)?;

  let original_logprobs = extract_logprobs(&original)?;
  let enforced: Vec<&str> = original_logprobs
    .iter()
    .map(|p| p.token.as_str())
    .collect();

  // replay the exact sampled stream: enforced tokens, no streaming,
  // specials preserved so token counts line up
  let object = request.as_object_mut().ok_or(Error::RequestNotObject)?;
  object.insert("enforced_tokens".into(), serde_json::json!(enforced));
  object.insert("stream".into(), serde_json::json!(false));
  object.insert("skip_special_tokens".into(), serde_json::json!(false));
  object.remove("stream_options");

  let raw = client.chat_completion(request).await?;
  let validation: ChatResponse = serde_json::from_value(raw)?;
  let validation_logprobs = extract_logprobs(&validation)?;

  Ok(ValidationOutcome {
    verdict: similarity::compare(&original_logprobs, &validation_logprobs),
    response_hash: response_hash(&original),
  })
}

fn extract_logprobs(
  response: &ChatResponse,
) -> Result<Vec<TokenLogprob>, Error> {
  let positions: Vec<TokenLogprob> = response
    .choices
    .iter()
    .filter_map(|c| c.logprobs.as_ref())
    .flat_map(|lp| lp.content.iter().cloned())
    .collect();
  if positions.is_empty() {
    return Err(Error::MissingLogprobs);
  }
  Ok(positions)
}

fn response_hash(response: &ChatResponse) -> String {
  let joined: String = response
    .choices
    .iter()
    .filter_map(|c| c.message.as_ref())
    .filter_map(|m| m.content.as_deref())
    .collect();
  hex::encode(Sha256::digest(joined.as_bytes()))
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn hashes_joined_choice_contents() {
    let response: ChatResponse = serde_json::from_str(
      r#"{"choices":[
        {"message":{"content":"Hello "}},
        {"message":{"content":"world"}}
      ]}"#,
    )
    .unwrap();
    assert_eq!(
      response_hash(&response),
      hex::encode(Sha256::digest(b"Hello world"))
    );
  }

  #[test]
  fn missing_logprobs_is_an_error() {
    let response: ChatResponse =
      serde_json::from_str(r#"{"choices":[{"message":{"content":"x"}}]}"#)
        .unwrap();
    assert!(matches!(
      extract_logprobs(&response),
      Err(Error::MissingLogprobs)
    ));
  }
}
