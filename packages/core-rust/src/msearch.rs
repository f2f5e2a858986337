//! Multi-search wire codec.
//!
//! A batch travels as newline-delimited JSON: one header line per request
//! naming the target index, followed by that request's body on a single line.
//! The backend answers with `{"responses": [...]}`, one element per request in
//! submission order. An element carrying an `"error"` field is an item-level
//! failure; the rest of the batch is unaffected.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FetchError;

/// Per-item outcome as reported by the backend.
pub type ItemResponse = Result<Value, String>;

/// One body of a multi-request wire call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRequest {
    pub target_resource: String,
    pub body: String,
}

impl WireRequest {
    pub fn new(target_resource: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            target_resource: target_resource.into(),
            body: body.into(),
        }
    }
}

/// Routing header preceding each body line.
///
/// A target written as `index/type` routes to a mapping type as well.
#[derive(Debug, Serialize)]
struct Header<'a> {
    index: &'a str,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    doc_type: Option<&'a str>,
}

impl<'a> Header<'a> {
    fn for_target(target: &'a str) -> Self {
        match target.split_once('/') {
            Some((index, doc_type)) if !doc_type.is_empty() => Self {
                index,
                doc_type: Some(doc_type),
            },
            _ => Self {
                index: target,
                doc_type: None,
            },
        }
    }
}

/// Error decoding a backend response body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed multi-search response: {0}")]
pub struct MalformedResponse(pub String);

#[derive(Deserialize)]
struct Envelope {
    responses: Vec<Value>,
}

/// Encodes requests into the newline-delimited multi-search payload.
///
/// Bodies are re-emitted in compact form so each occupies exactly one line.
///
/// # Errors
///
/// Returns [`FetchError::Serialization`] if a body is not valid JSON.
pub fn encode(requests: &[WireRequest]) -> Result<String, FetchError> {
    let mut out = String::new();
    for request in requests {
        let header = serde_json::to_string(&Header::for_target(&request.target_resource))?;
        let body: Value = serde_json::from_str(&request.body)?;
        out.push_str(&header);
        out.push('\n');
        out.push_str(&serde_json::to_string(&body)?);
        out.push('\n');
    }
    Ok(out)
}

/// Decodes a multi-search response body into per-item outcomes.
///
/// # Errors
///
/// Returns [`MalformedResponse`] if the body is not a JSON object with a
/// `responses` array.
pub fn decode(body: &str) -> Result<Vec<ItemResponse>, MalformedResponse> {
    let envelope: Envelope =
        serde_json::from_str(body).map_err(|e| MalformedResponse(e.to_string()))?;
    Ok(envelope.responses.into_iter().map(item_outcome).collect())
}

fn item_outcome(item: Value) -> ItemResponse {
    match item.get("error") {
        Some(error) => Err(error
            .get("reason")
            .and_then(Value::as_str)
            .map_or_else(|| error.to_string(), str::to_string)),
        None => Ok(item),
    }
}
