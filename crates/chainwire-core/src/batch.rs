//! Batch request validation and response correlation.
//!
//! Batch replies may come back in any order and may be partial; every entry
//! is matched to its request by `id`, never by position.

use std::collections::{HashMap, HashSet};

use crate::error::TransportError;
use crate::request::{JsonRpcRequest, JsonRpcResponse, RpcId};
use crate::transport::BatchResponse;

/// Reject a batch that cannot be correlated: empty, or with repeated ids.
pub fn validate(reqs: &[JsonRpcRequest]) -> Result<(), TransportError> {
    if reqs.is_empty() {
        return Err(TransportError::InvalidRequest("empty batch".into()));
    }
    let mut seen = HashSet::with_capacity(reqs.len());
    for req in reqs {
        if !seen.insert(&req.id) {
            return Err(TransportError::InvalidRequest(format!(
                "duplicate id {} in batch",
                req.id
            )));
        }
    }
    Ok(())
}

/// Line `responses` up with `reqs` by id.
///
/// Requests without a matching entry get `MissingResponse`; entries for ids
/// that were never requested are logged and discarded.
pub fn correlate(reqs: &[JsonRpcRequest], responses: Vec<JsonRpcResponse>) -> BatchResponse {
    let mut by_id: HashMap<RpcId, JsonRpcResponse> = HashMap::with_capacity(responses.len());
    for resp in responses {
        if let Some(previous) = by_id.insert(resp.id.clone(), resp) {
            tracing::debug!(id = %previous.id, "duplicate id in batch response");
        }
    }

    let out = reqs
        .iter()
        .map(|req| {
            by_id.remove(&req.id).ok_or_else(|| TransportError::MissingResponse {
                id: req.id.clone(),
            })
        })
        .collect();

    for id in by_id.keys() {
        tracing::debug!(%id, "batch response for unknown id");
    }
    out
}
