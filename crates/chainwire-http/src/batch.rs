//! Decoding of HTTP batch replies.
//!
//! A node answers a batch POST with either an array of responses (any
//! order, possibly partial) or a single error object that applies to the
//! whole batch (e.g. "batch too large").

use serde_json::Value;

use chainwire_core::batch::correlate;
use chainwire_core::error::TransportError;
use chainwire_core::request::{JsonRpcRequest, JsonRpcResponse};
use chainwire_core::transport::BatchResponse;

pub use chainwire_core::batch::validate;

/// Turn a batch reply body into per-request outcomes, in request order.
pub fn parse_reply(reqs: &[JsonRpcRequest], body: Value) -> Result<BatchResponse, TransportError> {
    match body {
        Value::Array(items) => {
            let responses = items
                .into_iter()
                .map(serde_json::from_value::<JsonRpcResponse>)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| TransportError::InvalidResponse(format!("batch entry: {e}")))?;
            Ok(correlate(reqs, responses))
        }
        Value::Object(_) => {
            let resp: JsonRpcResponse = serde_json::from_value(body)
                .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
            match resp.error {
                Some(err) => Err(TransportError::Rpc(err)),
                None => Err(TransportError::InvalidResponse(
                    "expected an array in reply to a batch".into(),
                )),
            }
        }
        other => Err(TransportError::InvalidResponse(format!(
            "unexpected batch reply: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainwire_core::request::RpcId;
    use serde_json::json;

    fn reqs() -> Vec<JsonRpcRequest> {
        vec![
            JsonRpcRequest::new(1, "eth_chainId", vec![]),
            JsonRpcRequest::new(2, "eth_blockNumber", vec![]),
        ]
    }

    #[test]
    fn partial_array_marks_missing_entry() {
        let body = json!([{"jsonrpc": "2.0", "id": 2, "result": "0x10"}]);
        let out = parse_reply(&reqs(), body).unwrap();
        assert!(matches!(
            &out[0],
            Err(TransportError::MissingResponse { id: RpcId::Number(1) })
        ));
        assert_eq!(out[1].as_ref().unwrap().result, Some(json!("0x10")));
    }

    #[test]
    fn per_entry_errors_stay_per_entry() {
        let body = json!([
            {"jsonrpc": "2.0", "id": 1, "result": "0x1"},
            {"jsonrpc": "2.0", "id": 2, "error": {"code": -32601, "message": "method not found"}}
        ]);
        let out = parse_reply(&reqs(), body).unwrap();
        assert!(out[0].as_ref().unwrap().is_ok());
        assert_eq!(out[1].as_ref().unwrap().error.as_ref().unwrap().code, -32601);
    }

    #[test]
    fn non_json_rpc_reply_is_invalid() {
        assert!(matches!(
            parse_reply(&reqs(), json!("nope")),
            Err(TransportError::InvalidResponse(_))
        ));
        assert!(matches!(
            parse_reply(&reqs(), json!([{"foo": 1}])),
            Err(TransportError::InvalidResponse(_))
        ));
    }
}
