//! Minimal JSON-RPC client for the node's mining interface
//!
//! Speaks only the two methods this client needs: `getblocktemplate` and
//! `submitblock`. Everything else about JSON-RPC is out of scope.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// JSON-RPC request envelope
#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

/// JSON-RPC response envelope
#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// JSON-RPC client bound to one node endpoint
#[derive(Clone, Debug)]
pub struct RpcClient {
    http: reqwest::Client,
    url: Url,
    auth: Option<(String, String)>,
    next_id: Arc<AtomicU64>,
}

impl RpcClient {
    /// Create a new RPC client
    pub fn new(
        base_url: impl AsRef<str>,
        timeout: Duration,
        insecure: bool,
        auth: Option<(String, String)>,
    ) -> Result<Self> {
        let url = Url::parse(base_url.as_ref())
            .map_err(|e| Error::config(format!("invalid RPC URL: {e}")))?;

        let http = reqwest::ClientBuilder::new()
            .timeout(timeout)
            .danger_accept_invalid_certs(insecure)
            .build()
            .map_err(Error::from)?;

        Ok(Self {
            http,
            url,
            auth,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Fetch a candidate block template
    pub async fn get_block_template(&self) -> Result<Value> {
        self.call(
            "getblocktemplate",
            json!([{ "capabilities": ["coinbasetxn", "workid"] }]),
        )
        .await
    }

    /// Submit a hex-encoded block.
    ///
    /// A `null` result is acceptance; a string result or an RPC error is the
    /// node's reject reason.
    pub async fn submit_block(&self, block_hex: &str, work_id: Option<&str>) -> Result<()> {
        let params = match work_id {
            Some(id) => json!([block_hex, { "workid": id }]),
            None => json!([block_hex]),
        };

        let result = match self.call("submitblock", params).await {
            Ok(result) => result,
            Err(Error::Rpc { code, message }) => {
                return Err(Error::submission_rejected(format!("{message} ({code})")))
            }
            Err(e) => return Err(e),
        };

        match result {
            Value::Null => Ok(()),
            Value::String(reason) => Err(Error::submission_rejected(reason)),
            other => Err(Error::submission_rejected(other.to_string())),
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };

        debug!("rpc call {method} (id {id})");

        let mut builder = self.http.post(self.url.clone()).json(&request);
        if let Some((user, pass)) = &self.auth {
            builder = builder.basic_auth(user, Some(pass));
        }

        let response = builder.send().await.map_err(Error::from)?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::connection(format!("{method}: HTTP {status}")));
        }

        let body: RpcResponse = response.json().await.map_err(Error::from)?;
        if let Some(error) = body.error {
            return Err(Error::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        // `result: null` and a missing result both decode to None
        Ok(body.result.unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_client_rejects_bad_url() {
        let client = RpcClient::new("not a url", Duration::from_secs(5), false, None);
        assert_matches!(client, Err(Error::Config { .. }));
    }

    #[test]
    fn test_client_creation() {
        let client = RpcClient::new(
            "http://localhost:8232/",
            Duration::from_secs(5),
            false,
            Some(("miner".into(), "hunter2".into())),
        );
        assert!(client.is_ok());
    }

    #[test]
    fn test_request_envelope_shape() {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: 7,
            method: "getblocktemplate",
            params: json!([{ "capabilities": ["coinbasetxn", "workid"] }]),
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 7);
        assert_eq!(value["method"], "getblocktemplate");
        assert_eq!(value["params"][0]["capabilities"][0], "coinbasetxn");
    }

    #[test]
    fn test_response_envelope_decodes_null_result() {
        let body: RpcResponse = serde_json::from_str(r#"{"id":1,"result":null}"#).unwrap();
        assert!(body.result.is_none());
        assert!(body.error.is_none());

        let body: RpcResponse =
            serde_json::from_str(r#"{"id":1,"error":{"code":-25,"message":"bad-prevblk"}}"#)
                .unwrap();
        let error = body.error.unwrap();
        assert_eq!(error.code, -25);
        assert_eq!(error.message, "bad-prevblk");
    }
}
