use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tracing::{debug, warn};

use crate::{prelude::*, Error};

/// HTTP status codes that indicate transient server errors (retryable)
const RETRYABLE_STATUS_CODES: &[u16] = &[502, 503, 504];

/// Initial backoff delay in milliseconds (doubles with each retry)
const INITIAL_BACKOFF_MS: u64 = 100;

#[derive(Serialize, Debug)]
struct RpcRequest<'a, P> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: P,
}

#[derive(Deserialize, Debug)]
struct RpcErrorObject {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Deserialize, Debug)]
struct RpcResponse {
    /// `Some(Value::Null)` for `"result": null`, `None` when the member is absent.
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

fn present<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

/// JSON-RPC 2.0 client over HTTP.
#[derive(Debug)]
pub struct JsonRpcClient {
    pub client: Client,
    pub url: String,
    next_id: AtomicU64,
    max_retries: u32,
}

async fn parse_response(response: Response) -> Result<String> {
    let status_code = response.status().as_u16();
    let text = response
        .text()
        .await
        .map_err(|e| Error::GenericRequest(e.to_string()))?;

    if status_code < 400 {
        return Ok(text);
    }
    if (400..500).contains(&status_code) {
        return Err(Error::client_error(status_code, text));
    }
    Err(Error::server_error(status_code, text))
}

fn parse_rpc_body<R: DeserializeOwned>(text: &str) -> Result<R> {
    let response: RpcResponse = serde_json::from_str(text).map_err(|e| Error::json_parse(e.to_string()))?;

    if let Some(error) = response.error {
        return Err(Error::Rpc {
            code: error.code,
            message: error.message,
            data: error.data.map(|data| match data {
                Value::String(s) => s,
                other => other.to_string(),
            }),
        });
    }

    let result = response
        .result
        .ok_or_else(|| Error::InvalidResponse("JSON-RPC response without result".to_string()))?;
    serde_json::from_value(result).map_err(|e| Error::json_parse(e.to_string()))
}

impl JsonRpcClient {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            next_id: AtomicU64::new(1),
            max_retries: 0,
        }
    }

    /// Retry transient server errors (502, 503, 504) up to `max_retries` times.
    ///
    /// Uses exponential backoff: 100ms, 200ms, 400ms between retries.
    /// Off by default.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Call `method` with `params` and deserialize the `result` member.
    pub async fn request<P, R>(&self, method: &str, params: P) -> Result<R>
    where
        P: Serialize + Send + Sync,
        R: DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::to_string(&RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        })
        .map_err(|e| Error::json_parse(e.to_string()))?;

        let text = self.post(method, body).await?;
        debug!(method, id, "JSON-RPC response received");
        parse_rpc_body(&text)
    }

    async fn post(&self, method: &str, data: String) -> Result<String> {
        for attempt in 0..=self.max_retries {
            let request = self
                .client
                .post(&self.url)
                .header("Content-Type", "application/json")
                .body(data.clone())
                .build()
                .map_err(|e| Error::GenericRequest(e.to_string()))?;

            let result = self
                .client
                .execute(request)
                .await
                .map_err(|e| Error::GenericRequest(e.to_string()))?;

            let status = result.status().as_u16();

            if RETRYABLE_STATUS_CODES.contains(&status) && attempt < self.max_retries {
                let backoff = Duration::from_millis(INITIAL_BACKOFF_MS * 2u64.pow(attempt));
                warn!(
                    status = status,
                    attempt = attempt + 1,
                    max_attempts = self.max_retries + 1,
                    backoff_ms = backoff.as_millis(),
                    method = %method,
                    "Retryable HTTP error, backing off"
                );
                tokio::time::sleep(backoff).await;
                continue;
            }

            return parse_response(result).await;
        }

        Err(Error::GenericRequest(format!(
            "Max retries ({}) exceeded for {method}",
            self.max_retries
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_result() {
        let value: String = parse_rpc_body(r#"{"jsonrpc":"2.0","id":1,"result":"0x10"}"#).unwrap();
        assert_eq!(value, "0x10");
    }

    #[test]
    fn test_parse_rpc_error() {
        let err = parse_rpc_body::<String>(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":3,"message":"execution reverted","data":"0x08c379a0"}}"#,
        )
        .unwrap_err();
        match err {
            Error::Rpc { code, message, data } => {
                assert_eq!(code, 3);
                assert_eq!(message, "execution reverted");
                assert_eq!(data.as_deref(), Some("0x08c379a0"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_missing_result_is_invalid() {
        let err = parse_rpc_body::<String>(r#"{"jsonrpc":"2.0","id":1}"#).unwrap_err();
        assert!(matches!(err, Error::InvalidResponse(_)));
    }

    #[test]
    fn test_null_result_is_none() {
        let value: Option<String> = parse_rpc_body(r#"{"jsonrpc":"2.0","id":1,"result":null}"#).unwrap();
        assert_eq!(value, None);

        // a null result is still an error for callers that need a value
        let err = parse_rpc_body::<String>(r#"{"jsonrpc":"2.0","id":1,"result":null}"#).unwrap_err();
        assert!(matches!(err, Error::JsonParse(_)));

        let err = parse_rpc_body::<Option<String>>(r#"{"jsonrpc":"2.0","id":1}"#).unwrap_err();
        assert!(matches!(err, Error::InvalidResponse(_)));
    }

    #[test]
    fn test_request_envelope() {
        let json = serde_json::to_value(RpcRequest {
            jsonrpc: "2.0",
            id: 7,
            method: "eth_blockNumber",
            params: (),
        })
        .unwrap();
        assert_eq!(json["method"], "eth_blockNumber");
        assert_eq!(json["id"], 7);
    }
}
