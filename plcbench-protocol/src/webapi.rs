//! Controller Web API adapter (JSON-RPC 2.0 over HTTPS).
//!
//! Every call is sent as a single-element batch to `<base_url>/api/jsonrpc`. The
//! session token returned by `Api.Login` rides along in the `X-Auth-Token` header.

use crate::adapter::{measure, ProtocolAdapter, Timed};
use async_trait::async_trait;
use plcbench_common::{BenchError, PlcValue, Result, WebApiConfig};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

const AUTH_HEADER: &str = "X-Auth-Token";

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Adapter for the controller's JSON-RPC Web API
pub struct WebApiAdapter {
    config: WebApiConfig,
    bulk_variable: String,
    client: Option<reqwest::Client>,
    token: Option<String>,
    next_id: u64,
}

impl WebApiAdapter {
    pub fn new(config: WebApiConfig, bulk_variable: impl Into<String>) -> Self {
        Self {
            config,
            bulk_variable: bulk_variable.into(),
            client: None,
            token: None,
            next_id: 1,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/jsonrpc", self.config.base_url.trim_end_matches('/'))
    }

    /// Issue one JSON-RPC call and return its `result` member
    async fn call(&mut self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Timed> {
        let client = self
            .client
            .clone()
            .ok_or_else(|| BenchError::connection("web api session is not established"))?;
        let id = self.next_id;
        self.next_id += 1;

        let batch = [RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }];
        let mut request = client.post(self.endpoint()).timeout(timeout).json(&batch);
        if let Some(token) = &self.token {
            request = request.header(AUTH_HEADER, token);
        }

        let (outcome, latency) = measure(async move {
            let response = request.send().await?;
            let status = response.status();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, body))
        })
        .await;
        let (status, body) = outcome.map_err(|e| classify_transport_error(method, e))?;

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            self.token = None;
            return Err(BenchError::connection(format!(
                "{} rejected with HTTP {}; session is no longer valid",
                method, status
            )));
        }
        if !status.is_success() {
            return Err(BenchError::operation(method, format!("HTTP {}", status)));
        }

        let result = parse_rpc_body(method, &body)?;
        debug!("{} completed in {:?}", method, latency);
        Ok(Timed::new(result, latency))
    }
}

/// Decode a batch response and extract the first `result`
fn parse_rpc_body(method: &str, body: &[u8]) -> Result<Value> {
    let responses: Vec<RpcResponse> = serde_json::from_slice(body)
        .map_err(|e| BenchError::operation(method, format!("malformed JSON-RPC response: {}", e)))?;
    let first = responses
        .into_iter()
        .next()
        .ok_or_else(|| BenchError::operation(method, "empty JSON-RPC batch response"))?;
    if let Some(error) = first.error {
        return Err(BenchError::operation(
            method,
            format!("JSON-RPC error {}: {}", error.code, error.message),
        ));
    }
    Ok(first.result.unwrap_or(Value::Null))
}

/// A bulk read returns the array; it must cover every requested element
fn check_block(method: &str, result: &Value, entries: usize) -> Result<usize> {
    match result.as_array() {
        Some(items) if items.len() >= entries => Ok(entries),
        Some(items) => Err(BenchError::operation(
            method,
            format!("expected {} elements, got {}", entries, items.len()),
        )),
        None => Err(BenchError::operation(method, "bulk read did not return an array")),
    }
}

fn classify_transport_error(method: &str, err: reqwest::Error) -> BenchError {
    if err.is_connect() {
        BenchError::connection(format!("{}: {}", method, err))
    } else if err.is_timeout() {
        BenchError::operation(method, format!("timed out: {}", err))
    } else {
        BenchError::operation_cause(method, err)
    }
}

#[async_trait]
impl ProtocolAdapter for WebApiAdapter {
    fn name(&self) -> &str {
        "web_api"
    }

    async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(self.config.skip_certificate_validation)
            .timeout(self.config.timeout())
            .build()
            .map_err(|e| BenchError::connection(format!("failed to build HTTP client: {}", e)))?;
        self.client = Some(client);

        let params = json!({
            "user": self.config.username,
            "password": self.config.password,
        });
        let login = match self.call("Api.Login", Some(params), self.config.timeout()).await {
            Ok(login) => login,
            Err(e) => {
                self.client = None;
                // Any login failure means there is no session to measure against
                return Err(match e {
                    BenchError::Connection(msg) => BenchError::Connection(msg),
                    other => BenchError::connection(format!("login failed: {}", other)),
                });
            }
        };

        let token = login
            .response
            .get("token")
            .and_then(Value::as_str)
            .map(str::to_owned);
        match token {
            Some(token) => {
                self.token = Some(token);
                info!("Logged in to Web API at {}", self.config.base_url);
                Ok(())
            }
            None => {
                self.client = None;
                Err(BenchError::connection("login response carried no token"))
            }
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.token.is_some() {
            if let Err(e) = self.call("Api.Logout", None, self.config.timeout()).await {
                warn!("Web API logout failed: {}", e);
            }
        }
        self.token = None;
        self.client = None;
        Ok(())
    }

    async fn write(&mut self, variable: &str, value: PlcValue) -> Result<Timed> {
        let params = json!({ "var": variable, "value": value.to_json() });
        self.call("PlcProgram.Write", Some(params), self.config.timeout())
            .await
    }

    async fn read(&mut self, variable: &str) -> Result<Timed> {
        let params = json!({ "var": variable });
        self.call("PlcProgram.Read", Some(params), self.config.timeout())
            .await
    }

    async fn write_bulk(&mut self, values: &[String]) -> Result<Timed> {
        let params = json!({ "var": self.bulk_variable, "value": values });
        self.call("PlcProgram.Write", Some(params), self.config.bulk_timeout())
            .await
    }

    async fn read_bulk(&mut self, entries: usize) -> Result<Timed> {
        let params = json!({ "var": self.bulk_variable });
        let timed = self
            .call("PlcProgram.Read", Some(params), self.config.bulk_timeout())
            .await?;
        let elements = check_block("PlcProgram.Read", &timed.response, entries)?;
        Ok(Timed::new(json!({ "elements": elements }), timed.latency))
    }

    fn is_connected(&self) -> bool {
        self.client.is_some() && self.token.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let batch = [RpcRequest {
            jsonrpc: "2.0",
            id: 3,
            method: "PlcProgram.Write",
            params: Some(json!({"var": "\"DB\".x", "value": true})),
        }];
        let encoded = serde_json::to_value(&batch).unwrap();
        assert_eq!(
            encoded,
            json!([{
                "jsonrpc": "2.0",
                "id": 3,
                "method": "PlcProgram.Write",
                "params": {"var": "\"DB\".x", "value": true}
            }])
        );

        let logout = serde_json::to_value(RpcRequest {
            jsonrpc: "2.0",
            id: 4,
            method: "Api.Logout",
            params: None,
        })
        .unwrap();
        assert!(logout.get("params").is_none());
    }

    #[test]
    fn test_parse_result() {
        let body = br#"[{"jsonrpc":"2.0","id":1,"result":{"token":"abc"}}]"#;
        assert_eq!(parse_rpc_body("Api.Login", body).unwrap(), json!({"token": "abc"}));
    }

    #[test]
    fn test_parse_rpc_error_is_operation_error() {
        let body = br#"[{"jsonrpc":"2.0","id":1,"error":{"code":200,"message":"Address does not exist"}}]"#;
        let err = parse_rpc_body("PlcProgram.Write", body).unwrap_err();
        assert_eq!(err.kind(), plcbench_common::ErrorKind::Operation);
        assert!(err.to_string().contains("Address does not exist"));
    }

    #[test]
    fn test_bulk_read_must_cover_block() {
        let block = json!(["LT#0ns", "LT#1000000ns", "LT#2000000ns"]);
        assert_eq!(check_block("PlcProgram.Read", &block, 3).unwrap(), 3);
        assert_eq!(check_block("PlcProgram.Read", &block, 2).unwrap(), 2);
        let err = check_block("PlcProgram.Read", &block, 100).unwrap_err();
        assert_eq!(err.kind(), plcbench_common::ErrorKind::Operation);
        assert!(check_block("PlcProgram.Read", &json!(true), 1).is_err());
    }

    #[test]
    fn test_parse_malformed_body() {
        assert!(parse_rpc_body("PlcProgram.Read", b"<html>").is_err());
        assert!(parse_rpc_body("PlcProgram.Read", b"[]").is_err());
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let config = WebApiConfig {
            base_url: "https://plc.local/".to_string(),
            ..WebApiConfig::default()
        };
        let adapter = WebApiAdapter::new(config, "\"DB\".Bulk");
        assert_eq!(adapter.endpoint(), "https://plc.local/api/jsonrpc");
        assert_eq!(adapter.name(), "web_api");
    }

    #[tokio::test]
    async fn test_calls_before_connect_are_connection_errors() {
        let mut adapter = WebApiAdapter::new(WebApiConfig::default(), "\"DB\".Bulk");
        let err = adapter.write("\"DB\".x", PlcValue::Bool(true)).await.unwrap_err();
        assert!(err.is_fatal_to_run());
        adapter.disconnect().await.unwrap();
        assert!(!adapter.is_connected());
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        let config = WebApiConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            timeout_ms: 500,
            ..WebApiConfig::default()
        };
        let mut adapter = WebApiAdapter::new(config, "\"DB\".Bulk");
        let err = adapter.connect().await.unwrap_err();
        assert_eq!(err.kind(), plcbench_common::ErrorKind::Connection);
        assert!(!adapter.is_connected());
    }
}
