//! Component B: the in-plugin line-framed JSON-RPC dispatcher (§4.B).
//!
//! Every plugin binary links this module and hands a [`PluginHandler`] impl to
//! [`run`], which owns the stdin read loop, JSON framing, per-method timeout
//! enforcement, and response ordering. Wire shape is one JSON object per line
//! in each direction: `{id, method, params}` in, `{id, result}` or
//! `{id, error: {code, message}}` out. Grounded on the `Worker`/JSON-RPC
//! framing used elsewhere in this codebase for subprocess plugin hosts,
//! mirrored here from the plugin side instead of the host side.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::error::ForgeResult;
use crate::model::{PluginInfo, PluginRequest, PluginResponse, PluginStatus};

const START_STOP_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const HANDLER_ERROR: i64 = -32000;

/// Implemented by each plugin to answer the fixed dispatcher method set.
#[async_trait]
pub trait PluginHandler: Send + Sync {
    /// Handle `initialize`, given the raw params value the host sent.
    async fn initialize(&self, params: Value) -> ForgeResult<Value>;
    /// Handle `start`.
    async fn start(&self) -> ForgeResult<()>;
    /// Handle `stop`.
    async fn stop(&self) -> ForgeResult<()>;
    /// Handle the generic `handle` method.
    async fn handle(&self, request: PluginRequest) -> PluginResponse;
    /// Handle `healthcheck`.
    async fn healthcheck(&self) -> ForgeResult<()>;
    /// Handle `getinfo`.
    async fn getinfo(&self) -> ForgeResult<PluginInfo>;
    /// Handle `getstatus`.
    async fn getstatus(&self) -> ForgeResult<PluginStatus>;
    /// Handle `export_state`.
    async fn export_state(&self) -> ForgeResult<Vec<u8>>;
    /// Handle `import_state`.
    async fn import_state(&self, state: Vec<u8>) -> ForgeResult<()>;
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

impl RpcResponse {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Run the dispatcher loop over `stdin`/`stdout`, dispatching each decoded
/// request to `handler` in the order it was read. Returns once `shutdown` has
/// been processed and its grace delay has elapsed, or once stdin closes.
pub async fn run(handler: impl PluginHandler) -> ForgeResult<()> {
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let request: RpcRequest = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                let response = RpcResponse::err(Value::Null, INVALID_PARAMS, e.to_string());
                write_response(&mut stdout, &response).await?;
                continue;
            }
        };

        let id = request.id.clone();
        let response = dispatch(&handler, request).await;
        write_response(&mut stdout, &response).await?;

        if response.id == id && is_shutdown_response(&response) {
            tokio::time::sleep(SHUTDOWN_GRACE).await;
            break;
        }
    }

    Ok(())
}

fn is_shutdown_response(response: &RpcResponse) -> bool {
    response
        .result
        .as_ref()
        .and_then(|v| v.get("__dispatcher_shutdown"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

async fn dispatch(handler: &impl PluginHandler, request: RpcRequest) -> RpcResponse {
    let RpcRequest { id, method, params } = request;

    match method.as_str() {
        "initialize" => with_result(id, handler.initialize(params).await),
        "start" => with_timeout(id, START_STOP_TIMEOUT, handler.start()).await,
        "stop" => with_timeout(id, START_STOP_TIMEOUT, handler.stop()).await,
        "handle" => {
            let req: PluginRequest = match serde_json::from_value(params) {
                Ok(r) => r,
                Err(e) => {
                    return RpcResponse::err(id, INVALID_PARAMS, e.to_string());
                }
            };
            let resp = handler.handle(req).await;
            match serde_json::to_value(resp) {
                Ok(v) => RpcResponse::ok(id, v),
                Err(e) => RpcResponse::err(id, HANDLER_ERROR, e.to_string()),
            }
        }
        "healthcheck" => with_result(id, handler.healthcheck().await.map(|_| Value::Bool(true))),
        "getinfo" => with_serde_result(id, handler.getinfo().await),
        "getstatus" => with_serde_result(id, handler.getstatus().await),
        "export_state" => with_result(
            id,
            handler
                .export_state()
                .await
                .map(|bytes| Value::String(hex::encode(bytes))),
        ),
        "import_state" => {
            let encoded = match params.as_str() {
                Some(s) => s.to_string(),
                None => {
                    return RpcResponse::err(id, INVALID_PARAMS, "import_state expects a hex string");
                }
            };
            let bytes = match hex::decode(encoded) {
                Ok(b) => b,
                Err(e) => return RpcResponse::err(id, INVALID_PARAMS, e.to_string()),
            };
            with_result(
                id,
                handler.import_state(bytes).await.map(|_| Value::Null),
            )
        }
        "shutdown" => {
            let stop_result = tokio::time::timeout(SHUTDOWN_STOP_TIMEOUT, handler.stop()).await;
            match stop_result {
                Ok(Ok(())) => RpcResponse::ok(id, serde_json::json!({"__dispatcher_shutdown": true})),
                Ok(Err(e)) => RpcResponse::err(id, HANDLER_ERROR, e.to_string()),
                Err(_) => RpcResponse::err(id, HANDLER_ERROR, "stop timed out during shutdown"),
            }
        }
        _ => RpcResponse::err(id, METHOD_NOT_FOUND, format!("unknown method '{method}'")),
    }
}

fn with_result(id: Value, result: ForgeResult<Value>) -> RpcResponse {
    match result {
        Ok(v) => RpcResponse::ok(id, v),
        Err(e) => RpcResponse::err(id, HANDLER_ERROR, e.to_string()),
    }
}

fn with_serde_result<T: Serialize>(id: Value, result: ForgeResult<T>) -> RpcResponse {
    match result {
        Ok(v) => match serde_json::to_value(v) {
            Ok(v) => RpcResponse::ok(id, v),
            Err(e) => RpcResponse::err(id, HANDLER_ERROR, e.to_string()),
        },
        Err(e) => RpcResponse::err(id, HANDLER_ERROR, e.to_string()),
    }
}

async fn with_timeout(
    id: Value,
    timeout: Duration,
    fut: impl std::future::Future<Output = ForgeResult<()>>,
) -> RpcResponse {
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(())) => RpcResponse::ok(id, Value::Null),
        Ok(Err(e)) => RpcResponse::err(id, HANDLER_ERROR, e.to_string()),
        Err(_) => RpcResponse::err(id, HANDLER_ERROR, "operation timed out"),
    }
}

async fn write_response(
    stdout: &mut (impl AsyncWriteExt + Unpin),
    response: &RpcResponse,
) -> ForgeResult<()> {
    let mut line = serde_json::to_string(response)?;
    line.push('\n');
    stdout.write_all(line.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct EchoHandler {
        started: Arc<AtomicBool>,
    }

    #[async_trait]
    impl PluginHandler for EchoHandler {
        async fn initialize(&self, params: Value) -> ForgeResult<Value> {
            Ok(params)
        }

        async fn start(&self) -> ForgeResult<()> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> ForgeResult<()> {
            self.started.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn handle(&self, request: PluginRequest) -> PluginResponse {
            PluginResponse {
                success: true,
                payload: request.payload,
                error: None,
            }
        }

        async fn healthcheck(&self) -> ForgeResult<()> {
            Ok(())
        }

        async fn getinfo(&self) -> ForgeResult<PluginInfo> {
            Err(crate::error::ForgeError::not_found("getinfo not wired in test handler"))
        }

        async fn getstatus(&self) -> ForgeResult<PluginStatus> {
            Ok(if self.started.load(Ordering::SeqCst) {
                PluginStatus::Running
            } else {
                PluginStatus::Stopped
            })
        }

        async fn export_state(&self) -> ForgeResult<Vec<u8>> {
            Ok(vec![1, 2, 3])
        }

        async fn import_state(&self, _state: Vec<u8>) -> ForgeResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn unknown_method_reports_method_not_found() {
        let handler = EchoHandler {
            started: Arc::new(AtomicBool::new(false)),
        };
        let request = RpcRequest {
            id: Value::from(1),
            method: "bogus".to_string(),
            params: Value::Null,
        };
        let response = dispatch(&handler, request).await;
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn handle_round_trips_payload() {
        let handler = EchoHandler {
            started: Arc::new(AtomicBool::new(false)),
        };
        let request = RpcRequest {
            id: Value::from(2),
            method: "handle".to_string(),
            params: serde_json::json!({"operation": "ping", "payload": {"n": 7}}),
        };
        let response = dispatch(&handler, request).await;
        let result = response.result.unwrap();
        assert_eq!(result["success"], Value::Bool(true));
        assert_eq!(result["payload"]["n"], 7);
    }

    #[tokio::test]
    async fn start_then_getstatus_reports_running() {
        let handler = EchoHandler {
            started: Arc::new(AtomicBool::new(false)),
        };
        let start_req = RpcRequest {
            id: Value::from(3),
            method: "start".to_string(),
            params: Value::Null,
        };
        let response = dispatch(&handler, start_req).await;
        assert!(response.error.is_none());

        let status_req = RpcRequest {
            id: Value::from(4),
            method: "getstatus".to_string(),
            params: Value::Null,
        };
        let response = dispatch(&handler, status_req).await;
        assert_eq!(response.result.unwrap(), serde_json::json!("running"));
    }

    #[tokio::test]
    async fn export_then_import_state_round_trips_hex() {
        let handler = EchoHandler {
            started: Arc::new(AtomicBool::new(false)),
        };
        let export_req = RpcRequest {
            id: Value::from(5),
            method: "export_state".to_string(),
            params: Value::Null,
        };
        let response = dispatch(&handler, export_req).await;
        let encoded = response.result.unwrap();
        assert_eq!(encoded, Value::String("010203".to_string()));

        let import_req = RpcRequest {
            id: Value::from(6),
            method: "import_state".to_string(),
            params: encoded,
        };
        let response = dispatch(&handler, import_req).await;
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn shutdown_marks_internal_sentinel() {
        let handler = EchoHandler {
            started: Arc::new(AtomicBool::new(true)),
        };
        let request = RpcRequest {
            id: Value::from(7),
            method: "shutdown".to_string(),
            params: Value::Null,
        };
        let response = dispatch(&handler, request).await;
        assert!(is_shutdown_response(&response));
    }
}
