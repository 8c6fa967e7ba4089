//! Reference plugin binary: echoes `handle` requests back to the caller and
//! tracks a simple request counter as its exportable state. Exists purely to
//! exercise the supervisor, dispatcher, and hot-swap coordinator end to end;
//! not part of the core runtime's public surface.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use forge_plugin::{ForgeError, ForgeResult, PluginHandler, PluginInfo, PluginRequest, PluginResponse, PluginStatus};
use parking_lot::RwLock;

struct EchoPlugin {
    counter: RwLock<u64>,
    running: RwLock<bool>,
}

impl EchoPlugin {
    fn new() -> Self {
        Self {
            counter: RwLock::new(0),
            running: RwLock::new(false),
        }
    }
}

#[async_trait]
impl PluginHandler for EchoPlugin {
    async fn initialize(&self, params: serde_json::Value) -> ForgeResult<serde_json::Value> {
        tracing::info!(?params, "echo-plugin initialized");
        Ok(serde_json::json!({"initialized": true}))
    }

    async fn start(&self) -> ForgeResult<()> {
        *self.running.write() = true;
        Ok(())
    }

    async fn stop(&self) -> ForgeResult<()> {
        *self.running.write() = false;
        Ok(())
    }

    async fn handle(&self, request: PluginRequest) -> PluginResponse {
        *self.counter.write() += 1;
        PluginResponse {
            success: true,
            payload: serde_json::json!({
                "operation": request.operation,
                "echo": request.payload,
                "request_count": *self.counter.read(),
            }),
            error: None,
        }
    }

    async fn healthcheck(&self) -> ForgeResult<()> {
        if *self.running.read() {
            Ok(())
        } else {
            Err(ForgeError::not_found("echo-plugin is not running"))
        }
    }

    async fn getinfo(&self) -> ForgeResult<PluginInfo> {
        Ok(PluginInfo {
            name: "echo-plugin".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            metadata: HashMap::new(),
            capabilities: vec!["echo".to_string()],
            status: self.status_now(),
            load_time: Utc::now(),
            uptime_secs: 0,
        })
    }

    async fn getstatus(&self) -> ForgeResult<PluginStatus> {
        Ok(self.status_now())
    }

    async fn export_state(&self) -> ForgeResult<Vec<u8>> {
        let count = *self.counter.read();
        Ok(serde_json::to_vec(&serde_json::json!({"request_count": count}))?)
    }

    async fn import_state(&self, state: Vec<u8>) -> ForgeResult<()> {
        let value: serde_json::Value = serde_json::from_slice(&state)?;
        let count = value["request_count"].as_u64().unwrap_or(0);
        *self.counter.write() = count;
        Ok(())
    }
}

impl EchoPlugin {
    fn status_now(&self) -> PluginStatus {
        if *self.running.read() {
            PluginStatus::Running
        } else {
            PluginStatus::Stopped
        }
    }
}

#[tokio::main]
async fn main() -> ForgeResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    forge_plugin::run_dispatcher(EchoPlugin::new()).await
}
