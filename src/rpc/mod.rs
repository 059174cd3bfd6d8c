//! JSON-RPC interface for host communication via stdin/stdout
//!
//! 每行一个 JSON 请求，响应与事件同样按行写回 stdout。

use std::sync::Arc;

use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::config::ActivationConfig;
use crate::control::{ConnectionStatus, TunnelController};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: Option<u64>,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcResponse {
    Result {
        id: u64,
        result: serde_json::Value,
    },
    Event {
        event: String,
        data: serde_json::Value,
    },
    Error {
        id: u64,
        error: RpcError,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

const PARSE_ERROR: i32 = -32700;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;
/// 控制面操作失败
const OPERATION_FAILED: i32 = -1;

#[derive(Debug, Deserialize)]
struct AppMessageParams {
    /// base64 编码的消息
    data: String,
}

pub struct RpcServer {
    tx: mpsc::UnboundedSender<RpcResponse>,
    controller: Arc<TunnelController>,
}

impl RpcServer {
    pub fn new(controller: Arc<TunnelController>) -> (Self, mpsc::UnboundedReceiver<RpcResponse>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, controller }, rx)
    }

    pub async fn run(controller: Arc<TunnelController>) -> Result<()> {
        let (server, mut rx) = Self::new(controller);
        let server = Arc::new(server);

        let stdout_task = tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            while let Some(response) = rx.recv().await {
                if let Ok(json) = serde_json::to_string(&response) {
                    if let Err(e) = stdout.write_all(json.as_bytes()).await {
                        error!("Failed to write to stdout: {}", e);
                        break;
                    }
                    if let Err(e) = stdout.write_all(b"\n").await {
                        error!("Failed to write newline: {}", e);
                        break;
                    }
                    if let Err(e) = stdout.flush().await {
                        error!("Failed to flush stdout: {}", e);
                        break;
                    }
                }
            }
        });

        let events_task = tokio::spawn(Arc::clone(&server).forward_status_events());

        let server_clone = Arc::clone(&server);
        let stdin_task = tokio::spawn(async move { server_clone.handle_stdin().await });

        tokio::select! {
            _ = stdout_task => {},
            _ = stdin_task => {},
        }
        events_task.abort();

        // stdin 关闭即宿主退出，不留下运行中的隧道
        server.controller.stop().await
    }

    /// 状态变化时推送 `status` 事件
    async fn forward_status_events(self: Arc<Self>) {
        let mut states = self.controller.subscribe();
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            let status = ConnectionStatus::from(state);
            if self.send_event("status", serde_json::json!({ "status": status })).is_err() {
                break;
            }
        }
    }

    async fn handle_stdin(self: &Arc<Self>) -> Result<()> {
        let stdin = tokio::io::stdin();
        let mut reader = BufReader::new(stdin);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    debug!("stdin closed");
                    break;
                }
                Ok(_) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let response = self.handle_request(&line).await;
                    if let Err(e) = self.send_response(response) {
                        error!("Failed to send response: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to read from stdin: {}", e);
                    break;
                }
            }
        }

        Ok(())
    }

    pub async fn handle_request(&self, line: &str) -> RpcResponse {
        let request: RpcRequest = match serde_json::from_str(line.trim()) {
            Ok(r) => r,
            Err(e) => return error_response(None, PARSE_ERROR, format!("Parse error: {}", e)),
        };
        debug!("Received RPC request: {:?}", request);

        let id = request.id;
        let result = match request.method.as_str() {
            "install" => self.handle_install(request.params, false),
            "update" => self.handle_install(request.params, true),
            "start" => self.handle_start().await,
            "stop" => self.handle_stop().await,
            "toggle" => self.handle_toggle().await,
            "status" => self.handle_status().await,
            "remove" => self.handle_remove().await,
            "network_settings" => self.handle_network_settings().await,
            "app_message" => self.handle_app_message(request.params).await,
            _ => {
                return error_response(id, METHOD_NOT_FOUND, format!("Method not found: {}", request.method));
            }
        };

        match result {
            Ok(result) => RpcResponse::Result {
                id: id.unwrap_or(0),
                result,
            },
            Err(e) => {
                let code = match &e {
                    Error::InvalidConfig(_) => INVALID_PARAMS,
                    _ => OPERATION_FAILED,
                };
                let _ = self.send_log("ERROR", format!("{} failed: {}", request.method, e));
                error_response(id, code, e.to_string())
            }
        }
    }

    fn handle_install(&self, params: serde_json::Value, update: bool) -> Result<serde_json::Value> {
        let activation: ActivationConfig = serde_json::from_value(params)?;
        if update {
            self.controller.update(&activation)?;
        } else {
            self.controller.install(&activation)?;
        }
        Ok(serde_json::json!({ "installed": true }))
    }

    async fn handle_start(&self) -> Result<serde_json::Value> {
        info!("Starting tunnel via RPC...");
        self.controller.start_tun().await?;
        Ok(serde_json::json!({ "state": self.controller.state() }))
    }

    async fn handle_stop(&self) -> Result<serde_json::Value> {
        self.controller.stop().await?;
        Ok(serde_json::json!({ "state": self.controller.state() }))
    }

    async fn handle_toggle(&self) -> Result<serde_json::Value> {
        let state = self.controller.toggle().await?;
        Ok(serde_json::json!({ "state": state }))
    }

    async fn handle_status(&self) -> Result<serde_json::Value> {
        let status = self.controller.status().await?;
        Ok(serde_json::to_value(status)?)
    }

    async fn handle_remove(&self) -> Result<serde_json::Value> {
        let removed = self.controller.remove().await?;
        Ok(serde_json::json!({ "removed": removed }))
    }

    async fn handle_network_settings(&self) -> Result<serde_json::Value> {
        let settings = self.controller.network_settings().await;
        Ok(serde_json::to_value(settings)?)
    }

    async fn handle_app_message(&self, params: serde_json::Value) -> Result<serde_json::Value> {
        let params: AppMessageParams = serde_json::from_value(params)?;
        let data = base64::engine::general_purpose::STANDARD
            .decode(params.data.as_bytes())
            .map_err(|e| Error::InvalidConfig(format!("invalid base64: {}", e)))?;
        self.controller.send_app_message(data).await?;
        Ok(serde_json::Value::Null)
    }

    fn send_response(&self, response: RpcResponse) -> Result<()> {
        self.tx.send(response)?;
        Ok(())
    }

    pub fn send_event(&self, event: &str, data: serde_json::Value) -> Result<()> {
        self.send_response(RpcResponse::Event {
            event: event.to_string(),
            data,
        })
    }

    pub fn send_log(&self, level: &str, message: String) -> Result<()> {
        self.send_event(
            "log",
            serde_json::json!({
                "level": level,
                "message": message,
                "timestamp": chrono::Local::now().to_rfc3339(),
            }),
        )
    }
}

fn error_response(id: Option<u64>, code: i32, message: String) -> RpcResponse {
    RpcResponse::Error {
        id: id.unwrap_or(0),
        error: RpcError { code, message },
    }
}
