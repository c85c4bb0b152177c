//! IPC Server - Unix Domain Socket 通信

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::service::DaemonState;

pub fn socket_path() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join("nearauth.sock")
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum IpcRequest {
    /// 为某个账户开启一次认证，返回句柄和邀请码
    #[serde(rename = "start_auth")]
    StartAuth {
        username: String,
        #[serde(default)]
        parameters: String,
    },
    /// 阻塞等待某个句柄的认证结果
    #[serde(rename = "complete_auth")]
    CompleteAuth { handle: i32 },
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "exit")]
    Exit,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
pub enum IpcResponse {
    #[serde(rename = "start_result")]
    StartResult {
        handle: i32,
        code: String,
        success: bool,
    },
    #[serde(rename = "complete_result")]
    CompleteResult {
        username: String,
        password: String,
        success: bool,
    },
    #[serde(rename = "status_result")]
    Status { sessions: Vec<SessionInfo> },
    #[serde(rename = "ok")]
    Ok { message: String },
    #[serde(rename = "error")]
    Error { message: String },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionInfo {
    pub handle: i32,
    pub state: String,
    pub username: String,
}

/// 每个连接一个所有者标识，用于在连接断开时回收未交付的会话
static NEXT_PEER: AtomicU64 = AtomicU64::new(1);

pub async fn run_ipc_server(state: Arc<DaemonState>) -> Result<()> {
    let path = socket_path();

    // 删除旧的 socket 文件
    let _ = std::fs::remove_file(&path);

    let listener = UnixListener::bind(&path)?;
    tracing::info!("IPC 服务器已启动: {:?}", path);

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(handle_client(stream, state.clone()));
            }
            Err(e) => {
                tracing::warn!("接受连接失败: {}", e);
            }
        }
    }
}

async fn handle_client(stream: UnixStream, state: Arc<DaemonState>) -> Result<()> {
    let owner = format!("peer-{}", NEXT_PEER.fetch_add(1, Ordering::Relaxed));
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let request: IpcRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                let resp = IpcResponse::Error {
                    message: format!("Invalid request: {}", e),
                };
                writer
                    .write_all(serde_json::to_string(&resp)?.as_bytes())
                    .await?;
                writer.write_all(b"\n").await?;
                line.clear();
                continue;
            }
        };

        tracing::debug!("收到请求 ({}): {:?}", owner, request);

        let response = dispatch(&state, &owner, request).await;

        writer
            .write_all(serde_json::to_string(&response)?.as_bytes())
            .await?;
        writer.write_all(b"\n").await?;
        line.clear();
    }

    // 连接断开：名下尚未拿到结果的会话就没人要了
    state.store.lock().await.owner_lost(&owner);
    Ok(())
}

async fn dispatch(state: &Arc<DaemonState>, owner: &str, request: IpcRequest) -> IpcResponse {
    match request {
        IpcRequest::StartAuth {
            username,
            parameters,
        } => {
            let mut store = state.store.lock().await;
            match store.start_auth(&username, &parameters).await {
                Ok(outcome) => IpcResponse::StartResult {
                    handle: outcome.handle,
                    code: outcome.code,
                    success: outcome.success,
                },
                Err(e) => IpcResponse::Error {
                    message: e.to_string(),
                },
            }
        }
        IpcRequest::CompleteAuth { handle } => {
            // 只在登记等待目标时持锁，等待结果时不能阻塞其他连接
            let rx = {
                let store = state.store.lock().await;
                store.complete_auth(handle, owner)
            };
            match rx {
                Ok(rx) => match rx.await {
                    Ok(reply) => IpcResponse::CompleteResult {
                        username: reply.username,
                        password: reply.password,
                        success: reply.success,
                    },
                    // 等待目标被后来的请求顶掉，或会话在交付前消失
                    Err(_) => IpcResponse::CompleteResult {
                        username: String::new(),
                        password: String::new(),
                        success: false,
                    },
                },
                // 未知句柄立即以失败应答
                Err(e) => {
                    tracing::debug!("complete_auth failed: {}", e);
                    IpcResponse::CompleteResult {
                        username: String::new(),
                        password: String::new(),
                        success: false,
                    }
                }
            }
        }
        IpcRequest::Status => {
            let store = state.store.lock().await;
            let sessions = store
                .snapshot()
                .into_iter()
                .map(|(handle, state, username)| SessionInfo {
                    handle,
                    state: state.name().to_string(),
                    username,
                })
                .collect();
            IpcResponse::Status { sessions }
        }
        IpcRequest::Exit => {
            tracing::info!("收到退出请求");
            state.shutdown.notify_one();
            IpcResponse::Ok {
                message: "exiting".to_string(),
            }
        }
    }
}
