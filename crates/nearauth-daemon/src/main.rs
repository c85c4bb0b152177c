//! Nearauth Daemon
//!
//! 后台守护进程，负责：
//! - 管理设备认证会话的完整生命周期
//! - 打开 Rendezvous/蓝牙通道并发送邀请信标
//! - 通过 Unix Socket 与 PAM 侧客户端通信

mod ipc;
mod service;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // 桥接 log crate（nearauth-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    // 初始化日志
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,nearauth_core=debug")),
        )
        .try_init();

    tracing::info!("Nearauth Daemon starting...");

    let state = service::DaemonState::new();

    // 启动 IPC 服务器
    let ipc_handle = tokio::spawn(ipc::run_ipc_server(state.clone()));

    // 启动后台回收
    let service_handle = tokio::spawn(service::run_service(state.clone()));

    // 等待退出请求、信号或任一任务异常退出
    tokio::select! {
        res = ipc_handle => {
            tracing::error!("IPC server exited: {:?}", res);
        }
        res = service_handle => {
            tracing::error!("Core service exited: {:?}", res);
        }
        () = state.shutdown.notified() => {
            tracing::info!("Shutdown requested");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
        }
    }

    // 停掉所有在途会话后再退出
    state.store.lock().await.shutdown().await;
    let _ = std::fs::remove_file(ipc::socket_path());

    Ok(())
}
