//! Core Service - 会话仓库与后台回收

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nearauth_core::{DEFAULT_CONFIG_DIR, ProcessStore};
use tokio::sync::{Mutex, Notify};

/// 后台回收扫描间隔
const HARVEST_INTERVAL: Duration = Duration::from_secs(30);

/// 守护进程共享状态：IPC 连接与后台任务都通过它访问会话仓库
pub struct DaemonState {
    pub store: Mutex<ProcessStore>,
    /// Exit 请求或信号触发后唤醒 main 的关停路径
    pub shutdown: Notify,
}

impl DaemonState {
    pub fn new() -> Arc<Self> {
        let dir = std::env::var("NEARAUTH_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_DIR));
        Arc::new(Self {
            store: Mutex::new(ProcessStore::new(dir)),
            shutdown: Notify::new(),
        })
    }
}

/// 周期性回收已结束的会话，顺便打一条活跃数日志
pub async fn run_service(state: Arc<DaemonState>) {
    tracing::info!("核心服务初始化...");

    loop {
        tokio::time::sleep(HARVEST_INTERVAL).await;
        let mut store = state.store.lock().await;
        store.harvest().await;
        let active = store.count();
        if active > 0 {
            tracing::debug!("活跃会话: {}", active);
        }
    }
}
