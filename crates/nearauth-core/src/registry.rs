//! 会话注册表
//!
//! 固定 16 个槽位的竞技场，句柄就是槽位下标。分配永远先回收再取
//! 最低空闲位，所以句柄在活跃会话之间唯一，回收后可以复用。

use crate::beacon::BeaconWriter;
use crate::engine::KeyedEngine;
use crate::session::{
    CompleteReply, ScriptLocker, Session, SessionError, SessionLocker, SessionState,
};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;

/// 同时进行的认证会话上限
pub const MAX_SIMULTANEOUS_AUTHS: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("all {MAX_SIMULTANEOUS_AUTHS} session slots in use")]
    Full,
    #[error("unknown session handle {0}")]
    UnknownHandle(i32),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// start_auth 的返回值
#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub handle: i32,
    pub code: String,
    pub success: bool,
}

/// 会话注册表
pub struct ProcessStore {
    slots: Vec<Option<Session>>,
    cursor: usize,
    default_dir: PathBuf,
    locker: Arc<dyn SessionLocker>,
    beacon_writer: Option<Arc<dyn BeaconWriter>>,
}

impl ProcessStore {
    pub fn new(default_dir: PathBuf) -> Self {
        #[cfg(feature = "bluetooth")]
        let beacon_writer: Option<Arc<dyn BeaconWriter>> =
            Some(Arc::new(crate::beacon::BluetoothBeaconWriter));
        #[cfg(not(feature = "bluetooth"))]
        let beacon_writer: Option<Arc<dyn BeaconWriter>> = None;

        Self {
            slots: (0..MAX_SIMULTANEOUS_AUTHS).map(|_| None).collect(),
            cursor: 0,
            default_dir,
            locker: Arc::new(ScriptLocker),
            beacon_writer,
        }
    }

    /// 替换 locker（测试注入）
    pub fn with_locker(mut self, locker: Arc<dyn SessionLocker>) -> Self {
        self.locker = locker;
        self
    }

    /// 替换广播投递实现（测试注入）
    pub fn with_beacon_writer(mut self, writer: Option<Arc<dyn BeaconWriter>>) -> Self {
        self.beacon_writer = writer;
        self
    }

    pub fn locker(&self) -> Arc<dyn SessionLocker> {
        self.locker.clone()
    }

    /// 活跃会话数
    pub fn count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn get(&self, handle: i32) -> Option<&Session> {
        usize::try_from(handle)
            .ok()
            .and_then(|i| self.slots.get(i))
            .and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, handle: i32) -> Option<&mut Session> {
        usize::try_from(handle)
            .ok()
            .and_then(|i| self.slots.get_mut(i))
            .and_then(Option::as_mut)
    }

    /// 回收可回收的会话，等待它们的任务退出
    pub async fn harvest(&mut self) {
        for index in 0..self.slots.len() {
            let harvestable = self.slots[index]
                .as_ref()
                .is_some_and(|s| s.state() == SessionState::Harvestable);
            if harvestable {
                if let Some(mut session) = self.slots[index].take() {
                    debug!("Harvesting session {}", session.handle());
                    if let Some(task) = session.take_task() {
                        let _ = task.await;
                    }
                }
            }
        }
        self.update_cursor();
    }

    fn update_cursor(&mut self) {
        self.cursor = self
            .slots
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.slots.len());
    }

    /// 分配一个新会话槽位（先回收）
    pub async fn add(&mut self) -> Result<i32, StoreError> {
        self.harvest().await;
        if self.cursor >= self.slots.len() {
            warn!("Session store full");
            return Err(StoreError::Full);
        }
        let handle = i32::try_from(self.cursor).map_err(|_| StoreError::Full)?;
        self.slots[self.cursor] = Some(Session::new(handle));
        self.update_cursor();
        Ok(handle)
    }

    /// 开始一次认证：分配、配置、启动通道，返回邀请码
    pub async fn start_auth(&mut self, username: &str, parameters: &str) -> Result<StartOutcome, StoreError> {
        let handle = self.add().await?;
        let default_dir = self.default_dir.clone();
        let locker = self.locker.clone();
        let beacon_writer = self.beacon_writer.clone();

        let session = self
            .get_mut(handle)
            .ok_or(StoreError::UnknownHandle(handle))?;
        session.configure(username, parameters, &default_dir);

        match session
            .start(Box::new(KeyedEngine::new()), locker, beacon_writer)
            .await
        {
            Ok(code) => {
                self.supersede(handle);
                Ok(StartOutcome {
                    handle,
                    code,
                    success: true,
                })
            }
            Err(SessionError::NoPairedUsers) => Ok(StartOutcome {
                handle,
                code: String::new(),
                success: false,
            }),
            Err(e) => {
                warn!("Failed to start session {}: {}", handle, e);
                if let Some(session) = self.get(handle) {
                    session.stop();
                }
                Ok(StartOutcome {
                    handle,
                    code: String::new(),
                    success: false,
                })
            }
        }
    }

    /// 顶掉与新会话重复的旧持续会话
    ///
    /// 比较键是服务承诺 + 用户名（不含设备身份）：同一账户对同一服务
    /// 的新认证取代旧的。只顶掉正处于持续认证态的会话，典型场景是
    /// 用户锁屏后重新发起认证，旧的持续会话已无意义。
    pub fn supersede(&mut self, new_handle: i32) {
        let Some(new_session) = self.get(new_handle) else {
            return;
        };
        let Some(commitment) = new_session.commitment() else {
            return;
        };
        let username = new_session.username();

        for slot in self.slots.iter().flatten() {
            if slot.handle() == new_handle {
                continue;
            }
            if slot.state() == SessionState::Continuing
                && slot.commitment() == Some(commitment)
                && slot.username() == username
            {
                info!(
                    "Superseding session {} with new session {}",
                    slot.handle(),
                    new_handle
                );
                slot.stop();
            }
        }
    }

    /// 请求某个会话的认证结果
    pub fn complete_auth(
        &self,
        handle: i32,
        owner: &str,
    ) -> Result<oneshot::Receiver<CompleteReply>, StoreError> {
        let session = self.get(handle).ok_or(StoreError::UnknownHandle(handle))?;
        Ok(session.complete(owner))
    }

    /// 调用方消失：停掉它名下所有结果未知的会话
    pub fn owner_lost(&self, owner: &str) {
        for slot in self.slots.iter().flatten() {
            if slot.owner().as_deref() == Some(owner) && slot.state() < SessionState::Completed {
                info!("Owner '{}' lost, stopping session {}", owner, slot.handle());
                slot.stop();
            }
        }
    }

    /// 活跃会话一览（句柄、状态、用户名）
    pub fn snapshot(&self) -> Vec<(i32, SessionState, String)> {
        self.slots
            .iter()
            .flatten()
            .map(|s| (s.handle(), s.state(), s.username()))
            .collect()
    }

    /// 停掉所有会话并等待它们退出
    pub async fn shutdown(&mut self) {
        for slot in self.slots.iter().flatten() {
            slot.stop();
        }
        for slot in &mut self.slots {
            if let Some(session) = slot.as_mut() {
                if let Some(task) = session.take_task() {
                    let _ = task.await;
                }
            }
            *slot = None;
        }
        self.update_cursor();
    }
}
