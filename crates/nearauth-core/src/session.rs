//! 认证会话
//!
//! 每个会话对应一次 start_auth 请求：打开通道、广播邀请、驱动协议
//! 引擎，最后把结果通过 complete 恰好一次地交给调用方。
//!
//! 状态单调前进：`Invalid → Started → Completed → Continuing →
//! Harvestable`，不会回退。会话本体是一个 actor 任务，消费通道事件；
//! 结果投递走共享状态里的 oneshot 目标，存第二个目标会顶掉（关闭）
//! 第一个，投递会消耗目标，所以天然恰好一次。

use crate::beacon::{self, BeaconDispatch, BeaconWriter};
use crate::channel::{ChannelBackend, ChannelError, ChannelEvent};
use crate::channel::loopback::{LoopbackChannel, LoopbackPeer};
use crate::config::AuthConfig;
use crate::engine::{EngineDeps, EngineNotice, EngineStatus, ProtocolEngine};
use crate::identity::{ServiceIdentity, UserStore};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// 锁屏脚本路径
const LOCK_COMMAND: &str = "/usr/share/nearauth/lock.sh";

/// 会话状态，只会前进
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// 已分配但尚未成功启动
    Invalid,
    /// 通道已打开，等待认证
    Started,
    /// 认证结果已知
    Completed,
    /// 结果已交付，持续监测中
    Continuing,
    /// 可以回收
    Harvestable,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Continuing => "continuing",
            Self::Harvestable => "harvestable",
        }
    }
}

/// 交给调用方的认证结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteReply {
    pub username: String,
    pub password: String,
    pub success: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no paired devices for this account")]
    NoPairedUsers,
    #[error("session not configured")]
    NotConfigured,
    #[error("session already started")]
    AlreadyStarted,
    #[error("failed to load service identity: {0}")]
    Identity(String),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// 锁定用户桌面会话的途径
///
/// 没有统一的锁屏办法，生产实现交给管理员放置的脚本。
#[async_trait]
pub trait SessionLocker: Send + Sync {
    async fn lock(&self, username: &str);
}

/// 运行 `/usr/share/nearauth/lock.sh <用户名>`
pub struct ScriptLocker;

#[async_trait]
impl SessionLocker for ScriptLocker {
    async fn lock(&self, username: &str) {
        info!("Locking session for user '{}'", username);
        match tokio::process::Command::new(LOCK_COMMAND)
            .arg(username)
            .status()
            .await
        {
            Ok(status) if status.success() => {}
            Ok(status) => warn!("Lock command exited with {}", status),
            Err(e) => warn!("Failed to run lock command: {}", e),
        }
    }
}

/// actor 任务和同步调用方共享的会话状态
struct SessionShared {
    state: SessionState,
    result: bool,
    username: String,
    password: String,
    continuous: bool,
    commitment: Option<[u8; 32]>,
    owner: Option<String>,
    reply: Option<oneshot::Sender<CompleteReply>>,
    delivered: bool,
}

impl SessionShared {
    /// 状态只前进
    fn advance(&mut self, to: SessionState) {
        if to > self.state {
            self.state = to;
        }
    }

    /// 投递已停泊的回复目标（如果有）
    fn deliver_parked(&mut self) {
        if let Some(tx) = self.reply.take() {
            let reply = CompleteReply {
                username: self.username.clone(),
                password: self.password.clone(),
                success: self.result,
            };
            debug!("Delivering parked reply (success={})", reply.success);
            let _ = tx.send(reply);
            self.delivered = true;
            if self.continuous && self.result {
                self.advance(SessionState::Continuing);
            }
        }
    }
}

/// 一次认证会话
pub struct Session {
    handle: i32,
    shared: Arc<Mutex<SessionShared>>,
    config: Option<AuthConfig>,
    channel: Option<Arc<ChannelBackend>>,
    task: Option<JoinHandle<()>>,
}

impl Session {
    pub fn new(handle: i32) -> Self {
        Self {
            handle,
            shared: Arc::new(Mutex::new(SessionShared {
                state: SessionState::Invalid,
                result: false,
                username: String::new(),
                password: String::new(),
                continuous: false,
                commitment: None,
                owner: None,
                reply: None,
                delivered: false,
            })),
            config: None,
            channel: None,
            task: None,
        }
    }

    pub fn handle(&self) -> i32 {
        self.handle
    }

    fn lock_shared(&self) -> MutexGuard<'_, SessionShared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 装载配置：配置目录文件 + 请求参数覆盖层
    pub fn configure(&mut self, username: &str, parameters: &str, default_dir: &Path) {
        let mut config = AuthConfig::load(default_dir);
        let original_dir = config.config_dir.clone();
        config.apply_overlay(parameters);
        if config.config_dir != original_dir {
            // 覆盖层换了配置目录：从新目录重新加载，再套一遍覆盖层
            let dir = config.config_dir.clone();
            config = AuthConfig::load(&dir);
            config.apply_overlay(parameters);
        }
        let mut shared = self.lock_shared();
        shared.username = username.to_string();
        shared.continuous = config.continuous;
        drop(shared);
        self.config = Some(config);
    }

    pub fn config(&self) -> Option<&AuthConfig> {
        self.config.as_ref()
    }

    /// 启动会话：打开配置指定的通道，返回邀请码
    pub async fn start(
        &mut self,
        engine: Box<dyn ProtocolEngine>,
        locker: Arc<dyn SessionLocker>,
        beacon_writer: Option<Arc<dyn BeaconWriter>>,
    ) -> Result<String, SessionError> {
        let (deps, config) = self.prepare()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let backend = ChannelBackend::open(&config, deps, engine, events_tx).await?;
        self.finish_start(&config, backend, events_rx, locker, beacon_writer)
    }

    /// 用回环通道启动（测试和本地开发）
    pub fn start_loopback(
        &mut self,
        engine: Box<dyn ProtocolEngine>,
        locker: Arc<dyn SessionLocker>,
    ) -> Result<(String, LoopbackPeer), SessionError> {
        let (deps, config) = self.prepare()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (channel, peer) = LoopbackChannel::open(deps, engine, events_tx);
        let invite = self.finish_start(
            &config,
            ChannelBackend::Loopback(channel),
            events_rx,
            locker,
            None,
        )?;
        Ok((invite, peer))
    }

    /// 公共的启动前检查：加载身份和用户，没有可用的配对用户则直接拒绝
    fn prepare(&mut self) -> Result<(EngineDeps, AuthConfig), SessionError> {
        if self.channel.is_some() {
            return Err(SessionError::AlreadyStarted);
        }
        let config = self.config.clone().ok_or(SessionError::NotConfigured)?;
        let dir = config.config_dir.clone();

        let identity = ServiceIdentity::load_or_generate(&dir)
            .map_err(|e| SessionError::Identity(e.to_string()))?;
        let users = UserStore::load(&dir);

        let mut shared = self.lock_shared();
        shared.commitment = Some(identity.commitment());
        let username = shared.username.clone();
        drop(shared);

        let users = if config.any_user {
            users
        } else {
            users.filter_by_account(&username)
        };
        // anyuser 只放开账户过滤，完全没有配对用户时同样拒绝
        if users.is_empty() {
            info!("No paired devices for '{}', denying", username);
            self.lock_shared().advance(SessionState::Harvestable);
            return Err(SessionError::NoPairedUsers);
        }

        Ok((
            EngineDeps {
                identity: Arc::new(identity),
                users,
                continuous: config.continuous,
            },
            config,
        ))
    }

    /// 收尾：启动广播、记录状态、派生 actor 任务
    fn finish_start(
        &mut self,
        config: &AuthConfig,
        backend: ChannelBackend,
        events_rx: mpsc::UnboundedReceiver<ChannelEvent>,
        locker: Arc<dyn SessionLocker>,
        beacon_writer: Option<Arc<dyn BeaconWriter>>,
    ) -> Result<String, SessionError> {
        let invite = backend.invite_code().to_string();
        let channel = Arc::new(backend);

        let beacons = if config.beacons {
            match beacon_writer {
                Some(writer) => {
                    let devices = beacon::load_devices(&config.config_dir);
                    Some(BeaconDispatch::start(devices, invite.clone(), writer))
                }
                None => {
                    warn!("Beacons requested but no transport available");
                    None
                }
            }
        } else {
            None
        };

        let timeout = if config.timeout > 0.0 {
            Some(Duration::from_secs_f64(config.timeout))
        } else {
            None
        };

        self.lock_shared().advance(SessionState::Started);
        info!("Session {} started ({})", self.handle, config.channel.name());

        self.task = Some(tokio::spawn(session_task(
            self.shared.clone(),
            channel.clone(),
            events_rx,
            locker,
            beacons,
            timeout,
        )));
        self.channel = Some(channel);
        Ok(invite)
    }

    /// 请求认证结果
    ///
    /// 结果已知则立即送入返回的接收端，终态可以重复读取；未知则
    /// 停泊等待，后到的 complete 会顶掉先前停泊的目标。
    pub fn complete(&self, owner: &str) -> oneshot::Receiver<CompleteReply> {
        let mut shared = self.lock_shared();
        shared.owner = Some(owner.to_string());
        let (tx, rx) = oneshot::channel();
        if shared.state >= SessionState::Completed {
            // 结果已知，立即投递
            shared.reply = Some(tx);
            shared.deliver_parked();
        } else {
            // 停泊；若已有停泊目标则顶掉它
            if shared.reply.is_some() {
                debug!("Superseding previously parked reply target");
            }
            shared.reply = Some(tx);
        }
        rx
    }

    /// 请求停止会话（幂等）
    pub fn stop(&self) {
        match &self.channel {
            Some(channel) => channel.stop(),
            // 从未启动，直接进入可回收态
            None => self.lock_shared().advance(SessionState::Harvestable),
        }
    }

    pub fn state(&self) -> SessionState {
        self.lock_shared().state
    }

    pub fn username(&self) -> String {
        self.lock_shared().username.clone()
    }

    pub fn owner(&self) -> Option<String> {
        self.lock_shared().owner.clone()
    }

    pub fn delivered(&self) -> bool {
        self.lock_shared().delivered
    }

    pub fn continuous(&self) -> bool {
        self.lock_shared().continuous
    }

    pub fn commitment(&self) -> Option<[u8; 32]> {
        self.lock_shared().commitment
    }

    /// 取走 actor 任务句柄（回收时等待它退出）
    pub fn take_task(&mut self) -> Option<JoinHandle<()>> {
        self.task.take()
    }
}

/// 会话 actor：消费通道事件，推进状态机
async fn session_task(
    shared: Arc<Mutex<SessionShared>>,
    channel: Arc<ChannelBackend>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    locker: Arc<dyn SessionLocker>,
    mut beacons: Option<BeaconDispatch>,
    timeout: Option<Duration>,
) {
    let mut deadline = timeout.map(|t| Instant::now() + t);

    loop {
        tokio::select! {
            () = crate::channel::sleep_until_opt(deadline), if deadline.is_some() => {
                info!("Session timed out, stopping channel");
                deadline = None;
                channel.stop();
            }
            event = events.recv() => match event {
                Some(ChannelEvent::Notice(notice)) => {
                    let device_connected =
                        matches!(notice, EngineNotice::Status(EngineStatus::Connected));
                    let outcome_known = handle_notice(&shared, &channel, &locker, notice).await;
                    // 设备已连上：解除启动超时，邀请广播也可以停了
                    if device_connected || outcome_known {
                        deadline = None;
                        if let Some(dispatch) = beacons.take() {
                            dispatch.stop().await;
                        }
                    }
                }
                Some(ChannelEvent::Stopped) => {
                    let mut guard = shared.lock().unwrap_or_else(PoisonError::into_inner);
                    guard.advance(SessionState::Harvestable);
                    // 无结果地停掉：把停泊的目标按失败投递
                    guard.deliver_parked();
                    break;
                }
                None => break,
            },
        }
    }

    if let Some(dispatch) = beacons.take() {
        dispatch.stop().await;
    }
    debug!("Session task finished");
}

/// 处理一条引擎通知，返回认证结果是否已知
async fn handle_notice(
    shared: &Arc<Mutex<SessionShared>>,
    channel: &ChannelBackend,
    locker: &Arc<dyn SessionLocker>,
    notice: EngineNotice,
) -> bool {
    match notice {
        EngineNotice::Status(status) => {
            debug!("Engine status: {:?}", status);
            false
        }
        EngineNotice::Authenticated { user, password } => {
            let mut guard = shared.lock().unwrap_or_else(PoisonError::into_inner);
            guard.result = true;
            if let Some(user) = user {
                if guard.username.is_empty() {
                    guard.username = user;
                }
            }
            if let Some(password) = password {
                guard.password = password;
            }
            guard.advance(SessionState::Completed);
            guard.deliver_parked();
            let continuous = guard.continuous;
            drop(guard);
            info!("Authentication succeeded");
            if !continuous {
                channel.stop();
            }
            true
        }
        EngineNotice::AuthFailed => {
            let mut guard = shared.lock().unwrap_or_else(PoisonError::into_inner);
            guard.result = false;
            guard.advance(SessionState::Completed);
            guard.deliver_parked();
            drop(guard);
            info!("Authentication failed");
            channel.stop();
            true
        }
        EngineNotice::SessionEnded => {
            info!("Continuous session ended");
            let (was_success, continuous, username) = close_with_failure(shared);
            // 成功过的持续会话失效 ⇒ 锁定桌面会话，无论结果拉没拉走
            if continuous && was_success {
                locker.lock(&username).await;
            }
            channel.stop();
            true
        }
        EngineNotice::Error(message) => {
            warn!("Engine error: {}", message);
            let (was_success, continuous, username) = close_with_failure(shared);
            if continuous && was_success {
                locker.lock(&username).await;
            }
            channel.stop();
            true
        }
    }
}

/// 会话结束或协议出错：记下先前的结果，当前结果改为失败并投递
fn close_with_failure(shared: &Arc<Mutex<SessionShared>>) -> (bool, bool, String) {
    let mut guard = shared.lock().unwrap_or_else(PoisonError::into_inner);
    let was_success = guard.result;
    guard.result = false;
    guard.advance(SessionState::Completed);
    guard.deliver_parked();
    (was_success, guard.continuous, guard.username.clone())
}

/// 测试用：什么都不做的 locker
pub struct NullLocker;

#[async_trait]
impl SessionLocker for NullLocker {
    async fn lock(&self, _username: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EchoEngine, KeyedEngine};
    use crate::identity::{PairedUser, USERS_FILE};
    use base64::{Engine as _, engine::general_purpose};

    fn write_paired_user(dir: &Path, account: &str) {
        let user = PairedUser {
            name: "Phone".into(),
            key: general_purpose::STANDARD.encode([1u8; 32]),
            user: account.into(),
        };
        std::fs::write(
            dir.join(USERS_FILE),
            format!("{}\n", serde_json::to_string(&user).unwrap()),
        )
        .unwrap();
    }

    #[test]
    fn test_state_never_regresses() {
        let session = Session::new(0);
        let mut shared = session.lock_shared();
        shared.advance(SessionState::Continuing);
        shared.advance(SessionState::Started);
        assert_eq!(shared.state, SessionState::Continuing);
        shared.advance(SessionState::Harvestable);
        assert_eq!(shared.state, SessionState::Harvestable);
    }

    #[tokio::test]
    async fn test_complete_parks_until_outcome() {
        let dir = tempfile::tempdir().unwrap();
        write_paired_user(dir.path(), "alice");
        let mut session = Session::new(0);
        session.configure("alice", "", dir.path());
        let (_invite, mut peer) = session
            .start_loopback(Box::new(EchoEngine), Arc::new(NullLocker))
            .unwrap();

        let rx = session.complete("owner-1");
        assert!(!session.delivered());

        // 对端断开 → EchoEngine 发 SessionEnded → 通道停止 → 失败投递
        peer.tx = {
            let (tx, _rx) = mpsc::unbounded_channel();
            tx
        };
        let reply = rx.await.unwrap();
        assert!(!reply.success);
        assert!(session.delivered());
        assert_eq!(session.state(), SessionState::Harvestable);
    }

    #[tokio::test]
    async fn test_second_parked_target_supersedes_first() {
        let dir = tempfile::tempdir().unwrap();
        write_paired_user(dir.path(), "alice");
        let mut session = Session::new(0);
        session.configure("alice", "", dir.path());
        let (_invite, _peer) = session
            .start_loopback(Box::new(EchoEngine), Arc::new(NullLocker))
            .unwrap();

        let rx1 = session.complete("owner-1");
        let rx2 = session.complete("owner-2");

        // 第一个目标被顶掉，其接收端直接关闭
        assert!(rx1.await.is_err());
        session.stop();
        let reply = rx2.await.unwrap();
        assert!(!reply.success);
    }

    #[tokio::test]
    async fn test_complete_rereads_terminal_result() {
        let dir = tempfile::tempdir().unwrap();
        write_paired_user(dir.path(), "alice");
        let mut session = Session::new(0);
        session.configure("alice", "", dir.path());
        let (_invite, _peer) = session
            .start_loopback(Box::new(EchoEngine), Arc::new(NullLocker))
            .unwrap();

        let rx = session.complete("owner-1");
        session.stop();
        let first = rx.await.unwrap();
        assert!(!first.success);

        // 终态可以重复读取，返回同样的结果
        let again = session.complete("owner-1").await.unwrap();
        assert_eq!(again, first);
    }

    #[tokio::test]
    async fn test_empty_filter_denies() {
        let dir = tempfile::tempdir().unwrap();
        // 没有任何配对用户
        let mut session = Session::new(0);
        session.configure("alice", "", dir.path());
        let result = session.start_loopback(Box::new(EchoEngine), Arc::new(NullLocker));
        assert!(matches!(result, Err(SessionError::NoPairedUsers)));
        assert_eq!(session.state(), SessionState::Harvestable);
    }

    #[tokio::test]
    async fn test_any_user_skips_filter() {
        let dir = tempfile::tempdir().unwrap();
        // 只有 bob 配对，anyuser 覆盖层仍允许为 alice 启动
        write_paired_user(dir.path(), "bob");
        let mut session = Session::new(0);
        session.configure("alice", r#"{"anyuser": 1}"#, dir.path());
        let result = session.start_loopback(Box::new(EchoEngine), Arc::new(NullLocker));
        assert!(result.is_ok());
        session.stop();
    }

    #[tokio::test]
    async fn test_any_user_with_empty_store_denies() {
        let dir = tempfile::tempdir().unwrap();
        // 一个配对用户都没有：anyuser 也不能放行
        let mut session = Session::new(0);
        session.configure("", r#"{"anyuser": 1}"#, dir.path());
        let result = session.start_loopback(Box::new(EchoEngine), Arc::new(NullLocker));
        assert!(matches!(result, Err(SessionError::NoPairedUsers)));
        assert_eq!(session.state(), SessionState::Harvestable);
    }

    #[tokio::test]
    async fn test_connect_cancels_session_timeout() {
        let dir = tempfile::tempdir().unwrap();
        write_paired_user(dir.path(), "alice");
        let mut session = Session::new(0);
        session.configure("alice", r#"{"timeout": 0.1}"#, dir.path());
        // 回环通道立即接通，接通后启动超时解除
        let (_invite, _peer) = session
            .start_loopback(Box::new(KeyedEngine::new()), Arc::new(NullLocker))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(session.state(), SessionState::Started);
        session.stop();
    }

    #[tokio::test]
    async fn test_stop_before_start_is_harvestable() {
        let session = Session::new(3);
        session.stop();
        assert_eq!(session.state(), SessionState::Harvestable);
    }
}
