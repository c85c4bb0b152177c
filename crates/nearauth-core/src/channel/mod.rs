//! 邀请通道
//!
//! 会话通过通道与证明方设备通信。三种后端：
//! - `rvp` — HTTP 会合点长轮询（无需本地硬件，默认）
//! - `btc` — 经典蓝牙 RFCOMM
//! - `ble` — 低功耗蓝牙 GATT
//!
//! 另有 `loopback` 进程内后端，用于测试和本地开发。
//! 各后端共享 `EngineDriver`（驱动协议引擎、执行其动作、转发其通知）
//! 和 `StopLatch`（保证无论 stop 被调用多少次，只发出一次停止事件）。

pub mod codec;
pub mod loopback;
pub mod rvp;

#[cfg(feature = "bluetooth")]
pub mod btc;

#[cfg(feature = "bluetooth")]
pub mod ble;

use crate::config::{AuthConfig, ChannelType};
use crate::engine::{EngineAction, EngineCtl, EngineDeps, EngineNotice, ProtocolEngine};
use log::warn;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// 通道层错误
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel backend unavailable: {0}")]
    Unavailable(String),
    #[error("channel I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("rendezvous request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[cfg(feature = "bluetooth")]
    #[error("bluetooth operation failed: {0}")]
    Bluetooth(#[from] bluer::Error),
    #[error("{0}")]
    Other(String),
}

/// 通道发给会话的事件
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// 引擎通知（认证结果、会话结束、错误）
    Notice(EngineNotice),
    /// 通道已完全停止（每个通道恰好一次）
    Stopped,
}

pub type EventSender = mpsc::UnboundedSender<ChannelEvent>;

/// 停止闩锁
///
/// `request_stop` 可以调用任意多次；`fire_stopped` 只在第一次调用时返回
/// true，保证停止事件恰好发出一次。
#[derive(Clone)]
pub struct StopLatch {
    cancel: CancellationToken,
    fired: Arc<AtomicBool>,
}

impl StopLatch {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// 第一次调用返回 true，之后永远返回 false
    pub fn fire_stopped(&self) -> bool {
        !self.fired.swap(true, Ordering::SeqCst)
    }
}

impl Default for StopLatch {
    fn default() -> Self {
        Self::new()
    }
}

/// 向会话发出停止事件（只会真正发送一次）
pub(crate) fn emit_stopped(latch: &StopLatch, events: &EventSender) {
    if latch.fire_stopped() {
        let _ = events.send(ChannelEvent::Stopped);
    }
}

/// 帧编码：4 字节大端长度前缀
pub fn encode_frame(data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + data.len());
    frame.extend_from_slice(&(u32::try_from(data.len()).unwrap_or(u32::MAX)).to_be_bytes());
    frame.extend_from_slice(data);
    frame
}

/// 去掉 4 字节长度前缀，长度不符时返回 None
pub fn decode_frame(frame: &[u8]) -> Option<&[u8]> {
    if frame.len() < 4 {
        return None;
    }
    let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    let body = &frame[4..];
    if body.len() < len {
        return None;
    }
    Some(&body[..len])
}

/// 引擎驱动器
///
/// 通道任务的共享部分：调用引擎、取出其动作（写队列、定时器、监听、
/// 断开）、把通知转发给会话。各后端只负责真正的 I/O。
pub(crate) struct EngineDriver {
    engine: Box<dyn ProtocolEngine>,
    ctl: EngineCtl,
    deps: EngineDeps,
    events: EventSender,
    writes: VecDeque<Vec<u8>>,
    timeout_at: Option<Instant>,
    listen_requested: bool,
    disconnect_requested: bool,
}

impl EngineDriver {
    pub fn new(engine: Box<dyn ProtocolEngine>, deps: EngineDeps, events: EventSender) -> Self {
        Self {
            engine,
            ctl: EngineCtl::default(),
            deps,
            events,
            writes: VecDeque::new(),
            timeout_at: None,
            listen_requested: false,
            disconnect_requested: false,
        }
    }

    pub fn start(&mut self) {
        let deps = self.deps.clone();
        self.engine.start(&mut self.ctl, &deps);
        self.apply();
    }

    pub fn connected(&mut self) {
        self.engine.connected(&mut self.ctl);
        self.apply();
    }

    pub fn disconnected(&mut self) {
        self.engine.disconnected(&mut self.ctl);
        self.apply();
    }

    pub fn read(&mut self, data: &[u8]) {
        self.engine.read(&mut self.ctl, data);
        self.apply();
    }

    pub fn fire_timeout(&mut self) {
        self.timeout_at = None;
        self.engine.timeout(&mut self.ctl);
        self.apply();
    }

    pub fn stop(&mut self) {
        self.engine.stop(&mut self.ctl);
        self.apply();
    }

    /// 执行引擎排队的动作，转发通知
    fn apply(&mut self) {
        let (actions, notices) = self.ctl.drain();
        for action in actions {
            match action {
                EngineAction::Write(data) => self.writes.push_back(data),
                EngineAction::SetTimeout(timeout) => {
                    self.timeout_at = Some(Instant::now() + timeout);
                }
                EngineAction::Listen => self.listen_requested = true,
                EngineAction::Disconnect => self.disconnect_requested = true,
            }
        }
        for notice in notices {
            let _ = self.events.send(ChannelEvent::Notice(notice));
        }
    }

    pub fn next_write(&mut self) -> Option<Vec<u8>> {
        self.writes.pop_front()
    }

    pub fn take_listen(&mut self) -> bool {
        std::mem::take(&mut self.listen_requested)
    }

    pub fn take_disconnect(&mut self) -> bool {
        std::mem::take(&mut self.disconnect_requested)
    }

    /// 引擎定时器到期时刻（未设置时为 None）
    pub fn timeout_at(&self) -> Option<Instant> {
        self.timeout_at
    }
}

/// 在可选时刻到期的睡眠（None 表示永不到期）
pub(crate) async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// 应用蓝牙可用性回退
///
/// 编译时没有蓝牙支持时，btc / ble 回退到 rvp。
pub fn effective_channel_type(requested: ChannelType) -> ChannelType {
    #[cfg(feature = "bluetooth")]
    {
        requested
    }
    #[cfg(not(feature = "bluetooth"))]
    {
        match requested {
            ChannelType::Rvp => ChannelType::Rvp,
            other => {
                warn!(
                    "Channel type '{}' needs bluetooth support, falling back to rvp",
                    other.name()
                );
                ChannelType::Rvp
            }
        }
    }
}

/// 三种后端之一（外加测试用的回环后端）
pub enum ChannelBackend {
    Rvp(rvp::RvpChannel),
    #[cfg(feature = "bluetooth")]
    Btc(btc::BtcChannel),
    #[cfg(feature = "bluetooth")]
    Ble(ble::BleChannel),
    Loopback(loopback::LoopbackChannel),
}

impl ChannelBackend {
    /// 按配置打开通道并启动 I/O 任务，返回邀请码
    pub async fn open(
        config: &AuthConfig,
        deps: EngineDeps,
        engine: Box<dyn ProtocolEngine>,
        events: EventSender,
    ) -> Result<Self, ChannelError> {
        let channel_type = effective_channel_type(config.channel);
        match channel_type {
            ChannelType::Rvp => {
                let channel = rvp::RvpChannel::open(config, deps, engine, events).await?;
                Ok(ChannelBackend::Rvp(channel))
            }
            #[cfg(feature = "bluetooth")]
            ChannelType::Btc => {
                if btc::adapter_available().await {
                    let channel = btc::BtcChannel::open(config, deps, engine, events).await?;
                    Ok(ChannelBackend::Btc(channel))
                } else {
                    warn!("No bluetooth adapter available, falling back to rvp");
                    let channel = rvp::RvpChannel::open(config, deps, engine, events).await?;
                    Ok(ChannelBackend::Rvp(channel))
                }
            }
            #[cfg(feature = "bluetooth")]
            ChannelType::Ble => {
                let channel = ble::BleChannel::open(config, deps, engine, events).await?;
                Ok(ChannelBackend::Ble(channel))
            }
            #[cfg(not(feature = "bluetooth"))]
            _ => unreachable!("effective_channel_type only returns rvp without bluetooth"),
        }
    }

    /// 通道地址（邀请码中的 `sa` 字段）
    pub fn invite_code(&self) -> &str {
        match self {
            ChannelBackend::Rvp(c) => c.invite_code(),
            #[cfg(feature = "bluetooth")]
            ChannelBackend::Btc(c) => c.invite_code(),
            #[cfg(feature = "bluetooth")]
            ChannelBackend::Ble(c) => c.invite_code(),
            ChannelBackend::Loopback(c) => c.invite_code(),
        }
    }

    /// 请求停止（幂等；通道完全排空后发出一次 `Stopped` 事件）
    pub fn stop(&self) {
        match self {
            ChannelBackend::Rvp(c) => c.stop(),
            #[cfg(feature = "bluetooth")]
            ChannelBackend::Btc(c) => c.stop(),
            #[cfg(feature = "bluetooth")]
            ChannelBackend::Ble(c) => c.stop(),
            ChannelBackend::Loopback(c) => c.stop(),
        }
    }
}
