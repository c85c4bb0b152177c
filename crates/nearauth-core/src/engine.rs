//! 协议引擎接口
//!
//! 认证协议本体通过 `ProtocolEngine` 接入通道。通道任务同步驱动引擎，
//! 引擎把动作（写、定时、监听、断开）和通知（认证结果、会话结束、错误）
//! 排入 `EngineCtl`，由通道任务取出执行或转发给会话。
//!
//! 引擎本身不做任何 I/O，因此可以在没有硬件的测试中直接驱动。

use crate::identity::{decrypt_extra, ServiceIdentity, UserStore};
use base64::{Engine as _, engine::general_purpose};
use log::{debug, warn};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// 引擎请求通道执行的动作
#[derive(Debug, PartialEq)]
pub enum EngineAction {
    /// 向对端发送一帧数据
    Write(Vec<u8>),
    /// 重置引擎定时器（到期时通道回调 `timeout`）
    SetTimeout(Duration),
    /// 开始等待对端连接
    Listen,
    /// 断开当前连接
    Disconnect,
}

/// 引擎向会话发出的通知
#[derive(Debug, Clone, PartialEq)]
pub enum EngineNotice {
    /// 协议阶段变化（通道用它来停广播等）
    Status(EngineStatus),
    /// 认证成功
    Authenticated {
        user: Option<String>,
        password: Option<String>,
    },
    /// 认证失败
    AuthFailed,
    /// 持续认证会话结束（设备离场或主动终止）
    SessionEnded,
    /// 协议错误
    Error(String),
}

/// 协议阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Started,
    Connected,
    Finished,
}

/// 动作和通知的排队缓冲
#[derive(Debug, Default)]
pub struct EngineCtl {
    actions: Vec<EngineAction>,
    notices: Vec<EngineNotice>,
}

impl EngineCtl {
    pub fn write(&mut self, data: Vec<u8>) {
        self.actions.push(EngineAction::Write(data));
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.actions.push(EngineAction::SetTimeout(timeout));
    }

    pub fn listen(&mut self) {
        self.actions.push(EngineAction::Listen);
    }

    pub fn disconnect(&mut self) {
        self.actions.push(EngineAction::Disconnect);
    }

    pub fn status(&mut self, status: EngineStatus) {
        self.notices.push(EngineNotice::Status(status));
    }

    pub fn authenticated(&mut self, user: Option<String>, password: Option<String>) {
        self.notices.push(EngineNotice::Authenticated { user, password });
    }

    pub fn auth_failed(&mut self) {
        self.notices.push(EngineNotice::AuthFailed);
    }

    pub fn session_ended(&mut self) {
        self.notices.push(EngineNotice::SessionEnded);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.notices.push(EngineNotice::Error(message.into()));
    }

    /// 取出已排队的动作和通知（通道任务每次驱动引擎后调用）
    pub fn drain(&mut self) -> (Vec<EngineAction>, Vec<EngineNotice>) {
        (
            std::mem::take(&mut self.actions),
            std::mem::take(&mut self.notices),
        )
    }
}

/// 引擎启动时可用的会话资源
#[derive(Clone)]
pub struct EngineDeps {
    /// 服务身份（签名、承诺）
    pub identity: Arc<ServiceIdentity>,
    /// 过滤后的配对用户集合
    pub users: UserStore,
    /// 首次认证后是否持续监测
    pub continuous: bool,
}

/// 认证协议引擎
///
/// 通道任务持有 `Box<dyn ProtocolEngine>` 并在事件发生时同步调用；
/// 引擎只操作传入的 `EngineCtl`，不直接做 I/O。
pub trait ProtocolEngine: Send {
    /// 会话开始（通道尚未监听）
    fn start(&mut self, ctl: &mut EngineCtl, deps: &EngineDeps);
    /// 对端已连接
    fn connected(&mut self, ctl: &mut EngineCtl);
    /// 对端断开
    fn disconnected(&mut self, ctl: &mut EngineCtl);
    /// 收到一帧数据
    fn read(&mut self, ctl: &mut EngineCtl, data: &[u8]);
    /// 引擎定时器到期
    fn timeout(&mut self, ctl: &mut EngineCtl);
    /// 会话停止（通道即将关闭）
    fn stop(&mut self, ctl: &mut EngineCtl);
}

/// 生成邀请码
///
/// 内容是 base64 编码的 JSON：
/// `{"sn": 承诺, "spk": 公钥, "sig": 签名, "ed": "", "sa": 通道地址, "td": {}, "t": "KP"}`，
/// 签名覆盖 `sa || spk`。
pub fn invite_code(identity: &ServiceIdentity, address: &str) -> String {
    let spk = general_purpose::STANDARD.encode(identity.public_key_der());
    let signed = format!("{}{}", address, spk);
    let sig = general_purpose::STANDARD.encode(identity.sign(signed.as_bytes()));
    let sn = general_purpose::STANDARD.encode(identity.commitment());
    let payload = serde_json::json!({
        "sn": sn,
        "spk": spk,
        "sig": sig,
        "ed": "",
        "sa": address,
        "td": {},
        "t": "KP",
    });
    general_purpose::STANDARD.encode(payload.to_string())
}

/// 引擎定时器间隔（两次协议消息之间允许的最长间隔）
const ENGINE_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// 基于配对密钥的认证引擎
///
/// 最小线协议（每帧一个 JSON 对象）：
/// - 设备 → 服务：`{"t": "auth", "user": 账户, "extra": base64(IV||密文)}`
/// - 服务 → 设备：`{"t": "result", "ok": bool}`
/// - 持续模式下设备定期发 `{"t": "ping"}`，发 `{"t": "end"}` 或超时则结束。
pub struct KeyedEngine {
    deps: Option<EngineDeps>,
    authenticated: bool,
}

impl KeyedEngine {
    pub fn new() -> Self {
        Self {
            deps: None,
            authenticated: false,
        }
    }

    fn handle_auth(&mut self, ctl: &mut EngineCtl, value: &Value) {
        let Some(deps) = &self.deps else {
            ctl.error("Engine not started");
            return;
        };
        let account = value.get("user").and_then(Value::as_str).unwrap_or_default();
        let Some(paired) = deps.users.iter().find(|u| u.user == account) else {
            debug!("No paired key for account '{}'", account);
            ctl.write(br#"{"t": "result", "ok": false}"#.to_vec());
            ctl.auth_failed();
            return;
        };

        let password = match value.get("extra").and_then(Value::as_str) {
            Some(extra) if !extra.is_empty() => match decrypt_extra(&paired.key, extra) {
                Ok(plain) => Some(plain),
                Err(e) => {
                    warn!("Failed to decrypt extra data: {}", e);
                    ctl.write(br#"{"t": "result", "ok": false}"#.to_vec());
                    ctl.auth_failed();
                    return;
                }
            },
            _ => None,
        };

        self.authenticated = true;
        ctl.write(br#"{"t": "result", "ok": true}"#.to_vec());
        ctl.authenticated(Some(account.to_string()), password);
        if deps.continuous {
            // 持续模式：连接保持，等待 ping / end
            ctl.set_timeout(ENGINE_STEP_TIMEOUT);
        } else {
            ctl.status(EngineStatus::Finished);
            ctl.disconnect();
        }
    }
}

impl Default for KeyedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolEngine for KeyedEngine {
    fn start(&mut self, ctl: &mut EngineCtl, deps: &EngineDeps) {
        self.deps = Some(deps.clone());
        ctl.status(EngineStatus::Started);
        ctl.listen();
    }

    fn connected(&mut self, ctl: &mut EngineCtl) {
        ctl.status(EngineStatus::Connected);
        ctl.set_timeout(ENGINE_STEP_TIMEOUT);
    }

    fn disconnected(&mut self, ctl: &mut EngineCtl) {
        if self.authenticated {
            if self.deps.as_ref().is_some_and(|d| d.continuous) {
                ctl.session_ended();
            }
        } else {
            ctl.auth_failed();
        }
    }

    fn read(&mut self, ctl: &mut EngineCtl, data: &[u8]) {
        let value: Value = match serde_json::from_slice(data) {
            Ok(v) => v,
            Err(e) => {
                ctl.error(format!("Malformed protocol message: {}", e));
                return;
            }
        };
        match value.get("t").and_then(Value::as_str) {
            Some("auth") => self.handle_auth(ctl, &value),
            Some("ping") if self.authenticated => {
                ctl.write(br#"{"t": "pong"}"#.to_vec());
                ctl.set_timeout(ENGINE_STEP_TIMEOUT);
            }
            Some("end") => {
                ctl.session_ended();
                ctl.status(EngineStatus::Finished);
                ctl.disconnect();
            }
            other => {
                ctl.error(format!("Unexpected message type {:?}", other));
            }
        }
    }

    fn timeout(&mut self, ctl: &mut EngineCtl) {
        if self.authenticated {
            // 持续模式下心跳超时，视为设备离场
            ctl.session_ended();
        } else {
            ctl.auth_failed();
        }
        ctl.disconnect();
    }

    fn stop(&mut self, ctl: &mut EngineCtl) {
        ctl.disconnect();
    }
}

/// 回显引擎，仅用于通道层测试
pub struct EchoEngine;

impl ProtocolEngine for EchoEngine {
    fn start(&mut self, ctl: &mut EngineCtl, _deps: &EngineDeps) {
        ctl.listen();
    }

    fn connected(&mut self, _ctl: &mut EngineCtl) {}

    fn disconnected(&mut self, ctl: &mut EngineCtl) {
        ctl.session_ended();
    }

    fn read(&mut self, ctl: &mut EngineCtl, data: &[u8]) {
        ctl.write(data.to_vec());
    }

    fn timeout(&mut self, ctl: &mut EngineCtl) {
        ctl.disconnect();
    }

    fn stop(&mut self, ctl: &mut EngineCtl) {
        ctl.disconnect();
    }
}
