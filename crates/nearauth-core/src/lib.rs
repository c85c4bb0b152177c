//! Nearauth Core Library
//!
//! 近场设备认证守护进程的核心库：会话编排、邀请通道和广播。
//! 调用方（通常是 PAM 模块，经由守护进程的 IPC）发起认证会话，
//! 证明方设备通过邀请通道连入并完成认证协议。
//!
//! # 模块
//!
//! - **config**: 会话参数（配置文件 + 请求覆盖层）
//! - **identity**: 服务密钥对、身份承诺、配对用户
//! - **engine**: 可插拔的认证协议引擎接口
//! - **channel**: 三种邀请通道（rvp / btc / ble）
//! - **beacon**: 向已知设备周期推送邀请
//! - **session**: 单次认证会话的状态机
//! - **registry**: 16 槽位的会话注册表
//!
//! # 使用示例
//!
//! ```ignore
//! use nearauth_core::ProcessStore;
//! use std::path::PathBuf;
//!
//! let mut store = ProcessStore::new(PathBuf::from("/etc/nearauth/"));
//!
//! // 发起认证，把邀请码交给设备（二维码、广播等）
//! let outcome = store.start_auth("alice", r#"{"channeltype": "ble"}"#).await?;
//!
//! // 某个时刻调用方来取结果；结果恰好交付一次
//! let reply = store.complete_auth(outcome.handle, "conn-1")?.await?;
//! assert!(reply.success);
//! ```

pub mod beacon;
pub mod channel;
pub mod config;
pub mod engine;
pub mod identity;
pub mod registry;
pub mod session;

// Config re-exports
pub use config::{AuthConfig, ChannelType, DEFAULT_CONFIG_DIR};

// Identity re-exports
pub use identity::{PairedUser, ServiceIdentity, UserStore};

// Engine re-exports
pub use engine::{EngineCtl, EngineDeps, EngineNotice, KeyedEngine, ProtocolEngine};

// Session / registry re-exports
pub use registry::{ProcessStore, StartOutcome, StoreError, MAX_SIMULTANEOUS_AUTHS};
pub use session::{CompleteReply, NullLocker, Session, SessionError, SessionLocker, SessionState};
