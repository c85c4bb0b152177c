//! 会话配置和持久化
//!
//! 提供认证会话参数的读取：磁盘配置文件（`config.txt`，JSON 格式）
//! 加上每次请求的参数覆盖层。

use log::{debug, warn};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// 默认配置目录
pub const DEFAULT_CONFIG_DIR: &str = "/etc/nearauth/";
/// 默认会合点 URL
pub const DEFAULT_RVP_URL: &str = "http://rendezvous.mypico.org/";
/// 配置文件名
pub const CONFIG_FILE: &str = "config.txt";
/// 默认会话超时（秒），0 表示禁用
const DEFAULT_TIMEOUT_SECS: f64 = 40.0;

/// 通道类型枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelType {
    /// HTTP 会合点长轮询
    #[default]
    Rvp,
    /// 经典蓝牙 RFCOMM
    Btc,
    /// 低功耗蓝牙 GATT
    Ble,
}

impl ChannelType {
    /// 从配置字符串创建，未知值回退到 Rvp
    pub fn from_name(name: &str) -> Self {
        match name {
            "rvp" => ChannelType::Rvp,
            "btc" => ChannelType::Btc,
            "ble" => ChannelType::Ble,
            other => {
                warn!("Unknown channel type '{}', falling back to rvp", other);
                ChannelType::Rvp
            }
        }
    }

    /// 获取配置字符串
    pub fn name(self) -> &'static str {
        match self {
            ChannelType::Rvp => "rvp",
            ChannelType::Btc => "btc",
            ChannelType::Ble => "ble",
        }
    }
}

/// 认证会话配置
///
/// 先从配置目录的 `config.txt` 读取，再应用调用方传入的参数覆盖层。
/// `any_user` 只能由覆盖层设置，文件中的值会被丢弃。
#[derive(Debug, Clone, PartialEq)]
pub struct AuthConfig {
    /// 首次认证后是否持续监测设备在场
    pub continuous: bool,
    /// 邀请通道类型
    pub channel: ChannelType,
    /// 是否向已知设备广播邀请
    pub beacons: bool,
    /// 是否允许任意已配对用户（跳过账户过滤）
    pub any_user: bool,
    /// 会话超时（秒），0 表示禁用
    pub timeout: f64,
    /// 会合点 URL，带尾部斜杠
    pub rvp_url: String,
    /// 配置目录，带尾部斜杠
    pub config_dir: PathBuf,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            continuous: false,
            channel: ChannelType::Rvp,
            beacons: false,
            any_user: false,
            timeout: DEFAULT_TIMEOUT_SECS,
            rvp_url: DEFAULT_RVP_URL.to_string(),
            config_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
        }
    }
}

impl AuthConfig {
    /// 从配置目录加载（文件不存在时使用默认值）
    ///
    /// 文件中的 `anyuser` 键会被忽略。
    pub fn load(dir: &Path) -> Self {
        let mut config = Self::default();
        config.config_dir = normalize_dir(dir);
        let path = config.config_dir.join(CONFIG_FILE);
        if path.exists() {
            match fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str::<Value>(&content) {
                    Ok(value) => {
                        config.apply_value(&value, false);
                        debug!("Loaded session config from {:?}", path);
                    }
                    Err(e) => {
                        warn!("Failed to parse config file: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    warn!("Failed to read config file: {}, using defaults", e);
                }
            }
        }
        config
    }

    /// 应用调用方传入的参数覆盖层（JSON 对象字符串）
    ///
    /// 空字符串视为无覆盖。覆盖层是唯一能启用 `anyuser` 的途径。
    pub fn apply_overlay(&mut self, parameters: &str) {
        if parameters.trim().is_empty() {
            return;
        }
        match serde_json::from_str::<Value>(parameters) {
            Ok(value) => self.apply_value(&value, true),
            Err(e) => warn!("Failed to parse parameter overlay: {}, ignoring", e),
        }
    }

    /// 应用一个 JSON 对象中的已知键
    fn apply_value(&mut self, value: &Value, honor_any_user: bool) {
        let Some(map) = value.as_object() else {
            warn!("Config root is not a JSON object, ignoring");
            return;
        };
        for (key, v) in map {
            match key.as_str() {
                "continuous" => {
                    if let Some(b) = value_as_bool(v) {
                        self.continuous = b;
                    }
                }
                "channeltype" => {
                    if let Some(s) = v.as_str() {
                        self.channel = ChannelType::from_name(s);
                    }
                }
                "beacons" => {
                    if let Some(b) = value_as_bool(v) {
                        self.beacons = b;
                    }
                }
                "anyuser" => {
                    if honor_any_user {
                        if let Some(b) = value_as_bool(v) {
                            self.any_user = b;
                        }
                    } else {
                        debug!("Ignoring 'anyuser' from config file");
                    }
                }
                "timeout" => {
                    if let Some(t) = v.as_f64() {
                        self.timeout = t;
                    }
                }
                "rvpurl" => {
                    if let Some(s) = v.as_str() {
                        self.rvp_url = with_trailing_slash(s);
                    }
                }
                "configdir" => {
                    if let Some(s) = v.as_str() {
                        self.config_dir = normalize_dir(Path::new(s));
                    }
                }
                other => debug!("Ignoring unknown config key '{}'", other),
            }
        }
    }
}

/// 布尔键同时接受 JSON 布尔和 0/1 整数（兼容旧格式）
fn value_as_bool(v: &Value) -> Option<bool> {
    if let Some(b) = v.as_bool() {
        return Some(b);
    }
    v.as_i64().map(|n| n != 0)
}

/// 确保 URL 或路径字符串带尾部斜杠
fn with_trailing_slash(s: &str) -> String {
    if s.ends_with('/') {
        s.to_string()
    } else {
        format!("{}/", s)
    }
}

fn normalize_dir(dir: &Path) -> PathBuf {
    PathBuf::from(with_trailing_slash(&dir.to_string_lossy()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AuthConfig::default();
        assert!(!config.continuous);
        assert_eq!(config.channel, ChannelType::Rvp);
        assert!(!config.beacons);
        assert!(!config.any_user);
        assert!((config.timeout - 40.0).abs() < f64::EPSILON);
        assert_eq!(config.rvp_url, DEFAULT_RVP_URL);
    }

    #[test]
    fn test_channel_type_names() {
        assert_eq!(ChannelType::from_name("btc"), ChannelType::Btc);
        assert_eq!(ChannelType::from_name("ble"), ChannelType::Ble);
        assert_eq!(ChannelType::from_name("nonsense"), ChannelType::Rvp);
        assert_eq!(ChannelType::Ble.name(), "ble");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"continuous": 1, "channeltype": "btc", "timeout": 20, "rvpurl": "http://example.com"}"#,
        )
        .unwrap();

        let config = AuthConfig::load(dir.path());
        assert!(config.continuous);
        assert_eq!(config.channel, ChannelType::Btc);
        assert!((config.timeout - 20.0).abs() < f64::EPSILON);
        // URL 补上尾部斜杠
        assert_eq!(config.rvp_url, "http://example.com/");
    }

    #[test]
    fn test_anyuser_immune_to_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), r#"{"anyuser": 1}"#).unwrap();

        let config = AuthConfig::load(dir.path());
        assert!(!config.any_user, "anyuser must never be honored from the file");

        // 覆盖层可以设置
        let mut config = config;
        config.apply_overlay(r#"{"anyuser": 1}"#);
        assert!(config.any_user);
    }

    #[test]
    fn test_overlay_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"channeltype": "btc", "beacons": true}"#,
        )
        .unwrap();

        let mut config = AuthConfig::load(dir.path());
        config.apply_overlay(r#"{"channeltype": "rvp", "continuous": true}"#);
        assert_eq!(config.channel, ChannelType::Rvp);
        assert!(config.continuous);
        // 未覆盖的键保留文件值
        assert!(config.beacons);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AuthConfig::load(dir.path());
        assert_eq!(config.channel, ChannelType::Rvp);
    }

    #[test]
    fn test_bad_overlay_ignored() {
        let mut config = AuthConfig::default();
        config.apply_overlay("not json at all");
        assert_eq!(config, AuthConfig::default());
    }
}
