//! 邀请广播
//!
//! 把邀请码周期性推送给 `bluetooth.txt` 里列出的已知设备，设备收到后
//! 可以直接连上邀请通道。每个设备一个发送循环，间隔 2 秒。
//!
//! 停止是延迟的：`stop` 等所有在途发送自然结束后才返回，不中断
//! 正在进行的 RFCOMM 写入。

use async_trait::async_trait;
use log::{debug, info, warn};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 设备列表文件名
pub const DEVICES_FILE: &str = "bluetooth.txt";
/// 两次发送之间的间隔
pub const BEACON_GAP: Duration = Duration::from_millis(2000);
/// 单次发送的上限时长
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// 接收方应用监听的 RFCOMM 服务 UUID
pub const BEACON_SERVICE_UUID: Uuid = Uuid::from_u128(0xED99_5E5A_C7E7_4442_A6EE_7BB7_6DF4_3B0D);

/// 广播器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconState {
    Starting,
    Ready,
    Sending,
    Stopping,
    Stopped,
}

/// 实际投递一条广播（测试注入桩实现，生产用蓝牙实现）
#[async_trait]
pub trait BeaconWriter: Send + Sync {
    async fn send(&self, device: &str, payload: &str) -> anyhow::Result<()>;
}

/// 读取广播设备列表：每行一个 MAC 地址，`#` 开头为注释
pub fn load_devices(dir: &Path) -> Vec<String> {
    let path = dir.join(DEVICES_FILE);
    match std::fs::read_to_string(&path) {
        Ok(content) => {
            let devices: Vec<String> = content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string)
                .collect();
            debug!("Loaded {} beacon device(s) from {:?}", devices.len(), path);
            devices
        }
        Err(e) => {
            debug!("No beacon device list at {:?}: {}", path, e);
            Vec::new()
        }
    }
}

/// 一个会话的广播调度器
pub struct BeaconDispatch {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    state: Arc<Mutex<BeaconState>>,
}

impl BeaconDispatch {
    /// 为设备列表里的每个设备启动一个发送循环
    pub fn start(devices: Vec<String>, invite: String, writer: Arc<dyn BeaconWriter>) -> Self {
        let cancel = CancellationToken::new();
        let state = Arc::new(Mutex::new(BeaconState::Starting));
        let mut tasks = JoinSet::new();

        for device in devices {
            tasks.spawn(send_loop(
                writer.clone(),
                device,
                invite.clone(),
                cancel.clone(),
                state.clone(),
            ));
        }

        set_state(&state, BeaconState::Ready);
        Self {
            cancel,
            tasks,
            state,
        }
    }

    pub fn state(&self) -> BeaconState {
        *self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// 请求停止并等待所有在途发送结束
    pub async fn stop(mut self) {
        set_state(&self.state, BeaconState::Stopping);
        self.cancel.cancel();
        while self.tasks.join_next().await.is_some() {}
        set_state(&self.state, BeaconState::Stopped);
        debug!("Beacon dispatch fully stopped");
    }
}

fn set_state(state: &Arc<Mutex<BeaconState>>, new: BeaconState) {
    let mut guard = state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    // Stopping / Stopped 之后不再回退
    if matches!(*guard, BeaconState::Stopping | BeaconState::Stopped)
        && matches!(new, BeaconState::Ready | BeaconState::Sending)
    {
        return;
    }
    *guard = new;
}

async fn send_loop(
    writer: Arc<dyn BeaconWriter>,
    device: String,
    invite: String,
    cancel: CancellationToken,
    state: Arc<Mutex<BeaconState>>,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        set_state(&state, BeaconState::Sending);
        // 在途发送不被打断，停止要等它结束
        match tokio::time::timeout(SEND_TIMEOUT, writer.send(&device, &invite)).await {
            Ok(Ok(())) => info!("Beacon delivered to {}", device),
            Ok(Err(e)) => debug!("Beacon to {} failed: {}", device, e),
            Err(_) => debug!("Beacon to {} timed out", device),
        }
        set_state(&state, BeaconState::Ready);

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(BEACON_GAP) => {}
        }
    }
}

/// 通过 RFCOMM 服务发现投递广播
#[cfg(feature = "bluetooth")]
pub struct BluetoothBeaconWriter;

#[cfg(feature = "bluetooth")]
#[async_trait]
impl BeaconWriter for BluetoothBeaconWriter {
    async fn send(&self, device: &str, payload: &str) -> anyhow::Result<()> {
        use bluer::rfcomm::{Profile, Role};
        use futures_util::StreamExt;
        use tokio::io::AsyncWriteExt;

        let address: bluer::Address = device
            .parse()
            .map_err(|e| anyhow::anyhow!("Bad device address '{}': {}", device, e))?;

        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;

        let profile = Profile {
            uuid: BEACON_SERVICE_UUID,
            role: Some(Role::Client),
            auto_connect: Some(true),
            ..Default::default()
        };
        let mut profile_handle = session.register_profile(profile).await?;

        let target = adapter.device(address)?;
        let connect = tokio::spawn(async move {
            if let Err(e) = target.connect_profile(&BEACON_SERVICE_UUID).await {
                warn!("connect_profile failed: {}", e);
            }
        });

        let request = profile_handle
            .next()
            .await
            .ok_or_else(|| anyhow::anyhow!("Profile handle closed"))?;
        let mut stream = request.accept()?;
        stream.write_all(payload.as_bytes()).await?;
        stream.flush().await?;

        connect.await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// 记录调用并可人为放慢的桩 writer
    struct RecordingWriter {
        sends_started: AtomicUsize,
        sends_finished: AtomicUsize,
        first_send: Notify,
        delay: Duration,
    }

    impl RecordingWriter {
        fn new(delay: Duration) -> Self {
            Self {
                sends_started: AtomicUsize::new(0),
                sends_finished: AtomicUsize::new(0),
                first_send: Notify::new(),
                delay,
            }
        }
    }

    #[async_trait]
    impl BeaconWriter for RecordingWriter {
        async fn send(&self, _device: &str, _payload: &str) -> anyhow::Result<()> {
            self.sends_started.fetch_add(1, Ordering::SeqCst);
            self.first_send.notify_waiters();
            tokio::time::sleep(self.delay).await;
            self.sends_finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_load_devices_skips_comments() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(DEVICES_FILE),
            "# paired phones\nAA:BB:CC:DD:EE:FF\n\n11:22:33:44:55:66\n",
        )
        .unwrap();
        let devices = load_devices(dir.path());
        assert_eq!(devices, vec!["AA:BB:CC:DD:EE:FF", "11:22:33:44:55:66"]);
    }

    #[test]
    fn test_load_devices_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_devices(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_fan_out_to_all_devices() {
        let writer = Arc::new(RecordingWriter::new(Duration::from_millis(1)));
        let dispatch = BeaconDispatch::start(
            vec!["dev-a".into(), "dev-b".into(), "dev-c".into()],
            "invite".into(),
            writer.clone(),
        );

        // 等所有设备至少各发过一轮
        tokio::time::timeout(Duration::from_secs(5), async {
            while writer.sends_finished.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        dispatch.stop().await;
    }

    #[tokio::test]
    async fn test_stop_waits_for_inflight_send() {
        let writer = Arc::new(RecordingWriter::new(Duration::from_millis(100)));
        let dispatch = BeaconDispatch::start(vec!["dev".into()], "invite".into(), writer.clone());

        // 等第一次发送开始
        let notified = writer.first_send.notified();
        if writer.sends_started.load(Ordering::SeqCst) == 0 {
            tokio::time::timeout(Duration::from_secs(5), notified)
                .await
                .unwrap();
        }

        dispatch.stop().await;
        // stop 返回时在途发送必须已经结束
        assert_eq!(
            writer.sends_started.load(Ordering::SeqCst),
            writer.sends_finished.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_state_reaches_stopped() {
        let writer = Arc::new(RecordingWriter::new(Duration::from_millis(1)));
        let dispatch = BeaconDispatch::start(vec!["dev".into()], "invite".into(), writer);
        assert_ne!(dispatch.state(), BeaconState::Stopped);
        let state = dispatch.state.clone();
        dispatch.stop().await;
        assert_eq!(*state.lock().unwrap(), BeaconState::Stopped);
    }
}
