//! 进程内回环通道
//!
//! 不经任何硬件或网络，用一对 mpsc 队列把"设备端"直接接到引擎上。
//! 集成测试和本地开发用它来走完整的会话路径。

use super::{emit_stopped, ChannelEvent, EngineDriver, EventSender, StopLatch, sleep_until_opt};
use crate::engine::{self, EngineDeps, ProtocolEngine};
use log::debug;
use tokio::sync::mpsc;

/// 测试侧的"设备"端点
pub struct LoopbackPeer {
    /// 设备 → 服务
    pub tx: mpsc::UnboundedSender<Vec<u8>>,
    /// 服务 → 设备
    pub rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

pub struct LoopbackChannel {
    invite: String,
    latch: StopLatch,
}

impl LoopbackChannel {
    /// 打开通道，返回通道和对端端点
    pub fn open(
        deps: EngineDeps,
        engine: Box<dyn ProtocolEngine>,
        events: EventSender,
    ) -> (Self, LoopbackPeer) {
        let address = format!("loopback://{}", uuid::Uuid::new_v4());
        let invite = engine::invite_code(&deps.identity, &address);

        let (peer_tx, inbound) = mpsc::unbounded_channel::<Vec<u8>>();
        let (outbound, peer_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let latch = StopLatch::new();
        let driver = EngineDriver::new(engine, deps, events.clone());
        tokio::spawn(run(driver, latch.clone(), events, inbound, outbound));

        (
            Self { invite, latch },
            LoopbackPeer {
                tx: peer_tx,
                rx: peer_rx,
            },
        )
    }

    pub fn invite_code(&self) -> &str {
        &self.invite
    }

    pub fn stop(&self) {
        self.latch.request_stop();
    }
}

async fn run(
    mut driver: EngineDriver,
    latch: StopLatch,
    events: EventSender,
    mut inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
) {
    driver.start();
    if driver.take_listen() {
        // 回环对端始终在场，监听即视为连接
        driver.connected();
    }

    loop {
        while let Some(data) = driver.next_write() {
            let _ = outbound.send(data);
        }
        if driver.take_disconnect() {
            debug!("Loopback channel disconnecting");
            break;
        }

        tokio::select! {
            () = latch.cancelled() => {
                driver.stop();
                while let Some(data) = driver.next_write() {
                    let _ = outbound.send(data);
                }
                break;
            }
            frame = inbound.recv() => match frame {
                Some(frame) => driver.read(&frame),
                None => {
                    driver.disconnected();
                    break;
                }
            },
            () = sleep_until_opt(driver.timeout_at()) => driver.fire_timeout(),
        }
    }

    emit_stopped(&latch, &events);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EchoEngine, EngineDeps};
    use crate::identity::{ServiceIdentity, UserStore};
    use std::sync::Arc;

    fn test_deps() -> EngineDeps {
        let dir = tempfile::tempdir().unwrap();
        EngineDeps {
            identity: Arc::new(ServiceIdentity::load_or_generate(dir.path()).unwrap()),
            users: UserStore::default(),
            continuous: false,
        }
    }

    #[tokio::test]
    async fn test_echo_roundtrip() {
        let (events, _events_rx) = mpsc::unbounded_channel();
        let (channel, mut peer) = LoopbackChannel::open(test_deps(), Box::new(EchoEngine), events);
        assert!(channel.invite_code().len() > 16);

        peer.tx.send(b"marco".to_vec()).unwrap();
        assert_eq!(peer.rx.recv().await.unwrap(), b"marco");
        channel.stop();
    }

    #[tokio::test]
    async fn test_stop_emits_exactly_one_stopped_event() {
        let (events, mut events_rx) = mpsc::unbounded_channel();
        let (channel, _peer) = LoopbackChannel::open(test_deps(), Box::new(EchoEngine), events);

        channel.stop();
        channel.stop();
        channel.stop();

        let mut stopped = 0;
        while let Some(event) = events_rx.recv().await {
            if matches!(event, ChannelEvent::Stopped) {
                stopped += 1;
            }
        }
        assert_eq!(stopped, 1);
    }
}
