//! 经典蓝牙 RFCOMM 通道
//!
//! 在 1..=31 里找第一个空闲的 RFCOMM 信道监听，邀请地址格式
//! `btspp://适配器MAC十六进制:信道十六进制`。帧格式与会合点一致：
//! 4 字节大端长度前缀。

use super::{
    emit_stopped, encode_frame, ChannelError, EngineDriver, EventSender, StopLatch,
    sleep_until_opt,
};
use crate::config::AuthConfig;
use crate::engine::{self, EngineDeps, ProtocolEngine};
use bluer::rfcomm::{Listener, SocketAddr, Stream};
use bluer::Address;
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// RFCOMM 信道号范围
const CHANNEL_MIN: u8 = 1;
const CHANNEL_MAX: u8 = 31;

/// 单帧最大长度（防御畸形长度前缀）
const MAX_FRAME_LEN: usize = 1 << 20;

/// 本机是否有可用的蓝牙适配器
pub async fn adapter_available() -> bool {
    match bluer::Session::new().await {
        Ok(session) => session.default_adapter().await.is_ok(),
        Err(_) => false,
    }
}

pub struct BtcChannel {
    invite: String,
    latch: StopLatch,
}

impl BtcChannel {
    /// 绑定监听信道并启动接受任务
    pub async fn open(
        _config: &AuthConfig,
        deps: EngineDeps,
        engine: Box<dyn ProtocolEngine>,
        events: EventSender,
    ) -> Result<Self, ChannelError> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        let address = adapter.address().await?;

        let (listener, channel) = bind_first_free(address).await?;
        let url = invite_url(address, channel);
        info!("RFCOMM listening on channel {} ({})", channel, url);

        let invite = engine::invite_code(&deps.identity, &url);
        let latch = StopLatch::new();
        let driver = EngineDriver::new(engine, deps, events.clone());
        tokio::spawn(run(driver, latch.clone(), events, listener));

        Ok(Self { invite, latch })
    }

    pub fn invite_code(&self) -> &str {
        &self.invite
    }

    pub fn stop(&self) {
        self.latch.request_stop();
    }
}

/// 从 1 开始找第一个能绑定的信道
async fn bind_first_free(address: Address) -> Result<(Listener, u8), ChannelError> {
    for channel in CHANNEL_MIN..=CHANNEL_MAX {
        match Listener::bind(SocketAddr::new(address, channel)).await {
            Ok(listener) => return Ok((listener, channel)),
            Err(e) => debug!("RFCOMM channel {} unavailable: {}", channel, e),
        }
    }
    Err(ChannelError::Unavailable(
        "no free RFCOMM channel".to_string(),
    ))
}

/// `btspp://AABBCCDDEEFF:CC` 形式的邀请地址
fn invite_url(address: Address, channel: u8) -> String {
    let hex: String = address.0.iter().map(|b| format!("{:02X}", b)).collect();
    format!("btspp://{}:{:02X}", hex, channel)
}

async fn run(
    mut driver: EngineDriver,
    latch: StopLatch,
    events: EventSender,
    listener: Listener,
) {
    driver.start();
    let _ = driver.take_listen();

    'outer: loop {
        if latch.is_stopping() {
            driver.stop();
            break;
        }

        let mut stream = tokio::select! {
            () = latch.cancelled() => continue 'outer,
            () = sleep_until_opt(driver.timeout_at()) => {
                driver.fire_timeout();
                continue 'outer;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!("RFCOMM connection from {}", peer.addr);
                    stream
                }
                Err(e) => {
                    warn!("RFCOMM accept failed: {}", e);
                    continue 'outer;
                }
            },
        };

        driver.connected();

        loop {
            while let Some(data) = driver.next_write() {
                if let Err(e) = stream.write_all(&encode_frame(&data)).await {
                    warn!("RFCOMM write failed: {}", e);
                    driver.disconnected();
                    continue 'outer;
                }
            }
            if driver.take_disconnect() {
                debug!("Engine requested disconnect");
                driver.disconnected();
                continue 'outer;
            }
            if latch.is_stopping() {
                driver.stop();
                break 'outer;
            }

            tokio::select! {
                () = latch.cancelled() => continue,
                () = sleep_until_opt(driver.timeout_at()) => driver.fire_timeout(),
                frame = read_frame(&mut stream) => match frame {
                    Ok(data) => driver.read(&data),
                    Err(e) => {
                        debug!("RFCOMM connection closed: {}", e);
                        driver.disconnected();
                        continue 'outer;
                    }
                },
            }
        }
    }

    emit_stopped(&latch, &events);
}

/// 读一帧：4 字节大端长度 + 数据
async fn read_frame(stream: &mut Stream) -> std::io::Result<Vec<u8>> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame length {} too large", len),
        ));
    }
    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await?;
    Ok(data)
}
