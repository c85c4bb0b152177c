//! HTTP 会合点通道
//!
//! 在会合点服务器上开一个随机命名的通道，GET 长轮询读、POST 写，
//! 任意时刻只有一个请求在途。会合点超时会返回一个 JSON 标记体，
//! 收到后立即重新轮询。瞬时错误 1 秒后重试。
//!
//! 每个请求都有挂钟看门狗：每秒采样一次真实时间，超过上限就放弃
//! 请求重新轮询。单调钟在系统挂起时停走，长轮询靠它无法察觉挂起，
//! 所以必须用挂钟。

use super::{
    decode_frame, emit_stopped, encode_frame, ChannelError, EventSender, EngineDriver, StopLatch,
    sleep_until_opt,
};
use crate::config::AuthConfig;
use crate::engine::{self, EngineDeps, ProtocolEngine};
use log::{debug, info, warn};
use rand::RngCore;
use std::time::{Duration, SystemTime};

/// 通道名随机字节数（十六进制后是名字的两倍长）
const CHANNEL_NAME_BYTES: usize = 16;
/// 挂钟看门狗上限
const DEFAULT_WALLCLOCK_TIMEOUT: Duration = Duration::from_secs(45);
/// 瞬时错误重试间隔
const RETRY_DELAY: Duration = Duration::from_secs(1);
/// HTTP 客户端请求超时
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

pub struct RvpChannel {
    invite: String,
    latch: StopLatch,
}

impl RvpChannel {
    /// 在会合点开通道并启动轮询任务
    pub async fn open(
        config: &AuthConfig,
        deps: EngineDeps,
        engine: Box<dyn ProtocolEngine>,
        events: EventSender,
    ) -> Result<Self, ChannelError> {
        let url = channel_url(&config.rvp_url);
        info!("Rendezvous channel at {}", url);

        let client = reqwest::Client::builder()
            .user_agent("nearauth")
            .timeout(HTTP_TIMEOUT)
            .build()?;

        let invite = engine::invite_code(&deps.identity, &url);
        let latch = StopLatch::new();
        let driver = EngineDriver::new(engine, deps, events.clone());
        tokio::spawn(run(driver, latch.clone(), events, client, url));

        Ok(Self { invite, latch })
    }

    pub fn invite_code(&self) -> &str {
        &self.invite
    }

    pub fn stop(&self) {
        self.latch.request_stop();
    }
}

/// 生成随机通道 URL
fn channel_url(rvp_url: &str) -> String {
    let mut random = [0u8; CHANNEL_NAME_BYTES];
    rand::thread_rng().fill_bytes(&mut random);
    let name: String = random.iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}channel/{}", rvp_url, name)
}

enum Op {
    Get,
    Post(Vec<u8>),
}

async fn run(
    mut driver: EngineDriver,
    latch: StopLatch,
    events: EventSender,
    client: reqwest::Client,
    url: String,
) {
    driver.start();
    let mut listening = driver.take_listen();
    let mut connected = false;

    'outer: loop {
        if driver.take_disconnect() {
            listening = false;
            if connected {
                connected = false;
                driver.disconnected();
            }
        }
        if latch.is_stopping() {
            driver.stop();
            break;
        }

        // 一次只有一个请求在途：先清写队列，再长轮询
        let op = if let Some(data) = driver.next_write() {
            Op::Post(data)
        } else if listening {
            Op::Get
        } else {
            // 没有待办 I/O，等待停止或引擎定时器
            tokio::select! {
                () = latch.cancelled() => continue 'outer,
                () = sleep_until_opt(driver.timeout_at()) => driver.fire_timeout(),
            }
            continue 'outer;
        };

        let result = tokio::select! {
            () = latch.cancelled() => continue 'outer,
            () = sleep_until_opt(driver.timeout_at()) => {
                driver.fire_timeout();
                continue 'outer;
            }
            () = wallclock_expired(DEFAULT_WALLCLOCK_TIMEOUT) => {
                info!("Wall clock timeout, abandoning request");
                continue 'outer;
            }
            result = execute(&client, &url, &op) => result,
        };

        match result {
            Ok(OpOutcome::Data(data)) => {
                if !connected {
                    connected = true;
                    driver.connected();
                }
                driver.read(&data);
            }
            Ok(OpOutcome::RendezvousTimeout) => {
                debug!("Rendezvous timeout marker, polling again");
            }
            Ok(OpOutcome::Written) => {}
            Err(e) => {
                warn!("Rendezvous request failed ({}), retrying", e);
                tokio::select! {
                    () = latch.cancelled() => continue 'outer,
                    () = tokio::time::sleep(RETRY_DELAY) => {}
                }
            }
        }
    }

    emit_stopped(&latch, &events);
}

enum OpOutcome {
    /// 读到一帧数据
    Data(Vec<u8>),
    /// 会合点自身超时，需要重新轮询
    RendezvousTimeout,
    /// 写入完成
    Written,
}

async fn execute(client: &reqwest::Client, url: &str, op: &Op) -> Result<OpOutcome, ChannelError> {
    match op {
        Op::Get => {
            let response = client.get(url).send().await?.error_for_status()?;
            let body = response.bytes().await?;
            // 会合点超时返回 JSON 对象而不是帧
            if body.first() == Some(&b'{') {
                return Ok(OpOutcome::RendezvousTimeout);
            }
            match decode_frame(&body) {
                Some(data) => Ok(OpOutcome::Data(data.to_vec())),
                None => {
                    debug!("Short rendezvous body ({} bytes), polling again", body.len());
                    Ok(OpOutcome::RendezvousTimeout)
                }
            }
        }
        Op::Post(data) => {
            client
                .post(url)
                .body(encode_frame(data))
                .send()
                .await?
                .error_for_status()?;
            Ok(OpOutcome::Written)
        }
    }
}

/// 挂钟看门狗：每秒采样真实时间，超过上限后返回
async fn wallclock_expired(limit: Duration) {
    let start = SystemTime::now();
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if let Ok(elapsed) = start.elapsed() {
            if elapsed >= limit {
                return;
            }
        }
    }
}
