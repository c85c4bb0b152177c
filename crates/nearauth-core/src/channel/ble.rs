//! 低功耗蓝牙 GATT 通道
//!
//! 注册一个 GATT 服务：入站特征（设备写入）和出站特征（订阅通知）。
//! 服务 UUID 从身份承诺派生，设备不需要事先知道邀请码就能找到服务。
//! 特征值容量有限，消息按 [`codec`](super::codec) 分块传输。
//!
//! 广播期间若一直无人订阅，每 10 秒拆掉并重建 GATT 应用和广播，
//! 避免 BlueZ 端的陈旧状态挂住会话。

use super::codec::{encode_chunks, service_uuid, ChunkAssembler};
use super::{emit_stopped, ChannelError, EngineDriver, EventSender, StopLatch, sleep_until_opt};
use crate::config::AuthConfig;
use crate::engine::{self, EngineDeps, ProtocolEngine};
use bluer::adv::{Advertisement, AdvertisementHandle};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicWrite, CharacteristicWriteMethod, Service,
};
use bluer::gatt::local::CharacteristicNotifier;
use bluer::Adapter;
use futures_util::FutureExt;
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

/// 入站特征（设备 → 服务）
const CHARACTERISTIC_UUID_INCOMING: Uuid =
    Uuid::from_u128(0x56add98a_0e8a_4113_85bf_6dc97b58a9c1);
/// 出站特征（服务 → 设备，通知）
const CHARACTERISTIC_UUID_OUTGOING: Uuid =
    Uuid::from_u128(0x56add98a_0e8a_4113_85bf_6dc97b58a9c2);

/// 广播空转时的 GATT 重建间隔
const CYCLE_INTERVAL: Duration = Duration::from_secs(10);

/// GATT 回调发给通道任务的消息
enum GattMsg {
    /// 入站特征收到一个块
    Chunk(Vec<u8>),
    /// 设备订阅了出站特征
    Subscribed(CharacteristicNotifier),
}

pub struct BleChannel {
    invite: String,
    latch: StopLatch,
}

impl BleChannel {
    /// 注册 GATT 服务并启动通道任务
    pub async fn open(
        config: &AuthConfig,
        deps: EngineDeps,
        engine: Box<dyn ProtocolEngine>,
        events: EventSender,
    ) -> Result<Self, ChannelError> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;

        let commitment = deps.identity.commitment();
        let advertised = service_uuid(&commitment, config.continuous);
        // 邀请地址始终携带非持续 UUID，设备端自行决定订阅哪个
        let url = format!("btgatt://{}", service_uuid(&commitment, false));
        info!("GATT service {} ({})", advertised, url);

        let invite = engine::invite_code(&deps.identity, &url);
        let latch = StopLatch::new();
        let driver = EngineDriver::new(engine, deps, events.clone());
        tokio::spawn(run(driver, latch.clone(), events, session, adapter, advertised));

        Ok(Self { invite, latch })
    }

    pub fn invite_code(&self) -> &str {
        &self.invite
    }

    pub fn stop(&self) {
        self.latch.request_stop();
    }
}

/// GATT 应用 + 广播句柄，drop 即注销
struct GattHandles {
    _adv_handle: AdvertisementHandle,
    _app_handle: ApplicationHandle,
}

/// 注册 GATT 应用和广播
async fn serve(
    adapter: &Adapter,
    uuid: Uuid,
    msg_tx: &mpsc::UnboundedSender<GattMsg>,
) -> Result<GattHandles, ChannelError> {
    let write_tx = msg_tx.clone();
    let incoming_char = Characteristic {
        uuid: CHARACTERISTIC_UUID_INCOMING,
        write: Some(CharacteristicWrite {
            write: true,
            write_without_response: true,
            method: CharacteristicWriteMethod::Fun(Box::new(move |data, _req| {
                let write_tx = write_tx.clone();
                async move {
                    debug!("Incoming characteristic write: {} byte(s)", data.len());
                    let _ = write_tx.send(GattMsg::Chunk(data));
                    Ok(())
                }
                .boxed()
            })),
            ..Default::default()
        }),
        ..Default::default()
    };

    let notify_tx = msg_tx.clone();
    let outgoing_char = Characteristic {
        uuid: CHARACTERISTIC_UUID_OUTGOING,
        notify: Some(CharacteristicNotify {
            notify: true,
            method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                let notify_tx = notify_tx.clone();
                async move {
                    debug!("Outgoing characteristic subscribed");
                    let _ = notify_tx.send(GattMsg::Subscribed(notifier));
                }
                .boxed()
            })),
            ..Default::default()
        }),
        ..Default::default()
    };

    let app = Application {
        services: vec![Service {
            uuid,
            primary: true,
            characteristics: vec![incoming_char, outgoing_char],
            ..Default::default()
        }],
        ..Default::default()
    };
    let app_handle = adapter.serve_gatt_application(app).await?;

    let mut service_uuids = BTreeSet::new();
    service_uuids.insert(uuid);
    let adv = Advertisement {
        advertisement_type: bluer::adv::Type::Peripheral,
        service_uuids,
        discoverable: Some(true),
        ..Default::default()
    };
    let adv_handle = adapter.advertise(adv).await?;
    debug!("GATT application and advertisement registered");

    Ok(GattHandles {
        _adv_handle: adv_handle,
        _app_handle: app_handle,
    })
}

async fn run(
    mut driver: EngineDriver,
    latch: StopLatch,
    events: EventSender,
    _session: bluer::Session,
    adapter: Adapter,
    uuid: Uuid,
) {
    driver.start();
    let _ = driver.take_listen();

    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
    let mut handles = match serve(&adapter, uuid, &msg_tx).await {
        Ok(handles) => Some(handles),
        Err(e) => {
            warn!("Failed to register GATT application: {}", e);
            emit_stopped(&latch, &events);
            return;
        }
    };

    let mut assembler = ChunkAssembler::new();
    let mut notifier: Option<CharacteristicNotifier> = None;
    let mut connected = false;
    let mut cycle_at = Instant::now() + CYCLE_INTERVAL;

    loop {
        // 出站：分块后通过通知发送
        while let Some(data) = driver.next_write() {
            let Some(n) = notifier.as_mut() else {
                warn!("Dropping outgoing message, no subscriber");
                continue;
            };
            for chunk in encode_chunks(&data) {
                if let Err(e) = n.notify(chunk).await {
                    warn!("Notify failed: {}", e);
                    break;
                }
            }
        }
        if driver.take_disconnect() {
            debug!("Engine requested disconnect, recycling GATT service");
            notifier = None;
            if connected {
                connected = false;
                driver.disconnected();
            }
            drop(handles.take());
            match serve(&adapter, uuid, &msg_tx).await {
                Ok(new_handles) => handles = Some(new_handles),
                Err(e) => {
                    warn!("Failed to re-register GATT application: {}", e);
                    break;
                }
            }
            cycle_at = Instant::now() + CYCLE_INTERVAL;
        }
        if latch.is_stopping() {
            driver.stop();
            break;
        }

        tokio::select! {
            () = latch.cancelled() => continue,
            () = sleep_until_opt(driver.timeout_at()) => driver.fire_timeout(),
            msg = msg_rx.recv() => match msg {
                Some(GattMsg::Chunk(chunk)) => {
                    if !connected {
                        connected = true;
                        driver.connected();
                    }
                    if let Some(message) = assembler.push(&chunk) {
                        driver.read(&message);
                    }
                }
                Some(GattMsg::Subscribed(n)) => notifier = Some(n),
                // 自己持有发送端，不会走到这里
                None => break,
            },
            () = tokio::time::sleep_until(cycle_at), if !connected => {
                debug!("Idle advertising cycle, re-registering GATT service");
                drop(handles.take());
                notifier = None;
                match serve(&adapter, uuid, &msg_tx).await {
                    Ok(new_handles) => handles = Some(new_handles),
                    Err(e) => {
                        warn!("Failed to re-register GATT application: {}", e);
                        break;
                    }
                }
                cycle_at = Instant::now() + CYCLE_INTERVAL;
            }
        }
    }

    drop(handles);
    emit_stopped(&latch, &events);
}
