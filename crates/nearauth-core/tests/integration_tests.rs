//! 集成测试 - 完整认证会话路径
//!
//! 通过回环通道走 会话仓库 → 会话 → 协议引擎 的端到端流程，
//! 测试侧扮演设备端，按线协议逐帧交互。

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aes::cipher::{KeyIvInit, StreamCipher};
use base64::{Engine as _, engine::general_purpose};
use nearauth_core::identity::USERS_FILE;
use nearauth_core::{
    KeyedEngine, NullLocker, PairedUser, ProcessStore, SessionLocker, SessionState,
};
use serde_json::Value;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// 设备端持有的配对密钥
const DEVICE_KEY: [u8; 32] = [7u8; 32];

fn write_paired_user(dir: &Path, account: &str) {
    let user = PairedUser {
        name: "Phone".into(),
        key: general_purpose::STANDARD.encode(DEVICE_KEY),
        user: account.into(),
    };
    std::fs::write(
        dir.join(USERS_FILE),
        format!("{}\n", serde_json::to_string(&user).unwrap()),
    )
    .unwrap();
}

/// 设备端加密附加数据：IV || AES-256-CTR 密文，整体 base64
fn encrypt_extra(plaintext: &str) -> String {
    let iv = [9u8; 16];
    let mut buffer = plaintext.as_bytes().to_vec();
    let mut cipher = Aes256Ctr::new(&DEVICE_KEY.into(), &iv.into());
    cipher.apply_keystream(&mut buffer);
    let mut wire = iv.to_vec();
    wire.extend_from_slice(&buffer);
    general_purpose::STANDARD.encode(wire)
}

fn auth_message(account: &str, password: &str) -> Vec<u8> {
    serde_json::json!({
        "t": "auth",
        "user": account,
        "extra": encrypt_extra(password),
    })
    .to_string()
    .into_bytes()
}

/// 记录锁屏调用的 locker
#[derive(Default)]
struct RecordingLocker {
    locked: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl SessionLocker for RecordingLocker {
    async fn lock(&self, username: &str) {
        self.locked.lock().unwrap().push(username.to_string());
    }
}

/// 轮询等待异步副作用落地
async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

fn store_in(dir: &Path) -> ProcessStore {
    ProcessStore::new(PathBuf::from(dir)).with_locker(Arc::new(NullLocker))
}

/// 完整成功路径：启动、设备认证、结果恰好一次交付、会话回收
#[tokio::test]
async fn test_successful_auth_delivers_once() {
    let dir = tempfile::tempdir().unwrap();
    write_paired_user(dir.path(), "alice");
    let mut store = store_in(dir.path());

    let handle = store.add().await.unwrap();
    let session = store.get_mut(handle).unwrap();
    session.configure("alice", "", dir.path());
    let (invite, mut peer) = session
        .start_loopback(Box::new(KeyedEngine::new()), Arc::new(NullLocker))
        .unwrap();

    // 邀请码是 base64 的 JSON，带通道地址和签名
    let decoded = general_purpose::STANDARD.decode(invite).unwrap();
    let value: Value = serde_json::from_slice(&decoded).unwrap();
    assert_eq!(value["t"], "KP");
    assert!(value["sa"].as_str().unwrap().starts_with("loopback://"));

    let rx = store.complete_auth(handle, "peer-1").unwrap();

    // 设备端发认证帧，收到成功应答
    peer.tx.send(auth_message("alice", "hunter2")).unwrap();
    let result = peer.rx.recv().await.unwrap();
    let result: Value = serde_json::from_slice(&result).unwrap();
    assert_eq!(result["ok"], true);

    let reply = rx.await.unwrap();
    assert!(reply.success);
    assert_eq!(reply.username, "alice");
    assert_eq!(reply.password, "hunter2");

    // 终态结果可以重复读取，不会重开通道
    let again = store.complete_auth(handle, "peer-1").unwrap().await.unwrap();
    assert!(again.success);
    assert_eq!(again.username, "alice");

    // 非持续会话认证完就结束，回收后槽位空出
    wait_for(|| store.get(handle).is_some_and(|s| s.state() == SessionState::Harvestable)).await;
    store.harvest().await;
    assert_eq!(store.count(), 0);
}

/// 持续会话结束后锁定桌面
#[tokio::test]
async fn test_continuous_session_end_locks_desktop() {
    let dir = tempfile::tempdir().unwrap();
    write_paired_user(dir.path(), "alice");
    let locker = Arc::new(RecordingLocker::default());
    let mut store = ProcessStore::new(PathBuf::from(dir.path())).with_locker(locker.clone());

    let handle = store.add().await.unwrap();
    let session = store.get_mut(handle).unwrap();
    session.configure("alice", r#"{"continuous": 1}"#, dir.path());
    let (_invite, peer) = session
        .start_loopback(Box::new(KeyedEngine::new()), locker.clone())
        .unwrap();

    let rx = store.complete_auth(handle, "peer-1").unwrap();
    peer.tx.send(auth_message("alice", "pw")).unwrap();
    let reply = rx.await.unwrap();
    assert!(reply.success);

    // 结果已交付，连接还在；设备端主动结束会话
    assert_eq!(store.get(handle).unwrap().state(), SessionState::Continuing);
    peer.tx.send(br#"{"t": "end"}"#.to_vec()).unwrap();

    wait_for(|| locker.locked.lock().unwrap().as_slice() == ["alice".to_string()]).await;
    wait_for(|| store.get(handle).is_some_and(|s| s.state() == SessionState::Harvestable)).await;
}

/// 回收后的槽位被最低空闲位优先复用
#[tokio::test]
async fn test_slot_reuse_after_harvest() {
    let dir = tempfile::tempdir().unwrap();
    write_paired_user(dir.path(), "alice");
    let mut store = store_in(dir.path());

    let first = store.add().await.unwrap();
    let second = store.add().await.unwrap();
    assert_eq!((first, second), (0, 1));

    {
        let session = store.get_mut(first).unwrap();
        session.configure("alice", "", dir.path());
        let _ = session
            .start_loopback(Box::new(KeyedEngine::new()), Arc::new(NullLocker))
            .unwrap();
        session.stop();
    }
    wait_for(|| store.get(first).is_some_and(|s| s.state() == SessionState::Harvestable)).await;

    // add 会先回收，然后拿到最低的空槽
    let reused = store.add().await.unwrap();
    assert_eq!(reused, 0);
    assert_eq!(store.count(), 2);
}

/// 调用方断开后，名下等待中的会话被停止并按失败投递
#[tokio::test]
async fn test_owner_lost_fails_waiting_session() {
    let dir = tempfile::tempdir().unwrap();
    write_paired_user(dir.path(), "alice");
    let mut store = store_in(dir.path());

    let handle = store.add().await.unwrap();
    let session = store.get_mut(handle).unwrap();
    session.configure("alice", "", dir.path());
    let (_invite, _peer) = session
        .start_loopback(Box::new(KeyedEngine::new()), Arc::new(NullLocker))
        .unwrap();

    let rx = store.complete_auth(handle, "peer-9").unwrap();
    store.owner_lost("peer-9");

    let reply = rx.await.unwrap();
    assert!(!reply.success);
    assert!(store.get(handle).unwrap().delivered());
}

/// 未知账户的认证请求被拒绝
#[tokio::test]
async fn test_unpaired_account_fails_auth() {
    let dir = tempfile::tempdir().unwrap();
    write_paired_user(dir.path(), "alice");
    let mut store = store_in(dir.path());

    let handle = store.add().await.unwrap();
    let session = store.get_mut(handle).unwrap();
    // anyuser 跳过启动前过滤，认证仍按配对密钥判定
    session.configure("mallory", r#"{"anyuser": 1}"#, dir.path());
    let (_invite, mut peer) = session
        .start_loopback(Box::new(KeyedEngine::new()), Arc::new(NullLocker))
        .unwrap();

    let rx = store.complete_auth(handle, "peer-1").unwrap();
    peer.tx.send(auth_message("mallory", "pw")).unwrap();

    let result = peer.rx.recv().await.unwrap();
    let result: Value = serde_json::from_slice(&result).unwrap();
    assert_eq!(result["ok"], false);

    let reply = rx.await.unwrap();
    assert!(!reply.success);
}

/// anyuser 只放开账户过滤：配对用户清单为空时启动同样被拒绝
#[tokio::test]
async fn test_anyuser_with_no_paired_users_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = store_in(dir.path());

    let outcome = store.start_auth("", r#"{"anyuser": 1}"#).await.unwrap();
    assert!(!outcome.success);
    assert!(outcome.code.is_empty());

    // 句柄存在，CompleteAuth 立即按失败应答
    let reply = store
        .complete_auth(outcome.handle, "peer-1")
        .unwrap()
        .await
        .unwrap();
    assert!(!reply.success);
}

/// 成功后协议出错，结果还没被拉取也必须锁定桌面
#[tokio::test]
async fn test_error_after_success_locks_desktop() {
    let dir = tempfile::tempdir().unwrap();
    write_paired_user(dir.path(), "alice");
    let locker = Arc::new(RecordingLocker::default());
    let mut store = ProcessStore::new(PathBuf::from(dir.path())).with_locker(locker.clone());

    let handle = store.add().await.unwrap();
    let session = store.get_mut(handle).unwrap();
    session.configure("alice", r#"{"continuous": 1}"#, dir.path());
    let (_invite, mut peer) = session
        .start_loopback(Box::new(KeyedEngine::new()), locker.clone())
        .unwrap();

    peer.tx.send(auth_message("alice", "pw")).unwrap();
    let result = peer.rx.recv().await.unwrap();
    let result: Value = serde_json::from_slice(&result).unwrap();
    assert_eq!(result["ok"], true);

    // 坏帧触发协议错误
    peer.tx.send(b"not json".to_vec()).unwrap();
    wait_for(|| locker.locked.lock().unwrap().as_slice() == ["alice".to_string()]).await;
    wait_for(|| store.get(handle).is_some_and(|s| s.state() == SessionState::Harvestable)).await;

    // 之后拉取结果只能得到失败
    let reply = store.complete_auth(handle, "peer-1").unwrap().await.unwrap();
    assert!(!reply.success);
}

/// 新会话只顶掉同一承诺同一账户、且已进入持续认证态的旧会话
#[tokio::test]
async fn test_supersede_stops_only_continuing_sessions() {
    let dir = tempfile::tempdir().unwrap();
    write_paired_user(dir.path(), "alice");
    let mut store = store_in(dir.path());

    let h0 = store.add().await.unwrap();
    let session = store.get_mut(h0).unwrap();
    session.configure("alice", r#"{"continuous": 1}"#, dir.path());
    let (_i0, p0) = session
        .start_loopback(Box::new(KeyedEngine::new()), Arc::new(NullLocker))
        .unwrap();
    p0.tx.send(auth_message("alice", "pw")).unwrap();
    wait_for(|| store.get(h0).is_some_and(|s| s.state() == SessionState::Completed)).await;

    // 同一服务目录 ⇒ 同一承诺；新会话不必是持续会话
    let h1 = store.add().await.unwrap();
    let session = store.get_mut(h1).unwrap();
    session.configure("alice", "", dir.path());
    let (_i1, _p1) = session
        .start_loopback(Box::new(KeyedEngine::new()), Arc::new(NullLocker))
        .unwrap();

    // h0 还在 Completed（结果没被拉走），不会被顶掉
    store.supersede(h1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.get(h0).unwrap().state(), SessionState::Completed);

    // 拉取结果后 h0 进入持续认证态，这时才被顶掉
    let reply = store.complete_auth(h0, "peer-1").unwrap().await.unwrap();
    assert!(reply.success);
    assert_eq!(store.get(h0).unwrap().state(), SessionState::Continuing);
    store.supersede(h1);
    wait_for(|| store.get(h0).is_some_and(|s| s.state() == SessionState::Harvestable)).await;
    assert_eq!(store.get(h1).unwrap().state(), SessionState::Started);
}
