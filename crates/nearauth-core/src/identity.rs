//! 服务身份和配对用户
//!
//! 服务的长期 P-256 密钥对（DER 文件，首次使用时生成）、
//! 身份承诺（公钥的 SHA-256）、配对用户文件和附加数据解密。
//!
//! 配置目录中的文件：
//! - `pico_pub_key.der` / `pico_priv_key.der` — 服务密钥对（SPKI / PKCS#8）
//! - `users.txt` — 配对用户，每行一个 JSON 对象

use aes::cipher::{KeyIvInit, StreamCipher};
use base64::{Engine as _, engine::general_purpose};
use log::{debug, info, warn};
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey};
use p256::SecretKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// 公钥文件名
pub const PUB_FILE: &str = "pico_pub_key.der";
/// 私钥文件名
pub const PRIV_FILE: &str = "pico_priv_key.der";
/// 配对用户文件名
pub const USERS_FILE: &str = "users.txt";

/// AES-256-CTR IV 长度（密文前缀）
const IV_LENGTH: usize = 16;

/// 服务的长期身份密钥对
pub struct ServiceIdentity {
    secret: SecretKey,
    public_der: Vec<u8>,
}

impl ServiceIdentity {
    /// 从配置目录加载密钥对，不存在时生成并持久化
    pub fn load_or_generate(dir: &Path) -> anyhow::Result<Self> {
        let priv_path = dir.join(PRIV_FILE);
        let pub_path = dir.join(PUB_FILE);

        let secret = if priv_path.exists() {
            let der = fs::read(&priv_path)?;
            debug!("Loaded service key pair from {:?}", priv_path);
            SecretKey::from_pkcs8_der(&der)
                .map_err(|e| anyhow::anyhow!("Invalid private key file: {}", e))?
        } else {
            info!("No service key pair found, generating a new one");
            let secret = SecretKey::random(&mut OsRng);
            fs::create_dir_all(dir)?;
            fs::write(&priv_path, secret.to_pkcs8_der()?.as_bytes())?;
            fs::write(&pub_path, secret.public_key().to_public_key_der()?.as_bytes())?;
            secret
        };

        let public_der = secret.public_key().to_public_key_der()?.as_bytes().to_vec();
        Ok(Self { secret, public_der })
    }

    /// DER (SPKI) 编码的公钥
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_der
    }

    /// 身份承诺：DER 公钥的 SHA-256（32 字节）
    ///
    /// 证明方设备用它来识别要认证的服务。
    pub fn commitment(&self) -> [u8; 32] {
        let digest = Sha256::digest(&self.public_der);
        digest.into()
    }

    /// 对数据做 ECDSA P-256 签名，返回 DER 编码
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        let signing_key = SigningKey::from(&self.secret);
        let signature: Signature = signing_key.sign(data);
        signature.to_der().as_bytes().to_vec()
    }
}

/// 一个配对用户条目
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PairedUser {
    /// 设备显示名
    pub name: String,
    /// Base64 编码的对称密钥（用于附加数据解密）
    pub key: String,
    /// 本机账户名
    pub user: String,
}

/// 配对用户集合（`users.txt`，每行一个 JSON 对象）
#[derive(Debug, Clone, Default)]
pub struct UserStore {
    users: Vec<PairedUser>,
}

impl UserStore {
    /// 从配置目录加载，文件不存在时返回空集合
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(USERS_FILE);
        let mut users = Vec::new();
        match fs::read_to_string(&path) {
            Ok(content) => {
                for (lineno, line) in content.lines().enumerate() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<PairedUser>(line) {
                        Ok(user) => users.push(user),
                        Err(e) => {
                            warn!("Skipping malformed user entry at line {}: {}", lineno + 1, e);
                        }
                    }
                }
                debug!("Loaded {} paired user(s) from {:?}", users.len(), path);
            }
            Err(e) => {
                debug!("No paired user file at {:?}: {}", path, e);
            }
        }
        Self { users }
    }

    /// 只保留与指定账户匹配的条目
    ///
    /// 过滤结果为空意味着该账户没有配对设备，认证必须直接拒绝。
    pub fn filter_by_account(&self, account: &str) -> Self {
        Self {
            users: self
                .users
                .iter()
                .filter(|u| u.user == account)
                .cloned()
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PairedUser> {
        self.users.iter()
    }

    #[cfg(test)]
    pub fn from_users(users: Vec<PairedUser>) -> Self {
        Self { users }
    }
}

/// 解密设备返回的附加数据（通常是密码）
///
/// 线格式：base64( IV(16 字节) || AES-256-CTR 密文 )。
pub fn decrypt_extra(key_b64: &str, data_b64: &str) -> anyhow::Result<String> {
    let key = general_purpose::STANDARD.decode(key_b64)?;
    let key: [u8; 32] = key
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("Extra-data key must be 32 bytes"))?;

    let raw = general_purpose::STANDARD.decode(data_b64)?;
    if raw.len() < IV_LENGTH {
        anyhow::bail!("Extra data shorter than its IV prefix");
    }
    let (iv, ciphertext) = raw.split_at(IV_LENGTH);
    let iv: [u8; IV_LENGTH] = iv.try_into().map_err(|_| anyhow::anyhow!("Bad IV"))?;

    let mut buffer = ciphertext.to_vec();
    let mut cipher = Aes256Ctr::new(&key.into(), &iv.into());
    cipher.apply_keystream(&mut buffer);

    String::from_utf8(buffer).map_err(Into::into)
}
