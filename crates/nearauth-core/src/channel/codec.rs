//! BLE 特征值分块编解码
//!
//! GATT 特征值一次最多承载 208 字节，发送侧按 128 字节分块。
//! 入站（设备 → 服务）首块格式：1 字节块计数 + 4 字节大端总长 + 载荷，
//! 后续块：1 字节块计数 + 载荷。出站（服务 → 设备）是 4 字节长度前缀
//! 加数据的整体缓冲，按块大小切片，不带块头。

use log::{debug, warn};
use uuid::Uuid;

/// GATT 特征值最大长度
pub const CHARACTERISTIC_LENGTH: usize = 208;
/// 出站单块最大字节数
pub const MAX_SEND_SIZE: usize = 128;

/// 把一条出站消息切成可直接写入特征值的块
pub fn encode_chunks(data: &[u8]) -> Vec<Vec<u8>> {
    let mut buffer = Vec::with_capacity(4 + data.len());
    buffer.extend_from_slice(&(u32::try_from(data.len()).unwrap_or(u32::MAX)).to_be_bytes());
    buffer.extend_from_slice(data);

    buffer.chunks(MAX_SEND_SIZE).map(<[u8]>::to_vec).collect()
}

/// 入站块重组器
///
/// 跨多次特征值写入重组一条消息；`push` 在消息完整时返回载荷。
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    buffer: Vec<u8>,
    remaining: usize,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 送入一个块；消息完整时返回重组好的载荷
    pub fn push(&mut self, chunk: &[u8]) -> Option<Vec<u8>> {
        if self.remaining == 0 {
            // 首块：1 字节计数 + 4 字节总长
            if chunk.len() <= 5 {
                warn!("First chunk too short ({} bytes), dropping", chunk.len());
                return None;
            }
            self.buffer.clear();
            self.remaining = u32::from_be_bytes([chunk[1], chunk[2], chunk[3], chunk[4]]) as usize;
            debug!("Receiving message of {} byte(s), chunk {}", self.remaining, chunk[0]);
            let payload = &chunk[5..];
            if payload.len() > self.remaining {
                warn!(
                    "Received too many bytes ({} of {})",
                    payload.len(),
                    self.remaining
                );
                self.remaining = 0;
                return None;
            }
            self.buffer.extend_from_slice(payload);
            self.remaining -= payload.len();
        } else {
            // 后续块：1 字节计数
            if chunk.is_empty() {
                return None;
            }
            let payload = &chunk[1..];
            if payload.len() > self.remaining {
                warn!(
                    "Received too many bytes ({} of {})",
                    payload.len(),
                    self.remaining
                );
                self.remaining = 0;
                self.buffer.clear();
                return None;
            }
            debug!("Continuation chunk {}, {} byte(s)", chunk[0], payload.len());
            self.buffer.extend_from_slice(payload);
            self.remaining -= payload.len();
        }

        if self.remaining == 0 {
            Some(std::mem::take(&mut self.buffer))
        } else {
            None
        }
    }
}

/// 从身份承诺派生 GATT 服务 UUID
///
/// 取承诺的第 16..32 字节按 4-2-2-2-6 排布；最后一个字节的最低位
/// 标记是否为持续认证服务，设备据此选择订阅对象。
pub fn service_uuid(commitment: &[u8; 32], continuous: bool) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&commitment[16..32]);
    if continuous {
        bytes[15] |= 0x01;
    } else {
        bytes[15] &= 0xFE;
    }
    Uuid::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 按入站线格式手工分块（测试辅助）
    fn make_inbound_chunks(data: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
        let mut chunks = Vec::new();
        let mut counter = 0u8;
        let mut first = vec![counter];
        first.extend_from_slice(&(data.len() as u32).to_be_bytes());
        let head = data.len().min(chunk_size - 5);
        first.extend_from_slice(&data[..head]);
        chunks.push(first);
        let mut pos = head;
        while pos < data.len() {
            counter += 1;
            let take = (data.len() - pos).min(chunk_size - 1);
            let mut chunk = vec![counter];
            chunk.extend_from_slice(&data[pos..pos + take]);
            chunks.push(chunk);
            pos += take;
        }
        chunks
    }

    #[test]
    fn test_single_chunk_message() {
        let mut assembler = ChunkAssembler::new();
        let chunks = make_inbound_chunks(b"hello", CHARACTERISTIC_LENGTH);
        assert_eq!(chunks.len(), 1);
        assert_eq!(assembler.push(&chunks[0]).unwrap(), b"hello");
    }

    #[test]
    fn test_multi_chunk_message() {
        let data: Vec<u8> = (0..500).map(|i| (i % 251) as u8).collect();
        let chunks = make_inbound_chunks(&data, CHARACTERISTIC_LENGTH);
        assert!(chunks.len() > 1);

        let mut assembler = ChunkAssembler::new();
        let mut result = None;
        for chunk in &chunks {
            result = assembler.push(chunk);
        }
        assert_eq!(result.unwrap(), data);
    }

    #[test]
    fn test_assembler_resets_between_messages() {
        let mut assembler = ChunkAssembler::new();
        for _ in 0..2 {
            let chunks = make_inbound_chunks(b"again", CHARACTERISTIC_LENGTH);
            assert_eq!(assembler.push(&chunks[0]).unwrap(), b"again");
        }
    }

    #[test]
    fn test_runt_first_chunk_dropped() {
        let mut assembler = ChunkAssembler::new();
        assert!(assembler.push(&[0, 0, 0]).is_none());
        // 之后仍能正常接收
        let chunks = make_inbound_chunks(b"ok", CHARACTERISTIC_LENGTH);
        assert_eq!(assembler.push(&chunks[0]).unwrap(), b"ok");
    }

    #[test]
    fn test_encode_chunks_layout() {
        let data = vec![0xABu8; 300];
        let chunks = encode_chunks(&data);
        // 304 字节（含 4 字节长度前缀）→ 128 + 128 + 48
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), MAX_SEND_SIZE);
        assert_eq!(chunks[2].len(), 48);
        assert_eq!(&chunks[0][..4], &300u32.to_be_bytes());
    }

    #[test]
    fn test_service_uuid_continuous_bit() {
        let commitment = [0x42u8; 32];
        let plain = service_uuid(&commitment, false);
        let continuous = service_uuid(&commitment, true);
        assert_ne!(plain, continuous);
        assert_eq!(plain.as_bytes()[15] & 0x01, 0);
        assert_eq!(continuous.as_bytes()[15] & 0x01, 1);
        // 前 15 个字节一致
        assert_eq!(plain.as_bytes()[..15], continuous.as_bytes()[..15]);
    }
}
