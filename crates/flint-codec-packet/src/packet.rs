use bytes::{BufMut, Bytes, BytesMut};

use crate::error::PacketError;

/// 报文头长度：2 字节总长度 + 1 字节类型。
pub const HEADER_LEN: usize = 3;

/// 默认单包上限（含报文头）。
pub const DEFAULT_MAX_PACKET_BYTES: usize = 1024;

/// 线格式所能表达的最大报文长度（`u16` 总长度字段）。
pub const MAX_WIRE_PACKET_BYTES: usize = u16::MAX as usize;

/// 报文头。
///
/// # 契约（What）
/// - `size` 为报文头与负载的总长度，大端序编码；
/// - `parse` 只做字节解释，不校验长度合法性，合法性由解码器结合上限判断。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    size: u16,
    packet_type: u8,
}

impl PacketHeader {
    /// 以负载长度构造报文头，总长度无法用 `u16` 表达时返回错误。
    pub fn for_payload(packet_type: u8, payload_len: usize) -> Result<Self, PacketError> {
        let total = HEADER_LEN + payload_len;
        let size = u16::try_from(total).map_err(|_| PacketError::OversizePacket {
            size: total,
            max: MAX_WIRE_PACKET_BYTES,
        })?;
        Ok(Self { size, packet_type })
    }

    /// 从 3 字节报文头解析。
    pub fn parse(raw: [u8; HEADER_LEN]) -> Self {
        Self {
            size: u16::from_be_bytes([raw[0], raw[1]]),
            packet_type: raw[2],
        }
    }

    /// 编码为线格式。
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let [hi, lo] = self.size.to_be_bytes();
        [hi, lo, self.packet_type]
    }

    /// 报文总长度（含报文头）。
    pub fn size(&self) -> usize {
        usize::from(self.size)
    }

    /// 报文类型。
    pub fn packet_type(&self) -> u8 {
        self.packet_type
    }

    /// 负载长度；总长度小于报文头时为 `None`。
    pub fn payload_len(&self) -> Option<usize> {
        self.size().checked_sub(HEADER_LEN)
    }
}

/// 解码得到的一个完整报文。
///
/// 负载是从解码器暂存区切分出的 `Bytes` 视图：引用计数共享底层内存而不复制；
/// 业务若需在分发结束后长期保留，持有该 `Bytes` 即可，暂存区会在下次扩容时另行分配。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    packet_type: u8,
    payload: Bytes,
}

impl Packet {
    /// 直接由类型与负载构造，主要用于测试与回环场景。
    pub fn new(packet_type: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            payload: payload.into(),
        }
    }

    /// 报文类型。
    pub fn packet_type(&self) -> u8 {
        self.packet_type
    }

    /// 负载视图。
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// 报文总长度（含报文头）。
    pub fn size(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// 取出负载所有权。
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

/// 将负载封装为一帧完整报文。
///
/// # 契约（What）
/// - `max_packet_bytes` 为对端解码器可接受的上限，帧长超出时返回 [`PacketError::OversizePacket`]，
///   不会截断负载；
/// - 上限本身必须位于 `[3, 65535]`，否则返回 [`PacketError::InvalidLimit`]。
pub fn encode_packet(
    packet_type: u8,
    payload: &[u8],
    max_packet_bytes: usize,
) -> Result<Bytes, PacketError> {
    validate_limit(max_packet_bytes)?;
    let total = HEADER_LEN + payload.len();
    if total > max_packet_bytes {
        return Err(PacketError::OversizePacket {
            size: total,
            max: max_packet_bytes,
        });
    }
    let header = PacketHeader::for_payload(packet_type, payload.len())?;
    let mut frame = BytesMut::with_capacity(total);
    frame.put_slice(&header.encode());
    frame.put_slice(payload);
    Ok(frame.freeze())
}

pub(crate) fn validate_limit(max_packet_bytes: usize) -> Result<(), PacketError> {
    if (HEADER_LEN..=MAX_WIRE_PACKET_BYTES).contains(&max_packet_bytes) {
        Ok(())
    } else {
        Err(PacketError::InvalidLimit {
            max: max_packet_bytes,
        })
    }
}
