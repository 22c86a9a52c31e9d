use thiserror::Error;

use crate::packet::{HEADER_LEN, MAX_WIRE_PACKET_BYTES};

/// 分帧协议错误。
///
/// `UndersizedPacket` 与 `OversizePacket` 都属于协议违例：对端发送的字节流已不可信，
/// 解码器在报告后进入中毒状态，不再尝试重新同步。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// 报文头声明的总长度小于报文头本身。
    #[error("packet header declares size {size}, smaller than the {}-byte header", HEADER_LEN)]
    UndersizedPacket {
        /// 报文头中声明的总长度。
        size: usize,
    },
    /// 报文总长度超过允许的上限。
    #[error("packet size {size} exceeds the limit of {max} bytes")]
    OversizePacket {
        /// 报文总长度（含报文头）。
        size: usize,
        /// 当前生效的上限。
        max: usize,
    },
    /// 配置的报文上限不在 `[3, 65535]` 区间内。
    #[error(
        "max packet size {max} must lie within [{}, {}]",
        HEADER_LEN,
        MAX_WIRE_PACKET_BYTES
    )]
    InvalidLimit {
        /// 非法的上限取值。
        max: usize,
    },
}

impl PacketError {
    /// 是否为对端造成的协议违例。
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            PacketError::UndersizedPacket { .. } | PacketError::OversizePacket { .. }
        )
    }
}
