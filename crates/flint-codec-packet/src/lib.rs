#![warn(missing_docs)]

//! `flint-codec-packet` 实现长度前缀分帧协议的编码与增量解码。
//!
//! # 背景（Why）
//! - 传输层在同一条有序字节流上承载多种业务报文，需要一个最小的分帧头来切分边界；
//! - 读完成事件带来的字节块与报文边界无关，解码器必须跨多次投喂保留半包。
//!
//! # 线格式（What）
//! ```text
//! offset 0: u16 total_size   // 报文头 + 负载，大端序（网络字节序），>= 3
//! offset 2: u8  packet_type
//! offset 3: payload[total_size - 3]
//! ```
//!
//! # 使用概览（How）
//! - 出站：[`encode_packet`] 生成带头部的完整帧；
//! - 入站：[`InboundDecoder::feed`] 或 `absorb` + `decode_next` 逐包解出 [`Packet`]；
//! - 违反协议（长度小于报文头、超过上限）时返回 [`PacketError`]，是否关闭连接由上层决定。

mod decoder;
mod error;
mod packet;

pub use decoder::{Feed, InboundDecoder};
pub use error::PacketError;
pub use packet::{
    DEFAULT_MAX_PACKET_BYTES, HEADER_LEN, MAX_WIRE_PACKET_BYTES, Packet, PacketHeader,
    encode_packet,
};
