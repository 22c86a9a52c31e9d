use bytes::{Buf, BytesMut};

use crate::{
    error::PacketError,
    packet::{DEFAULT_MAX_PACKET_BYTES, HEADER_LEN, Packet, PacketHeader, validate_limit},
};

/// 长度前缀报文的增量解码器。
///
/// # 设计动机（Why）
/// - 读完成事件交付的字节块与报文边界无关：一次可能带来半个报文，也可能带来多个报文加半个尾巴；
/// - 解码器需要在多次投喂之间保留尾巴，并且只在报文完整到达后才交付，杜绝撕裂或重复的报文。
///
/// # 行为概览（How）
/// - 暂存区为定长（`capacity` = 单包上限）的 `BytesMut`，`buffered()` 即有效字节游标；
/// - [`InboundDecoder::absorb`] 只接受不超过剩余空间的前缀，保证游标永不越过容量；
/// - [`InboundDecoder::decode_next`] 读取报文头：总长度小于报文头或超过上限即判定违例；
///   不足一个完整报文时返回 `Ok(None)`；否则用 `split_to` 切出整包，剩余字节自然前移；
/// - [`InboundDecoder::feed`] 把两者组合为按到达顺序产出报文的迭代器。
///
/// # 契约（What）
/// - **后置条件**：每次解码只消费整包，结束时 `0 <= buffered() < capacity()`；
/// - **失败语义**：违例后解码器中毒，之后每次解码都返回同一错误，直至 [`InboundDecoder::reset`]；
///   关闭连接属于上层职责，解码器本身不做任何关闭动作。
///
/// # 权衡（Trade-offs）
/// - 超过上限的报文头在负载到达之前就会被拒绝，而不是等待一个永远装不下的报文；
/// - 交付出去的负载与暂存区共享底层内存，若业务长期持有负载，暂存区下次追加时会重新分配。
#[derive(Debug)]
pub struct InboundDecoder {
    scratch: BytesMut,
    capacity: usize,
    poisoned: Option<PacketError>,
}

impl Default for InboundDecoder {
    fn default() -> Self {
        Self::with_capacity_unchecked(DEFAULT_MAX_PACKET_BYTES)
    }
}

impl InboundDecoder {
    /// 使用默认单包上限（1024 字节）创建解码器。
    pub fn new() -> Self {
        Self::default()
    }

    /// 以指定单包上限创建解码器，上限须位于 `[3, 65535]`。
    pub fn with_max_packet(max_packet_bytes: usize) -> Result<Self, PacketError> {
        validate_limit(max_packet_bytes)?;
        Ok(Self::with_capacity_unchecked(max_packet_bytes))
    }

    fn with_capacity_unchecked(capacity: usize) -> Self {
        Self {
            scratch: BytesMut::with_capacity(capacity),
            capacity,
            poisoned: None,
        }
    }

    /// 暂存区容量，即单包上限。
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 已缓存但尚未解码的字节数。
    pub fn buffered(&self) -> usize {
        self.scratch.len()
    }

    /// 暂存区剩余空间；下一次读操作不应请求超过该值的字节。
    pub fn spare_capacity(&self) -> usize {
        self.capacity - self.scratch.len()
    }

    /// 是否因协议违例而中毒。
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    /// 追加输入中能放下的前缀，返回接受的字节数。
    pub fn absorb(&mut self, input: &[u8]) -> usize {
        let accepted = input.len().min(self.spare_capacity());
        self.scratch.extend_from_slice(&input[..accepted]);
        accepted
    }

    /// 从暂存区解出下一个完整报文。
    pub fn decode_next(&mut self) -> Result<Option<Packet>, PacketError> {
        if let Some(err) = &self.poisoned {
            return Err(err.clone());
        }
        if self.scratch.len() < HEADER_LEN {
            return Ok(None);
        }

        let header = PacketHeader::parse([self.scratch[0], self.scratch[1], self.scratch[2]]);
        let size = header.size();
        if size < HEADER_LEN {
            return Err(self.poison(PacketError::UndersizedPacket { size }));
        }
        if size > self.capacity {
            return Err(self.poison(PacketError::OversizePacket {
                size,
                max: self.capacity,
            }));
        }
        if self.scratch.len() < size {
            return Ok(None);
        }

        let mut frame = self.scratch.split_to(size);
        frame.advance(HEADER_LEN);
        Ok(Some(Packet::new(header.packet_type(), frame.freeze())))
    }

    /// 投喂一段新字节，返回按到达顺序产出报文的迭代器。
    ///
    /// 构造时立即缓存能放下的前缀；其余输入随着迭代腾出空间逐段缓存。
    /// 迭代器提前丢弃时，尚未缓存的部分可通过 [`Feed::remainder`] 取回。
    pub fn feed<'d, 'i>(&'d mut self, input: &'i [u8]) -> Feed<'d, 'i> {
        let accepted = if self.is_poisoned() {
            0
        } else {
            self.absorb(input)
        };
        Feed {
            decoder: self,
            pending: &input[accepted..],
            failed: false,
        }
    }

    /// 丢弃缓存字节并清除中毒状态，用于连接重建后复用解码器。
    pub fn reset(&mut self) {
        self.scratch.clear();
        self.poisoned = None;
    }

    fn poison(&mut self, err: PacketError) -> PacketError {
        self.poisoned = Some(err.clone());
        err
    }
}

/// [`InboundDecoder::feed`] 返回的报文迭代器。
///
/// 遇到协议违例时产出一次 `Err` 后结束。
#[derive(Debug)]
pub struct Feed<'d, 'i> {
    decoder: &'d mut InboundDecoder,
    pending: &'i [u8],
    failed: bool,
}

impl<'i> Feed<'_, 'i> {
    /// 尚未进入暂存区的输入。
    pub fn remainder(&self) -> &'i [u8] {
        self.pending
    }
}

impl Iterator for Feed<'_, '_> {
    type Item = Result<Packet, PacketError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            match self.decoder.decode_next() {
                Ok(Some(packet)) => return Some(Ok(packet)),
                Ok(None) => {}
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
            if self.pending.is_empty() {
                return None;
            }
            let accepted = self.decoder.absorb(self.pending);
            if accepted == 0 {
                return None;
            }
            self.pending = &self.pending[accepted..];
        }
    }
}
