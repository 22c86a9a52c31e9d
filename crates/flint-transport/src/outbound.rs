use std::{collections::VecDeque, io};

use flint_buffer::{BufferPool, PooledBuffer};

use crate::error::short_write_error;

/// 已拷贝进池化缓冲、等待入队的一次写请求。
///
/// 拷贝在连接互斥锁之外完成，锁内只剩链表与计数的更新。
#[derive(Debug)]
pub struct StagedWrite {
    chunks: Vec<PooledBuffer>,
    total: usize,
}

impl StagedWrite {
    /// 按池的单块容量切分 `data`，每块拷贝进一块新租借的缓冲。
    pub fn stage(pool: &BufferPool, data: &[u8]) -> Self {
        let mut chunks = Vec::with_capacity(data.len().div_ceil(pool.buffer_capacity()));
        for chunk in data.chunks(pool.buffer_capacity()) {
            let mut buffer = pool.acquire();
            buffer.append(chunk);
            chunks.push(buffer);
        }
        Self {
            chunks,
            total: data.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

/// 单连接的出站队列。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把任意长度的写请求变成一串定长池化缓冲，按调用顺序逐块交给字节流；
/// - 小写入尽量合并进队尾缓冲，减少系统调用与缓冲占用。
///
/// ## 逻辑（How）
/// - `pending` 是尚未发出的缓冲链；在途缓冲被移出链表、交给字节流，
///   队列只记住它的长度，因此“在途缓冲不可被修改”由所有权保证；
/// - 合并只发生在链尾，且只针对一次写请求的首块，并要求首块能整块放入队尾剩余空间；
/// - `start_next` 在无在途写时取出链头；`complete` 回收在途缓冲并清除在途标记。
///
/// ## 契约（What）
/// - **单飞**：`start_next` 在上一次写完成之前始终返回 `None`；
/// - **顺序**：链表严格先进先出，合并只追加，不会改变字节相对顺序；
/// - `pending_bytes()` = 排队字节 + 在途字节，随每次入队、完成与清空同步更新；
/// - **前置条件**：所有方法都在连接互斥锁内调用。
///
/// ## 注意事项（Trade-offs）
/// - 首块合并时需要在锁内再拷贝一次（至多一块缓冲大小），换取更少的写操作；
/// - 写完成的字节数与缓冲长度不一致视为短写错误，由上层关闭连接，不做续写。
#[derive(Debug, Default)]
pub struct OutboundQueue {
    pending: VecDeque<PooledBuffer>,
    pending_bytes: usize,
    in_flight: Option<usize>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 入队一次写请求，可能把首块合并进队尾。
    pub fn push(&mut self, staged: StagedWrite) {
        self.pending_bytes += staged.total;
        let mut chunks = staged.chunks.into_iter();
        let Some(first) = chunks.next() else {
            return;
        };
        let merged = match self.pending.back_mut() {
            Some(tail) if tail.spare() >= first.len() => {
                tail.append(&first);
                true
            }
            _ => false,
        };
        if !merged {
            self.pending.push_back(first);
        }
        self.pending.extend(chunks);
    }

    /// 若当前没有在途写且链非空，取出链头作为下一次写入。
    pub fn start_next(&mut self) -> Option<PooledBuffer> {
        if self.in_flight.is_some() {
            return None;
        }
        let buffer = self.pending.pop_front()?;
        self.in_flight = Some(buffer.len());
        Some(buffer)
    }

    /// 处理写完成：归还缓冲、扣减积压并清除在途标记。
    ///
    /// 写入字节数与缓冲长度不一致时返回短写错误。
    pub fn complete(&mut self, buffer: PooledBuffer, result: io::Result<usize>) -> io::Result<()> {
        let expected = self.in_flight.take().unwrap_or(buffer.len());
        self.pending_bytes = self.pending_bytes.saturating_sub(expected);
        drop(buffer);
        match result {
            Ok(written) if written == expected => Ok(()),
            Ok(written) => Err(short_write_error(written, expected)),
            Err(err) => Err(err),
        }
    }

    /// 丢弃所有排队缓冲，返回丢弃的缓冲块数；在途缓冲仍等待其完成事件。
    pub fn drain(&mut self) -> usize {
        let drained = self.pending.len();
        let queued: usize = self.pending.iter().map(PooledBuffer::len).sum();
        self.pending.clear();
        self.pending_bytes = self.pending_bytes.saturating_sub(queued);
        drained
    }

    /// 排队字节 + 在途字节。
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// 尚未发出的缓冲块数（不含在途缓冲）。
    pub fn queued_buffers(&self) -> usize {
        self.pending.len()
    }

    /// 排队缓冲各自的已用长度，按发送顺序排列。
    pub fn queued_lengths(&self) -> Vec<usize> {
        self.pending.iter().map(PooledBuffer::len).collect()
    }

    pub fn is_write_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.pending.is_empty()
    }
}
