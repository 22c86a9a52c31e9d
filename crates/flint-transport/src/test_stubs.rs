//! 内存字节流测试桩。
//!
//! # 教案级说明
//! - **意图（Why）**：在不依赖操作系统套接字与异步运行时的前提下驱动连接与泵循环，
//!   让写完成时机、读到达节奏与故障注入全部由测试脚本决定；
//! - **结构（How）**：[`MemoryStream`] 与 [`MemoryReactor`] 共享一个受互斥锁保护的状态：
//!   发起的操作只登记或排入就绪队列，完成事件一律经由 `MemoryReactor::poll_one` 取出，
//!   从不在调用内部同步回调；
//! - **契约（What）**：`MemoryStream` 可克隆，克隆体即测试端的控制器；
//!   `close` 会把所有未完成操作以 `ConnectionAborted` 完成。

use std::{
    borrow::Cow,
    collections::VecDeque,
    io,
    sync::Arc,
};

use bytes::Bytes;
use flint_buffer::PooledBuffer;
use parking_lot::Mutex;

use crate::{
    error::{READ, WRITE, aborted_error},
    stream::{ByteStream, Completion, Reactor},
};

#[derive(Debug)]
struct MemoryState {
    ready: VecDeque<Completion>,
    outstanding: VecDeque<PooledBuffer>,
    active_writes: usize,
    max_active_writes: usize,
    pending_read: Option<usize>,
    read_chunk_limit: Option<usize>,
    inbound: VecDeque<u8>,
    eof: bool,
    auto_complete: bool,
    written: Vec<u8>,
    write_sizes: Vec<usize>,
    closed: bool,
    close_calls: usize,
}

impl MemoryState {
    fn complete_write(&mut self, failure: Option<io::ErrorKind>) -> bool {
        let Some(buffer) = self.outstanding.pop_front() else {
            return false;
        };
        let result = match failure {
            Some(kind) => Err(io::Error::new(kind, "injected write failure")),
            None => {
                self.written.extend_from_slice(&buffer);
                self.write_sizes.push(buffer.len());
                Ok(buffer.len())
            }
        };
        self.ready.push_back(Completion::Write { buffer, result });
        true
    }

    fn try_deliver(&mut self) {
        let Some(max_len) = self.pending_read else {
            return;
        };
        if !self.inbound.is_empty() {
            let limit = self.read_chunk_limit.unwrap_or(usize::MAX).min(max_len);
            let take = limit.min(self.inbound.len());
            let chunk: Vec<u8> = self.inbound.drain(..take).collect();
            self.pending_read = None;
            self.ready.push_back(Completion::Read {
                result: Ok(Bytes::from(chunk)),
            });
        } else if self.eof {
            self.pending_read = None;
            self.ready.push_back(Completion::Read {
                result: Ok(Bytes::new()),
            });
        }
    }
}

/// 脚本化的内存字节流。
#[derive(Clone, Debug)]
pub struct MemoryStream {
    id: String,
    state: Arc<Mutex<MemoryState>>,
}

/// 与 [`MemoryStream`] 配对的完成事件队列。
#[derive(Debug)]
pub struct MemoryReactor {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStream {
    /// 创建一对共享状态的流与 reactor；默认写入立即成功完成。
    pub fn pair(id: impl Into<String>) -> (Self, MemoryReactor) {
        let state = Arc::new(Mutex::new(MemoryState {
            ready: VecDeque::new(),
            outstanding: VecDeque::new(),
            active_writes: 0,
            max_active_writes: 0,
            pending_read: None,
            read_chunk_limit: None,
            inbound: VecDeque::new(),
            eof: false,
            auto_complete: true,
            written: Vec::new(),
            write_sizes: Vec::new(),
            closed: false,
            close_calls: 0,
        }));
        (
            Self {
                id: id.into(),
                state: Arc::clone(&state),
            },
            MemoryReactor { state },
        )
    }

    /// 关闭自动完成后写入只登记，需由 [`MemoryStream::complete_next_write`] 手动完成。
    pub fn set_auto_complete(&self, enabled: bool) {
        self.state.lock().auto_complete = enabled;
    }

    /// 限制单次读完成交付的最大字节数，用于模拟分片到达。
    pub fn set_read_chunk_limit(&self, limit: Option<usize>) {
        self.state.lock().read_chunk_limit = limit;
    }

    /// 追加对端发来的字节；若有读在途则立即排入一个读完成事件。
    pub fn push_inbound(&self, bytes: &[u8]) {
        let mut state = self.state.lock();
        state.inbound.extend(bytes.iter().copied());
        state.try_deliver();
    }

    /// 标记对端关闭：剩余字节交付完之后，下一次读以空 `Bytes` 完成。
    pub fn push_eof(&self) {
        let mut state = self.state.lock();
        state.eof = true;
        state.try_deliver();
    }

    /// 成功完成最早的未完成写入，返回是否存在这样的写入。
    pub fn complete_next_write(&self) -> bool {
        self.state.lock().complete_write(None)
    }

    /// 以指定错误完成最早的未完成写入。
    pub fn fail_next_write(&self, kind: io::ErrorKind) -> bool {
        self.state.lock().complete_write(Some(kind))
    }

    /// 以指定错误完成在途的读，返回是否存在在途读。
    pub fn fail_pending_read(&self, kind: io::ErrorKind) -> bool {
        let mut state = self.state.lock();
        if state.pending_read.take().is_none() {
            return false;
        }
        state.ready.push_back(Completion::Read {
            result: Err(io::Error::new(kind, "injected read failure")),
        });
        true
    }

    /// 成功写出的全部字节，按写完成顺序拼接。
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    /// 每次成功写入的字节数。
    pub fn write_sizes(&self) -> Vec<usize> {
        self.state.lock().write_sizes.clone()
    }

    /// 已发起但尚未完成的写入数。
    pub fn outstanding_writes(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    /// 历史上同时在途（发起后、完成事件被取走前）的写入数峰值。
    pub fn max_active_writes(&self) -> usize {
        self.state.lock().max_active_writes
    }

    /// 在途读的请求长度。
    pub fn pending_read(&self) -> Option<usize> {
        self.state.lock().pending_read
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }
}

impl ByteStream for MemoryStream {
    fn id(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.id)
    }

    fn async_write(&self, buffer: PooledBuffer) {
        let mut state = self.state.lock();
        state.active_writes += 1;
        state.max_active_writes = state.max_active_writes.max(state.active_writes);
        if state.closed {
            state.ready.push_back(Completion::Write {
                buffer,
                result: Err(aborted_error(WRITE)),
            });
            return;
        }
        state.outstanding.push_back(buffer);
        if state.auto_complete {
            state.complete_write(None);
        }
    }

    fn async_read(&self, max_len: usize) {
        let mut state = self.state.lock();
        if state.closed {
            state.ready.push_back(Completion::Read {
                result: Err(aborted_error(READ)),
            });
            return;
        }
        state.pending_read = Some(max_len);
        state.try_deliver();
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.close_calls += 1;
        if state.closed {
            return;
        }
        state.closed = true;
        while let Some(buffer) = state.outstanding.pop_front() {
            state.ready.push_back(Completion::Write {
                buffer,
                result: Err(aborted_error(WRITE)),
            });
        }
        if state.pending_read.take().is_some() {
            state.ready.push_back(Completion::Read {
                result: Err(aborted_error(READ)),
            });
        }
    }
}

impl Reactor for MemoryReactor {
    fn poll_one(&mut self) -> Option<Completion> {
        let mut state = self.state.lock();
        let completion = state.ready.pop_front()?;
        if matches!(completion, Completion::Write { .. }) {
            state.active_writes = state.active_writes.saturating_sub(1);
        }
        Some(completion)
    }
}
