use std::{borrow::Cow, io};

use bytes::Bytes;
use flint_buffer::PooledBuffer;

/// 双工字节流：连接消费的外部协作者。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 传输核心不关心字节流来自 TCP、内存管道还是其他实现，只要求“发起异步读写，
///   稍后经由 [`Reactor`] 收到完成事件”；
/// - 与具体运行时解耦后，同一套队列、解码与泵循环逻辑可以在测试桩与 Tokio 之间复用。
///
/// ## 契约（What）
/// - `async_write`：接管缓冲所有权并发起写入；完成时必须通过 [`Completion::Write`]
///   原样交还该缓冲，连接据此释放回池；
/// - `async_read`：发起一次至多 `max_len` 字节的读取，完成时产生 [`Completion::Read`]；
///   读到空 `Bytes` 表示对端已关闭；
/// - `close`：中止所有未完成操作；被中止的操作仍各自产生一个携带错误的完成事件；
/// - **前置条件**：三者都不得阻塞，也不得在调用内部同步回调连接；
/// - **后置条件**：每个发起的操作恰好产生一个完成事件。
///
/// ## 风险提示（Trade-offs）
/// - 调用方保证同一时刻至多一个写与一个读在途，实现无需自行排队；
/// - `close` 之后发起的操作应立即以错误完成，而不是静默丢弃缓冲。
pub trait ByteStream: Send + Sync + 'static {
    /// 返回可用于日志或追踪的连接 ID。
    fn id(&self) -> Cow<'_, str>;

    /// 发起异步写入。
    fn async_write(&self, buffer: PooledBuffer);

    /// 发起异步读取。
    fn async_read(&self, max_len: usize);

    /// 中止未完成的操作并关闭底层流。
    fn close(&self);
}

/// 一次异步操作的完成事件。
#[derive(Debug)]
pub enum Completion {
    /// 写完成：交还在途缓冲，并给出写入字节数或错误。
    Write {
        buffer: PooledBuffer,
        result: io::Result<usize>,
    },
    /// 读完成：空 `Bytes` 表示 EOF。
    Read { result: io::Result<Bytes> },
}

/// 完成事件来源。
///
/// `poll_one` 是非阻塞的单次轮询：有就绪事件时取出一个，否则立即返回 `None`。
pub trait Reactor {
    fn poll_one(&mut self) -> Option<Completion>;
}

impl<R: Reactor + ?Sized> Reactor for Box<R> {
    fn poll_one(&mut self) -> Option<Completion> {
        (**self).poll_one()
    }
}
