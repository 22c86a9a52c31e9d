use std::{borrow::Cow, io, net::SocketAddr, time::Duration};

use bytes::BytesMut;
use flint_buffer::{BufferPool, PooledBuffer};
use socket2::SockRef;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    runtime::Handle,
    sync::{mpsc, watch},
};
use tracing::debug;

use crate::{
    config::TransportConfig,
    connection::Connection,
    error::{CONFIGURE, CONNECT, READ, TransportError, WRITE, aborted_error, map_io_error},
    pump::PumpLoop,
    stream::{ByteStream, Completion, Reactor},
};

/// TCP 套接字选项。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把建连后需要立即落地的套接字选项集中配置，避免调用方直接操作 `socket2`。
///
/// ## 核心逻辑（How）
/// - `nodelay` 控制 `TCP_NODELAY`：出站队列已经做了合并，默认关闭 Nagle 以降低延迟；
/// - `linger` 为 `Some(dur)` 时通过 `socket2::SockRef::set_linger` 设置 `SO_LINGER`，
///   `None` 表示沿用内核默认策略。
///
/// ## 契约说明（What）
/// - **后置条件**：`apply` 返回 `Ok(())` 时选项已全部生效。
///
/// ## 设计取舍与注意事项（Trade-offs）
/// - `SO_LINGER` 在不同平台的精度不同（Linux 取整到秒）；设置过小可能让发送缓冲中的数据被丢弃。
#[derive(Clone, Debug)]
pub struct TcpSocketConfig {
    nodelay: bool,
    linger: Option<Duration>,
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpSocketConfig {
    /// 创建默认配置：`nodelay = true`，`linger = None`。
    pub const fn new() -> Self {
        Self {
            nodelay: true,
            linger: None,
        }
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// 设置 `SO_LINGER` 超时时长。
    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    pub fn nodelay(&self) -> bool {
        self.nodelay
    }

    pub fn linger(&self) -> Option<Duration> {
        self.linger
    }

    fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        let sock = SockRef::from(stream);
        sock.set_tcp_nodelay(self.nodelay)?;
        sock.set_linger(self.linger)
    }
}

/// 基于 Tokio `TcpStream` 的 [`ByteStream`] 实现。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把 Tokio 的 `async` 读写适配为“发起操作、稍后取完成事件”的回调式接口，
///   让同步的泵循环无需进入异步上下文即可驱动真实套接字。
///
/// ## 逻辑 (How)
/// - `TcpStream` 拆分为读写两半，各由一个后台任务持有；
/// - `async_write`/`async_read` 只把请求投递进无界通道，任务完成后把 [`Completion`]
///   投递到 [`TokioReactor`] 持有的通道；
/// - `close` 通过 `watch` 通道广播关闭信号：进行中的读写被中止并以 `ConnectionAborted` 完成，
///   尚未开始的请求同样逐个以错误完成。
///
/// ## 契约 (What)
/// - 每个发起的操作恰好产生一个完成事件；reactor 已被丢弃时，完成事件中的缓冲随之归还缓冲池；
/// - **前置条件**：`spawn` 必须在 Tokio 运行时句柄可用的上下文中调用。
///
/// ## 注意事项 (Trade-offs)
/// - 写任务使用 `write_all`，因此成功完成总是整块写出；
/// - 读任务每次按请求长度分配一块新的 `BytesMut`，冻结后整体交给解码器。
#[derive(Debug)]
pub struct TokioStream {
    id: String,
    writes: mpsc::UnboundedSender<PooledBuffer>,
    reads: mpsc::UnboundedSender<usize>,
    completions: mpsc::UnboundedSender<Completion>,
    closed: watch::Sender<bool>,
}

/// 收取 [`TokioStream`] 后台任务投递的完成事件。
#[derive(Debug)]
pub struct TokioReactor {
    completions: mpsc::UnboundedReceiver<Completion>,
}

impl TokioStream {
    /// 拆分 `stream` 并在 `handle` 上启动读写任务。
    pub fn spawn(stream: TcpStream, handle: &Handle) -> (Self, TokioReactor) {
        let id = match stream.peer_addr() {
            Ok(peer) => format!("tcp://{peer}"),
            Err(_) => String::from("tcp://unknown"),
        };
        let (reader, writer) = stream.into_split();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        handle.spawn(write_loop(
            writer,
            write_rx,
            completion_tx.clone(),
            closed_rx.clone(),
        ));
        handle.spawn(read_loop(reader, read_rx, completion_tx.clone(), closed_rx));

        (
            Self {
                id,
                writes: write_tx,
                reads: read_tx,
                completions: completion_tx,
                closed: closed_tx,
            },
            TokioReactor {
                completions: completion_rx,
            },
        )
    }
}

impl ByteStream for TokioStream {
    fn id(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.id)
    }

    fn async_write(&self, buffer: PooledBuffer) {
        if let Err(mpsc::error::SendError(buffer)) = self.writes.send(buffer) {
            let _ = self.completions.send(Completion::Write {
                buffer,
                result: Err(aborted_error(WRITE)),
            });
        }
    }

    fn async_read(&self, max_len: usize) {
        if self.reads.send(max_len).is_err() {
            let _ = self.completions.send(Completion::Read {
                result: Err(aborted_error(READ)),
            });
        }
    }

    fn close(&self) {
        debug!(conn_id = %self.id, "closing tcp stream");
        self.closed.send_replace(true);
    }
}

impl Reactor for TokioReactor {
    fn poll_one(&mut self) -> Option<Completion> {
        self.completions.try_recv().ok()
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut requests: mpsc::UnboundedReceiver<PooledBuffer>,
    completions: mpsc::UnboundedSender<Completion>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        let buffer = tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => break,
            request = requests.recv() => match request {
                Some(buffer) => buffer,
                None => break,
            },
        };
        let outcome = tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => None,
            written = writer.write_all(&buffer) => Some(written),
        };
        let result = match outcome {
            Some(Ok(())) => Ok(buffer.len()),
            Some(Err(err)) => Err(err),
            None => Err(aborted_error(WRITE)),
        };
        if completions.send(Completion::Write { buffer, result }).is_err() {
            break;
        }
    }

    requests.close();
    while let Ok(buffer) = requests.try_recv() {
        let _ = completions.send(Completion::Write {
            buffer,
            result: Err(aborted_error(WRITE)),
        });
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    mut requests: mpsc::UnboundedReceiver<usize>,
    completions: mpsc::UnboundedSender<Completion>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        let max_len = tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => break,
            request = requests.recv() => match request {
                Some(max_len) => max_len,
                None => break,
            },
        };
        let mut chunk = BytesMut::zeroed(max_len);
        let outcome = loop {
            let attempt = tokio::select! {
                biased;
                _ = closed.wait_for(|closed| *closed) => None,
                read = reader.read(&mut chunk[..]) => Some(read),
            };
            match attempt {
                Some(Err(err)) if err.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };
        let result = match outcome {
            Some(Ok(read)) => {
                chunk.truncate(read);
                Ok(chunk.freeze())
            }
            Some(Err(err)) => Err(err),
            None => Err(aborted_error(READ)),
        };
        if completions.send(Completion::Read { result }).is_err() {
            break;
        }
    }

    requests.close();
    while requests.try_recv().is_ok() {
        let _ = completions.send(Completion::Read {
            result: Err(aborted_error(READ)),
        });
    }
}

/// 连接 `addr` 并构建就绪的泵循环。
pub async fn connect(
    addr: SocketAddr,
    pool: BufferPool,
    config: TransportConfig,
    socket: TcpSocketConfig,
) -> Result<PumpLoop<TokioReactor>, TransportError> {
    config.validate()?;
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|err| map_io_error(CONNECT, err))?;
    from_tcp_stream(stream, pool, config, socket)
}

/// 以已建立的 `TcpStream`（例如 `accept` 所得）构建泵循环。
///
/// 必须在 Tokio 运行时上下文中调用，否则返回 [`TransportError::Runtime`]。
pub fn from_tcp_stream(
    stream: TcpStream,
    pool: BufferPool,
    config: TransportConfig,
    socket: TcpSocketConfig,
) -> Result<PumpLoop<TokioReactor>, TransportError> {
    socket
        .apply(&stream)
        .map_err(|err| map_io_error(CONFIGURE, err))?;
    let handle = Handle::try_current().map_err(|err| TransportError::Runtime(err.to_string()))?;
    let (stream, reactor) = TokioStream::spawn(stream, &handle);
    let connection = Connection::new(stream, pool, config)?;
    Ok(PumpLoop::new(connection, reactor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn loopback_stream() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (server, _) = accepted.expect("accept");
        (client.expect("connect"), server)
    }

    #[tokio::test]
    async fn socket_options_are_applied_to_the_stream() {
        let (client, _server) = loopback_stream().await;

        TcpSocketConfig::new()
            .with_linger(Some(Duration::from_secs(1)))
            .apply(&client)
            .expect("apply options");
        assert!(client.nodelay().expect("read nodelay"));
        assert_eq!(
            SockRef::from(&client).linger().expect("read linger"),
            Some(Duration::from_secs(1))
        );

        TcpSocketConfig::new()
            .with_nodelay(false)
            .apply(&client)
            .expect("apply options");
        assert!(!client.nodelay().expect("read nodelay"));
    }
}
