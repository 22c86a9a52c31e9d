use std::{collections::HashMap, fmt, io, sync::Arc};

use bytes::Bytes;
use flint_buffer::{BufferPool, PooledBuffer};
use flint_codec_packet::{InboundDecoder, Packet, encode_packet};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    backpressure::HighWaterMark,
    config::TransportConfig,
    error::{CloseReason, ConfigError, READ, TransportError, WRITE},
    outbound::{OutboundQueue, StagedWrite},
    stream::{ByteStream, Completion},
};

/// 连接生命周期。
///
/// 只会沿 `Open -> Closing -> Closed` 单向推进。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

type PacketHandler = Box<dyn FnMut(&Packet) + Send>;
type CloseHandler = Box<dyn FnOnce(&CloseReason) + Send>;

/// 一条双工连接：出站队列 + 入站解码器 + 外部字节流。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把背压、协议违例与 I/O 故障统一收敛为“单向关闭”，
///   让上层只需观察一次关闭事件，不必处理半途失败；
/// - 区分两类调用方：reactor 线程持有 `Connection`（解码、分发、处理完成事件），
///   生产者线程持有可克隆的 [`ConnectionHandle`] 只负责写入与关闭。
///
/// ## 架构定位（Architecture）
/// - 出站状态（队列、在途标记、状态机）放在 `Shared` 的互斥锁内，供两类调用方共享；
/// - 解码器与处理器表只由 reactor 线程访问，天然无需加锁；
/// - 分发处理器时不持有互斥锁，处理器内部可以安全地调用 `ConnectionHandle::send`。
///
/// ## 契约（What）
/// - 进入 `Closing` 时立即清空排队缓冲并调用一次 `ByteStream::close`；
/// - 在途的读与写都完成后进入 `Closed`，此时本连接租借的缓冲已全部归还；
/// - `on_close` 处理器在进入 `Closed` 后由泵循环触发，恰好一次；
/// - 连接离开 `Open` 后不再分发任何报文。
///
/// ## 风险提示（Trade-offs）
/// - 同一报文类型只保留最后一次注册的处理器；
/// - 丢弃 `Connection` 会以 `LocalShutdown` 关闭连接，但已注册的 `on_close` 不会再被触发。
pub struct Connection {
    shared: Arc<Shared>,
    decoder: InboundDecoder,
    handlers: HashMap<u8, PacketHandler>,
    fallback: Option<PacketHandler>,
    close_handlers: Vec<CloseHandler>,
    close_notified: bool,
}

/// 供生产者线程使用的连接句柄。
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

struct Shared {
    id: String,
    pool: BufferPool,
    stream: Box<dyn ByteStream>,
    config: TransportConfig,
    high_water: HighWaterMark,
    core: Mutex<Core>,
}

struct Core {
    state: ConnectionState,
    queue: OutboundQueue,
    read_in_flight: bool,
    close_reason: Option<CloseReason>,
}

impl Core {
    /// 进入 `Closing`；返回值表示调用方是否需要关闭底层流。
    fn begin_close(&mut self, id: &str, reason: CloseReason) -> bool {
        if self.state != ConnectionState::Open {
            return false;
        }
        let drained = self.queue.drain();
        debug!(conn_id = id, reason = %reason, drained, "connection closing");
        self.state = ConnectionState::Closing;
        self.close_reason = Some(reason);
        self.try_finalize(id);
        true
    }

    fn try_finalize(&mut self, id: &str) {
        if self.state == ConnectionState::Closing
            && !self.queue.is_write_in_flight()
            && !self.read_in_flight
        {
            self.state = ConnectionState::Closed;
            debug!(conn_id = id, "connection closed");
        }
    }

    fn closed_error(&self) -> TransportError {
        TransportError::Closed {
            reason: self
                .close_reason
                .clone()
                .unwrap_or(CloseReason::LocalShutdown),
        }
    }
}

impl Shared {
    fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        {
            let core = self.core.lock();
            if core.state != ConnectionState::Open {
                return Err(core.closed_error());
            }
        }
        if data.is_empty() {
            return Ok(());
        }

        let staged = StagedWrite::stage(&self.pool, data);
        let mut core = self.core.lock();
        if core.state != ConnectionState::Open {
            return Err(core.closed_error());
        }
        if let Err(trip) = self.high_water.check(core.queue.pending_bytes()) {
            warn!(
                conn_id = %self.id,
                pending = trip.pending,
                limit = trip.limit,
                discarded = staged.len(),
                "outbound backlog exceeded high-water mark, closing connection"
            );
            let reason = CloseReason::Backpressure {
                pending: trip.pending,
                limit: trip.limit,
            };
            let close_stream = core.begin_close(&self.id, reason);
            drop(core);
            drop(staged);
            if close_stream {
                self.stream.close();
            }
            return Ok(());
        }

        core.queue.push(staged);
        let next = core.queue.start_next();
        drop(core);
        if let Some(buffer) = next {
            self.issue_write(buffer);
        }
        Ok(())
    }

    fn close_with(&self, reason: CloseReason) {
        let close_stream = self.core.lock().begin_close(&self.id, reason);
        if close_stream {
            self.stream.close();
        }
    }

    fn issue_write(&self, buffer: PooledBuffer) {
        trace!(conn_id = %self.id, buffer_id = buffer.id(), len = buffer.len(), "write issued");
        self.stream.async_write(buffer);
    }

    fn on_write_complete(&self, buffer: PooledBuffer, result: io::Result<usize>) {
        let mut core = self.core.lock();
        let was_open = core.state == ConnectionState::Open;
        let mut close_stream = false;
        match core.queue.complete(buffer, result) {
            Ok(()) => {
                trace!(conn_id = %self.id, pending = core.queue.pending_bytes(), "write completed");
            }
            Err(err) if was_open => {
                warn!(conn_id = %self.id, error = %err, "write failed, closing connection");
                close_stream = core.begin_close(&self.id, CloseReason::from_io(WRITE, &err));
            }
            Err(err) => {
                trace!(conn_id = %self.id, error = %err, "write abandoned during close");
            }
        }
        let next = if core.state == ConnectionState::Open {
            core.queue.start_next()
        } else {
            None
        };
        core.try_finalize(&self.id);
        drop(core);

        if close_stream {
            self.stream.close();
        }
        if let Some(buffer) = next {
            self.issue_write(buffer);
        }
    }
}

impl Connection {
    /// 以外部字节流、共享缓冲池与配置创建连接。
    ///
    /// 缓冲池的单块容量必须与 `config.buffer_capacity_bytes` 一致。
    pub fn new(
        stream: impl ByteStream,
        pool: BufferPool,
        config: TransportConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if pool.buffer_capacity() != config.buffer_capacity_bytes {
            return Err(ConfigError::PoolCapacityMismatch {
                pool: pool.buffer_capacity(),
                configured: config.buffer_capacity_bytes,
            });
        }
        let decoder = InboundDecoder::with_max_packet(config.max_packet_bytes)?;
        let id = stream.id().into_owned();
        debug!(conn_id = %id, "connection open");

        Ok(Self {
            shared: Arc::new(Shared {
                id,
                pool,
                stream: Box::new(stream),
                high_water: HighWaterMark::new(config.high_water_mark_bytes),
                config,
                core: Mutex::new(Core {
                    state: ConnectionState::Open,
                    queue: OutboundQueue::new(),
                    read_in_flight: false,
                    close_reason: None,
                }),
            }),
            decoder,
            handlers: HashMap::new(),
            fallback: None,
            close_handlers: Vec::new(),
            close_notified: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    pub fn pool(&self) -> &BufferPool {
        &self.shared.pool
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.core.lock().state
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.core.lock().close_reason.clone()
    }

    pub fn pending_bytes(&self) -> usize {
        self.shared.core.lock().queue.pending_bytes()
    }

    /// 入站暂存区中尚未分发的字节数。
    pub fn buffered_inbound(&self) -> usize {
        self.decoder.buffered()
    }

    /// 写入字节，见 [`ConnectionHandle::send`]。
    pub fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        self.shared.send(data)
    }

    /// 封帧后写入，见 [`ConnectionHandle::send_packet`]。
    pub fn send_packet(&self, packet_type: u8, payload: &[u8]) -> Result<(), TransportError> {
        let frame = encode_packet(packet_type, payload, self.shared.config.max_packet_bytes)?;
        self.shared.send(&frame)
    }

    /// 主动关闭连接；重复调用无副作用。
    pub fn shutdown(&self) {
        self.shared.close_with(CloseReason::LocalShutdown);
    }

    /// 注册某一报文类型的处理器，替换同类型的旧处理器。
    pub fn on_packet<F>(&mut self, packet_type: u8, handler: F)
    where
        F: FnMut(&Packet) + Send + 'static,
    {
        self.handlers.insert(packet_type, Box::new(handler));
    }

    /// 注册兜底处理器，接收没有专属处理器的报文。
    pub fn on_unhandled<F>(&mut self, handler: F)
    where
        F: FnMut(&Packet) + Send + 'static,
    {
        self.fallback = Some(Box::new(handler));
    }

    /// 注册关闭观察者；连接已关闭并通知过时立即调用。
    pub fn on_close<F>(&mut self, handler: F)
    where
        F: FnOnce(&CloseReason) + Send + 'static,
    {
        if self.close_notified {
            let reason = self.close_reason().unwrap_or(CloseReason::LocalShutdown);
            handler(&reason);
        } else {
            self.close_handlers.push(Box::new(handler));
        }
    }

    /// 确保有一个读操作在途，读取长度不超过解码器剩余空间。
    pub(crate) fn ensure_read(&mut self) {
        let spare = self.decoder.spare_capacity();
        if spare == 0 {
            return;
        }
        {
            let mut core = self.shared.core.lock();
            if core.state != ConnectionState::Open || core.read_in_flight {
                return;
            }
            core.read_in_flight = true;
        }
        trace!(conn_id = %self.shared.id, max_len = spare, "read issued");
        self.shared.stream.async_read(spare);
    }

    pub(crate) fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Write { buffer, result } => self.shared.on_write_complete(buffer, result),
            Completion::Read { result } => self.on_read_complete(result),
        }
    }

    fn on_read_complete(&mut self, result: io::Result<Bytes>) {
        {
            let mut core = self.shared.core.lock();
            core.read_in_flight = false;
            if core.state != ConnectionState::Open {
                core.try_finalize(&self.shared.id);
                return;
            }
        }
        match result {
            Ok(bytes) if bytes.is_empty() => {
                debug!(conn_id = %self.shared.id, "peer closed the stream");
                self.shared.close_with(CloseReason::PeerClosed);
            }
            Ok(bytes) => {
                let accepted = self.decoder.absorb(&bytes);
                trace!(conn_id = %self.shared.id, len = bytes.len(), "read completed");
                if accepted < bytes.len() {
                    let err = io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!(
                            "read delivered {} bytes but only {accepted} fit the inbound buffer",
                            bytes.len()
                        ),
                    );
                    warn!(conn_id = %self.shared.id, error = %err, "read overran request, closing connection");
                    self.shared.close_with(CloseReason::from_io(READ, &err));
                }
            }
            Err(err) => {
                warn!(conn_id = %self.shared.id, error = %err, "read failed, closing connection");
                self.shared.close_with(CloseReason::from_io(READ, &err));
            }
        }
    }

    /// 分发暂存区中已完整到达的报文；分发到边界报文时停止并返回 `true`。
    pub(crate) fn dispatch_buffered(&mut self) -> bool {
        let boundary = self.shared.config.boundary_packet_type;
        while self.state() == ConnectionState::Open {
            match self.decoder.decode_next() {
                Ok(Some(packet)) => {
                    let packet_type = packet.packet_type();
                    self.dispatch(&packet);
                    if packet_type == boundary {
                        return true;
                    }
                }
                Ok(None) => return false,
                Err(err) => {
                    warn!(conn_id = %self.shared.id, error = %err, "protocol violation, closing connection");
                    self.shared.close_with(CloseReason::Protocol(err));
                    return false;
                }
            }
        }
        false
    }

    fn dispatch(&mut self, packet: &Packet) {
        trace!(
            conn_id = %self.shared.id,
            packet_type = packet.packet_type(),
            size = packet.size(),
            "dispatching packet"
        );
        if let Some(handler) = self.handlers.get_mut(&packet.packet_type()) {
            handler(packet);
        } else if let Some(fallback) = self.fallback.as_mut() {
            fallback(packet);
        }
    }

    /// 连接进入 `Closed` 后恰好一次地通知关闭观察者。
    pub(crate) fn notify_closed(&mut self) {
        if self.close_notified {
            return;
        }
        let reason = {
            let core = self.shared.core.lock();
            if core.state != ConnectionState::Closed {
                return;
            }
            core.close_reason.clone().unwrap_or(CloseReason::LocalShutdown)
        };
        self.close_notified = true;
        for handler in self.close_handlers.drain(..) {
            handler(&reason);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.close_with(CloseReason::LocalShutdown);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("buffered_inbound", &self.decoder.buffered())
            .field("handlers", &self.handlers.len())
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// 写入字节。
    ///
    /// # 契约（What）
    /// - 连接不处于 `Open` 时立即返回 [`TransportError::Closed`]；
    /// - 入队前积压已超过高水位线时，本次写入与全部排队数据一起被丢弃，连接转入关闭，
    ///   返回 `Ok(())`：关闭本身就是信号；
    /// - 多个线程并发调用时，字节按各调用进入互斥锁的顺序到达对端，单次调用的字节不会被拆散。
    pub fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        self.shared.send(data)
    }

    /// 以 `encode_packet` 封帧后写入；帧长超过 `max_packet_bytes` 时返回协议错误。
    pub fn send_packet(&self, packet_type: u8, payload: &[u8]) -> Result<(), TransportError> {
        let frame = encode_packet(packet_type, payload, self.shared.config.max_packet_bytes)?;
        self.shared.send(&frame)
    }

    /// 主动关闭连接；重复调用无副作用。
    pub fn shutdown(&self) {
        self.shared.close_with(CloseReason::LocalShutdown);
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.core.lock().state
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.core.lock().close_reason.clone()
    }

    pub fn pending_bytes(&self) -> usize {
        self.shared.core.lock().queue.pending_bytes()
    }

    pub fn high_water_mark(&self) -> usize {
        self.shared.high_water.limit()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}
