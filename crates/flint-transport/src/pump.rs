use crate::{
    connection::{Connection, ConnectionHandle, ConnectionState},
    stream::Reactor,
};

/// 泵循环所处阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PumpPhase {
    Idle,
    Draining,
}

/// 协作式泵循环：每次调用推进连接一个逻辑 tick。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 让同步调用方（例如逐帧驱动的主循环）每次只推进一个协议“帧”，无需为网络单独开线程；
/// - 以 [`Reactor::poll_one`] 的非阻塞单次轮询取代“轮询、重置、再试一次”的忙等写法。
///
/// ## 逻辑（How）
/// 1. 先分发上一 tick 遗留在暂存区的报文，遇到边界报文即结束本 tick；
/// 2. 确保有一个读在途，读长度不超过解码器剩余空间；
/// 3. 逐个处理完成事件，每处理一个就分发新到达的完整报文，
///    直到分发了边界报文或 reactor 暂无就绪事件；
/// 4. 连接已进入 `Closed` 时触发关闭观察者。
///
/// ## 契约（What）
/// - `run_one_tick` 永不阻塞；返回 `true` 表示本 tick 以边界报文结束；
/// - 边界报文之后的报文保留在暂存区，下一次调用时最先分发；
/// - 调用返回时阶段总是 `Idle`。
///
/// ## 风险提示（Trade-offs）
/// - 对端持续发送而从不发送边界报文时，单次调用会一直处理到 reactor 暂无就绪事件为止；
/// - 读长度受解码器剩余空间约束，因此边界之后积压的报文会抑制新的读取，直到被分发。
#[derive(Debug)]
pub struct PumpLoop<R> {
    connection: Connection,
    reactor: R,
    phase: PumpPhase,
}

impl<R: Reactor> PumpLoop<R> {
    pub fn new(connection: Connection, reactor: R) -> Self {
        Self {
            connection,
            reactor,
            phase: PumpPhase::Idle,
        }
    }

    /// 推进一个逻辑 tick，返回是否以边界报文结束。
    pub fn run_one_tick(&mut self) -> bool {
        self.phase = PumpPhase::Draining;
        let mut completed = self.connection.dispatch_buffered();
        while !completed {
            self.connection.ensure_read();
            let Some(completion) = self.reactor.poll_one() else {
                break;
            };
            self.connection.handle_completion(completion);
            completed = self.connection.dispatch_buffered();
        }
        self.connection.notify_closed();
        self.phase = PumpPhase::Idle;
        completed
    }

    pub fn phase(&self) -> PumpPhase {
        self.phase
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// 用于注册处理器等 reactor 侧操作。
    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.connection
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.connection.handle()
    }

    pub fn reactor_mut(&mut self) -> &mut R {
        &mut self.reactor
    }

    pub fn is_closed(&self) -> bool {
        self.connection.state() == ConnectionState::Closed
    }

    pub fn into_parts(self) -> (Connection, R) {
        (self.connection, self.reactor)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use flint_codec_packet::encode_packet;

    use super::*;
    use crate::{TransportConfig, test_stubs::MemoryStream};

    fn frame(packet_type: u8, payload: &[u8]) -> Vec<u8> {
        encode_packet(packet_type, payload, 1024)
            .expect("fits")
            .to_vec()
    }

    #[test]
    fn idle_tick_returns_without_blocking() {
        let (stream, reactor) = MemoryStream::pair("idle");
        let config = TransportConfig::default();
        let connection =
            Connection::new(stream.clone(), config.build_pool().expect("valid"), config)
                .expect("valid");
        let mut pump = PumpLoop::new(connection, reactor);
        assert!(!pump.run_one_tick());
        assert_eq!(pump.phase(), PumpPhase::Idle);
        assert_eq!(stream.pending_read(), Some(1024), "读长度等于解码器剩余空间");
    }

    #[test]
    fn packets_split_across_reads_are_reassembled_within_a_tick() {
        let (stream, reactor) = MemoryStream::pair("split");
        let config = TransportConfig::default();
        let connection =
            Connection::new(stream.clone(), config.build_pool().expect("valid"), config)
                .expect("valid");
        let mut pump = PumpLoop::new(connection, reactor);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        pump.connection_mut().on_packet(5, move |packet| {
            sink.lock()
                .expect("test mutex")
                .push(packet.payload().to_vec());
        });

        let mut wire = frame(5, b"hello");
        wire.extend(frame(0, b""));
        stream.set_read_chunk_limit(Some(2));
        stream.push_inbound(&wire);

        assert!(pump.run_one_tick());
        assert_eq!(*seen.lock().expect("test mutex"), vec![b"hello".to_vec()]);
    }
}
