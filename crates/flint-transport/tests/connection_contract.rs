//! `connection_contract` 集成测试：以外部 crate 视角验证连接与泵循环的契约。
//!
//! # 测试目标（Why）
//! - 守恒与顺序：任意写入序列到达对端的字节与调用顺序一致；
//! - 无泄漏：连接关闭后缓冲池回到创建前的状态；
//! - 合并、背压、边界 tick、违例报文头与 I/O 故障各自的可观察行为。
//!
//! # 手法（How）
//! - 使用 `test_stubs::MemoryStream` 脚本化写完成与入站字节，完成事件经由 `MemoryReactor` 取出；
//! - 守恒性质以 proptest 随机生成写入序列与写完成节奏。

use std::{
    io,
    sync::{
        Arc, Barrier, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use flint_codec_packet::encode_packet;
use flint_transport::{
    BufferPool, CloseReason, Connection, ConnectionState, PumpLoop, TransportConfig,
    TransportError,
    test_stubs::{MemoryReactor, MemoryStream},
};
use proptest::prelude::*;

const PACKET_A: u8 = 7;
const BOUNDARY: u8 = 0;

fn open_pump_with(
    config: TransportConfig,
    pool: BufferPool,
) -> (PumpLoop<MemoryReactor>, MemoryStream) {
    let (stream, reactor) = MemoryStream::pair("mem-contract");
    let connection = Connection::new(stream.clone(), pool, config).expect("valid config");
    (PumpLoop::new(connection, reactor), stream)
}

fn open_pump(config: TransportConfig) -> (PumpLoop<MemoryReactor>, MemoryStream) {
    let pool = config.build_pool().expect("valid config");
    open_pump_with(config, pool)
}

fn frame(packet_type: u8, payload: &[u8]) -> Vec<u8> {
    encode_packet(packet_type, payload, 1024)
        .expect("test frame fits")
        .to_vec()
}

/// 依次运行 tick，直到 reactor 无事可做且连接不再变化。
fn settle(pump: &mut PumpLoop<MemoryReactor>) {
    for _ in 0..1024 {
        let before = pump.connection().pending_bytes();
        pump.run_one_tick();
        if pump.connection().pending_bytes() == before {
            return;
        }
    }
}

proptest! {
    #[test]
    fn writes_arrive_complete_and_in_call_order(
        writes in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..300), 0..24),
        completions_between in prop::collection::vec(0usize..3, 24),
    ) {
        let config = TransportConfig::new()
            .with_buffer_capacity(64)
            .with_high_water_mark(usize::MAX / 2);
        let (mut pump, stream) = open_pump(config);
        stream.set_auto_complete(false);
        let handle = pump.handle();

        for (index, payload) in writes.iter().enumerate() {
            handle.send(payload).expect("connection stays open");
            for _ in 0..completions_between[index] {
                stream.complete_next_write();
                pump.run_one_tick();
            }
        }
        while stream.complete_next_write() {
            pump.run_one_tick();
        }
        pump.run_one_tick();

        let expected: Vec<u8> = writes.concat();
        prop_assert_eq!(stream.written(), expected);
        prop_assert!(stream.max_active_writes() <= 1, "单飞：同一时刻至多一个写在途");
        prop_assert!(stream.write_sizes().iter().all(|&size| size <= 64));
        prop_assert_eq!(handle.pending_bytes(), 0);
    }
}

#[test]
fn concurrent_producers_keep_each_write_contiguous() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 50;

    let config = TransportConfig::new()
        .with_buffer_capacity(32)
        .with_high_water_mark(usize::MAX / 2);
    let (mut pump, stream) = open_pump(config);
    let handle = pump.handle();

    thread::scope(|scope| {
        for worker in 0..THREADS {
            let handle = handle.clone();
            scope.spawn(move || {
                for _ in 0..ROUNDS {
                    handle
                        .send(&[worker as u8; 10])
                        .expect("connection stays open");
                }
            });
        }
    });
    settle(&mut pump);

    let written = stream.written();
    assert_eq!(written.len(), THREADS * ROUNDS * 10);
    for record in written.chunks(10) {
        assert!(
            record.iter().all(|byte| *byte == record[0]),
            "单次 send 的字节不得被其他生产者插入"
        );
    }
    assert!(stream.max_active_writes() <= 1);
}

/// 生产者线程持续 `send` 的同时，本线程不断 `run_one_tick` 处理写完成并发起下一次写。
#[test]
fn producers_and_reactor_interleave_without_tearing_writes() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 2000;
    const RECORD: usize = 10;

    let config = TransportConfig::new()
        .with_buffer_capacity(32)
        .with_high_water_mark(usize::MAX / 2);
    let (mut pump, stream) = open_pump(config);
    let pool = pump.connection().pool().clone();
    let handle = pump.handle();
    let barrier = Barrier::new(THREADS + 1);
    let finished = AtomicUsize::new(0);

    thread::scope(|scope| {
        for worker in 0..THREADS {
            let handle = handle.clone();
            let barrier = &barrier;
            let finished = &finished;
            scope.spawn(move || {
                barrier.wait();
                for _ in 0..ROUNDS {
                    handle
                        .send(&[worker as u8 + 1; RECORD])
                        .expect("connection stays open");
                }
                finished.fetch_add(1, Ordering::Release);
            });
        }

        barrier.wait();
        while finished.load(Ordering::Acquire) < THREADS {
            pump.run_one_tick();
            thread::yield_now();
        }
    });
    settle(&mut pump);

    let written = stream.written();
    assert_eq!(written.len(), THREADS * ROUNDS * RECORD);
    let mut per_worker = [0usize; THREADS];
    for record in written.chunks(RECORD) {
        assert!(
            record.iter().all(|byte| *byte == record[0]),
            "单次 send 的字节不得被其他生产者插入"
        );
        per_worker[usize::from(record[0]) - 1] += 1;
    }
    assert_eq!(per_worker, [ROUNDS; THREADS]);
    assert!(stream.max_active_writes() <= 1, "单飞：同一时刻至多一个写在途");
    assert_eq!(handle.pending_bytes(), 0);

    drop(handle);
    drop(pump);
    assert_eq!(pool.stats().leased, 0);
}

#[test]
fn closing_returns_every_buffer_to_the_pool() {
    let config = TransportConfig::new().with_buffer_capacity(16);
    let pool = config.build_pool().expect("valid config");
    {
        let warm = pool.acquire();
        pool.release(warm);
    }
    let before = pool.stats();

    let (mut pump, stream) = open_pump_with(config, pool.clone());
    stream.set_auto_complete(false);
    pump.connection().send(&[1; 100]).expect("open");
    pump.connection().send(&[2; 5]).expect("open");
    assert!(pool.stats().leased > 0);

    pump.connection().shutdown();
    pump.run_one_tick();

    assert!(pump.is_closed());
    let after = pool.stats();
    assert_eq!(after.leased, 0);
    assert_eq!(after.available, after.allocated);
    assert!(after.available >= before.available);
}

#[test]
fn two_small_writes_share_one_pending_buffer() {
    let config = TransportConfig::new().with_buffer_capacity(64);
    let (mut pump, stream) = open_pump(config);
    stream.set_auto_complete(false);

    // 第一次写入立即成为在途写，后两次写入在待发链中合并。
    pump.connection().send(b"head").expect("open");
    pump.connection().send(&[b'a'; 20]).expect("open");
    pump.connection().send(&[b'b'; 44]).expect("open");

    assert!(stream.complete_next_write());
    pump.run_one_tick();
    assert!(stream.complete_next_write());
    pump.run_one_tick();
    assert_eq!(stream.write_sizes(), vec![4, 64]);
}

#[test]
fn writes_exceeding_capacity_use_two_buffers() {
    let config = TransportConfig::new().with_buffer_capacity(64);
    let (mut pump, stream) = open_pump(config);
    stream.set_auto_complete(false);

    pump.connection().send(b"head").expect("open");
    pump.connection().send(&[b'a'; 20]).expect("open");
    pump.connection().send(&[b'b'; 45]).expect("open");

    while stream.complete_next_write() {
        pump.run_one_tick();
    }
    assert_eq!(stream.write_sizes(), vec![4, 20, 45]);
}

#[test]
fn backpressure_trip_closes_and_releases_queued_buffers() {
    let config = TransportConfig::new()
        .with_buffer_capacity(100)
        .with_high_water_mark(250);
    let (mut pump, stream) = open_pump(config);
    stream.set_auto_complete(false);
    let handle = pump.handle();
    let pool = pump.connection().pool().clone();

    let mut accepted = 0;
    while handle.state() == ConnectionState::Open {
        handle.send(&[0xAB; 100]).expect("trip is not an error");
        accepted += 1;
        assert!(accepted < 10, "高水位线必须在有限次写入后触发");
    }
    assert_eq!(accepted, 4, "积压 300 字节时第 4 次写入触发断开");
    assert_eq!(
        handle.close_reason(),
        Some(CloseReason::Backpressure {
            pending: 300,
            limit: 250
        })
    );
    assert_eq!(pool.stats().leased, 1, "只剩在途缓冲等待中止完成");

    let reason = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&reason);
    pump.connection_mut().on_close(move |why| {
        *sink.lock().expect("test mutex") = Some(why.clone());
    });
    pump.run_one_tick();

    assert!(pump.is_closed());
    assert_eq!(pool.stats().leased, 0);
    assert!(matches!(
        *reason.lock().expect("test mutex"),
        Some(CloseReason::Backpressure { .. })
    ));
    assert!(matches!(
        handle.send(b"late"),
        Err(TransportError::Closed { .. })
    ));
}

#[test]
fn boundary_packet_ends_the_tick() {
    let (mut pump, stream) =
        open_pump(TransportConfig::new().with_boundary_packet_type(BOUNDARY));
    let seen = Arc::new(Mutex::new(Vec::new()));
    for packet_type in [PACKET_A, BOUNDARY] {
        let sink = Arc::clone(&seen);
        pump.connection_mut().on_packet(packet_type, move |packet| {
            sink.lock().expect("test mutex").push((
                packet.packet_type(),
                packet.payload().to_vec(),
            ));
        });
    }

    let mut wire = frame(PACKET_A, b"one");
    wire.extend(frame(PACKET_A, b"two"));
    wire.extend(frame(BOUNDARY, b""));
    wire.extend(frame(PACKET_A, b"four"));
    stream.push_inbound(&wire);

    assert!(pump.run_one_tick(), "首个 tick 以边界报文结束");
    assert_eq!(
        *seen.lock().expect("test mutex"),
        vec![
            (PACKET_A, b"one".to_vec()),
            (PACKET_A, b"two".to_vec()),
            (BOUNDARY, Vec::new()),
        ]
    );
    assert!(pump.connection().buffered_inbound() > 0, "第四个报文留待下一 tick");

    assert!(!pump.run_one_tick());
    let seen = seen.lock().expect("test mutex");
    assert_eq!(seen.len(), 4);
    assert_eq!(seen[3], (PACKET_A, b"four".to_vec()));
}

#[test]
fn malformed_header_closes_without_dispatch() {
    let (mut pump, stream) = open_pump(TransportConfig::default());
    let dispatched = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&dispatched);
    pump.connection_mut().on_unhandled(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    stream.push_inbound(&[0x00, 0x01, PACKET_A]);
    assert!(!pump.run_one_tick());

    assert_eq!(dispatched.load(Ordering::SeqCst), 0);
    assert!(pump.is_closed());
    assert!(matches!(
        pump.connection().close_reason(),
        Some(CloseReason::Protocol(_))
    ));
    assert!(stream.is_closed());
}

#[test]
fn peer_eof_closes_after_delivering_earlier_packets() {
    let (mut pump, stream) = open_pump(TransportConfig::default());
    let dispatched = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&dispatched);
    pump.connection_mut().on_packet(PACKET_A, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    stream.push_inbound(&frame(PACKET_A, b"bye"));
    stream.push_eof();
    pump.run_one_tick();
    pump.run_one_tick();

    assert_eq!(dispatched.load(Ordering::SeqCst), 1);
    assert!(pump.is_closed());
    assert_eq!(
        pump.connection().close_reason(),
        Some(CloseReason::PeerClosed)
    );
}

#[test]
fn read_error_drains_outbound_chain() {
    let config = TransportConfig::new().with_buffer_capacity(8);
    let (mut pump, stream) = open_pump(config);
    stream.set_auto_complete(false);
    pump.run_one_tick();
    pump.connection().send(&[5; 40]).expect("open");
    let pool = pump.connection().pool().clone();
    assert_eq!(pool.stats().leased, 5);

    assert!(stream.fail_pending_read(io::ErrorKind::ConnectionReset));
    pump.run_one_tick();

    assert!(pump.is_closed());
    assert_eq!(pool.stats().leased, 0);
    match pump.connection().close_reason() {
        Some(CloseReason::Io { kind, .. }) => assert_eq!(kind, io::ErrorKind::ConnectionReset),
        other => panic!("unexpected close reason: {other:?}"),
    }
}

#[test]
fn shutdown_is_idempotent_and_waits_for_in_flight_write() {
    let (mut pump, stream) = open_pump(TransportConfig::default());
    stream.set_auto_complete(false);
    let handle = pump.handle();
    handle.send(b"in flight").expect("open");
    assert_eq!(stream.outstanding_writes(), 1);

    // 没有 tick 处理中止完成之前，连接停留在 Closing。
    handle.shutdown();
    handle.shutdown();
    pump.connection().shutdown();
    assert_eq!(stream.close_calls(), 1);
    assert_eq!(handle.state(), ConnectionState::Closing);
    assert!(matches!(
        handle.send(b"rejected"),
        Err(TransportError::Closed {
            reason: CloseReason::LocalShutdown
        })
    ));

    let closes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closes);
    pump.connection_mut().on_close(move |reason| {
        assert!(reason.is_local());
        counter.fetch_add(1, Ordering::SeqCst);
    });
    pump.run_one_tick();
    pump.run_one_tick();

    assert_eq!(handle.state(), ConnectionState::Closed);
    assert_eq!(closes.load(Ordering::SeqCst), 1, "关闭观察者恰好触发一次");
    assert!(stream.written().is_empty());
}
