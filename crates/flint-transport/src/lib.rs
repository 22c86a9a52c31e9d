//! # flint-transport
//!
//! ## 教案目的（Why）
//! - 在池化缓冲与长度前缀解码之上，提供一条完整的缓冲式异步套接字传输：
//!   出站写请求合并为定长缓冲链并保持单飞写入，入站字节重组为报文并按类型分发；
//! - 让同步调用方以 [`PumpLoop::run_one_tick`] 每次推进一个协议“帧”，
//!   不必为网络单独开线程，也不必进入异步上下文。
//!
//! ## 模块划分（How）
//! - `outbound`：[`OutboundQueue`] 与锁外拷贝的 [`StagedWrite`]；
//! - `connection`：[`Connection`]（reactor 侧）与 [`ConnectionHandle`]（生产者侧），
//!   负责背压、单向关闭与报文分发；
//! - `pump`：[`PumpLoop`]，以非阻塞的 [`Reactor::poll_one`] 驱动连接；
//! - `stream`：外部协作者接口 [`ByteStream`]、[`Reactor`] 与 [`Completion`]；
//! - `tokio_stream`（特性 `runtime-tokio`）：基于 Tokio `TcpStream` 的实现；
//! - [`test_stubs`]：脚本化的内存字节流，供测试驱动完成时机与故障注入。
//!
//! ## 契约（What）
//! - 字节按 `send` 调用进入连接互斥锁的顺序到达对端；
//! - 同一连接任意时刻至多一个写在途；
//! - 背压、协议违例与 I/O 故障都只表现为连接单向关闭，关闭完成时租借的缓冲全部归还。
//!
//! ## 风险与注意（Trade-offs）
//! - 本 crate 只发出 `tracing` 事件，从不安装订阅者；
//! - 超时策略属于外部 reactor，本 crate 不设置任何计时器。

mod backpressure;
mod config;
mod connection;
mod error;
mod outbound;
mod pump;
mod stream;
pub mod test_stubs;
#[cfg(feature = "runtime-tokio")]
mod tokio_stream;

pub use config::{DEFAULT_BOUNDARY_PACKET_TYPE, DEFAULT_HIGH_WATER_MARK_BYTES, TransportConfig};
pub use connection::{Connection, ConnectionHandle, ConnectionState};
pub use error::{CloseReason, ConfigError, OperationKind, TransportError, aborted_error};
pub use flint_buffer::{BufferPool, PoolStats, PooledBuffer};
pub use flint_codec_packet::{Packet, PacketError};
pub use outbound::{OutboundQueue, StagedWrite};
pub use pump::{PumpLoop, PumpPhase};
pub use stream::{ByteStream, Completion, Reactor};
#[cfg(feature = "runtime-tokio")]
pub use tokio_stream::{TcpSocketConfig, TokioReactor, TokioStream, connect, from_tcp_stream};
