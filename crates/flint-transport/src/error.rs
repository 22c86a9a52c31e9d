use std::io;

use flint_codec_packet::PacketError;
use thiserror::Error;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

#[cfg_attr(not(feature = "runtime-tokio"), allow(dead_code))]
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "flint.transport.connect_failed",
    message: "stream connect",
};
#[cfg_attr(not(feature = "runtime-tokio"), allow(dead_code))]
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "flint.transport.configure_failed",
    message: "socket configure",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "flint.transport.read_failed",
    message: "stream read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "flint.transport.write_failed",
    message: "stream write",
};

const CLOSED_CODE: &str = "flint.transport.closed";
const PROTOCOL_CODE: &str = "flint.transport.protocol_violation";
const CONFIG_CODE: &str = "flint.transport.invalid_config";
const RUNTIME_CODE: &str = "flint.transport.runtime_unavailable";

/// 连接进入关闭流程的原因。
///
/// # 契约（What）
/// - 每条连接至多记录一个原因：第一个触发关闭的条件胜出，后续条件被忽略；
/// - 所有原因都是单向的：不存在“降级后恢复”的路径；
/// - `Io` 只保存错误种类与文案，便于在多个观察者之间克隆分发。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CloseReason {
    #[error("connection shut down locally")]
    LocalShutdown,
    #[error("peer closed the stream")]
    PeerClosed,
    #[error("protocol violation: {0}")]
    Protocol(#[from] PacketError),
    #[error("outbound backlog of {pending} bytes exceeded the {limit}-byte high-water mark")]
    Backpressure { pending: usize, limit: usize },
    #[error("{}: {message}", .op.message)]
    Io {
        op: OperationKind,
        kind: io::ErrorKind,
        message: String,
    },
}

impl CloseReason {
    pub(crate) fn from_io(op: OperationKind, error: &io::Error) -> Self {
        Self::Io {
            op,
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    /// 稳定错误码，供日志与告警聚合使用。
    pub fn code(&self) -> &'static str {
        match self {
            Self::LocalShutdown => "flint.transport.local_shutdown",
            Self::PeerClosed => "flint.transport.peer_closed",
            Self::Protocol(_) => PROTOCOL_CODE,
            Self::Backpressure { .. } => "flint.transport.backpressure_exceeded",
            Self::Io { op, .. } => op.code,
        }
    }

    /// 是否由本端主动发起（而非对端或故障导致）。
    pub fn is_local(&self) -> bool {
        matches!(self, Self::LocalShutdown)
    }
}

/// 配置校验错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("buffer capacity must be positive")]
    ZeroBufferCapacity,
    #[error("high-water mark must be positive")]
    ZeroHighWaterMark,
    #[error("invalid packet limit: {0}")]
    PacketLimit(#[from] PacketError),
    #[error("pool hands out {pool}-byte buffers but the configuration expects {configured}")]
    PoolCapacityMismatch { pool: usize, configured: usize },
    #[error("malformed configuration document: {0}")]
    Parse(#[from] toml::de::Error),
}

/// 传输层对调用方暴露的错误。
///
/// 背压与 I/O 故障不会以该错误返回给 `send`：它们表现为连接关闭，
/// 之后的 `send` 才会收到 [`TransportError::Closed`]。
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection is closed: {reason}")]
    Closed { reason: CloseReason },
    #[error(transparent)]
    Protocol(#[from] PacketError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{}: {source}", .op.message)]
    Io {
        op: OperationKind,
        #[source]
        source: io::Error,
    },
    #[error("tokio runtime unavailable: {0}")]
    Runtime(String),
}

impl TransportError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::Closed { .. } => CLOSED_CODE,
            Self::Protocol(_) => PROTOCOL_CODE,
            Self::Config(_) => CONFIG_CODE,
            Self::Io { op, .. } => op.code,
            Self::Runtime(_) => RUNTIME_CODE,
        }
    }

    /// 若为关闭错误，返回关闭原因。
    pub fn close_reason(&self) -> Option<&CloseReason> {
        match self {
            Self::Closed { reason } => Some(reason),
            _ => None,
        }
    }
}

/// 将 IO 错误映射为传输错误，并附带操作种类。
#[cfg_attr(not(feature = "runtime-tokio"), allow(dead_code))]
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> TransportError {
    TransportError::Io {
        op: kind,
        source: error,
    }
}

/// 构造“操作因连接关闭而中止”的错误，供流实现完成被取消的读写。
pub fn aborted_error(kind: OperationKind) -> io::Error {
    io::Error::new(
        io::ErrorKind::ConnectionAborted,
        format!("{} aborted by close", kind.message),
    )
}

pub(crate) fn short_write_error(written: usize, expected: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::WriteZero,
        format!("short write: {written} of {expected} bytes"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_close_reason_keeps_operation_code() {
        let error = io::Error::new(io::ErrorKind::BrokenPipe, "pipe gone");
        let reason = CloseReason::from_io(WRITE, &error);
        assert_eq!(reason.code(), "flint.transport.write_failed");
        assert_eq!(reason.to_string(), "stream write: pipe gone");
        assert!(!reason.is_local());
    }

    #[test]
    fn closed_error_exposes_reason() {
        let err = TransportError::Closed {
            reason: CloseReason::PeerClosed,
        };
        assert_eq!(err.code(), "flint.transport.closed");
        assert_eq!(err.close_reason(), Some(&CloseReason::PeerClosed));
    }

    #[test]
    fn protocol_reason_wraps_packet_error() {
        let reason = CloseReason::from(PacketError::UndersizedPacket { size: 1 });
        assert_eq!(reason.code(), "flint.transport.protocol_violation");
        assert!(reason.to_string().starts_with("protocol violation"));
    }
}
