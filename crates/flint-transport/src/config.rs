use flint_buffer::{BufferPool, DEFAULT_BUFFER_CAPACITY};
use flint_codec_packet::{DEFAULT_MAX_PACKET_BYTES, InboundDecoder};
use serde::Deserialize;

use crate::error::ConfigError;

/// 默认高水位线（字节）：约 20 块默认容量的缓冲。
pub const DEFAULT_HIGH_WATER_MARK_BYTES: usize = 160_000;

/// 默认的 tick 边界报文类型。
pub const DEFAULT_BOUNDARY_PACKET_TYPE: u8 = 0;

/// 传输层配置。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 把“单块缓冲多大、单包上限多大、积压到多少就断开慢连接、哪个报文结束一个 tick”
///   这四个决定集中在一处，连接与泵循环只读取、不自行假设；
/// - 支持从配置文档反序列化，缺省字段自动回落到默认值。
///
/// ## 契约（What）
/// - `buffer_capacity_bytes`：出站缓冲块容量，默认 8000；
/// - `max_packet_bytes`：入站单包上限（含报文头），默认 1024，须位于 `[3, 65535]`；
/// - `high_water_mark_bytes`：未刷出字节的上限，默认 160000，超过后下一次写入将断开连接；
/// - `boundary_packet_type`：结束一个 tick 的报文类型，默认 0；
/// - **后置条件**：[`TransportConfig::validate`] 通过后，上述取值可安全用于构建池与解码器。
///
/// ## 注意事项（Trade-offs）
/// - 高水位线以字节计，不区分在途与排队中的数据；
/// - 缓冲容量需与注入连接的 [`BufferPool`] 一致，否则构造连接时会被拒绝。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    pub buffer_capacity_bytes: usize,
    pub max_packet_bytes: usize,
    pub high_water_mark_bytes: usize,
    pub boundary_packet_type: u8,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            buffer_capacity_bytes: DEFAULT_BUFFER_CAPACITY,
            max_packet_bytes: DEFAULT_MAX_PACKET_BYTES,
            high_water_mark_bytes: DEFAULT_HIGH_WATER_MARK_BYTES,
            boundary_packet_type: DEFAULT_BOUNDARY_PACKET_TYPE,
        }
    }
}

impl TransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffer_capacity(mut self, bytes: usize) -> Self {
        self.buffer_capacity_bytes = bytes;
        self
    }

    pub fn with_max_packet(mut self, bytes: usize) -> Self {
        self.max_packet_bytes = bytes;
        self
    }

    pub fn with_high_water_mark(mut self, bytes: usize) -> Self {
        self.high_water_mark_bytes = bytes;
        self
    }

    pub fn with_boundary_packet_type(mut self, packet_type: u8) -> Self {
        self.boundary_packet_type = packet_type;
        self
    }

    /// 从 TOML 片段解析并校验配置。
    ///
    /// ```
    /// let config = flint_transport::TransportConfig::from_toml_str(
    ///     "max_packet_bytes = 2048\nboundary_packet_type = 7",
    /// )
    /// .unwrap();
    /// assert_eq!(config.max_packet_bytes, 2048);
    /// assert_eq!(config.buffer_capacity_bytes, 8000);
    /// ```
    pub fn from_toml_str(document: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// 校验取值范围。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_capacity_bytes == 0 {
            return Err(ConfigError::ZeroBufferCapacity);
        }
        if self.high_water_mark_bytes == 0 {
            return Err(ConfigError::ZeroHighWaterMark);
        }
        InboundDecoder::with_max_packet(self.max_packet_bytes)?;
        Ok(())
    }

    /// 按配置创建缓冲池；多个连接可共享同一个池。
    pub fn build_pool(&self) -> Result<BufferPool, ConfigError> {
        self.validate()?;
        Ok(BufferPool::with_capacity(self.buffer_capacity_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = TransportConfig::default();
        assert_eq!(config.buffer_capacity_bytes, 8000);
        assert_eq!(config.max_packet_bytes, 1024);
        assert_eq!(config.high_water_mark_bytes, 160_000);
        assert_eq!(config.boundary_packet_type, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_fields_fall_back_to_defaults() {
        let config =
            TransportConfig::from_toml_str("high_water_mark_bytes = 4096").expect("valid document");
        assert_eq!(config.high_water_mark_bytes, 4096);
        assert_eq!(config.max_packet_bytes, 1024);
    }

    #[test]
    fn unknown_toml_field_is_rejected() {
        let err = TransportConfig::from_toml_str("buffer_size = 1").expect_err("unknown field");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(matches!(
            TransportConfig::new().with_buffer_capacity(0).validate(),
            Err(ConfigError::ZeroBufferCapacity)
        ));
        assert!(matches!(
            TransportConfig::new().with_high_water_mark(0).validate(),
            Err(ConfigError::ZeroHighWaterMark)
        ));
        assert!(matches!(
            TransportConfig::new().with_max_packet(2).validate(),
            Err(ConfigError::PacketLimit(_))
        ));
    }

    #[test]
    fn build_pool_uses_configured_capacity() {
        let pool = TransportConfig::new()
            .with_buffer_capacity(512)
            .build_pool()
            .expect("valid config");
        assert_eq!(pool.buffer_capacity(), 512);
    }
}
