// src/error.rs

use thiserror::Error;

/// 整个交换服务共用的 Result 别名
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// 竞价数据交换的错误分类
///
/// - `InvalidArgument`：会话不匹配、坐标方不在白名单、竞价服务端返回的业务错误等
/// - `Timeout`：整体超时（解密+校验+落库未在限定时间内完成）
/// - `Decryption`：密文/密钥不匹配。对调用方表现为 invalid-argument，但单独记录日志
/// - `Internal`：编解码、序列化等内部故障
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("decryption failure: {0}")]
    Decryption(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ExchangeError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// 对外暴露的状态码（HTTP 语义）
    ///
    /// 解密失败按 invalid-argument 上报，避免向调用方泄露密钥状态。
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidArgument(_) | Self::Decryption(_) => 400,
            Self::Timeout(_) => 504,
            Self::Internal(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decryption_failure_maps_to_invalid_argument_status() {
        assert_eq!(ExchangeError::Decryption("bad seal".into()).status_code(), 400);
        assert_eq!(
            ExchangeError::InvalidArgument("mismatch".into()).status_code(),
            400
        );
    }

    #[test]
    fn timeout_and_internal_have_distinct_statuses() {
        assert_eq!(ExchangeError::Timeout("overall".into()).status_code(), 504);
        assert_eq!(ExchangeError::Internal("codec".into()).status_code(), 500);
    }
}
