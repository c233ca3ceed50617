//! 统一错误类型模块
//!
//! 提供 authguard 中所有操作的错误类型定义。
//!
//! 错误分为两类：
//!
//! - **调用方可见**: CSRF token 无效、速率限制超出、配置错误
//! - **仅内部可见**: 审计写入失败（[`SinkError`]），永远不会穿过公共边界

use std::time::Duration;
use thiserror::Error;

/// authguard 的统一结果类型
pub type Result<T> = std::result::Result<T, Error>;

/// authguard 的错误类型
#[derive(Debug, Error)]
pub enum Error {
    /// CSRF token 无效
    ///
    /// 缺失、过期、不匹配、记录损坏对调用方一律表现为此错误，
    /// 具体原因只记录在审计事件的 details 中。
    #[error("invalid CSRF token")]
    InvalidCsrfToken,

    /// 速率限制超出
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimitExceeded {
        /// 重试等待时间
        retry_after: Duration,
    },

    /// 配置错误
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// 加密错误
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// 验证错误
    #[error("validation error: {0}")]
    Validation(String),

    /// 内部错误
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// 创建一个内部错误
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// 创建一个验证错误
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// 创建一个速率限制错误
    pub fn rate_limited(retry_after: Duration) -> Self {
        Error::RateLimitExceeded { retry_after }
    }

    /// 是否为速率限制错误
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Error::RateLimitExceeded { .. })
    }
}

/// CSRF 校验失败的具体原因
///
/// 只用于审计记录和内部日志，对外统一映射为 [`Error::InvalidCsrfToken`]。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum CsrfFailure {
    /// 请求未携带 token
    #[error("token missing")]
    MissingToken,
    /// Session 中没有对应的记录
    #[error("session record missing")]
    MissingRecord,
    /// 记录已过期
    #[error("token expired")]
    Expired,
    /// 哈希不匹配
    #[error("token mismatch")]
    Mismatch,
    /// 记录无法解码或签名无效
    #[error("session record malformed")]
    MalformedRecord,
}

impl CsrfFailure {
    /// 用于审计 details 的稳定标识
    pub fn as_str(&self) -> &'static str {
        match self {
            CsrfFailure::MissingToken => "token_missing",
            CsrfFailure::MissingRecord => "record_missing",
            CsrfFailure::Expired => "token_expired",
            CsrfFailure::Mismatch => "token_mismatch",
            CsrfFailure::MalformedRecord => "record_malformed",
        }
    }
}

impl From<CsrfFailure> for Error {
    fn from(_: CsrfFailure) -> Self {
        Error::InvalidCsrfToken
    }
}

/// 审计事件写入失败
///
/// 由 [`crate::audit::SecurityAudit`] 在内部捕获，从不返回给调用方。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// 目标存储不可用
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
    /// 序列化失败
    #[error("audit event serialization failed: {0}")]
    Serialization(String),
    /// 异步通道已满
    #[error("audit channel full")]
    ChannelFull,
    /// 异步通道已关闭
    #[error("audit channel closed")]
    ChannelClosed,
    /// sink 在写入时 panic
    #[error("audit sink panicked: {0}")]
    Panicked(String),
}

/// 配置相关错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 读取配置文件失败
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    /// 解析失败
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// 缺少必需的配置
    #[error("missing required configuration: {0}")]
    MissingRequired(String),
    /// 语义校验失败（包含全部问题）
    #[error("invalid configuration: {}", .issues.join("; "))]
    Invalid {
        /// 所有校验问题
        issues: Vec<String>,
    },
}

/// 加密相关错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// 随机数生成失败
    #[error("random number generation failed: {0}")]
    RngFailed(String),
    /// 密钥无效
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csrf_failures_collapse_to_one_error() {
        for failure in [
            CsrfFailure::MissingToken,
            CsrfFailure::MissingRecord,
            CsrfFailure::Expired,
            CsrfFailure::Mismatch,
            CsrfFailure::MalformedRecord,
        ] {
            let err: Error = failure.into();
            assert!(matches!(err, Error::InvalidCsrfToken));
            assert_eq!(err.to_string(), "invalid CSRF token");
        }
    }

    #[test]
    fn test_rate_limited_display() {
        let err = Error::rate_limited(Duration::from_secs(30));
        assert!(err.is_rate_limited());
        assert_eq!(err.to_string(), "rate limit exceeded, retry after 30s");
    }

    #[test]
    fn test_config_invalid_lists_all_issues() {
        let err = ConfigError::Invalid {
            issues: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(err.to_string(), "invalid configuration: a; b");
    }

    #[test]
    fn test_csrf_failure_labels() {
        assert_eq!(CsrfFailure::Expired.as_str(), "token_expired");
        assert_eq!(CsrfFailure::Mismatch.to_string(), "token mismatch");
    }
}
