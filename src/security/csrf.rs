//! CSRF (跨站请求伪造) 防护模块
//!
//! 采用双重提交模式：
//!
//! - 服务端生成随机 token，只把 `HMAC(secret, raw ++ salt)` 写入 session 记录
//!   （签名后放在 HttpOnly Cookie `csrf-record` 中），原始 token 永不在服务端保存
//! - 原始 token 只返回给调用方，由调用方交给客户端；使用 [`CookieSession`] 时
//!   [`CsrfProtection::issue_cookie`] 会把它放进脚本可读的 `csrf-token` Cookie
//! - 前端在状态变更请求中通过 `X-CSRF-Token` 头回传，服务端重新计算 HMAC 并常量时间比较
//!
//! Token 在有效期内可重复使用，直到过期或被 [`CsrfProtection::refresh`] 轮换。
//!
//! ## 基本用法
//!
//! ```rust
//! use authguard::security::csrf::{CsrfConfig, CsrfProtection};
//! use authguard::security::session::MemorySession;
//!
//! let csrf = CsrfProtection::new(CsrfConfig::new(*b"my-secret-key-at-least-32-bytes!")).unwrap();
//! let mut session = MemorySession::new();
//!
//! let token = csrf.issue(&mut session).unwrap();
//! assert!(csrf.validate(&mut session, &token));
//! assert!(!csrf.validate(&mut session, "forged"));
//! ```

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock, duration_millis};
use crate::error::{ConfigError, CryptoError, CsrfFailure, Error, Result};
use crate::random::{constant_time_compare, random_bytes};
use crate::security::cookie::{CookieSession, sign_cookie, verify_cookie};
use crate::security::session::SessionContext;

type HmacSha256 = Hmac<Sha256>;

/// 回传 token 的请求头
pub const CSRF_HEADER_NAME: &str = "X-CSRF-Token";

/// 保存签名记录的 Cookie（HttpOnly）
pub const CSRF_RECORD_COOKIE: &str = "csrf-record";

/// 下发原始 token 的 Cookie（脚本可读）
pub const CSRF_TOKEN_COOKIE: &str = "csrf-token";

/// 密钥最小长度（字节）
pub const MIN_SECRET_LENGTH: usize = 32;

/// Token 最小熵（字节）
pub const MIN_TOKEN_LENGTH: usize = 32;

/// 盐值最小长度（字节）
pub const MIN_SALT_LENGTH: usize = 16;

/// 默认有效期：1 小时
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// 有效期上限：30 天
pub const MAX_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

const RECORD_KEY_LABEL: &[u8] = b"authguard/csrf-record";

// ============================================================================
// 配置
// ============================================================================

/// CSRF 配置
#[derive(Clone)]
pub struct CsrfConfig {
    secret: Vec<u8>,
    token_length: usize,
    salt_length: usize,
    ttl: Duration,
}

impl fmt::Debug for CsrfConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsrfConfig")
            .field("secret", &"<redacted>")
            .field("token_length", &self.token_length)
            .field("salt_length", &self.salt_length)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl CsrfConfig {
    /// 使用签名密钥创建配置
    ///
    /// 密钥必须由服务端持有，至少 32 字节。
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
            token_length: MIN_TOKEN_LENGTH,
            salt_length: MIN_SALT_LENGTH,
            ttl: DEFAULT_TTL,
        }
    }

    /// 设置 token 长度（字节）
    pub fn with_token_length(mut self, length: usize) -> Self {
        self.token_length = length;
        self
    }

    /// 设置盐值长度（字节）
    pub fn with_salt_length(mut self, length: usize) -> Self {
        self.salt_length = length;
        self
    }

    /// 设置 token 有效期
    ///
    /// ```rust
    /// use authguard::security::csrf::CsrfConfig;
    /// use std::time::Duration;
    ///
    /// let config = CsrfConfig::new(vec![7u8; 32]).with_ttl(Duration::from_secs(7200));
    /// assert_eq!(config.ttl(), Duration::from_secs(7200));
    /// ```
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Token 有效期
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Token 长度（字节）
    pub fn token_length(&self) -> usize {
        self.token_length
    }

    /// 盐值长度（字节）
    pub fn salt_length(&self) -> usize {
        self.salt_length
    }

    /// 校验配置，返回全部问题
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let mut issues = Vec::new();
        if self.secret.len() < MIN_SECRET_LENGTH {
            issues.push(format!(
                "csrf secret must be at least {} bytes (got {})",
                MIN_SECRET_LENGTH,
                self.secret.len()
            ));
        }
        if self.token_length < MIN_TOKEN_LENGTH {
            issues.push(format!(
                "csrf token length must be at least {} bytes",
                MIN_TOKEN_LENGTH
            ));
        }
        if self.salt_length < MIN_SALT_LENGTH {
            issues.push(format!(
                "csrf salt length must be at least {} bytes",
                MIN_SALT_LENGTH
            ));
        }
        if self.ttl.is_zero() {
            issues.push("csrf ttl must be greater than zero".to_string());
        }
        if self.ttl > MAX_TTL {
            issues.push(format!(
                "csrf ttl must not exceed {} seconds",
                MAX_TTL.as_secs()
            ));
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { issues })
        }
    }
}

// ============================================================================
// Session 记录
// ============================================================================

/// 保存在 session 中的 CSRF 记录
///
/// 不包含原始 token。序列化后再由服务端签名，客户端无法伪造或修改。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsrfRecord {
    /// `HMAC_SHA256(secret, raw ++ salt)`，base64url
    #[serde(rename = "h")]
    pub hashed_value: String,
    /// 每次签发独立生成的盐值，base64url
    #[serde(rename = "s")]
    pub salt: String,
    /// 过期时间（Unix 毫秒）
    #[serde(rename = "e")]
    pub expires_at: u64,
}

impl CsrfRecord {
    /// 在给定时间是否已过期（严格大于才算过期）
    pub fn is_expired_at(&self, now_millis: u64) -> bool {
        now_millis > self.expires_at
    }
}

/// CSRF 统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CsrfStats {
    /// 已签发数量
    pub issued: u64,
    /// 验证通过数量
    pub validated: u64,
    /// 验证拒绝数量
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct CsrfCounters {
    issued: AtomicU64,
    validated: AtomicU64,
    rejected: AtomicU64,
}

// ============================================================================
// 防护器
// ============================================================================

/// CSRF 防护器
///
/// 本身无状态（除统计计数外），所有 token 状态都保存在调用方的 session 中。
/// 克隆后共享统计计数。
#[derive(Clone)]
pub struct CsrfProtection {
    config: CsrfConfig,
    record_key: Vec<u8>,
    clock: Arc<dyn Clock>,
    counters: Arc<CsrfCounters>,
}

impl fmt::Debug for CsrfProtection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsrfProtection")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl CsrfProtection {
    /// 创建 CSRF 防护器，配置无效时返回错误
    pub fn new(config: CsrfConfig) -> Result<Self> {
        config.validate()?;
        let record_key = hmac_digest(&config.secret, &[RECORD_KEY_LABEL])?;
        Ok(Self {
            config,
            record_key,
            clock: Arc::new(SystemClock),
            counters: Arc::new(CsrfCounters::default()),
        })
    }

    /// 替换时间源
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// 当前配置
    pub fn config(&self) -> &CsrfConfig {
        &self.config
    }

    /// 签发新的 token
    ///
    /// 覆盖 session 中已有的记录，返回原始 token（base64url）。
    /// session 里只有记录，原始 token 由调用方负责下发。
    /// 只有操作系统随机数生成失败时才会返回错误。
    pub fn issue<S: SessionContext + ?Sized>(&self, session: &mut S) -> Result<String> {
        let raw = random_bytes(self.config.token_length)?;
        let salt = random_bytes(self.config.salt_length)?;
        let digest = self.token_digest(&raw, &salt)?;

        let record = CsrfRecord {
            hashed_value: URL_SAFE_NO_PAD.encode(digest),
            salt: URL_SAFE_NO_PAD.encode(&salt),
            expires_at: self
                .clock
                .now_millis()
                .saturating_add(duration_millis(self.config.ttl)),
        };
        let payload = serde_json::to_string(&record)
            .map_err(|e| Error::internal(format!("failed to encode csrf record: {}", e)))?;
        let signed = sign_cookie(&payload, &self.record_key)?;

        session.set(CSRF_RECORD_COOKIE, signed);

        self.counters.issued.fetch_add(1, Ordering::Relaxed);
        debug!(expires_at = record.expires_at, "issued csrf token");
        Ok(URL_SAFE_NO_PAD.encode(&raw))
    }

    /// 签发 token，并通过脚本可读的 `csrf-token` Cookie 下发给客户端
    pub fn issue_cookie(&self, session: &mut CookieSession) -> Result<String> {
        let token = self.issue(session)?;
        session.deliver(CSRF_TOKEN_COOKIE, &token);
        Ok(token)
    }

    /// 验证请求回传的 token
    ///
    /// 任何失败（缺失、过期、不匹配、记录损坏）都返回 `false`，从不 panic。
    /// 过期的记录会被清除。
    pub fn validate<S: SessionContext + ?Sized>(&self, session: &mut S, presented: &str) -> bool {
        self.check(session, Some(presented)).is_ok()
    }

    /// 验证 token 并给出失败原因
    ///
    /// 原因只用于审计记录，对外应统一表现为 [`Error::InvalidCsrfToken`]。
    pub fn check<S: SessionContext + ?Sized>(
        &self,
        session: &mut S,
        presented: Option<&str>,
    ) -> std::result::Result<(), CsrfFailure> {
        let result = self.check_inner(session, presented);
        match result {
            Ok(()) => {
                self.counters.validated.fetch_add(1, Ordering::Relaxed);
            }
            Err(reason) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(reason = reason.as_str(), "csrf validation failed");
            }
        }
        result
    }

    fn check_inner<S: SessionContext + ?Sized>(
        &self,
        session: &mut S,
        presented: Option<&str>,
    ) -> std::result::Result<(), CsrfFailure> {
        let record = self.load_record(&*session)?;

        if record.is_expired_at(self.clock.now_millis()) {
            self.revoke(session);
            return Err(CsrfFailure::Expired);
        }

        // 必须原样回传，带空白的值不做规范化，按不匹配处理
        let presented = presented
            .filter(|t| !t.is_empty())
            .ok_or(CsrfFailure::MissingToken)?;

        if self.matches(&record, presented)? {
            Ok(())
        } else {
            Err(CsrfFailure::Mismatch)
        }
    }

    /// 轮换 token：清除旧记录后重新签发
    pub fn refresh<S: SessionContext + ?Sized>(&self, session: &mut S) -> Result<String> {
        self.revoke(session);
        let token = self.issue(session)?;
        debug!("refreshed csrf token");
        Ok(token)
    }

    /// 确认客户端持有的 token 仍然有效，不轮换
    ///
    /// 服务端不保存原始 token，所以需要调用方传入客户端手里的副本
    /// （例如请求带来的 `csrf-token` Cookie）。没有记录、记录过期或不匹配时
    /// 返回 `None`。不修改 session，也不计入统计。
    pub fn peek<S: SessionContext + ?Sized>(
        &self,
        session: &S,
        client_token: &str,
    ) -> Option<String> {
        let record = self.load_record(session).ok()?;
        if record.is_expired_at(self.clock.now_millis()) {
            return None;
        }
        match self.matches(&record, client_token) {
            Ok(true) => Some(client_token.to_string()),
            _ => None,
        }
    }

    /// 清除 session 中的记录
    pub fn revoke<S: SessionContext + ?Sized>(&self, session: &mut S) {
        session.clear(CSRF_RECORD_COOKIE);
    }

    /// 清除记录，同时让客户端删除下发的 `csrf-token` Cookie
    pub fn revoke_cookie(&self, session: &mut CookieSession) {
        self.revoke(session);
        session.withdraw(CSRF_TOKEN_COOKIE);
    }

    /// 统计信息
    pub fn stats(&self) -> CsrfStats {
        CsrfStats {
            issued: self.counters.issued.load(Ordering::Relaxed),
            validated: self.counters.validated.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    fn load_record<S: SessionContext + ?Sized>(
        &self,
        session: &S,
    ) -> std::result::Result<CsrfRecord, CsrfFailure> {
        let signed = session
            .get(CSRF_RECORD_COOKIE)
            .ok_or(CsrfFailure::MissingRecord)?;
        let payload =
            verify_cookie(&signed, &self.record_key).map_err(|_| CsrfFailure::MalformedRecord)?;
        serde_json::from_str(&payload).map_err(|_| CsrfFailure::MalformedRecord)
    }

    fn matches(
        &self,
        record: &CsrfRecord,
        presented: &str,
    ) -> std::result::Result<bool, CsrfFailure> {
        let salt = URL_SAFE_NO_PAD
            .decode(&record.salt)
            .map_err(|_| CsrfFailure::MalformedRecord)?;
        let expected = URL_SAFE_NO_PAD
            .decode(&record.hashed_value)
            .map_err(|_| CsrfFailure::MalformedRecord)?;

        // 非法编码的 token 视为不匹配
        let Ok(raw) = URL_SAFE_NO_PAD.decode(presented) else {
            return Ok(false);
        };

        let actual = self
            .token_digest(&raw, &salt)
            .map_err(|_| CsrfFailure::MalformedRecord)?;
        Ok(constant_time_compare(&actual, &expected))
    }

    fn token_digest(&self, raw: &[u8], salt: &[u8]) -> Result<Vec<u8>> {
        hmac_digest(&self.config.secret, &[raw, salt])
    }
}

fn hmac_digest(key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::Crypto(CryptoError::InvalidKey(e.to_string())))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().to_vec())
}
