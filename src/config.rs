//! 配置模块
//!
//! 从 TOML 文件加载 [`GuardConfig`]，签名密钥可由环境变量
//! `AUTHGUARD_CSRF_SECRET` 覆盖。加载流程：读取 → 解析 → 环境变量 → 校验。
//! 校验会一次性返回全部问题。
//!
//! ```rust
//! use authguard::config::GuardConfig;
//! use authguard::security::rate_limit::LimiterClass;
//!
//! let config = GuardConfig::from_toml_str(r#"
//!     [csrf]
//!     secret = "0123456789abcdef0123456789abcdef"
//!     ttl_secs = 1800
//!
//!     [rate_limit.login]
//!     window_ms = 60000
//!     max_attempts = 3
//! "#).unwrap();
//!
//! config.validate().unwrap();
//! assert_eq!(config.limiter_config(LimiterClass::Login).max_attempts, 3);
//! // 未配置的类别使用默认值
//! assert_eq!(config.limiter_config(LimiterClass::Api).max_attempts, 100);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::audit::{DEFAULT_CHANNEL_CAPACITY, DEFAULT_FALLBACK_CAPACITY};
use crate::clock::duration_millis;
use crate::error::ConfigError;
use crate::security::csrf::{
    CsrfConfig, DEFAULT_TTL, MAX_TTL, MIN_SALT_LENGTH, MIN_SECRET_LENGTH, MIN_TOKEN_LENGTH,
};
use crate::security::rate_limit::{LimiterClass, RateLimitConfig};

/// 覆盖签名密钥的环境变量
pub const CSRF_SECRET_ENV: &str = "AUTHGUARD_CSRF_SECRET";

/// 顶层配置
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// CSRF 配置
    pub csrf: CsrfSettings,
    /// 各类别的速率限制
    pub rate_limit: RateLimitSettings,
    /// 审计配置
    pub audit: AuditSettings,
}

/// `[csrf]`
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CsrfSettings {
    /// 签名密钥（至少 32 字节）
    pub secret: Option<String>,
    /// Token 有效期（秒）
    pub ttl_secs: u64,
    /// Token 熵（字节）
    pub token_bytes: usize,
    /// 盐值长度（字节）
    pub salt_bytes: usize,
}

impl Default for CsrfSettings {
    fn default() -> Self {
        Self {
            secret: None,
            ttl_secs: DEFAULT_TTL.as_secs(),
            token_bytes: MIN_TOKEN_LENGTH,
            salt_bytes: MIN_SALT_LENGTH,
        }
    }
}

impl fmt::Debug for CsrfSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsrfSettings")
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("ttl_secs", &self.ttl_secs)
            .field("token_bytes", &self.token_bytes)
            .field("salt_bytes", &self.salt_bytes)
            .finish()
    }
}

/// 单个限制器的配置
///
/// 出现在文件中时两个字段都必须给出。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// 时间窗口（毫秒）
    pub window_ms: u64,
    /// 窗口内最大请求数
    pub max_attempts: u32,
}

impl From<RateLimitConfig> for LimiterSettings {
    fn from(config: RateLimitConfig) -> Self {
        Self {
            window_ms: duration_millis(config.window),
            max_attempts: config.max_attempts,
        }
    }
}

impl From<LimiterSettings> for RateLimitConfig {
    fn from(settings: LimiterSettings) -> Self {
        RateLimitConfig::new(
            settings.max_attempts,
            Duration::from_millis(settings.window_ms),
        )
    }
}

/// `[rate_limit.*]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// `[rate_limit.login]`
    pub login: LimiterSettings,
    /// `[rate_limit.registration]`
    pub registration: LimiterSettings,
    /// `[rate_limit.api]`
    pub api: LimiterSettings,
    /// `[rate_limit.admin]`
    pub admin: LimiterSettings,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            login: RateLimitConfig::for_login().into(),
            registration: RateLimitConfig::for_registration().into(),
            api: RateLimitConfig::for_api().into(),
            admin: RateLimitConfig::for_admin().into(),
        }
    }
}

impl RateLimitSettings {
    /// 某个类别的配置
    pub fn get(&self, class: LimiterClass) -> LimiterSettings {
        match class {
            LimiterClass::Login => self.login,
            LimiterClass::Registration => self.registration,
            LimiterClass::Api => self.api,
            LimiterClass::Admin => self.admin,
        }
    }
}

/// `[audit]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    /// 回退缓冲区容量
    pub fallback_capacity: usize,
    /// 异步通道容量
    pub channel_capacity: usize,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            fallback_capacity: DEFAULT_FALLBACK_CAPACITY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl GuardConfig {
    /// 从 TOML 文件加载、应用环境变量并校验
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// 只解析，不校验
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// 使用进程环境变量覆盖
    pub fn apply_env(&mut self) {
        self.apply_env_with(|name| std::env::var(name).ok());
    }

    /// 使用给定的查找函数覆盖
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(secret) = lookup(CSRF_SECRET_ENV).filter(|s| !s.is_empty()) {
            self.csrf.secret = Some(secret);
        }
    }

    /// 语义校验，返回全部问题
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut issues = Vec::new();

        match &self.csrf.secret {
            None => issues.push(format!(
                "csrf.secret is required (or set {})",
                CSRF_SECRET_ENV
            )),
            Some(secret) if secret.len() < MIN_SECRET_LENGTH => issues.push(format!(
                "csrf.secret must be at least {} bytes",
                MIN_SECRET_LENGTH
            )),
            Some(_) => {}
        }
        if self.csrf.ttl_secs == 0 {
            issues.push("csrf.ttl_secs must be greater than zero".to_string());
        } else if self.csrf.ttl_secs > MAX_TTL.as_secs() {
            issues.push(format!(
                "csrf.ttl_secs must not exceed {}",
                MAX_TTL.as_secs()
            ));
        }
        if self.csrf.token_bytes < MIN_TOKEN_LENGTH {
            issues.push(format!(
                "csrf.token_bytes must be at least {}",
                MIN_TOKEN_LENGTH
            ));
        }
        if self.csrf.salt_bytes < MIN_SALT_LENGTH {
            issues.push(format!(
                "csrf.salt_bytes must be at least {}",
                MIN_SALT_LENGTH
            ));
        }

        for class in LimiterClass::ALL {
            let settings = self.rate_limit.get(class);
            if settings.window_ms == 0 {
                issues.push(format!("rate_limit.{}.window_ms must be greater than zero", class));
            }
            if settings.max_attempts == 0 {
                issues.push(format!(
                    "rate_limit.{}.max_attempts must be greater than zero",
                    class
                ));
            }
        }

        if self.audit.fallback_capacity == 0 {
            issues.push("audit.fallback_capacity must be greater than zero".to_string());
        }
        if self.audit.channel_capacity == 0 {
            issues.push("audit.channel_capacity must be greater than zero".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { issues })
        }
    }

    /// 构造 CSRF 配置
    pub fn csrf_config(&self) -> Result<CsrfConfig, ConfigError> {
        let secret = self
            .csrf
            .secret
            .as_ref()
            .ok_or_else(|| ConfigError::MissingRequired("csrf.secret".to_string()))?;
        Ok(CsrfConfig::new(secret.as_bytes().to_vec())
            .with_ttl(Duration::from_secs(self.csrf.ttl_secs))
            .with_token_length(self.csrf.token_bytes)
            .with_salt_length(self.csrf.salt_bytes))
    }

    /// 某个类别的速率限制配置
    pub fn limiter_config(&self, class: LimiterClass) -> RateLimitConfig {
        self.rate_limit.get(class).into()
    }
}
