//! # authguard
//!
//! 面向 Web 服务的请求认证与滥用防护核心。
//!
//! ## 功能特性
//!
//! - **CSRF 防护**: 双重提交 token，session 中只保存加盐 HMAC，常量时间比较
//! - **速率限制**: 按 key 的固定窗口计数，多个独立配置的限制器共存
//! - **安全审计**: 封闭的事件分类，写入失败不影响主流程，失败事件进入回退缓冲区
//! - **配置**: TOML 文件 + 环境变量，校验时返回全部问题
//!
//! 本库不依赖任何 HTTP 框架。集成层负责从请求中取出 Cookie、请求头，
//! 并按"限流 → CSRF 校验"的顺序调用各组件，或直接使用 [`guard::RequestGuard`]。
//!
//! ## CSRF 示例
//!
//! ```rust
//! use authguard::security::cookie::CookieSession;
//! use authguard::security::csrf::{CsrfConfig, CsrfProtection, CSRF_TOKEN_COOKIE};
//!
//! let csrf = CsrfProtection::new(CsrfConfig::new(*b"my-secret-key-at-least-32-bytes!")).unwrap();
//!
//! // 渲染表单时签发
//! let mut session = CookieSession::from_header(None);
//! let token = csrf.issue_cookie(&mut session).unwrap();
//! let set_cookies = session.take_set_cookie_headers();
//! assert_eq!(set_cookies.len(), 2);
//!
//! // 下一次请求带回 Cookie 和 X-CSRF-Token 头
//! let cookie_header = set_cookies
//!     .iter()
//!     .map(|h| h.split(';').next().unwrap())
//!     .collect::<Vec<_>>()
//!     .join("; ");
//! let mut next = CookieSession::from_header(Some(&cookie_header));
//! assert_eq!(next.client_cookie(CSRF_TOKEN_COOKIE), Some(token.as_str()));
//! assert!(csrf.validate(&mut next, &token));
//! ```
//!
//! ## 速率限制示例
//!
//! ```rust
//! use authguard::security::rate_limit::{LimiterClass, LimiterRegistry, rate_limit_key};
//! use authguard::clock::SystemClock;
//! use std::sync::Arc;
//!
//! let limiters = LimiterRegistry::new(Arc::new(SystemClock));
//! let key = rate_limit_key(LimiterClass::Registration, "203.0.113.7");
//!
//! for _ in 0..3 {
//!     assert!(!limiters.get(LimiterClass::Registration).is_rate_limited(&key));
//! }
//! assert!(limiters.get(LimiterClass::Registration).is_rate_limited(&key));
//! ```
//!
//! ## 审计示例
//!
//! ```rust
//! use authguard::audit::{EventContext, TracingAuditSink, SecurityAudit};
//! use std::sync::Arc;
//!
//! let audit = SecurityAudit::new(Arc::new(TracingAuditSink));
//! audit.log_login_attempt("alice@example.com", false, &EventContext::new());
//! ```

pub mod audit;
pub mod clock;
pub mod config;
pub mod error;
pub mod guard;
pub mod random;
pub mod security;

pub use error::{Error, Result};

// ============================================================================
// 随机数生成函数导出
// ============================================================================

pub use random::{constant_time_compare, random_bytes, random_hex};

// ============================================================================
// 安全防护相关导出
// ============================================================================

pub use security::csrf::{CSRF_HEADER_NAME, CsrfConfig, CsrfProtection};
pub use security::rate_limit::{
    LimiterClass, LimiterRegistry, RateLimitConfig, RateLimitInfo, RateLimiter,
};
pub use security::session::{MemorySession, SessionContext};

// ============================================================================
// 审计与编排导出
// ============================================================================

pub use audit::{EventContext, EventSeverity, EventType, SecurityAudit, SecurityEvent};
pub use config::GuardConfig;
pub use guard::RequestGuard;
