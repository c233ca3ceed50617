//! 安全防护模块
//!
//! ## 子模块
//!
//! - **session**: 每个客户端 session 的键值存储抽象
//! - **cookie**: Cookie 签名与基于 Cookie 的 session 适配器
//! - **csrf**: CSRF (跨站请求伪造) 防护
//! - **rate_limit**: 速率限制，防止暴力破解
//!
//! ## 速率限制示例
//!
//! ```rust
//! use authguard::security::rate_limit::{RateLimiter, RateLimitConfig};
//! use std::time::Duration;
//!
//! let limiter = RateLimiter::new("api", RateLimitConfig::new(5, Duration::from_secs(60)));
//!
//! let info = limiter.check("api:user-123");
//! assert!(!info.limited);
//! assert_eq!(info.remaining, 4);
//! ```

pub mod cookie;
pub mod csrf;
pub mod rate_limit;
pub mod session;

pub use cookie::{CookieSession, SameSite, SecureCookie};
pub use csrf::{CsrfConfig, CsrfProtection, CsrfRecord, CsrfStats};
pub use rate_limit::{
    InMemoryFixedWindowStore, LimiterClass, LimiterRegistry, RateLimitConfig, RateLimitInfo,
    RateLimitStore, RateLimiter, RateLimiterStats,
};
pub use session::{MemorySession, SessionContext};
