//! 请求防护编排
//!
//! 三个核心组件（速率限制、CSRF、审计）彼此不直接调用。[`RequestGuard`]
//! 把常见的检查顺序打包给集成层：先按调用方身份限流，状态变更请求再校验
//! CSRF token，两个检查点失败时都写入对应的审计事件。
//!
//! ```rust
//! use authguard::audit::{EventContext, InMemoryAuditSink, SecurityAudit};
//! use authguard::guard::RequestGuard;
//! use authguard::security::csrf::{CsrfConfig, CsrfProtection};
//! use authguard::security::rate_limit::{LimiterClass, LimiterRegistry};
//! use authguard::security::session::MemorySession;
//! use authguard::clock::SystemClock;
//! use std::sync::Arc;
//!
//! let sink = InMemoryAuditSink::new();
//! let guard = RequestGuard::new(
//!     CsrfProtection::new(CsrfConfig::new(*b"my-secret-key-at-least-32-bytes!")).unwrap(),
//!     LimiterRegistry::new(Arc::new(SystemClock)),
//!     SecurityAudit::new(Arc::new(sink.clone())),
//! );
//!
//! let ctx = EventContext::new().with_source_address("203.0.113.7");
//! let mut session = MemorySession::new();
//! let token = guard.csrf().issue(&mut session).unwrap();
//!
//! guard.check_rate_limit(LimiterClass::Api, "203.0.113.7", &ctx).unwrap();
//! guard.verify_csrf(&mut session, Some(&token), &ctx).unwrap();
//! assert!(guard.verify_csrf(&mut session, None, &ctx).is_err());
//! assert_eq!(sink.len(), 1);
//! ```

use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::audit::{AsyncAuditSink, AuditSink, EventContext, SecurityAudit, spawn_audit_worker};
use crate::clock::Clock;
use crate::config::GuardConfig;
use crate::error::Result;
use crate::security::csrf::CsrfProtection;
use crate::security::rate_limit::{LimiterClass, LimiterRegistry, RateLimitInfo, rate_limit_key};
use crate::security::session::SessionContext;

/// 缺少请求头时使用的占位值
pub const UNKNOWN_CLIENT: &str = "unknown";

/// 请求防护器
#[derive(Debug, Clone)]
pub struct RequestGuard {
    csrf: CsrfProtection,
    limiters: LimiterRegistry,
    audit: SecurityAudit,
}

impl RequestGuard {
    /// 由已构建的组件组装
    pub fn new(csrf: CsrfProtection, limiters: LimiterRegistry, audit: SecurityAudit) -> Self {
        Self {
            csrf,
            limiters,
            audit,
        }
    }

    /// 根据配置构建全部组件，所有组件共享同一个时间源
    pub fn from_config(
        config: &GuardConfig,
        sink: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let csrf = CsrfProtection::new(config.csrf_config()?)?.with_clock(clock.clone());
        let limiters =
            LimiterRegistry::with_configs(clock.clone(), |class| config.limiter_config(class));
        let audit = SecurityAudit::new(sink)
            .with_clock(clock)
            .with_fallback_capacity(config.audit.fallback_capacity);
        Ok(Self::new(csrf, limiters, audit))
    }

    /// 根据配置构建，审计事件经过 `[audit] channel_capacity` 大小的通道交给后台任务写入
    ///
    /// 必须在 tokio 运行时内调用。通道满时事件进入回退缓冲区，请求不会等待 sink。
    /// 返回的句柄在所有 guard 克隆被丢弃、剩余事件写完后结束。
    pub fn spawn_from_config<S>(
        config: &GuardConfig,
        sink: S,
        clock: Arc<dyn Clock>,
    ) -> Result<(Self, JoinHandle<()>)>
    where
        S: AsyncAuditSink + 'static,
    {
        config.validate()?;
        let (channel, worker) = spawn_audit_worker(sink, config.audit.channel_capacity);
        let guard = Self::from_config(config, Arc::new(channel), clock)?;
        Ok((guard, worker))
    }

    /// CSRF 防护器
    pub fn csrf(&self) -> &CsrfProtection {
        &self.csrf
    }

    /// 限制器注册表
    pub fn limiters(&self) -> &LimiterRegistry {
        &self.limiters
    }

    /// 审计记录器
    pub fn audit(&self) -> &SecurityAudit {
        &self.audit
    }

    /// 限流检查点
    ///
    /// 记录一次请求；被限制时写入 `rate_limit_exceeded` 事件并返回
    /// [`crate::Error::RateLimitExceeded`]。
    pub fn check_rate_limit(
        &self,
        class: LimiterClass,
        identity: &str,
        ctx: &EventContext,
    ) -> Result<RateLimitInfo> {
        let key = rate_limit_key(class, identity);
        let info = self.limiters.get(class).check(&key);
        if info.limited {
            self.audit
                .log_rate_limit_exceeded(class.as_str(), &key, ctx);
        }
        info.into_result()
    }

    /// CSRF 检查点
    ///
    /// 失败原因只写入审计事件，调用方统一得到 [`crate::Error::InvalidCsrfToken`]。
    pub fn verify_csrf<S: SessionContext + ?Sized>(
        &self,
        session: &mut S,
        presented: Option<&str>,
        ctx: &EventContext,
    ) -> Result<()> {
        self.csrf.check(session, presented).map_err(|reason| {
            self.audit.log_csrf_violation(reason, ctx);
            reason.into()
        })
    }

    /// 登录尝试
    ///
    /// 先经过登录限流检查点（超限时只写一条限流事件，不再记录登录尝试），
    /// 然后记录登录尝试；登录成功会清除该邮箱的限流计数。
    pub fn login_attempt(
        &self,
        email: &str,
        success: bool,
        ctx: &EventContext,
    ) -> Result<RateLimitInfo> {
        let info = self.check_rate_limit(LimiterClass::Login, email, ctx)?;
        self.audit.log_login_attempt(email, success, ctx);
        if success {
            self.limiters
                .get(LimiterClass::Login)
                .reset(&rate_limit_key(LimiterClass::Login, email));
        }
        Ok(info)
    }
}

/// 从请求头推导客户端标识
///
/// 取 `X-Forwarded-For` 的第一跳，其次 `X-Real-IP`，都没有时为 `unknown`；
/// 再拼接 User-Agent（缺失同样为 `unknown`）。
///
/// ```rust
/// use authguard::guard::client_identifier;
///
/// assert_eq!(
///     client_identifier(Some("203.0.113.7, 10.0.0.1"), Some("10.0.0.2"), Some("curl/8")),
///     "203.0.113.7:curl/8"
/// );
/// assert_eq!(client_identifier(None, None, None), "unknown:unknown");
/// ```
pub fn client_identifier(
    forwarded_for: Option<&str>,
    real_ip: Option<&str>,
    user_agent: Option<&str>,
) -> String {
    let ip = client_address(forwarded_for, real_ip).unwrap_or(UNKNOWN_CLIENT);
    let agent = non_empty(user_agent).unwrap_or(UNKNOWN_CLIENT);
    format!("{}:{}", ip, agent)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn client_address<'a>(forwarded_for: Option<&'a str>, real_ip: Option<&'a str>) -> Option<&'a str> {
    non_empty(forwarded_for.and_then(|v| v.split(',').next())).or_else(|| non_empty(real_ip))
}

/// 从请求头构造审计上下文
pub fn event_context(
    forwarded_for: Option<&str>,
    real_ip: Option<&str>,
    user_agent: Option<&str>,
) -> EventContext {
    let mut ctx = EventContext::new();
    if let Some(address) = client_address(forwarded_for, real_ip) {
        ctx = ctx.with_source_address(address);
    }
    if let Some(agent) = non_empty(user_agent) {
        ctx = ctx.with_user_agent(agent);
    }
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{EventType, InMemoryAuditSink};
    use crate::clock::ManualClock;
    use crate::error::Error;
    use crate::security::csrf::CsrfConfig;
    use crate::security::session::MemorySession;

    fn guard(clock: &ManualClock) -> (RequestGuard, InMemoryAuditSink) {
        let mut config = GuardConfig::default();
        config.csrf.secret = Some("0123456789abcdef0123456789abcdef".to_string());
        let sink = InMemoryAuditSink::new();
        let guard =
            RequestGuard::from_config(&config, Arc::new(sink.clone()), Arc::new(clock.clone()))
                .unwrap();
        (guard, sink)
    }

    #[test]
    fn test_from_config_rejects_invalid() {
        let result = RequestGuard::from_config(
            &GuardConfig::default(),
            Arc::new(InMemoryAuditSink::new()),
            Arc::new(ManualClock::new(0)),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_rate_limit_checkpoint_logs_once_per_block() {
        let clock = ManualClock::new(0);
        let (guard, sink) = guard(&clock);
        let ctx = EventContext::new();

        for _ in 0..3 {
            guard
                .check_rate_limit(LimiterClass::Registration, "1.2.3.4", &ctx)
                .unwrap();
        }
        let err = guard
            .check_rate_limit(LimiterClass::Registration, "1.2.3.4", &ctx)
            .unwrap_err();
        assert!(err.is_rate_limited());

        let events = sink.events_by_type(EventType::RateLimitExceeded);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].detail("key"),
            Some(&serde_json::Value::from("register:1.2.3.4"))
        );
    }

    #[test]
    fn test_csrf_checkpoint_hides_reason() {
        let clock = ManualClock::new(0);
        let (guard, sink) = guard(&clock);
        let ctx = EventContext::new();
        let mut session = MemorySession::new();

        let err = guard.verify_csrf(&mut session, Some("x"), &ctx).unwrap_err();
        assert!(matches!(err, Error::InvalidCsrfToken));

        let event = &sink.events_by_type(EventType::CsrfViolation)[0];
        assert_eq!(
            event.detail("reason"),
            Some(&serde_json::Value::from("record_missing"))
        );
    }

    #[test]
    fn test_login_success_resets_counter() {
        let clock = ManualClock::new(0);
        let (guard, _sink) = guard(&clock);
        let ctx = EventContext::new();

        for _ in 0..4 {
            guard.login_attempt("a@example.com", false, &ctx).unwrap();
        }
        guard.login_attempt("a@example.com", true, &ctx).unwrap();

        let key = rate_limit_key(LimiterClass::Login, "a@example.com");
        assert_eq!(guard.limiters().get(LimiterClass::Login).remaining(&key), 5);
    }

    #[test]
    fn test_shared_clock_drives_csrf_expiry() {
        let clock = ManualClock::new(0);
        let (guard, _sink) = guard(&clock);
        let mut session = MemorySession::new();
        let token = guard.csrf().issue(&mut session).unwrap();

        clock.set(3_600_001);
        assert!(
            guard
                .verify_csrf(&mut session, Some(&token), &EventContext::new())
                .is_err()
        );
    }

    #[test]
    fn test_manual_assembly() {
        let csrf = CsrfProtection::new(CsrfConfig::new(vec![9u8; 32])).unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(0));
        let guard = RequestGuard::new(
            csrf,
            LimiterRegistry::new(clock),
            SecurityAudit::new(Arc::new(InMemoryAuditSink::new())),
        );
        assert_eq!(guard.limiters().get(LimiterClass::Admin).config().max_attempts, 10);
    }

    #[test]
    fn test_client_identifier_fallbacks() {
        assert_eq!(
            client_identifier(None, Some(" 10.0.0.2 "), None),
            "10.0.0.2:unknown"
        );
        assert_eq!(
            client_identifier(Some(""), None, Some("Mozilla/5.0")),
            "unknown:Mozilla/5.0"
        );
    }

    #[test]
    fn test_event_context_from_headers() {
        let ctx = event_context(Some("203.0.113.7, 10.0.0.1"), None, Some("curl/8"));
        assert_eq!(ctx.source_address(), Some("203.0.113.7"));
        assert_eq!(ctx.user_agent(), Some("curl/8"));
        assert_eq!(event_context(None, None, None), EventContext::new());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_spawn_from_config_uses_channel_capacity() {
        let clock = ManualClock::new(0);
        let mut config = GuardConfig::default();
        config.csrf.secret = Some("0123456789abcdef0123456789abcdef".to_string());
        config.audit.channel_capacity = 2;

        let store = InMemoryAuditSink::new();
        let (guard, worker) =
            RequestGuard::spawn_from_config(&config, store.clone(), Arc::new(clock.clone()))
                .unwrap();
        let ctx = EventContext::new();

        // worker 在本任务让出前不会运行，第 3 个事件超出通道容量
        for _ in 0..3 {
            guard.login_attempt("a@example.com", false, &ctx).unwrap();
        }
        assert_eq!(guard.audit().fallback().len(), 1);

        drop(guard);
        worker.await.unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_spawn_from_config_rejects_invalid_before_spawning() {
        // 配置无效时不需要运行时，也不会 spawn
        let result = RequestGuard::spawn_from_config(
            &GuardConfig::default(),
            InMemoryAuditSink::new(),
            Arc::new(ManualClock::new(0)),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
