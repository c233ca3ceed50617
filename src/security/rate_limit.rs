//! 速率限制模块
//!
//! 基于固定窗口算法的按 key 速率限制，用于防止暴力破解和滥用。
//!
//! ## 功能特性
//!
//! - **固定窗口算法**: 窗口内计数，窗口结束后首次请求重新开始计数
//! - **可插拔存储**: 算法封装在 [`RateLimitStore`] 之后，可替换为其他实现
//! - **多实例共存**: 登录、注册、API、管理操作各自独立配置与计数
//! - **响应头**: 生成 `X-RateLimit-*` 和 `Retry-After`
//!
//! 固定窗口在窗口边界附近最多允许约 2 倍 `max_attempts` 的突发，这是算法本身的近似。
//!
//! ## 示例
//!
//! ```rust
//! use authguard::security::rate_limit::{RateLimiter, RateLimitConfig};
//! use std::time::Duration;
//!
//! // 每分钟最多 5 次
//! let limiter = RateLimiter::new("login", RateLimitConfig::new(5, Duration::from_secs(60)));
//!
//! let key = "login:203.0.113.7";
//! for _ in 0..5 {
//!     assert!(!limiter.is_rate_limited(key));
//! }
//! assert!(limiter.is_rate_limited(key));
//! assert_eq!(limiter.remaining(key), 0);
//! ```

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::clock::{Clock, SystemClock, duration_millis};
use crate::error::{Error, Result};

/// 过期记录的默认保留时间：24 小时
pub const DEFAULT_CLEANUP_RETENTION: Duration = Duration::from_secs(24 * 3600);

/// 速率限制配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// 时间窗口内允许的最大请求数
    pub max_attempts: u32,
    /// 时间窗口大小
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::for_api()
    }
}

impl RateLimitConfig {
    /// 创建新的配置
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
        }
    }

    /// 设置最大请求数
    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    /// 设置时间窗口
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// 登录场景：15 分钟 5 次
    pub fn for_login() -> Self {
        Self::new(5, Duration::from_secs(15 * 60))
    }

    /// 注册场景：1 小时 3 次
    pub fn for_registration() -> Self {
        Self::new(3, Duration::from_secs(3600))
    }

    /// API 场景：1 分钟 100 次
    pub fn for_api() -> Self {
        Self::new(100, Duration::from_secs(60))
    }

    /// 管理操作：5 分钟 10 次
    pub fn for_admin() -> Self {
        Self::new(10, Duration::from_secs(5 * 60))
    }

    fn window_millis(&self) -> u64 {
        duration_millis(self.window)
    }
}

/// 速率限制信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo {
    /// 本次请求是否被限制
    pub limited: bool,
    /// 剩余请求次数
    pub remaining: u32,
    /// 总限制次数
    pub limit: u32,
    /// 窗口重置时间（Unix 毫秒）
    pub reset_at: u64,
    /// 被限制时建议的重试等待时间
    pub retry_after: Option<Duration>,
}

impl RateLimitInfo {
    fn fresh(now: u64, config: &RateLimitConfig) -> Self {
        Self {
            limited: false,
            remaining: config.max_attempts,
            limit: config.max_attempts,
            reset_at: now.saturating_add(config.window_millis()),
            retry_after: None,
        }
    }

    /// 开启新窗口的那次请求本身从不被限制，即使 `max_attempts` 为 0
    fn window_started(record: &FixedWindowRecord, config: &RateLimitConfig) -> Self {
        Self {
            limited: false,
            remaining: config.max_attempts.saturating_sub(record.count),
            limit: config.max_attempts,
            reset_at: record.reset_at,
            retry_after: None,
        }
    }

    fn from_record(record: &FixedWindowRecord, now: u64, config: &RateLimitConfig) -> Self {
        let limited = record.count > config.max_attempts;
        Self {
            limited,
            remaining: config.max_attempts.saturating_sub(record.count),
            limit: config.max_attempts,
            reset_at: record.reset_at,
            // 窗口在 now > reset_at 时才重置
            retry_after: limited
                .then(|| Duration::from_millis(record.reset_at.saturating_sub(now) + 1)),
        }
    }

    /// 生成限流响应头
    ///
    /// `X-RateLimit-Reset` 为 Unix 秒（向上取整），`Retry-After` 只在被限制时出现。
    ///
    /// ```rust
    /// use authguard::security::rate_limit::RateLimitInfo;
    /// use std::time::Duration;
    ///
    /// let info = RateLimitInfo {
    ///     limited: true,
    ///     remaining: 0,
    ///     limit: 5,
    ///     reset_at: 1_500,
    ///     retry_after: Some(Duration::from_millis(1_200)),
    /// };
    /// let headers = info.headers();
    /// assert!(headers.contains(&("X-RateLimit-Reset", "2".to_string())));
    /// assert!(headers.contains(&("Retry-After", "2".to_string())));
    /// ```
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_at.div_ceil(1000).to_string()),
        ];
        if self.limited
            && let Some(retry_after) = self.retry_after
        {
            let secs = duration_millis(retry_after).div_ceil(1000);
            headers.push(("Retry-After", secs.to_string()));
        }
        headers
    }

    /// 被限制时转换为 [`Error::RateLimitExceeded`]
    pub fn into_result(self) -> Result<Self> {
        if self.limited {
            Err(Error::rate_limited(self.retry_after.unwrap_or_default()))
        } else {
            Ok(self)
        }
    }
}

/// 限制器统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimiterStats {
    /// 记录总数
    pub total_entries: usize,
    /// 当前处于限制状态的记录数
    pub blocked_entries: usize,
}

/// 固定窗口记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FixedWindowRecord {
    /// 当前窗口的请求计数（被限制期间继续累加）
    count: u32,
    /// 窗口结束时间（Unix 毫秒）
    reset_at: u64,
}

impl FixedWindowRecord {
    fn start(now: u64, config: &RateLimitConfig) -> Self {
        Self {
            count: 1,
            reset_at: now.saturating_add(config.window_millis()),
        }
    }

    fn is_live_at(&self, now: u64) -> bool {
        now <= self.reset_at
    }
}

/// 速率限制器存储 trait
///
/// 实现必须保证同一个 key 的"检查-重置-累加-比较"是原子的，并发请求不会丢失计数。
pub trait RateLimitStore: Send + Sync {
    /// 记录一次请求并返回限制信息
    fn check_and_record(&self, key: &str, now: u64, config: &RateLimitConfig) -> RateLimitInfo;

    /// 获取当前状态（不记录请求）
    fn status(&self, key: &str, now: u64, config: &RateLimitConfig) -> RateLimitInfo;

    /// 删除某个 key 的记录
    fn reset(&self, key: &str);

    /// 清理窗口结束超过 `retention` 的记录，返回清理数量
    fn cleanup(&self, now: u64, retention: Duration) -> usize;

    /// 统计信息
    fn stats(&self, now: u64, config: &RateLimitConfig) -> RateLimiterStats;
}

/// 内存速率限制存储（固定窗口）
///
/// 基于分片并发哈希表，单个 key 的更新在该分片的写锁内完成。
#[derive(Debug, Default)]
pub struct InMemoryFixedWindowStore {
    records: DashMap<String, FixedWindowRecord>,
}

impl InMemoryFixedWindowStore {
    /// 创建新的内存存储
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前记录数
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl RateLimitStore for InMemoryFixedWindowStore {
    fn check_and_record(&self, key: &str, now: u64, config: &RateLimitConfig) -> RateLimitInfo {
        match self.records.entry(key.to_string()) {
            Entry::Vacant(entry) => {
                let record = *entry.insert(FixedWindowRecord::start(now, config));
                RateLimitInfo::window_started(&record, config)
            }
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                if record.is_live_at(now) {
                    record.count = record.count.saturating_add(1);
                    RateLimitInfo::from_record(record, now, config)
                } else {
                    *record = FixedWindowRecord::start(now, config);
                    RateLimitInfo::window_started(record, config)
                }
            }
        }
    }

    fn status(&self, key: &str, now: u64, config: &RateLimitConfig) -> RateLimitInfo {
        match self.records.get(key) {
            Some(record) if record.is_live_at(now) => {
                RateLimitInfo::from_record(&record, now, config)
            }
            _ => RateLimitInfo::fresh(now, config),
        }
    }

    fn reset(&self, key: &str) {
        self.records.remove(key);
    }

    fn cleanup(&self, now: u64, retention: Duration) -> usize {
        let retention = duration_millis(retention);
        let mut removed = 0;
        self.records.retain(|_, record| {
            let keep = now <= record.reset_at.saturating_add(retention);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    fn stats(&self, now: u64, config: &RateLimitConfig) -> RateLimiterStats {
        let mut stats = RateLimiterStats::default();
        for record in self.records.iter() {
            stats.total_entries += 1;
            if record.is_live_at(now) && record.count > config.max_attempts {
                stats.blocked_entries += 1;
            }
        }
        stats
    }
}

/// 速率限制器
///
/// 每个实例拥有独立的存储，互不影响。
///
/// ```rust
/// use authguard::security::rate_limit::{RateLimiter, RateLimitConfig};
///
/// let limiter = RateLimiter::new("login", RateLimitConfig::for_login());
/// let info = limiter.check("login:user@example.com");
/// assert!(!info.limited);
/// assert_eq!(info.remaining, 4);
/// ```
#[derive(Clone)]
pub struct RateLimiter {
    name: String,
    config: RateLimitConfig,
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// 使用内存固定窗口存储和系统时钟创建限制器
    pub fn new(name: impl Into<String>, config: RateLimitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            store: Arc::new(InMemoryFixedWindowStore::new()),
            clock: Arc::new(SystemClock),
        }
    }

    /// 替换存储
    pub fn with_store(mut self, store: Arc<dyn RateLimitStore>) -> Self {
        self.store = store;
        self
    }

    /// 替换时间源
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// 限制器名称
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 获取配置
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// 记录一次请求并返回完整的限制信息
    pub fn check(&self, key: &str) -> RateLimitInfo {
        let now = self.clock.now_millis();
        let info = self.store.check_and_record(key, now, &self.config);
        if info.limited {
            warn!(
                limiter = %self.name,
                key,
                retry_after_ms = info.retry_after.map(duration_millis),
                "rate limit exceeded"
            );
        }
        info
    }

    /// 记录一次请求，返回是否被限制
    pub fn is_rate_limited(&self, key: &str) -> bool {
        self.check(key).limited
    }

    /// 记录一次请求，被限制时返回 [`Error::RateLimitExceeded`]
    pub fn enforce(&self, key: &str) -> Result<RateLimitInfo> {
        self.check(key).into_result()
    }

    /// 剩余次数（不记录请求）
    pub fn remaining(&self, key: &str) -> u32 {
        self.status(key).remaining
    }

    /// 获取当前状态（不记录请求）
    pub fn status(&self, key: &str) -> RateLimitInfo {
        self.store.status(key, self.clock.now_millis(), &self.config)
    }

    /// 当前是否处于限制状态（不记录请求）
    pub fn is_blocked(&self, key: &str) -> bool {
        self.status(key).limited
    }

    /// 删除某个 key 的记录
    pub fn reset(&self, key: &str) {
        self.store.reset(key);
    }

    /// 清理窗口结束超过 `retention` 的记录
    pub fn cleanup(&self, retention: Duration) -> usize {
        self.store.cleanup(self.clock.now_millis(), retention)
    }

    /// 统计信息
    pub fn stats(&self) -> RateLimiterStats {
        self.store.stats(self.clock.now_millis(), &self.config)
    }
}

// ============================================================================
// 限制器注册表
// ============================================================================

/// 限制器类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimiterClass {
    /// 登录
    Login,
    /// 注册
    Registration,
    /// 通用 API
    Api,
    /// 管理操作
    Admin,
}

impl LimiterClass {
    /// 所有类别
    pub const ALL: [LimiterClass; 4] = [
        LimiterClass::Login,
        LimiterClass::Registration,
        LimiterClass::Api,
        LimiterClass::Admin,
    ];

    /// 作为 key 前缀和日志字段使用的名称
    pub fn as_str(&self) -> &'static str {
        match self {
            LimiterClass::Login => "login",
            LimiterClass::Registration => "register",
            LimiterClass::Api => "api",
            LimiterClass::Admin => "admin",
        }
    }

    /// 该类别的默认配置
    pub fn default_config(&self) -> RateLimitConfig {
        match self {
            LimiterClass::Login => RateLimitConfig::for_login(),
            LimiterClass::Registration => RateLimitConfig::for_registration(),
            LimiterClass::Api => RateLimitConfig::for_api(),
            LimiterClass::Admin => RateLimitConfig::for_admin(),
        }
    }
}

impl fmt::Display for LimiterClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 构造限流 key：`<操作类别>:<调用方标识>`
///
/// ```rust
/// use authguard::security::rate_limit::{rate_limit_key, LimiterClass};
///
/// assert_eq!(rate_limit_key(LimiterClass::Login, "alice@example.com"), "login:alice@example.com");
/// ```
pub fn rate_limit_key(class: LimiterClass, identity: &str) -> String {
    format!("{}:{}", class.as_str(), identity)
}

/// 限制器注册表
///
/// 启动时构建一次，以引用方式传给请求处理逻辑。
#[derive(Debug, Clone)]
pub struct LimiterRegistry {
    login: RateLimiter,
    registration: RateLimiter,
    api: RateLimiter,
    admin: RateLimiter,
}

impl LimiterRegistry {
    /// 使用各类别的默认配置创建
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_configs(clock, |class| class.default_config())
    }

    /// 为每个类别指定配置
    pub fn with_configs(
        clock: Arc<dyn Clock>,
        config_for: impl Fn(LimiterClass) -> RateLimitConfig,
    ) -> Self {
        let build = |class: LimiterClass| {
            RateLimiter::new(class.as_str(), config_for(class)).with_clock(clock.clone())
        };
        Self {
            login: build(LimiterClass::Login),
            registration: build(LimiterClass::Registration),
            api: build(LimiterClass::Api),
            admin: build(LimiterClass::Admin),
        }
    }

    /// 替换某个类别的限制器
    pub fn with_limiter(mut self, class: LimiterClass, limiter: RateLimiter) -> Self {
        *self.get_mut(class) = limiter;
        self
    }

    /// 获取某个类别的限制器
    pub fn get(&self, class: LimiterClass) -> &RateLimiter {
        match class {
            LimiterClass::Login => &self.login,
            LimiterClass::Registration => &self.registration,
            LimiterClass::Api => &self.api,
            LimiterClass::Admin => &self.admin,
        }
    }

    fn get_mut(&mut self, class: LimiterClass) -> &mut RateLimiter {
        match class {
            LimiterClass::Login => &mut self.login,
            LimiterClass::Registration => &mut self.registration,
            LimiterClass::Api => &mut self.api,
            LimiterClass::Admin => &mut self.admin,
        }
    }

    /// 清理所有限制器，返回清理总数
    pub fn cleanup(&self, retention: Duration) -> usize {
        LimiterClass::ALL
            .iter()
            .map(|class| self.get(*class).cleanup(retention))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(clock: &ManualClock, max: u32, window_ms: u64) -> RateLimiter {
        RateLimiter::new("test", RateLimitConfig::new(max, Duration::from_millis(window_ms)))
            .with_clock(Arc::new(clock.clone()))
    }

    #[test]
    fn test_fixed_window_boundary() {
        let clock = ManualClock::new(0);
        let limiter = limiter(&clock, 3, 5000);

        for t in 0..3 {
            clock.set(t);
            assert!(!limiter.is_rate_limited("k"), "t={t}");
        }
        clock.set(3);
        assert!(limiter.is_rate_limited("k"));

        // 窗口结束时刻本身仍属于旧窗口
        clock.set(5000);
        assert!(limiter.is_rate_limited("k"));

        clock.set(5001);
        assert!(!limiter.is_rate_limited("k"));
        assert_eq!(limiter.remaining("k"), 2);
    }

    #[test]
    fn test_count_keeps_growing_while_blocked() {
        let clock = ManualClock::new(0);
        let limiter = limiter(&clock, 1, 1000);

        limiter.check("k");
        for _ in 0..3 {
            let info = limiter.check("k");
            assert!(info.limited);
            assert_eq!(info.remaining, 0);
        }
        assert_eq!(limiter.stats().blocked_entries, 1);
    }

    #[test]
    fn test_remaining_without_entry_is_max() {
        let clock = ManualClock::new(0);
        let limiter = limiter(&clock, 3, 1000);
        assert_eq!(limiter.remaining("nobody"), 3);

        limiter.check("k");
        assert_eq!(limiter.remaining("k"), 2);

        // 过期的记录视为不存在
        clock.set(1001);
        assert_eq!(limiter.remaining("k"), 3);
    }

    #[test]
    fn test_reset_clears_key() {
        let clock = ManualClock::new(0);
        let limiter = limiter(&clock, 1, 1000);

        limiter.check("k");
        assert!(limiter.is_rate_limited("k"));
        limiter.reset("k");
        assert!(!limiter.is_rate_limited("k"));
    }

    #[test]
    fn test_retry_after_and_enforce() {
        let clock = ManualClock::new(10_000);
        let limiter = limiter(&clock, 1, 5000);

        assert!(limiter.enforce("k").is_ok());
        clock.set(12_000);
        let err = limiter.enforce("k").unwrap_err();
        match err {
            Error::RateLimitExceeded { retry_after } => {
                assert_eq!(retry_after, Duration::from_millis(3001));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_headers_when_allowed() {
        let clock = ManualClock::new(1_000);
        let limiter = limiter(&clock, 5, 60_000);

        let headers = limiter.check("k").headers();
        assert_eq!(
            headers,
            vec![
                ("X-RateLimit-Limit", "5".to_string()),
                ("X-RateLimit-Remaining", "4".to_string()),
                ("X-RateLimit-Reset", "61".to_string()),
            ]
        );
    }

    #[test]
    fn test_cleanup_respects_retention() {
        let clock = ManualClock::new(0);
        let limiter = limiter(&clock, 5, 1000);
        limiter.check("old");

        clock.set(5_000);
        limiter.check("new");

        assert_eq!(limiter.cleanup(Duration::from_millis(2_000)), 1);
        assert_eq!(limiter.stats().total_entries, 1);
        assert_eq!(limiter.remaining("new"), 4);
    }

    #[test]
    fn test_presets() {
        assert_eq!(
            RateLimitConfig::for_login(),
            RateLimitConfig::new(5, Duration::from_secs(900))
        );
        assert_eq!(RateLimitConfig::for_registration().max_attempts, 3);
        assert_eq!(RateLimitConfig::for_api().window, Duration::from_secs(60));
        assert_eq!(RateLimitConfig::for_admin().max_attempts, 10);
        assert_eq!(RateLimitConfig::default(), RateLimitConfig::for_api());
    }

    #[test]
    fn test_registry_instances_are_independent() {
        let clock = ManualClock::new(0);
        let registry = LimiterRegistry::new(Arc::new(clock.clone()));

        let key = rate_limit_key(LimiterClass::Registration, "1.2.3.4");
        for _ in 0..3 {
            assert!(!registry.get(LimiterClass::Registration).is_rate_limited(&key));
        }
        assert!(registry.get(LimiterClass::Registration).is_rate_limited(&key));
        assert_eq!(registry.get(LimiterClass::Api).remaining(&key), 100);
        assert_eq!(registry.get(LimiterClass::Login).name(), "login");
    }

    #[test]
    fn test_registry_with_limiter_override() {
        let clock = ManualClock::new(0);
        let registry = LimiterRegistry::new(Arc::new(clock.clone())).with_limiter(
            LimiterClass::Api,
            limiter(&clock, 1, 1000),
        );

        assert_eq!(registry.get(LimiterClass::Api).config().max_attempts, 1);
    }

    #[test]
    fn test_concurrent_checks_do_not_lose_counts() {
        let clock = ManualClock::new(0);
        let limiter = limiter(&clock, 1_000, 60_000);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        limiter.check("shared");
                    }
                });
            }
        });

        assert_eq!(limiter.remaining("shared"), 1_000 - 400);
    }

    #[test]
    fn test_window_start_is_never_blocked() {
        let clock = ManualClock::new(0);
        let limiter = limiter(&clock, 0, 5000);

        let first = limiter.check("k");
        assert!(!first.limited);
        assert_eq!(first.remaining, 0);
        assert!(limiter.is_rate_limited("k"));

        // 窗口结束后重新开启的那次同样放行
        clock.set(5001);
        assert!(!limiter.is_rate_limited("k"));
        assert!(limiter.is_rate_limited("k"));
    }

    #[test]
    fn test_huge_window_does_not_wrap() {
        let clock = ManualClock::new(1_000);
        let limiter = RateLimiter::new("test", RateLimitConfig::new(1, Duration::from_secs(u64::MAX)))
            .with_clock(Arc::new(clock.clone()));

        let info = limiter.check("k");
        assert_eq!(info.reset_at, u64::MAX);
        clock.set(2_000);
        assert!(limiter.is_rate_limited("k"));
    }
}
