//! 审计日志模块
//!
//! 提供安全事件的记录和审计功能，包括：
//!
//! - **固定的事件分类**: [`EventType`] 和 [`EventSeverity`] 都是封闭集合
//! - **Sink 抽象**: [`AuditSink`] 只需要"追加一条记录"的能力
//! - **尽力而为**: [`SecurityAudit`] 的所有记录方法都不返回错误，写入失败进入 [`FallbackBuffer`]
//! - **内存 / tracing / 异步通道** 三种内置 sink
//!
//! ## 基本用法
//!
//! ```rust
//! use authguard::audit::{EventContext, EventSeverity, InMemoryAuditSink, SecurityAudit};
//! use std::sync::Arc;
//!
//! let sink = InMemoryAuditSink::new();
//! let audit = SecurityAudit::new(Arc::new(sink.clone()));
//!
//! let ctx = EventContext::new().with_source_address("192.168.1.1");
//! audit.log_login_attempt("alice@example.com", false, &ctx);
//! audit.log_password_change("user_1", &ctx);
//!
//! assert_eq!(sink.len(), 2);
//! assert_eq!(sink.events_by_severity(EventSeverity::Warning).len(), 1);
//! ```
//!
//! ## 写入失败
//!
//! ```rust
//! use authguard::audit::{AuditSink, EventContext, SecurityAudit, SecurityEvent};
//! use authguard::error::SinkError;
//! use std::sync::Arc;
//!
//! struct Offline;
//!
//! impl AuditSink for Offline {
//!     fn append(&self, _event: &SecurityEvent) -> Result<(), SinkError> {
//!         Err(SinkError::Unavailable("database offline".into()))
//!     }
//! }
//!
//! let audit = SecurityAudit::new(Arc::new(Offline));
//! audit.log_system_error("billing", "timeout", &EventContext::new());
//! assert_eq!(audit.fallback().len(), 1);
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{CsrfFailure, SinkError};
use crate::random::random_hex;

/// 事件详情
pub type EventDetails = Map<String, Value>;

/// 默认回退缓冲区容量
pub const DEFAULT_FALLBACK_CAPACITY: usize = 256;

/// 默认异步通道容量
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

// ============================================================================
// 事件分类
// ============================================================================

/// 事件严重程度
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    /// 一般信息
    #[default]
    Info,
    /// 警告
    Warning,
    /// 错误
    Error,
}

impl EventSeverity {
    /// 小写名称
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSeverity::Info => "info",
            EventSeverity::Warning => "warning",
            EventSeverity::Error => "error",
        }
    }
}

impl fmt::Display for EventSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 安全事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// 认证（登录）
    Authentication,
    /// 注册
    Registration,
    /// 多因素认证
    Mfa,
    /// 个人资料变更（包括密码）
    Profile,
    /// 管理操作
    Admin,
    /// 可疑活动
    SuspiciousActivity,
    /// 速率限制触发
    RateLimitExceeded,
    /// CSRF 校验失败
    CsrfViolation,
    /// 数据访问
    DataAccess,
    /// 系统事件
    System,
}

impl EventType {
    /// snake_case 名称，与序列化结果一致
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Authentication => "authentication",
            EventType::Registration => "registration",
            EventType::Mfa => "mfa",
            EventType::Profile => "profile",
            EventType::Admin => "admin",
            EventType::SuspiciousActivity => "suspicious_activity",
            EventType::RateLimitExceeded => "rate_limit_exceeded",
            EventType::CsrfViolation => "csrf_violation",
            EventType::DataAccess => "data_access",
            EventType::System => "system",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 数据访问类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataAccessKind {
    /// 读取
    Read,
    /// 写入
    Write,
    /// 删除
    Delete,
}

impl DataAccessKind {
    fn as_str(&self) -> &'static str {
        match self {
            DataAccessKind::Read => "read",
            DataAccessKind::Write => "write",
            DataAccessKind::Delete => "delete",
        }
    }
}

// ============================================================================
// 事件
// ============================================================================

/// 请求上下文
///
/// 事件的主体和来源信息，通常由集成层从请求中提取。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventContext {
    subject_id: Option<String>,
    source_address: Option<String>,
    user_agent: Option<String>,
}

impl EventContext {
    /// 创建空上下文
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置主体 ID
    pub fn with_subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    /// 设置来源地址
    pub fn with_source_address(mut self, address: impl Into<String>) -> Self {
        self.source_address = Some(address.into());
        self
    }

    /// 设置 User-Agent
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// 主体 ID
    pub fn subject_id(&self) -> Option<&str> {
        self.subject_id.as_deref()
    }

    /// 来源地址
    pub fn source_address(&self) -> Option<&str> {
        self.source_address.as_deref()
    }

    /// User-Agent
    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }
}

/// 安全事件
///
/// 创建后不可修改，只提供只读访问。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    id: String,
    event_type: EventType,
    severity: EventSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subject_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_agent: Option<String>,
    #[serde(default)]
    details: EventDetails,
    timestamp: DateTime<Utc>,
}

impl SecurityEvent {
    /// 创建新的安全事件
    pub fn new(
        event_type: EventType,
        severity: EventSeverity,
        details: EventDetails,
        ctx: &EventContext,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: generate_event_id(),
            event_type,
            severity,
            subject_id: ctx.subject_id.clone(),
            source_address: ctx.source_address.clone(),
            user_agent: ctx.user_agent.clone(),
            details,
            timestamp,
        }
    }

    /// 事件 ID
    pub fn id(&self) -> &str {
        &self.id
    }

    /// 事件类型
    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// 严重程度
    pub fn severity(&self) -> EventSeverity {
        self.severity
    }

    /// 主体 ID
    pub fn subject_id(&self) -> Option<&str> {
        self.subject_id.as_deref()
    }

    /// 来源地址
    pub fn source_address(&self) -> Option<&str> {
        self.source_address.as_deref()
    }

    /// User-Agent
    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    /// 详情
    pub fn details(&self) -> &EventDetails {
        &self.details
    }

    /// 读取单个详情字段
    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.details.get(key)
    }

    /// 事件时间
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

fn generate_event_id() -> String {
    format!(
        "evt_{}",
        random_hex(16).unwrap_or_else(|_| "unknown".to_string())
    )
}

fn details_of(value: Value) -> EventDetails {
    match value {
        Value::Object(map) => map,
        _ => EventDetails::new(),
    }
}

// ============================================================================
// Sink
// ============================================================================

/// 审计 sink trait
///
/// 只要求"追加一条记录"，实现应当对重试或丢弃是安全的。
pub trait AuditSink: Send + Sync {
    /// 追加一条事件
    fn append(&self, event: &SecurityEvent) -> Result<(), SinkError>;
}

/// 异步审计 sink trait
///
/// 由 [`spawn_audit_worker`] 在后台任务中调用。
#[async_trait]
pub trait AsyncAuditSink: Send + Sync {
    /// 追加一条事件
    async fn append(&self, event: SecurityEvent) -> Result<(), SinkError>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // 另一个线程在持锁时 panic 不应让审计永久失效
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ----------------------------------------------------------------------------
// InMemoryAuditSink
// ----------------------------------------------------------------------------

/// 内存审计 sink
///
/// 用于测试和开发环境。克隆后共享同一份存储。
#[derive(Debug, Clone, Default)]
pub struct InMemoryAuditSink {
    events: Arc<Mutex<VecDeque<SecurityEvent>>>,
    max_events: Option<usize>,
}

impl InMemoryAuditSink {
    /// 创建不限容量的 sink
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建有最大容量的 sink，超出时丢弃最旧的事件
    pub fn with_max_events(max: usize) -> Self {
        Self {
            events: Arc::default(),
            max_events: Some(max),
        }
    }

    /// 所有事件（按写入顺序）
    pub fn events(&self) -> Vec<SecurityEvent> {
        lock(&self.events).iter().cloned().collect()
    }

    /// 事件数量
    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        lock(&self.events).is_empty()
    }

    fn filtered(&self, predicate: impl Fn(&SecurityEvent) -> bool) -> Vec<SecurityEvent> {
        lock(&self.events)
            .iter()
            .filter(|e| predicate(e))
            .cloned()
            .collect()
    }

    /// 按主体获取事件
    pub fn events_by_subject(&self, subject_id: &str) -> Vec<SecurityEvent> {
        self.filtered(|e| e.subject_id() == Some(subject_id))
    }

    /// 按类型获取事件
    pub fn events_by_type(&self, event_type: EventType) -> Vec<SecurityEvent> {
        self.filtered(|e| e.event_type == event_type)
    }

    /// 按严重程度获取事件
    pub fn events_by_severity(&self, severity: EventSeverity) -> Vec<SecurityEvent> {
        self.filtered(|e| e.severity == severity)
    }

    /// 获取时间范围内的事件（闭区间）
    pub fn events_in_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<SecurityEvent> {
        self.filtered(|e| e.timestamp >= start && e.timestamp <= end)
    }

    /// 最近 N 个事件，最新的在前
    pub fn recent(&self, count: usize) -> Vec<SecurityEvent> {
        lock(&self.events).iter().rev().take(count).cloned().collect()
    }

    /// 清空
    pub fn clear(&self) {
        lock(&self.events).clear();
    }

    /// 统计信息
    pub fn stats(&self) -> AuditStats {
        let events = lock(&self.events);
        let mut stats = AuditStats {
            total_events: events.len(),
            ..Default::default()
        };

        for event in events.iter() {
            match event.severity {
                EventSeverity::Info => stats.info_count += 1,
                EventSeverity::Warning => stats.warning_count += 1,
                EventSeverity::Error => stats.error_count += 1,
            }
            *stats.events_by_type.entry(event.event_type).or_insert(0) += 1;
        }

        stats
    }

    fn push(&self, event: SecurityEvent) {
        let mut events = lock(&self.events);
        if let Some(max) = self.max_events {
            while events.len() >= max.max(1) {
                events.pop_front();
            }
        }
        events.push_back(event);
    }
}

impl AuditSink for InMemoryAuditSink {
    fn append(&self, event: &SecurityEvent) -> Result<(), SinkError> {
        self.push(event.clone());
        Ok(())
    }
}

#[async_trait]
impl AsyncAuditSink for InMemoryAuditSink {
    async fn append(&self, event: SecurityEvent) -> Result<(), SinkError> {
        self.push(event);
        Ok(())
    }
}

/// 审计统计信息
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AuditStats {
    /// 总事件数
    pub total_events: usize,
    /// Info 级别事件数
    pub info_count: usize,
    /// Warning 级别事件数
    pub warning_count: usize,
    /// Error 级别事件数
    pub error_count: usize,
    /// 按类型统计
    pub events_by_type: HashMap<EventType, usize>,
}

// ----------------------------------------------------------------------------
// NoOpAuditSink
// ----------------------------------------------------------------------------

/// 空操作 sink，用于禁用审计
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpAuditSink;

impl AuditSink for NoOpAuditSink {
    fn append(&self, _event: &SecurityEvent) -> Result<(), SinkError> {
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// TracingAuditSink
// ----------------------------------------------------------------------------

/// 把事件写成结构化 tracing 记录的 sink
///
/// 日志级别跟随事件严重程度。
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl TracingAuditSink {
    fn emit(event: &SecurityEvent) -> Result<(), SinkError> {
        let details = serde_json::to_string(&event.details)
            .map_err(|e| SinkError::Serialization(e.to_string()))?;
        let subject = event.subject_id().unwrap_or("-");
        let source = event.source_address().unwrap_or("-");

        match event.severity {
            EventSeverity::Info => info!(
                target: "authguard::audit",
                event_id = %event.id,
                event_type = %event.event_type,
                subject,
                source,
                details = %details,
                "security event"
            ),
            EventSeverity::Warning => warn!(
                target: "authguard::audit",
                event_id = %event.id,
                event_type = %event.event_type,
                subject,
                source,
                details = %details,
                "security event"
            ),
            EventSeverity::Error => error!(
                target: "authguard::audit",
                event_id = %event.id,
                event_type = %event.event_type,
                subject,
                source,
                details = %details,
                "security event"
            ),
        }
        Ok(())
    }
}

impl AuditSink for TracingAuditSink {
    fn append(&self, event: &SecurityEvent) -> Result<(), SinkError> {
        Self::emit(event)
    }
}

#[async_trait]
impl AsyncAuditSink for TracingAuditSink {
    async fn append(&self, event: SecurityEvent) -> Result<(), SinkError> {
        Self::emit(&event)
    }
}

// ----------------------------------------------------------------------------
// ChannelSink
// ----------------------------------------------------------------------------

/// 通过有界通道把事件交给后台任务的 sink
///
/// `append` 使用 `try_send`，从不阻塞；通道已满或已关闭都作为写入失败返回。
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<SecurityEvent>,
}

impl ChannelSink {
    /// 从已有的发送端创建
    pub fn new(tx: mpsc::Sender<SecurityEvent>) -> Self {
        Self { tx }
    }
}

impl AuditSink for ChannelSink {
    fn append(&self, event: &SecurityEvent) -> Result<(), SinkError> {
        self.tx.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::ChannelFull,
            mpsc::error::TrySendError::Closed(_) => SinkError::ChannelClosed,
        })
    }
}

/// 启动后台审计任务
///
/// 返回可交给 [`SecurityAudit`] 的 [`ChannelSink`] 和任务句柄。
/// 所有 `ChannelSink` 被丢弃后任务在处理完剩余事件后退出。
/// 必须在 tokio 运行时内调用。
pub fn spawn_audit_worker<S>(sink: S, capacity: usize) -> (ChannelSink, JoinHandle<()>)
where
    S: AsyncAuditSink + 'static,
{
    let (tx, mut rx) = mpsc::channel::<SecurityEvent>(capacity.max(1));
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let event_id = event.id.clone();
            if let Err(e) = sink.append(event).await {
                warn!(event_id = %event_id, error = %e, "background audit sink write failed");
            }
        }
    });
    (ChannelSink::new(tx), handle)
}

// ============================================================================
// FallbackBuffer
// ============================================================================

/// 一次失败的写入
#[derive(Debug, Clone, PartialEq)]
pub struct FailedWrite {
    /// 未写入的事件
    pub event: SecurityEvent,
    /// 失败原因
    pub error: SinkError,
}

/// 有界回退缓冲区
///
/// 保存写入失败的事件供检查或重试，满了丢弃最旧的并计数。
#[derive(Debug)]
pub struct FallbackBuffer {
    entries: Mutex<VecDeque<FailedWrite>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl Default for FallbackBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_FALLBACK_CAPACITY)
    }
}

impl FallbackBuffer {
    /// 创建指定容量的缓冲区（至少为 1）
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// 追加一条失败记录
    pub fn push(&self, failed: FailedWrite) {
        let mut entries = lock(&self.entries);
        if entries.len() >= self.capacity {
            entries.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        entries.push_back(failed);
    }

    /// 容量
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 当前条目数
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// 因容量不足被丢弃的条目数
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// 当前内容的副本
    pub fn snapshot(&self) -> Vec<FailedWrite> {
        lock(&self.entries).iter().cloned().collect()
    }

    /// 取出全部内容
    pub fn drain(&self) -> Vec<FailedWrite> {
        lock(&self.entries).drain(..).collect()
    }
}

// ============================================================================
// SecurityAudit
// ============================================================================

/// 安全审计记录器
///
/// 所有方法都返回 `()`：sink 返回错误或 panic 时，事件进入回退缓冲区，
/// 并通过 tracing 记录一条警告，调用方的主流程不受影响。
#[derive(Clone)]
pub struct SecurityAudit {
    sink: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    fallback: Arc<FallbackBuffer>,
}

impl fmt::Debug for SecurityAudit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityAudit")
            .field("fallback", &self.fallback)
            .finish_non_exhaustive()
    }
}

impl SecurityAudit {
    /// 使用指定 sink 创建
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            sink,
            clock: Arc::new(SystemClock),
            fallback: Arc::new(FallbackBuffer::default()),
        }
    }

    /// 替换时间源
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// 设置回退缓冲区容量
    pub fn with_fallback_capacity(mut self, capacity: usize) -> Self {
        self.fallback = Arc::new(FallbackBuffer::new(capacity));
        self
    }

    /// 回退缓冲区
    pub fn fallback(&self) -> &FallbackBuffer {
        &self.fallback
    }

    /// 记录一条事件
    pub fn log_event(
        &self,
        event_type: EventType,
        severity: EventSeverity,
        details: EventDetails,
        ctx: &EventContext,
    ) {
        let event = SecurityEvent::new(event_type, severity, details, ctx, self.clock.now_utc());
        self.write(event);
    }

    /// 重新写入回退缓冲区中的事件，返回成功数量
    ///
    /// 仍然失败的事件会重新进入缓冲区。
    pub fn retry_failed(&self) -> usize {
        let mut written = 0;
        for failed in self.fallback.drain() {
            if self.write(failed.event) {
                written += 1;
            }
        }
        written
    }

    fn write(&self, event: SecurityEvent) -> bool {
        let error = match catch_unwind(AssertUnwindSafe(|| self.sink.append(&event))) {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => e,
            Err(payload) => SinkError::Panicked(panic_message(payload.as_ref())),
        };

        warn!(
            event_id = %event.id,
            event_type = %event.event_type,
            error = %error,
            "audit sink write failed, event kept in fallback buffer"
        );
        self.fallback.push(FailedWrite { event, error });
        false
    }

    fn log(
        &self,
        event_type: EventType,
        severity: EventSeverity,
        details: Value,
        ctx: &EventContext,
    ) {
        self.log_event(event_type, severity, details_of(details), ctx);
    }

    // ========================================================================
    // 认证
    // ========================================================================

    /// 登录尝试，失败为 warning
    pub fn log_login_attempt(&self, email: &str, success: bool, ctx: &EventContext) {
        let severity = if success {
            EventSeverity::Info
        } else {
            EventSeverity::Warning
        };
        self.log(
            EventType::Authentication,
            severity,
            json!({ "action": "login_attempt", "email": email, "success": success }),
            ctx,
        );
    }

    /// 登录成功
    pub fn log_login_success(&self, user_id: &str, ctx: &EventContext) {
        self.log(
            EventType::Authentication,
            EventSeverity::Info,
            json!({ "action": "login_success" }),
            &ctx.clone().with_subject(user_id),
        );
    }

    /// 登录失败
    pub fn log_login_failure(&self, email: &str, reason: &str, ctx: &EventContext) {
        self.log(
            EventType::Authentication,
            EventSeverity::Warning,
            json!({ "action": "login_failure", "email": email, "reason": reason }),
            ctx,
        );
    }

    // ========================================================================
    // 注册
    // ========================================================================

    /// 注册尝试
    pub fn log_registration_attempt(&self, email: &str, ctx: &EventContext) {
        self.log(
            EventType::Registration,
            EventSeverity::Info,
            json!({ "action": "registration_attempt", "email": email }),
            ctx,
        );
    }

    /// 注册成功
    pub fn log_registration_success(&self, user_id: &str, email: &str, ctx: &EventContext) {
        self.log(
            EventType::Registration,
            EventSeverity::Info,
            json!({ "action": "registration_success", "email": email }),
            &ctx.clone().with_subject(user_id),
        );
    }

    /// 注册失败
    pub fn log_registration_failure(&self, email: &str, reason: &str, ctx: &EventContext) {
        self.log(
            EventType::Registration,
            EventSeverity::Warning,
            json!({ "action": "registration_failure", "email": email, "reason": reason }),
            ctx,
        );
    }

    // ========================================================================
    // MFA
    // ========================================================================

    /// 启用 MFA
    pub fn log_mfa_setup(&self, user_id: &str, method: &str, ctx: &EventContext) {
        self.log(
            EventType::Mfa,
            EventSeverity::Info,
            json!({ "action": "mfa_setup", "method": method }),
            &ctx.clone().with_subject(user_id),
        );
    }

    /// MFA 验证成功
    pub fn log_mfa_verify(&self, user_id: &str, ctx: &EventContext) {
        self.log(
            EventType::Mfa,
            EventSeverity::Info,
            json!({ "action": "mfa_verify" }),
            &ctx.clone().with_subject(user_id),
        );
    }

    /// MFA 验证失败
    pub fn log_mfa_failure(&self, user_id: &str, reason: &str, ctx: &EventContext) {
        self.log(
            EventType::Mfa,
            EventSeverity::Warning,
            json!({ "action": "mfa_failure", "reason": reason }),
            &ctx.clone().with_subject(user_id),
        );
    }

    // ========================================================================
    // 账户与管理
    // ========================================================================

    /// 密码修改
    pub fn log_password_change(&self, user_id: &str, ctx: &EventContext) {
        self.log(
            EventType::Profile,
            EventSeverity::Info,
            json!({ "action": "password_change" }),
            &ctx.clone().with_subject(user_id),
        );
    }

    /// 管理操作
    pub fn log_admin_action(
        &self,
        admin_id: &str,
        action: &str,
        target: Option<&str>,
        ctx: &EventContext,
    ) {
        let mut details = json!({ "action": action });
        if let (Some(target), Value::Object(map)) = (target, &mut details) {
            map.insert("target".to_string(), Value::from(target));
        }
        self.log(
            EventType::Admin,
            EventSeverity::Info,
            details,
            &ctx.clone().with_subject(admin_id),
        );
    }

    /// 数据访问，删除为 warning
    pub fn log_data_access(
        &self,
        user_id: &str,
        kind: DataAccessKind,
        resource: &str,
        ctx: &EventContext,
    ) {
        let severity = match kind {
            DataAccessKind::Delete => EventSeverity::Warning,
            DataAccessKind::Read | DataAccessKind::Write => EventSeverity::Info,
        };
        self.log(
            EventType::DataAccess,
            severity,
            json!({ "action": kind.as_str(), "resource": resource }),
            &ctx.clone().with_subject(user_id),
        );
    }

    // ========================================================================
    // 防护
    // ========================================================================

    /// CSRF 校验失败
    pub fn log_csrf_violation(&self, reason: CsrfFailure, ctx: &EventContext) {
        self.log(
            EventType::CsrfViolation,
            EventSeverity::Warning,
            json!({ "reason": reason.as_str() }),
            ctx,
        );
    }

    /// 速率限制触发
    pub fn log_rate_limit_exceeded(&self, limiter: &str, key: &str, ctx: &EventContext) {
        self.log(
            EventType::RateLimitExceeded,
            EventSeverity::Warning,
            json!({ "limiter": limiter, "key": key }),
            ctx,
        );
    }

    /// 可疑活动
    pub fn log_suspicious_activity(&self, description: &str, ctx: &EventContext) {
        self.log(
            EventType::SuspiciousActivity,
            EventSeverity::Error,
            json!({ "description": description }),
            ctx,
        );
    }

    /// 系统错误
    pub fn log_system_error(&self, component: &str, message: &str, ctx: &EventContext) {
        self.log(
            EventType::System,
            EventSeverity::Error,
            json!({ "component": component, "message": message }),
            ctx,
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ============================================================================
// 测试
// ============================================================================
