//! 集成测试：审计日志
//!
//! 测试安全事件记录、查询、写入失败回退以及后台异步写入的完整流程。

use authguard::audit::{
    AuditSink, DataAccessKind, EventContext, EventSeverity, EventType, InMemoryAuditSink,
    SecurityAudit, SecurityEvent, spawn_audit_worker,
};
use authguard::clock::ManualClock;
use authguard::error::{CsrfFailure, SinkError};
use chrono::{Duration, TimeZone, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn memory_audit() -> (SecurityAudit, InMemoryAuditSink) {
    let sink = InMemoryAuditSink::new();
    (SecurityAudit::new(Arc::new(sink.clone())), sink)
}

/// 总是返回错误的 sink
struct FailingSink;

impl AuditSink for FailingSink {
    fn append(&self, _event: &SecurityEvent) -> Result<(), SinkError> {
        Err(SinkError::Unavailable("connection refused".to_string()))
    }
}

/// 写入时 panic 的 sink
struct PanickingSink;

impl AuditSink for PanickingSink {
    fn append(&self, _event: &SecurityEvent) -> Result<(), SinkError> {
        panic!("sink exploded");
    }
}

/// 前 N 次失败、之后恢复的 sink
struct FlakySink {
    failures_left: AtomicUsize,
    inner: InMemoryAuditSink,
}

impl AuditSink for FlakySink {
    fn append(&self, event: &SecurityEvent) -> Result<(), SinkError> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(SinkError::Unavailable("warming up".to_string()));
        }
        self.inner.append(event)
    }
}

fn log_every_wrapper(audit: &SecurityAudit) {
    let ctx = EventContext::new()
        .with_source_address("203.0.113.7")
        .with_user_agent("Mozilla/5.0");

    audit.log_login_attempt("a@example.com", false, &ctx);
    audit.log_login_success("user_1", &ctx);
    audit.log_login_failure("a@example.com", "bad_password", &ctx);
    audit.log_registration_attempt("b@example.com", &ctx);
    audit.log_registration_success("user_2", "b@example.com", &ctx);
    audit.log_registration_failure("c@example.com", "duplicate", &ctx);
    audit.log_mfa_setup("user_1", "totp", &ctx);
    audit.log_mfa_verify("user_1", &ctx);
    audit.log_mfa_failure("user_1", "bad_code", &ctx);
    audit.log_password_change("user_1", &ctx);
    audit.log_admin_action("admin_1", "approve_kyc", Some("user_2"), &ctx);
    audit.log_data_access("user_1", DataAccessKind::Read, "investments", &ctx);
    audit.log_data_access("user_1", DataAccessKind::Write, "investments", &ctx);
    audit.log_data_access("user_1", DataAccessKind::Delete, "investments", &ctx);
    audit.log_csrf_violation(CsrfFailure::Expired, &ctx);
    audit.log_rate_limit_exceeded("login", "login:a@example.com", &ctx);
    audit.log_suspicious_activity("credential stuffing pattern", &ctx);
    audit.log_system_error("mailer", "smtp timeout", &ctx);
}

/// 测试每个场景都落在固定的分类上
#[test]
fn test_wrappers_use_closed_taxonomy() {
    let (audit, sink) = memory_audit();
    log_every_wrapper(&audit);

    let stats = sink.stats();
    assert_eq!(stats.total_events, 18);
    assert_eq!(stats.events_by_type.get(&EventType::Authentication), Some(&3));
    assert_eq!(stats.events_by_type.get(&EventType::Registration), Some(&3));
    assert_eq!(stats.events_by_type.get(&EventType::Mfa), Some(&3));
    assert_eq!(stats.events_by_type.get(&EventType::Profile), Some(&1));
    assert_eq!(stats.events_by_type.get(&EventType::Admin), Some(&1));
    assert_eq!(stats.events_by_type.get(&EventType::DataAccess), Some(&3));
    assert_eq!(stats.events_by_type.get(&EventType::CsrfViolation), Some(&1));
    assert_eq!(
        stats.events_by_type.get(&EventType::RateLimitExceeded),
        Some(&1)
    );
    assert_eq!(
        stats.events_by_type.get(&EventType::SuspiciousActivity),
        Some(&1)
    );
    assert_eq!(stats.events_by_type.get(&EventType::System), Some(&1));

    assert_eq!(stats.error_count, 2);
    assert_eq!(
        sink.events_by_type(EventType::RateLimitExceeded)[0].severity(),
        EventSeverity::Warning
    );
    for event in sink.events() {
        assert_eq!(event.source_address(), Some("203.0.113.7"));
        assert_eq!(event.user_agent(), Some("Mozilla/5.0"));
    }
}

/// 测试失败的 sink 不会影响调用方
#[test]
fn test_audit_never_throws_with_failing_sink() {
    let audit = SecurityAudit::new(Arc::new(FailingSink));
    log_every_wrapper(&audit);

    let failed = audit.fallback().snapshot();
    assert_eq!(failed.len(), 18);
    assert!(
        failed
            .iter()
            .all(|f| f.error == SinkError::Unavailable("connection refused".to_string()))
    );
}

/// 测试 panic 的 sink 同样被吞掉
#[test]
fn test_audit_never_throws_with_panicking_sink() {
    let audit = SecurityAudit::new(Arc::new(PanickingSink));
    audit.log_login_attempt("a@example.com", false, &EventContext::new());
    audit.log_system_error("db", "down", &EventContext::new());

    let failed = audit.fallback().snapshot();
    assert_eq!(failed.len(), 2);
    assert_eq!(
        failed[0].error,
        SinkError::Panicked("sink exploded".to_string())
    );
}

/// 测试回退缓冲区的重试
#[test]
fn test_retry_failed_after_recovery() {
    let inner = InMemoryAuditSink::new();
    let sink = FlakySink {
        failures_left: AtomicUsize::new(2),
        inner: inner.clone(),
    };
    let audit = SecurityAudit::new(Arc::new(sink));
    let ctx = EventContext::new();

    audit.log_password_change("user_1", &ctx);
    audit.log_password_change("user_2", &ctx);
    assert_eq!(audit.fallback().len(), 2);
    assert!(inner.is_empty());

    assert_eq!(audit.retry_failed(), 2);
    assert!(audit.fallback().is_empty());
    assert_eq!(inner.len(), 2);
    assert_eq!(inner.events_by_subject("user_2").len(), 1);
}

/// 测试时间范围和最近事件查询
#[test]
fn test_time_range_and_recent_queries() {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let clock = ManualClock::new(start.timestamp_millis() as u64);
    let sink = InMemoryAuditSink::new();
    let audit = SecurityAudit::new(Arc::new(sink.clone())).with_clock(Arc::new(clock.clone()));
    let ctx = EventContext::new();

    audit.log_login_success("early", &ctx);
    clock.advance(std::time::Duration::from_secs(3600));
    audit.log_login_success("late", &ctx);

    let first_half = sink.events_in_range(start, start + Duration::minutes(30));
    assert_eq!(first_half.len(), 1);
    assert_eq!(first_half[0].subject_id(), Some("early"));

    let recent = sink.recent(1);
    assert_eq!(recent[0].subject_id(), Some("late"));
    assert_eq!(recent[0].timestamp(), start + Duration::hours(1));
}

/// 测试事件 JSON 形状
#[test]
fn test_event_json_shape() {
    let (audit, sink) = memory_audit();
    audit.log_csrf_violation(
        CsrfFailure::Mismatch,
        &EventContext::new().with_subject("user_1"),
    );

    let json: Value = serde_json::to_value(&sink.events()[0]).unwrap();
    assert_eq!(json["event_type"], "csrf_violation");
    assert_eq!(json["severity"], "warning");
    assert_eq!(json["subject_id"], "user_1");
    assert_eq!(json["details"]["reason"], "token_mismatch");
    assert!(json["id"].as_str().unwrap().starts_with("evt_"));
    assert!(json.get("source_address").is_none());
}

/// 测试后台异步写入
#[tokio::test]
async fn test_channel_sink_hands_off_to_worker() {
    let store = InMemoryAuditSink::new();
    let (channel, worker) = spawn_audit_worker(store.clone(), 16);
    let audit = SecurityAudit::new(Arc::new(channel));

    audit.log_admin_action("admin_1", "export", None, &EventContext::new());
    audit.log_mfa_verify("user_1", &EventContext::new());
    assert!(audit.fallback().is_empty());

    // 丢弃所有发送端后 worker 处理完剩余事件退出
    drop(audit);
    worker.await.unwrap();

    assert_eq!(store.len(), 2);
    assert_eq!(store.events()[0].event_type(), EventType::Admin);
}

/// 测试通道满时事件进入回退缓冲区
#[tokio::test(flavor = "current_thread")]
async fn test_full_channel_goes_to_fallback() {
    let store = InMemoryAuditSink::new();
    let (channel, worker) = spawn_audit_worker(store.clone(), 1);
    let audit = SecurityAudit::new(Arc::new(channel));
    let ctx = EventContext::new();

    // current_thread 运行时下 worker 在本任务让出前不会运行
    audit.log_mfa_verify("user_1", &ctx);
    audit.log_mfa_verify("user_2", &ctx);
    audit.log_mfa_verify("user_3", &ctx);

    let failed = audit.fallback().snapshot();
    assert_eq!(failed.len(), 2);
    assert!(failed.iter().all(|f| f.error == SinkError::ChannelFull));

    drop(audit);
    worker.await.unwrap();
    assert_eq!(store.len(), 1);
}
