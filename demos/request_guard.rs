//! 请求防护演示
//!
//! 运行: `RUST_LOG=authguard=debug cargo run --example request_guard`
//!
//! 审计事件经由有界通道交给后台任务，以结构化 tracing 日志输出。

use authguard::audit::TracingAuditSink;
use authguard::clock::SystemClock;
use authguard::config::GuardConfig;
use authguard::guard::{RequestGuard, client_identifier, event_context};
use authguard::security::cookie::CookieSession;
use authguard::security::rate_limit::LimiterClass;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEMO_CONFIG: &str = r#"
[csrf]
secret = "demo-secret-change-me-in-production!"
ttl_secs = 3600

[audit]
channel_capacity = 64

[rate_limit.login]
window_ms = 60000
max_attempts = 3
"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "authguard=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = GuardConfig::from_toml_str(DEMO_CONFIG)?;
    config.apply_env();

    let (guard, worker) =
        RequestGuard::spawn_from_config(&config, TracingAuditSink, Arc::new(SystemClock))?;

    let forwarded_for = Some("203.0.113.7");
    let user_agent = Some("demo-client/1.0");
    let identity = client_identifier(forwarded_for, None, user_agent);
    let ctx = event_context(forwarded_for, None, user_agent);

    // 签发 token，并把 Set-Cookie 回放成下一次请求的 Cookie 头
    let mut response = CookieSession::from_header(None);
    let token = guard.csrf().issue_cookie(&mut response)?;
    let cookie_header = response
        .take_set_cookie_headers()
        .iter()
        .filter_map(|h| h.split(';').next().map(str::to_string))
        .collect::<Vec<_>>()
        .join("; ");

    let mut request = CookieSession::from_header(Some(&cookie_header));
    let info = guard.check_rate_limit(LimiterClass::Api, &identity, &ctx)?;
    for (name, value) in info.headers() {
        tracing::info!(header = name, value = %value, "rate limit header");
    }
    guard.verify_csrf(&mut request, Some(&token), &ctx)?;
    tracing::info!("state-changing request accepted");

    if let Err(e) = guard.verify_csrf(&mut request, Some("forged"), &ctx) {
        tracing::info!(error = %e, "forged request rejected");
    }

    for attempt in 1..=4 {
        match guard.login_attempt("victim@example.com", false, &ctx) {
            Ok(info) => tracing::info!(attempt, remaining = info.remaining, "login failed"),
            Err(e) => tracing::warn!(attempt, error = %e, "login blocked"),
        }
    }

    // 丢弃所有发送端，等待后台任务写完
    drop(guard);
    worker.await?;
    Ok(())
}
