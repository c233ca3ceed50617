//! 安全 Cookie 助手模块
//!
//! 提供 Cookie 签名、`Set-Cookie` 头生成，以及基于 Cookie 的
//! [`SessionContext`] 适配器：
//!
//! - **Cookie 签名**: 使用 HMAC-SHA256 签名 Cookie 值，篡改后验证失败
//! - **安全属性封装**: [`SecureCookie`] 封装 HttpOnly / Secure / SameSite
//! - **Session 适配**: [`CookieSession`] 读取请求的 `Cookie` 头，收集响应要写回的 `Set-Cookie`；
//!   session 值一律 HttpOnly，给前端读取的值通过 [`CookieSession::deliver`] 单独下发
//!
//! ## 基本签名与验证
//!
//! ```rust
//! use authguard::security::cookie::{sign_cookie, verify_cookie};
//!
//! let secret = b"my-secret-key-at-least-32-bytes!";
//! let signed = sign_cookie("user_session_data", secret).unwrap();
//! let original = verify_cookie(&signed, secret).unwrap();
//! assert_eq!(original, "user_session_data");
//! ```
//!
//! ## Cookie session
//!
//! ```rust
//! use authguard::security::cookie::CookieSession;
//! use authguard::security::session::SessionContext;
//!
//! let mut session = CookieSession::from_header(Some("theme=dark; csrf-token=abc"));
//! assert_eq!(session.client_cookie("csrf-token"), Some("abc"));
//!
//! session.set("csrf-record", "blob".to_string());
//! session.deliver("csrf-token", "def");
//! assert_eq!(session.get("csrf-token"), None);
//!
//! let headers = session.take_set_cookie_headers();
//! assert!(headers[0].contains("HttpOnly"));
//! assert!(headers[1].starts_with("csrf-token=def"));
//! assert!(!headers[1].contains("HttpOnly"));
//! ```

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{CryptoError, Error, Result};
use crate::security::session::SessionContext;

type HmacSha256 = Hmac<Sha256>;

/// 签名分隔符
const SIGNATURE_SEPARATOR: &str = ".";

/// SameSite Cookie 属性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SameSite {
    /// 严格模式：Cookie 只在同站请求时发送
    Strict,
    /// 宽松模式：允许顶级导航的跨站请求
    #[default]
    Lax,
    /// 无限制：所有请求都发送 Cookie（需要 Secure 属性）
    None,
}

impl std::fmt::Display for SameSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SameSite::Strict => write!(f, "Strict"),
            SameSite::Lax => write!(f, "Lax"),
            SameSite::None => write!(f, "None"),
        }
    }
}

/// 安全 Cookie 结构
///
/// 封装 Cookie 的所有安全相关属性
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureCookie {
    /// Cookie 名称
    pub name: String,
    /// Cookie 值
    pub value: String,
    /// HttpOnly 属性（防止 JavaScript 访问）
    #[serde(default)]
    pub http_only: bool,
    /// Secure 属性（仅通过 HTTPS 发送）
    #[serde(default)]
    pub secure: bool,
    /// SameSite 属性
    #[serde(default)]
    pub same_site: SameSite,
    /// Max-Age 属性
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_age: Option<Duration>,
    /// Path 属性
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl SecureCookie {
    /// 创建新的 Cookie（无安全属性）
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            http_only: false,
            secure: false,
            same_site: SameSite::Lax,
            max_age: None,
            path: None,
        }
    }

    /// 创建安全会话 Cookie（推荐默认值）
    ///
    /// 设置 HttpOnly、Secure、SameSite=Strict
    pub fn session(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, value)
            .http_only(true)
            .secure(true)
            .same_site(SameSite::Strict)
    }

    /// 设置 HttpOnly 属性
    pub fn http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    /// 设置 Secure 属性
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// 设置 SameSite 属性
    pub fn same_site(mut self, same_site: SameSite) -> Self {
        self.same_site = same_site;
        self
    }

    /// 设置 Max-Age 属性
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// 设置 Path 属性
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// 生成 Set-Cookie 头值
    ///
    /// ```rust
    /// use authguard::security::cookie::{SecureCookie, SameSite};
    ///
    /// let header = SecureCookie::session("csrf-record", "abc123").path("/").to_header_value();
    /// assert!(header.contains("csrf-record=abc123"));
    /// assert!(header.contains("HttpOnly"));
    /// assert!(header.contains("SameSite=Strict"));
    /// ```
    pub fn to_header_value(&self) -> String {
        let mut parts = vec![format!("{}={}", self.name, self.value)];

        if self.http_only {
            parts.push("HttpOnly".to_string());
        }

        if self.secure {
            parts.push("Secure".to_string());
        }

        parts.push(format!("SameSite={}", self.same_site));

        if let Some(ref max_age) = self.max_age {
            parts.push(format!("Max-Age={}", max_age.as_secs()));
        }

        if let Some(ref path) = self.path {
            parts.push(format!("Path={}", path));
        }

        parts.join("; ")
    }
}

/// 解析请求的 `Cookie` 头
///
/// 格式为 `a=1; b=2`，无法解析的片段会被忽略，重复名称以第一个为准。
pub fn parse_cookie_header(header: &str) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for pair in header.split(';') {
        let Some((name, value)) = pair.split_once('=') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        cookies
            .entry(name.to_string())
            .or_insert_with(|| value.trim().to_string());
    }
    cookies
}

fn mac_for(secret: &[u8]) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(secret)
        .map_err(|e| Error::Crypto(CryptoError::InvalidKey(e.to_string())))
}

/// 签名 Cookie 值
///
/// 使用 HMAC-SHA256 对值进行签名，返回格式为 `base64(value).base64(signature)`
pub fn sign_cookie(value: &str, secret: &[u8]) -> Result<String> {
    let encoded_value = URL_SAFE_NO_PAD.encode(value.as_bytes());

    let mut mac = mac_for(secret)?;
    mac.update(encoded_value.as_bytes());
    let signature = mac.finalize().into_bytes();
    let encoded_signature = URL_SAFE_NO_PAD.encode(signature);

    Ok(format!(
        "{}{}{}",
        encoded_value, SIGNATURE_SEPARATOR, encoded_signature
    ))
}

/// 验证签名的 Cookie 值
///
/// 如果签名有效，返回原始值；否则返回错误
pub fn verify_cookie(signed_value: &str, secret: &[u8]) -> Result<String> {
    let Some((encoded_value, encoded_signature)) = signed_value.rsplit_once(SIGNATURE_SEPARATOR)
    else {
        return Err(Error::validation("Invalid signed cookie format"));
    };

    let provided_signature = URL_SAFE_NO_PAD
        .decode(encoded_signature)
        .map_err(|_| Error::validation("Invalid signature encoding"))?;

    // verify_slice 内部为常量时间比较
    let mut mac = mac_for(secret)?;
    mac.update(encoded_value.as_bytes());
    mac.verify_slice(&provided_signature)
        .map_err(|_| Error::validation("Cookie signature verification failed"))?;

    let value_bytes = URL_SAFE_NO_PAD
        .decode(encoded_value)
        .map_err(|_| Error::validation("Invalid value encoding"))?;

    String::from_utf8(value_bytes).map_err(|_| Error::validation("Invalid UTF-8 in cookie value"))
}

/// 创建删除 Cookie 的头值
///
/// 设置 Max-Age=0 和过去的 Expires 时间
pub fn delete_cookie_header(name: &str, path: Option<&str>) -> String {
    let mut parts = vec![
        format!("{}=", name),
        "Max-Age=0".to_string(),
        "Expires=Thu, 01 Jan 1970 00:00:00 GMT".to_string(),
    ];

    if let Some(p) = path {
        parts.push(format!("Path={}", p));
    }

    parts.join("; ")
}

/// 基于 Cookie 的 session 适配器
///
/// 由请求的 `Cookie` 头初始化；`set`/`clear` 立即对后续 `get` 可见，
/// 同时按顺序记录需要写回响应的 `Set-Cookie` 头。
///
/// 通过 [`SessionContext`] 写入的值都是 HttpOnly + Secure + SameSite=Strict。
/// 需要被前端脚本读取的值（例如双重提交模式中的原始 token）不属于 session，
/// 只能通过 [`CookieSession::deliver`] 下发，之后的 `get` 也读不到它。
#[derive(Debug, Clone)]
pub struct CookieSession {
    inbound: HashMap<String, String>,
    values: HashMap<String, String>,
    path: String,
    max_age: Option<Duration>,
    secure: bool,
    pending: Vec<String>,
}

impl CookieSession {
    /// 从请求的 `Cookie` 头创建
    pub fn from_header(header: Option<&str>) -> Self {
        let inbound = header.map(parse_cookie_header).unwrap_or_default();
        Self {
            values: inbound.clone(),
            inbound,
            path: "/".to_string(),
            max_age: None,
            secure: true,
            pending: Vec::new(),
        }
    }

    /// 设置写出 Cookie 的 Path（默认 `/`）
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// 设置写出 Cookie 的 Max-Age
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// 是否设置 Secure 属性（本地 HTTP 开发时可关闭）
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// 请求中客户端带来的原始 Cookie 值
    pub fn client_cookie(&self, name: &str) -> Option<&str> {
        self.inbound.get(name).map(String::as_str)
    }

    /// 下发一个脚本可读的 Cookie（不设置 HttpOnly）
    ///
    /// 值只进入响应头，不写入 session。
    pub fn deliver(&mut self, name: &str, value: &str) {
        let header = self.cookie_for(name, value).http_only(false).to_header_value();
        self.pending.push(header);
    }

    /// 删除之前下发给客户端的 Cookie
    pub fn withdraw(&mut self, name: &str) {
        self.pending
            .push(delete_cookie_header(name, Some(self.path.as_str())));
    }

    /// 待写回的 `Set-Cookie` 头
    pub fn set_cookie_headers(&self) -> &[String] {
        &self.pending
    }

    /// 取出并清空待写回的 `Set-Cookie` 头
    pub fn take_set_cookie_headers(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending)
    }

    fn cookie_for(&self, name: &str, value: &str) -> SecureCookie {
        let mut cookie = SecureCookie::session(name, value)
            .secure(self.secure)
            .path(self.path.clone());
        if let Some(max_age) = self.max_age {
            cookie = cookie.max_age(max_age);
        }
        cookie
    }
}

impl SessionContext for CookieSession {
    fn get(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }

    fn set(&mut self, name: &str, value: String) {
        let header = self.cookie_for(name, &value).to_header_value();
        self.values.insert(name.to_string(), value);
        self.pending.push(header);
    }

    fn clear(&mut self, name: &str) {
        self.values.remove(name);
        self.withdraw(name);
    }
}
