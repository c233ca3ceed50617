//! Session 上下文模块
//!
//! CSRF 记录保存在调用方自己的 session 存储中（通常是一个服务端签名的 Cookie）。
//! 本模块只定义抽象的 get/set/clear 能力，具体的 Cookie/Header 处理由集成层实现，
//! 参见 [`crate::security::cookie::CookieSession`]。

use std::collections::HashMap;

/// 每个客户端 session 的小型键值存储
///
/// 实现方只需保证同一个请求内 `set` 之后的 `get` 能读到新值。
pub trait SessionContext {
    /// 读取一个值
    fn get(&self, name: &str) -> Option<String>;

    /// 写入（覆盖）一个值
    fn set(&mut self, name: &str, value: String);

    /// 删除一个值
    fn clear(&mut self, name: &str);
}

impl<T: SessionContext + ?Sized> SessionContext for &mut T {
    fn get(&self, name: &str) -> Option<String> {
        (**self).get(name)
    }

    fn set(&mut self, name: &str, value: String) {
        (**self).set(name, value)
    }

    fn clear(&mut self, name: &str) {
        (**self).clear(name)
    }
}

/// 内存 session
///
/// 用于测试以及不需要跨请求持久化的场景。
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MemorySession {
    values: HashMap<String, String>,
}

impl MemorySession {
    /// 创建空 session
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前保存的条目数
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl SessionContext for MemorySession {
    fn get(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }

    fn set(&mut self, name: &str, value: String) {
        self.values.insert(name.to_string(), value);
    }

    fn clear(&mut self, name: &str) {
        self.values.remove(name);
    }
}
