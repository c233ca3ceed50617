//! 安全随机数模块
//!
//! CSRF token、盐值和审计事件 ID 都从这里取随机字节，统一使用操作系统 CSPRNG。
//! 随机源不可用时返回 [`CryptoError::RngFailed`]，由调用方决定失败方式。

use rand::{TryRngCore, rngs::OsRng};
use std::fmt::Write;
use subtle::ConstantTimeEq;

use crate::error::{CryptoError, Error, Result};

/// 用随机字节填满缓冲区
pub fn fill_random(buf: &mut [u8]) -> Result<()> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| Error::Crypto(CryptoError::RngFailed(e.to_string())))
}

/// 生成 `length` 个随机字节
///
/// ```rust
/// use authguard::random::random_bytes;
///
/// let salt = random_bytes(16).unwrap();
/// assert_eq!(salt.len(), 16);
/// ```
pub fn random_bytes(length: usize) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; length];
    fill_random(&mut bytes)?;
    Ok(bytes)
}

/// 生成小写十六进制随机串，长度为 `byte_length * 2`
pub fn random_hex(byte_length: usize) -> Result<String> {
    let bytes = random_bytes(byte_length)?;
    let mut out = String::with_capacity(byte_length * 2);
    for byte in bytes {
        // 写入 String 不会失败
        let _ = write!(out, "{byte:02x}");
    }
    Ok(out)
}

/// 常量时间比较，长度不同直接返回 `false`
pub fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
