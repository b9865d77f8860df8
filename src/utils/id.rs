//! 标识符生成
//!
//! 故障记录、监听器注册和函数调用都需要短小且足够唯一的标识符。
//! 短 ID 为 10 位 62 进制字符串（0-9, a-z, A-Z）。

use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

/// 62 进制字符集
const BASE62_CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// ID 长度
const ID_LENGTH: usize = 10;

/// 生成 10 位 62 进制 ID
///
/// 使用时间戳与随机数异或后编码。
///
/// # 示例
///
/// ```
/// use cjmod_runtime::utils::id::generate_id;
///
/// let id = generate_id();
/// assert_eq!(id.len(), 10);
/// ```
pub fn generate_id() -> String {
    let mut rng = rand::thread_rng();

    // 时钟早于 UNIX 纪元时退化为纯随机
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let random: u64 = rng.gen();
    let mut value = timestamp ^ random;

    let mut result = String::with_capacity(ID_LENGTH);
    let mut digits = [0u8; ID_LENGTH];
    for slot in digits.iter_mut().rev() {
        *slot = BASE62_CHARS[(value % 62) as usize];
        value /= 62;
    }
    for byte in digits {
        result.push(byte as char);
    }
    result
}

/// 验证 ID 格式是否有效
pub fn is_valid_id(id: &str) -> bool {
    id.len() == ID_LENGTH && id.chars().all(|c| c.is_ascii_alphanumeric())
}

/// 生成 UUID v4 字符串
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 生成一次函数调用的执行 ID，格式为 `<模块名>-<短 ID>`
pub fn generate_execution_id(module: &str) -> String {
    format!("{}-{}", module, generate_id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_id_length() {
        let id = generate_id();
        assert_eq!(id.len(), ID_LENGTH);
        assert!(is_valid_id(&id));
    }

    #[test]
    fn test_generate_id_uniqueness() {
        let mut ids = HashSet::new();
        for _ in 0..1000 {
            assert!(ids.insert(generate_id()), "ID collision detected");
        }
    }

    #[test]
    fn test_is_valid_id() {
        assert!(is_valid_id("a1B2c3D4e5"));
        assert!(!is_valid_id("short"));
        assert!(!is_valid_id("a1B2c3-4e5"));
    }

    #[test]
    fn test_execution_id() {
        let id = generate_execution_id("string-utils");
        assert!(id.starts_with("string-utils-"));
        assert_eq!(id.len(), "string-utils-".len() + ID_LENGTH);
    }

    #[test]
    fn test_generate_uuid() {
        let uuid = generate_uuid();
        assert_eq!(uuid.len(), 36);
    }
}
