//! 联系方式字段加密
//!
//! 用户的手机号、邮箱和推送令牌在任何持久化记录与日志中都不得以
//! 明文出现。偏好文档落库前经此模块加密，投递前在内存中瞬时解密；
//! 日志引用一律走下方的脱敏函数。密钥是强制配置项，不提供
//! "开发环境免加密"的降级路径。
//!
//! 算法选 AES-256-GCM：AEAD 同时给出机密性和完整性，被篡改的
//! 密文在解密时直接失败。每次加密独立取随机 nonce，同号码多次
//! 落库产生不同密文，避免通过密文相等比对出"两个用户同号"。
//!
//! 存储格式: `base64(nonce[12] || ciphertext || tag[16])`

use aes_gcm::{AeadCore, Aes256Gcm, KeyInit, aead::Aead};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

/// GCM 推荐的 96-bit nonce
const NONCE_LEN: usize = 12;

/// 加密模块错误类型
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("加密失败: {0}")]
    EncryptionFailed(String),

    #[error("解密失败: {0}")]
    DecryptionFailed(String),

    #[error("密钥长度错误: 需要 32 字节，实际 {0} 字节")]
    InvalidKeyLength(usize),

    #[error("密钥不是合法的 hex 字符串")]
    InvalidKeyEncoding,

    #[error("密文格式错误: {0}")]
    InvalidCiphertext(String),
}

/// 字段级加密器
///
/// Send + Sync，组合根创建一次后以 Arc 注入路由器与摘要引擎。
#[derive(Clone)]
pub struct FieldEncryptor {
    cipher: Aes256Gcm,
}

impl FieldEncryptor {
    /// 从 32 字节密钥创建加密器；其他长度一律拒绝
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != 32 {
            return Err(CryptoError::InvalidKeyLength(key.len()));
        }
        Aes256Gcm::new_from_slice(key)
            .map(|cipher| Self { cipher })
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
    }

    /// 从 hex 编码的密钥创建加密器
    ///
    /// 部署侧通过 `NOTIFY_ENCRYPTION_KEY_HEX` 注入 64 字符 hex。
    pub fn from_hex(hex_key: &str) -> Result<Self, CryptoError> {
        let key = decode_hex(hex_key).ok_or(CryptoError::InvalidKeyEncoding)?;
        Self::new(&key)
    }

    /// 加密一个联系方式字段
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut aes_gcm::aead::OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        // nonce 前置拼接后整体编码，解密按固定长度拆回
        let mut wire = nonce.to_vec();
        wire.extend(sealed);
        Ok(STANDARD.encode(wire))
    }

    /// 解密 [`encrypt`](Self::encrypt) 产出的密文
    pub fn decrypt(&self, stored: &str) -> Result<String, CryptoError> {
        let wire = STANDARD
            .decode(stored)
            .map_err(|e| CryptoError::InvalidCiphertext(format!("base64 解码失败: {e}")))?;

        // nonce 之后至少还要有 GCM 认证标签
        if wire.len() <= NONCE_LEN {
            return Err(CryptoError::InvalidCiphertext(format!(
                "密文过短: {} 字节",
                wire.len()
            )));
        }

        let (nonce, sealed) = wire.split_at(NONCE_LEN);
        let opened = self
            .cipher
            .decrypt(aes_gcm::Nonce::from_slice(nonce), sealed)
            .map_err(|_| CryptoError::DecryptionFailed("认证失败，密文损坏或密钥不符".to_string()))?;

        String::from_utf8(opened)
            .map_err(|e| CryptoError::DecryptionFailed(format!("明文非 UTF-8: {e}")))
    }
}

/// 解码 hex 字符串；任何非法字符或奇数长度返回 None
fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    let bytes = hex.as_bytes();
    if bytes.is_empty() || bytes.len() % 2 != 0 {
        return None;
    }
    bytes
        .chunks(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some((hi << 4 | lo) as u8)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// 日志脱敏
// ---------------------------------------------------------------------------

/// 邮箱脱敏，域名保留便于排查服务商侧退信
///
/// `alice@example.com` -> `a***@example.com`
pub fn mask_email(email: &str) -> String {
    let Some((local, domain)) = email.split_once('@') else {
        return "***".to_string();
    };
    match local.chars().next() {
        Some(first) => format!("{first}***@{domain}"),
        None => format!("***@{domain}"),
    }
}

/// 手机号脱敏，保留前 3 后 4 位数字
///
/// `+14155550123` -> `141****0123`；不足 7 位的号码全部遮蔽。
pub fn mask_phone(phone: &str) -> String {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 7 {
        return "****".to_string();
    }
    // 纯 ASCII，可安全按字节切片
    format!("{}****{}", &digits[..3], &digits[digits.len() - 4..])
}

/// 推送令牌脱敏，只留末 6 位
///
/// 令牌被服务商判定失效时日志记录此后缀，供上游比对清理设备
/// 注册表；完整令牌不落日志。
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 6 {
        return "***".to_string();
    }
    let suffix: String = chars[chars.len() - 6..].iter().collect();
    format!("...{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encryptor() -> FieldEncryptor {
        FieldEncryptor::new(b"0123456789abcdef0123456789abcdef").unwrap()
    }

    #[test]
    fn roundtrip_restores_plaintext() {
        let e = encryptor();
        for field in ["+14155550123", "alice@example.com", "fcm-token-xyz", ""] {
            let stored = e.encrypt(field).unwrap();
            if !field.is_empty() {
                assert_ne!(stored, field);
            }
            assert_eq!(e.decrypt(&stored).unwrap(), field);
        }
    }

    #[test]
    fn same_field_never_repeats_ciphertext() {
        let e = encryptor();
        let first = e.encrypt("+14155550123").unwrap();
        let second = e.encrypt("+14155550123").unwrap();

        // 随机 nonce：同号码两次落库密文不同，但都能还原
        assert_ne!(first, second);
        assert_eq!(e.decrypt(&first).unwrap(), "+14155550123");
        assert_eq!(e.decrypt(&second).unwrap(), "+14155550123");
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let stored = encryptor().encrypt("secret phone").unwrap();

        let other = FieldEncryptor::new(b"ffffffffffffffffffffffffffffffff").unwrap();
        assert!(matches!(
            other.decrypt(&stored),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn key_length_is_enforced() {
        assert!(matches!(
            FieldEncryptor::new(&[7u8; 16]),
            Err(CryptoError::InvalidKeyLength(16))
        ));
        assert!(matches!(
            FieldEncryptor::new(&[7u8; 48]),
            Err(CryptoError::InvalidKeyLength(48))
        ));
        assert!(FieldEncryptor::new(&[7u8; 32]).is_ok());
    }

    #[test]
    fn hex_key_parsing() {
        // 64 个 hex 字符 = 32 字节
        let hex = "aa".repeat(32);
        let e = FieldEncryptor::from_hex(&hex).unwrap();
        let stored = e.encrypt("+8613812345678").unwrap();
        assert_eq!(e.decrypt(&stored).unwrap(), "+8613812345678");

        // 空串、奇数长度、非 hex 字符、长度不是 32 字节
        for bad in ["", "abc", "zz".repeat(32).as_str(), "aabb"] {
            assert!(FieldEncryptor::from_hex(bad).is_err());
        }
    }

    #[test]
    fn tampered_or_truncated_ciphertext_rejected() {
        let e = encryptor();

        // 非 base64
        assert!(e.decrypt("!!not base64!!").is_err());

        // 解码后不足 nonce + tag
        assert!(e.decrypt(&STANDARD.encode([0u8; NONCE_LEN])).is_err());

        // 翻转密文末字节，GCM 认证标签校验失败
        let stored = e.encrypt("+14155550123").unwrap();
        let mut wire = STANDARD.decode(&stored).unwrap();
        *wire.last_mut().unwrap() ^= 0x01;
        assert!(e.decrypt(&STANDARD.encode(wire)).is_err());
    }

    // ==================== 脱敏函数 ====================

    #[test]
    fn mask_email_keeps_first_char_and_domain() {
        assert_eq!(mask_email("alice@example.com"), "a***@example.com");
        assert_eq!(mask_email("x@bank.example.com"), "x***@bank.example.com");
        assert_eq!(mask_email("@bank.example.com"), "***@bank.example.com");
        assert_eq!(mask_email("not an address"), "***");
    }

    #[test]
    fn mask_phone_keeps_edges_only() {
        assert_eq!(mask_phone("+14155550123"), "141****0123");
        assert_eq!(mask_phone("+8613812345678"), "861****5678");
        // 号码过短时不保留任何位，防止反推
        assert_eq!(mask_phone("+1234"), "****");
    }

    #[test]
    fn mask_token_keeps_suffix_only() {
        assert_eq!(mask_token("fcm-token-abcdef123456"), "...123456");
        assert_eq!(mask_token("tiny"), "***");
    }
}
