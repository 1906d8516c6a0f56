//! ACME 協議所使用的 URL-safe Base64（無填充）編碼工具。

use data_encoding::BASE64URL_NOPAD;
use thiserror::Error;

/// Base64 解碼失敗時回傳的錯誤。
#[derive(Debug, Error)]
#[error("Base64 decode error: {0}")]
pub struct DecodeError(#[from] data_encoding::DecodeError);

/// 以 URL-safe 字元集編碼，並移除結尾的 `=` 填充。
pub fn encode_url<T: AsRef<[u8]>>(input: T) -> String {
    BASE64URL_NOPAD.encode(input.as_ref())
}

/// 解碼 URL-safe 且無填充的 Base64 字串。
///
/// 若輸入帶有 `=` 填充，會先移除再解碼。
pub fn decode_url(input: &str) -> Result<Vec<u8>, DecodeError> {
    Ok(BASE64URL_NOPAD.decode(input.trim_end_matches('=').as_bytes())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_safe_encoding() {
        let encoded = encode_url([0xFB, 0xFF, 0xFE]);
        assert_eq!(encoded, "-__-");
        assert!(!encode_url("Hello+World/123=").contains('='));
    }

    #[test]
    fn test_different_lengths() {
        assert_eq!(encode_url("a"), "YQ");
        assert_eq!(encode_url("ab"), "YWI");
        assert_eq!(encode_url("abc"), "YWJj");
        assert_eq!(encode_url(""), "");
    }

    #[test]
    fn test_decode_accepts_padding() {
        assert_eq!(decode_url("SGVsbG8sIFdvcmxkIQ").unwrap(), b"Hello, World!");
        assert_eq!(decode_url("SGVsbG8sIFdvcmxkIQ==").unwrap(), b"Hello, World!");
    }

    #[test]
    fn test_invalid_char() {
        assert!(decode_url("SGVsbG8$Ww").is_err());
    }
}
