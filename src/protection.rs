use serde::{Deserialize, Serialize};

use crate::{
    base64,
    jwk::Jwk,
    key_pair::{CryptoError, KeyPair},
};

type Result<T> = std::result::Result<T, CryptoError>;

/// JWS protected header。
///
/// `jwk` 與 `kid` 互斥：帳戶 URL 未知時內嵌公鑰，已知後改以帳戶 URL 指向金鑰。
/// 金鑰輪替的內層 JWS 不帶 nonce。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedHeader {
    /// 簽章演算法
    pub alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwk: Option<Jwk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    /// 用於防止重放攻擊的隨機數
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// 請求目標 URL
    pub url: String,
}

impl ProtectedHeader {
    /// 序列化為 JSON 後以 URL-safe Base64 編碼。
    pub fn to_base64(&self) -> Result<String> {
        Ok(base64::encode_url(serde_json::to_vec(self)?))
    }
}

/// 用於生成 [`ProtectedHeader`] 的建構器。
///
/// 預設為 JWK 模式；呼叫 [`Protection::kid`] 後切換為 KID 模式。
#[derive(Debug)]
pub struct Protection<'a> {
    key_pair: &'a KeyPair,
    kid: Option<String>,
    nonce: Option<String>,
}

impl<'a> Protection<'a> {
    pub fn new(key_pair: &'a KeyPair) -> Self {
        Self {
            key_pair,
            kid: None,
            nonce: None,
        }
    }

    /// 以帳戶 URL 作為 key identifier。
    pub fn kid(mut self, account_url: impl Into<String>) -> Self {
        self.kid = Some(account_url.into());
        self
    }

    pub fn nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }

    /// 依目前設定產生指向 `url` 的 protected header。
    pub fn create_header(&self, url: impl Into<String>) -> Result<ProtectedHeader> {
        let jwk = match self.kid {
            Some(_) => None,
            None => Some(self.key_pair.jwk()?),
        };

        Ok(ProtectedHeader {
            alg: self.key_pair.jws_algorithm().to_string(),
            jwk,
            kid: self.kid.clone(),
            nonce: self.nonce.clone(),
            url: url.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_pair::KeyAlgorithm;
    use serde_json::Value;

    fn header_json(header: &ProtectedHeader) -> Value {
        serde_json::to_value(header).unwrap()
    }

    #[test]
    fn test_jwk_mode() {
        let key = KeyPair::generate(KeyAlgorithm::Rsa, Some(2048)).unwrap();
        let header = Protection::new(&key)
            .nonce("n-1")
            .create_header("https://x/acct")
            .unwrap();

        let json = header_json(&header);
        assert_eq!(json["alg"], "RS256");
        assert_eq!(json["nonce"], "n-1");
        assert_eq!(json["url"], "https://x/acct");
        assert_eq!(json["jwk"]["kty"], "RSA");
        assert_eq!(json["jwk"]["e"], "AQAB");
        assert!(json.get("kid").is_none());
    }

    #[test]
    fn test_kid_mode() {
        let key = KeyPair::generate(KeyAlgorithm::Rsa, Some(2048)).unwrap();
        let header = Protection::new(&key)
            .kid("https://x/acct/1")
            .nonce("n-2")
            .create_header("https://x/order")
            .unwrap();

        let json = header_json(&header);
        assert_eq!(json["kid"], "https://x/acct/1");
        assert!(json.get("jwk").is_none());
    }

    #[test]
    fn test_nonce_omitted_when_absent() {
        let key = KeyPair::generate(KeyAlgorithm::Ec, None).unwrap();
        let header = Protection::new(&key).create_header("https://x/key").unwrap();

        let json = header_json(&header);
        assert_eq!(json["alg"], "ES256");
        assert_eq!(json["jwk"]["crv"], "P-256");
        assert!(json.get("nonce").is_none());

        let decoded: ProtectedHeader =
            serde_json::from_slice(&base64::decode_url(&header.to_base64().unwrap()).unwrap())
                .unwrap();
        assert_eq!(decoded, header);
    }
}
