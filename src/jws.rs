//! 此模組提供 ACME 請求所使用的 JSON Web Signature (JWS) 結構（flattened JSON 序列化）。

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::{
    base64::{self, DecodeError},
    key_pair::{CryptoError, KeyPair},
    protection::ProtectedHeader,
    signature,
};

/// 解析既有 JWS 時可能發生的錯誤。
#[derive(Error, Debug)]
pub enum JwsError {
    #[error("Base64 decode error: {0}")]
    Base64(#[from] DecodeError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// 表示一個 JSON Web Signature (JWS) 物件。
///
/// 三個欄位皆為 URL-safe Base64 字串；`payload` 為空字串時代表 POST-as-GET。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Jws {
    pub protected: String,
    pub payload: String,
    pub signature: String,
}

impl Jws {
    /// 對 `base64url(protected) + "." + payload` 簽名並組成 JWS。
    ///
    /// `payload` 必須已經過 Base64 編碼。
    pub fn sign(
        header: &ProtectedHeader,
        payload: &str,
        key_pair: &KeyPair,
    ) -> Result<Self, CryptoError> {
        let protected = header.to_base64()?;
        let signing_input = format!("{}.{}", protected, payload);
        let signature = signature::sign(signing_input.as_bytes(), key_pair)?;

        Ok(Jws {
            protected,
            payload: payload.to_string(),
            signature: base64::encode_url(signature),
        })
    }

    /// 將 `Jws` 實例序列化為 JSON 格式的字串。
    pub fn to_json(&self) -> Result<String, CryptoError> {
        Ok(serde_json::to_string(self)?)
    }

    /// 以公鑰驗證簽名；簽名不符回傳 `Ok(false)`，OpenSSL 失敗則回傳錯誤。
    pub fn verify(&self, key_pair: &KeyPair) -> Result<bool, JwsError> {
        let signature = base64::decode_url(&self.signature)?;
        let signing_input = format!("{}.{}", self.protected, self.payload);
        Ok(signature::verify(signing_input.as_bytes(), &signature, key_pair)?)
    }

    pub fn header(&self) -> Result<ProtectedHeader, JwsError> {
        Ok(serde_json::from_slice(&base64::decode_url(
            &self.protected,
        )?)?)
    }

    /// 解碼 payload；POST-as-GET 的空 payload 回傳 `None`。
    pub fn payload<T: DeserializeOwned>(&self) -> Result<Option<T>, JwsError> {
        if self.payload.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&base64::decode_url(
            &self.payload,
        )?)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{key_pair::KeyAlgorithm, protection::Protection};
    use serde_json::{json, Value};

    #[test]
    fn test_sign_and_verify_twice() {
        let key = KeyPair::generate(KeyAlgorithm::Rsa, Some(2048)).unwrap();
        let header = Protection::new(&key)
            .nonce("abc")
            .create_header("https://x/order")
            .unwrap();
        let payload = base64::encode_url(r#"{"identifiers":[]}"#);

        let first = Jws::sign(&header, &payload, &key).unwrap();
        let second = Jws::sign(&header, &payload, &key).unwrap();
        assert!(first.verify(&key).unwrap());
        assert!(second.verify(&key).unwrap());

        let other = KeyPair::generate(KeyAlgorithm::Rsa, Some(2048)).unwrap();
        assert!(!first.verify(&other).unwrap());
    }

    #[test]
    fn test_post_as_get_payload() {
        let key = KeyPair::generate(KeyAlgorithm::Ec, None).unwrap();
        let header = Protection::new(&key)
            .kid("https://x/acct/1")
            .nonce("abc")
            .create_header("https://x/authz/1")
            .unwrap();

        let jws = Jws::sign(&header, "", &key).unwrap();
        assert!(jws.verify(&key).unwrap());
        assert!(jws.payload::<Value>().unwrap().is_none());

        let wire: Value = serde_json::from_str(&jws.to_json().unwrap()).unwrap();
        assert_eq!(wire["payload"], json!(""));
        assert_eq!(jws.header().unwrap().kid.as_deref(), Some("https://x/acct/1"));
    }

    #[test]
    fn test_verify_reports_openssl_failure() {
        let key = KeyPair::generate(KeyAlgorithm::Ec, None).unwrap();
        let header = Protection::new(&key)
            .nonce("abc")
            .create_header("https://x/order")
            .unwrap();
        let mut jws = Jws::sign(&header, "", &key).unwrap();

        let mut tampered = base64::decode_url(&jws.signature).unwrap();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        jws.signature = base64::encode_url(tampered);
        assert!(!jws.verify(&key).unwrap());

        // EC 金鑰標成 RSA 時，非 DER 的簽名無法解析
        let mislabeled = KeyPair {
            algorithm: KeyAlgorithm::Rsa,
            pri_key: key.pri_key.clone(),
            pub_key: key.pub_key.clone(),
        };
        jws.signature = base64::encode_url([0xff; 64]);
        assert!(matches!(jws.verify(&mislabeled), Err(JwsError::Crypto(_))));
    }
}
