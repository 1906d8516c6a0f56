use openssl::{
    bn::{BigNum, BigNumContext},
    sha::sha256,
};
use serde::{Deserialize, Serialize};

use crate::{
    base64,
    key_pair::{CryptoError, KeyAlgorithm, KeyPair},
};

type Result<T> = std::result::Result<T, CryptoError>;

/// JSON Web Key 的公開參數。
///
/// 欄位宣告順序即序列化順序，且剛好是 RFC 7638 要求的字典序
/// （RSA：`e, kty, n`；EC：`crv, kty, x, y`），thumbprint 依賴這個順序。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Jwk {
    Rsa(RsaJwk),
    Ec(EcJwk),
}

/// RSA 公鑰的 JWK 表示。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsaJwk {
    e: String,
    kty: String,
    n: String,
}

/// EC（P-256）公鑰的 JWK 表示。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcJwk {
    crv: String,
    kty: String,
    x: String,
    y: String,
}

impl RsaJwk {
    /// 以已編碼的模數 `n` 與指數 `e` 建立。
    pub fn new(n: impl Into<String>, e: impl Into<String>) -> Self {
        Self {
            e: e.into(),
            kty: "RSA".to_string(),
            n: n.into(),
        }
    }
}

impl Jwk {
    /// 從金鑰對的公鑰擷取 JWK 參數。
    pub fn new(key_pair: &KeyPair) -> Result<Self> {
        match key_pair.algorithm {
            KeyAlgorithm::Rsa => {
                let rsa = key_pair.pub_key.rsa().map_err(CryptoError::Details)?;
                Ok(Jwk::Rsa(RsaJwk::new(
                    base64::encode_url(rsa.n().to_vec()),
                    base64::encode_url(rsa.e().to_vec()),
                )))
            }
            KeyAlgorithm::Ec => {
                let ec = key_pair.pub_key.ec_key().map_err(CryptoError::Details)?;
                let mut ctx = BigNumContext::new().map_err(CryptoError::Details)?;
                let mut x = BigNum::new().map_err(CryptoError::Details)?;
                let mut y = BigNum::new().map_err(CryptoError::Details)?;
                ec.public_key()
                    .affine_coordinates_gfp(ec.group(), &mut x, &mut y, &mut ctx)
                    .map_err(CryptoError::Details)?;

                Ok(Jwk::Ec(EcJwk {
                    crv: "P-256".to_string(),
                    kty: "EC".to_string(),
                    x: base64::encode_url(x.to_vec_padded(32).map_err(CryptoError::Details)?),
                    y: base64::encode_url(y.to_vec_padded(32).map_err(CryptoError::Details)?),
                }))
            }
        }
    }

    /// 只含必要成員、無空白的 JSON，即 thumbprint 的雜湊輸入。
    pub fn canonical_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// `base64url(SHA-256(canonical_json))`。
    pub fn thumbprint(&self) -> Result<String> {
        let digest = sha256(self.canonical_json()?.as_bytes());
        Ok(base64::encode_url(digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RFC7638_N: &str = "0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw";

    #[test]
    fn test_rfc7638_thumbprint() {
        let jwk = Jwk::Rsa(RsaJwk::new(RFC7638_N, "AQAB"));
        assert_eq!(
            jwk.thumbprint().unwrap(),
            "NzbLsXh8uDCcd-6MNwXF4W_7noWXFZAfHkxZsRGC9Xs"
        );
    }

    #[test]
    fn test_rsa_field_order_is_lexical() {
        let json = Jwk::Rsa(RsaJwk::new("nnn", "AQAB")).canonical_json().unwrap();
        assert_eq!(json, r#"{"e":"AQAB","kty":"RSA","n":"nnn"}"#);
    }

    #[test]
    fn test_ec_jwk_from_key() {
        let key = KeyPair::generate(KeyAlgorithm::Ec, None).unwrap();
        let json = key.jwk().unwrap().canonical_json().unwrap();
        assert!(json.starts_with(r#"{"crv":"P-256","kty":"EC","x":""#));
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["x"].as_str().unwrap().len(), 43);
        assert_eq!(value["y"].as_str().unwrap().len(), 43);
    }
}
