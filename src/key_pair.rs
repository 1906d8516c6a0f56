use std::{fmt, str::FromStr};

use openssl::{
    ec::{EcGroup, EcKey},
    error::ErrorStack,
    nid::Nid,
    pkey::{Id, PKey, Private, Public},
    rsa::Rsa,
};
use thiserror::Error;

use crate::jwk::Jwk;

/// 金鑰、簽名、CSR 與憑證處理時可能發生的錯誤。
///
/// 每個變體都標示出失敗的步驟，方便判斷是產生、匯出還是解析細節時出錯。
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Failed to generate {algorithm} key pair: {source}")]
    Generate {
        algorithm: KeyAlgorithm,
        source: ErrorStack,
    },
    #[error("Failed to export key: {0}")]
    Export(ErrorStack),
    #[error("Failed to read key details: {0}")]
    Details(ErrorStack),
    #[error("Failed to sign data: {0}")]
    Sign(ErrorStack),
    #[error("Failed to build CSR: {0}")]
    Csr(ErrorStack),
    #[error("Failed to process certificate: {0}")]
    Certificate(ErrorStack),
    #[error("Unsupported key type")]
    UnsupportedKey,
    #[error("Unknown key algorithm: {0}")]
    UnknownAlgorithm(String),
    #[error("CSR requires at least one domain")]
    NoSanEntries,
    #[error("No PEM certificate block found")]
    NoCertificate,
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, CryptoError>;

/// 支援的金鑰演算法。
///
/// 帳戶金鑰固定使用 RSA；憑證金鑰可選 RSA 或 EC（P-256）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyAlgorithm {
    Rsa,
    Ec,
}

impl KeyAlgorithm {
    /// 預設的 RSA 金鑰長度。
    pub const DEFAULT_RSA_BITS: u32 = 4096;

    /// 演算法名稱，同時作為儲存路徑的一部分。
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rsa => "rsa",
            Self::Ec => "ec",
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyAlgorithm {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "rsa" => Ok(Self::Rsa),
            "ec" | "ecdsa" => Ok(Self::Ec),
            other => Err(CryptoError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// 一組非對稱金鑰對。
///
/// 私鑰與由其派生的公鑰一併保存，持久化時分別匯出為兩個 PEM 區塊。
#[derive(Debug, Clone)]
pub struct KeyPair {
    /// 金鑰演算法。
    pub algorithm: KeyAlgorithm,
    /// 私鑰，使用 OpenSSL 的 `PKey` 封裝。
    pub pri_key: PKey<Private>,
    /// 公鑰，從私鑰派生而來。
    pub pub_key: PKey<Public>,
}

impl KeyPair {
    /// 依指定演算法產生新的金鑰對。
    ///
    /// `bits` 僅對 RSA 有效，未提供時使用 4096 位元；EC 固定使用 P-256 曲線。
    pub fn generate(algorithm: KeyAlgorithm, bits: Option<u32>) -> Result<Self> {
        let generate_err = |source| CryptoError::Generate { algorithm, source };

        let pri_key = match algorithm {
            KeyAlgorithm::Rsa => {
                let rsa = Rsa::generate(bits.unwrap_or(KeyAlgorithm::DEFAULT_RSA_BITS))
                    .map_err(generate_err)?;
                PKey::from_rsa(rsa).map_err(generate_err)?
            }
            KeyAlgorithm::Ec => {
                let group =
                    EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).map_err(generate_err)?;
                let ec = EcKey::generate(&group).map_err(generate_err)?;
                PKey::from_ec_key(ec).map_err(generate_err)?
            }
        };

        Self::from_private_key(pri_key)
    }

    /// 根據 PEM 格式的私鑰資料建立金鑰對，演算法由金鑰本身判斷。
    pub fn from_pem(pri_key_pem: &[u8]) -> Result<Self> {
        let pri_key = PKey::private_key_from_pem(pri_key_pem).map_err(CryptoError::Details)?;
        Self::from_private_key(pri_key)
    }

    fn from_private_key(pri_key: PKey<Private>) -> Result<Self> {
        let algorithm = match pri_key.id() {
            Id::RSA => KeyAlgorithm::Rsa,
            Id::EC => KeyAlgorithm::Ec,
            _ => return Err(CryptoError::UnsupportedKey),
        };
        let pub_pem = pri_key
            .public_key_to_pem()
            .map_err(CryptoError::Export)?;
        let pub_key = PKey::public_key_from_pem(&pub_pem).map_err(CryptoError::Details)?;

        Ok(Self {
            algorithm,
            pri_key,
            pub_key,
        })
    }

    /// 以 PKCS#8 PEM 匯出私鑰。
    pub fn private_pem(&self) -> Result<Vec<u8>> {
        self.pri_key
            .private_key_to_pem_pkcs8()
            .map_err(CryptoError::Export)
    }

    /// 以 SubjectPublicKeyInfo PEM 匯出公鑰。
    pub fn public_pem(&self) -> Result<Vec<u8>> {
        self.pub_key.public_key_to_pem().map_err(CryptoError::Export)
    }

    /// 此金鑰對應的 JWK 公開參數。
    pub fn jwk(&self) -> Result<Jwk> {
        Jwk::new(self)
    }

    /// 計算金鑰的 JWK thumbprint（RFC 7638），以 URL-safe Base64 回傳。
    pub fn thumbprint(&self) -> Result<String> {
        self.jwk()?.thumbprint()
    }

    /// JWS `alg` 欄位的值。
    pub fn jws_algorithm(&self) -> &'static str {
        match self.algorithm {
            KeyAlgorithm::Rsa => "RS256",
            KeyAlgorithm::Ec => "ES256",
        }
    }

    /// 取得金鑰長度（位元）。
    pub fn bits(&self) -> u32 {
        self.pri_key.bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_rsa_round_trips_through_pem() {
        let key = KeyPair::generate(KeyAlgorithm::Rsa, Some(2048)).unwrap();
        assert_eq!(key.algorithm, KeyAlgorithm::Rsa);
        assert_eq!(key.bits(), 2048);
        assert_eq!(key.jws_algorithm(), "RS256");

        let pem = key.private_pem().unwrap();
        let restored = KeyPair::from_pem(&pem).unwrap();
        assert_eq!(restored.thumbprint().unwrap(), key.thumbprint().unwrap());
        assert_eq!(restored.public_pem().unwrap(), key.public_pem().unwrap());
    }

    #[test]
    fn test_generate_ec_key() {
        let key = KeyPair::generate(KeyAlgorithm::Ec, None).unwrap();
        assert_eq!(key.algorithm, KeyAlgorithm::Ec);
        assert_eq!(key.bits(), 256);
        assert_eq!(key.jws_algorithm(), "ES256");
        assert!(String::from_utf8(key.public_pem().unwrap())
            .unwrap()
            .starts_with("-----BEGIN PUBLIC KEY-----"));
    }

    #[test]
    fn test_thumbprint_is_stable() {
        let key = KeyPair::generate(KeyAlgorithm::Rsa, Some(2048)).unwrap();
        let first = key.thumbprint().unwrap();
        assert_eq!(first, key.thumbprint().unwrap());
        assert_eq!(first.len(), 43);
    }

    #[test]
    fn test_algorithm_parsing() {
        assert_eq!("RSA".parse::<KeyAlgorithm>().unwrap(), KeyAlgorithm::Rsa);
        assert_eq!("ec".parse::<KeyAlgorithm>().unwrap(), KeyAlgorithm::Ec);
        assert!(matches!(
            "dsa".parse::<KeyAlgorithm>(),
            Err(CryptoError::UnknownAlgorithm(_))
        ));
        assert_eq!(KeyAlgorithm::Ec.to_string(), "ec");
    }
}
