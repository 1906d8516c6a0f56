use chrono::{DateTime, Duration, Utc};
use openssl::{
    asn1::{Asn1Time, Asn1TimeRef},
    x509::X509,
};

use crate::key_pair::CryptoError;

/// 自定義結果型別，錯誤類型為 [`CryptoError`]
type Result<T> = std::result::Result<T, CryptoError>;

const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_END: &str = "-----END CERTIFICATE-----";

/// X.509 證書封裝結構，只提供流程所需的解析：DER 轉換與有效期間。
#[derive(Debug, Clone)]
pub struct Certificate {
    /// 內部使用的 X509 證書對象
    pub cert: X509,
}

impl Certificate {
    /// 根據 PEM 字串解析證書；有多個區塊時取第一個。
    pub fn new(pem: &str) -> Result<Self> {
        let cert = X509::from_pem(pem.as_bytes()).map_err(CryptoError::Certificate)?;
        Ok(Certificate { cert })
    }

    pub fn to_der(&self) -> Result<Vec<u8>> {
        self.cert.to_der().map_err(CryptoError::Certificate)
    }

    pub fn valid_from(&self) -> Result<DateTime<Utc>> {
        asn1_to_utc(self.cert.not_before())
    }

    pub fn valid_to(&self) -> Result<DateTime<Utc>> {
        asn1_to_utc(self.cert.not_after())
    }
}

fn asn1_to_utc(time: &Asn1TimeRef) -> Result<DateTime<Utc>> {
    let epoch = Asn1Time::from_unix(0).map_err(CryptoError::Certificate)?;
    let diff = epoch.diff(time).map_err(CryptoError::Certificate)?;
    let seconds = diff.days as i64 * 86400 + diff.secs as i64;
    DateTime::from_timestamp(seconds, 0).ok_or(CryptoError::NoCertificate)
}

/// 依序取出文字中每個 `BEGIN/END CERTIFICATE` 區塊（含邊界行）。
pub fn split_pem_chain(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(PEM_BEGIN) {
        let Some(len) = rest[start..].find(PEM_END) else {
            break;
        };
        let end = start + len + PEM_END.len();
        blocks.push(rest[start..end].to_string());
        rest = &rest[end..];
    }
    blocks
}

/// 簽發完成後的憑證與相關檔案內容（皆為 PEM）。
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// 葉憑證
    pub certificate: String,
    /// 葉憑證加上中繼憑證，依伺服器回傳順序以換行串接
    pub certificate_full_chained: String,
    pub private_key: String,
    pub public_key: String,
    pub csr: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
}

impl CertificateInfo {
    /// 由伺服器下載的 PEM 鏈組成憑證資訊。
    pub fn from_chain(
        chain: &str,
        private_key: String,
        public_key: String,
        csr: String,
    ) -> Result<Self> {
        let blocks = split_pem_chain(chain);
        let certificate = blocks.first().cloned().ok_or(CryptoError::NoCertificate)?;
        let leaf = Certificate::new(&certificate)?;

        Ok(Self {
            valid_from: leaf.valid_from()?,
            valid_to: leaf.valid_to()?,
            certificate_full_chained: blocks.join("\n"),
            certificate,
            private_key,
            public_key,
            csr,
        })
    }

    /// 憑證是否會在 `days` 天內到期（已過期也算）。
    pub fn expires_within(&self, days: i64) -> bool {
        self.valid_to - Utc::now() <= Duration::days(days)
    }
}
