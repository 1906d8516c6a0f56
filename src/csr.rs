use openssl::{
    hash::MessageDigest,
    stack::Stack,
    x509::{
        extension::{BasicConstraints, KeyUsage, SubjectAlternativeName},
        X509NameBuilder, X509Req,
    },
};

use crate::key_pair::{CryptoError, KeyAlgorithm, KeyPair};

type Result<T> = std::result::Result<T, CryptoError>;

/// X.509 `commonName` 的長度上限 (RFC 5280 ub-common-name)
const MAX_COMMON_NAME_LEN: usize = 64;

/// 表示一個 CSR 建構器，生成包含主體替代名稱 (SAN) 擴展的證書簽名請求。
///
/// 每個域名都以 `DNS:<domain>` 列入 SAN，第一個不超過 64 字元的域名同時作為 CN。
#[derive(Debug, Default)]
pub struct CSR {
    san_entries: Vec<String>,
    organization: Option<String>,
    country: Option<String>,
}

impl CSR {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新增一個 DNS 主體替代名稱。
    pub fn set_san(mut self, dns_name: &str) -> Self {
        self.san_entries.push(dns_name.to_string());
        self
    }

    /// 一次加入多個域名。
    pub fn set_sans<S: AsRef<str>>(mut self, dns_names: &[S]) -> Self {
        self.san_entries
            .extend(dns_names.iter().map(|name| name.as_ref().to_string()));
        self
    }

    /// 主體的組織名稱（`O`）。
    pub fn organization(mut self, organization: &str) -> Self {
        self.organization = Some(organization.to_string());
        self
    }

    /// 主體的國家代碼（`C`）。
    pub fn country(mut self, country: &str) -> Self {
        self.country = Some(country.to_string());
        self
    }

    /// 以指定的金鑰對簽署並產生 CSR，摘要演算法為 SHA-256。
    ///
    /// 未設定任何 SAN 時回傳 [`CryptoError::NoSanEntries`]。
    /// 所有域名都超過 CN 長度上限時主體不含 CN，CA 只看 SAN。
    pub fn build(self, key_pair: &KeyPair) -> Result<X509Req> {
        if self.san_entries.is_empty() {
            return Err(CryptoError::NoSanEntries);
        }

        let mut name = X509NameBuilder::new().map_err(CryptoError::Csr)?;
        if let Some(common_name) = self
            .san_entries
            .iter()
            .find(|entry| entry.len() <= MAX_COMMON_NAME_LEN)
        {
            name.append_entry_by_text("CN", common_name)
                .map_err(CryptoError::Csr)?;
        }
        if let Some(organization) = &self.organization {
            name.append_entry_by_text("O", organization)
                .map_err(CryptoError::Csr)?;
        }
        if let Some(country) = &self.country {
            name.append_entry_by_text("C", country)
                .map_err(CryptoError::Csr)?;
        }

        let mut req_builder = X509Req::builder().map_err(CryptoError::Csr)?;
        req_builder
            .set_subject_name(&name.build())
            .map_err(CryptoError::Csr)?;
        req_builder
            .set_pubkey(&key_pair.pri_key)
            .map_err(CryptoError::Csr)?;

        let mut san_builder = SubjectAlternativeName::new();
        for entry in &self.san_entries {
            san_builder.dns(entry);
        }
        let san = san_builder
            .build(&req_builder.x509v3_context(None))
            .map_err(CryptoError::Csr)?;

        // RSA 金鑰可用於金鑰交換，EC 金鑰只做簽章
        let mut key_usage = KeyUsage::new();
        key_usage.critical().digital_signature();
        if key_pair.algorithm == KeyAlgorithm::Rsa {
            key_usage.key_encipherment();
        }

        let mut stack = Stack::new().map_err(CryptoError::Csr)?;
        stack
            .push(BasicConstraints::new().build().map_err(CryptoError::Csr)?)
            .map_err(CryptoError::Csr)?;
        stack
            .push(key_usage.build().map_err(CryptoError::Csr)?)
            .map_err(CryptoError::Csr)?;
        stack.push(san).map_err(CryptoError::Csr)?;
        req_builder
            .add_extensions(&stack)
            .map_err(CryptoError::Csr)?;

        req_builder
            .sign(&key_pair.pri_key, MessageDigest::sha256())
            .map_err(CryptoError::Csr)?;

        Ok(req_builder.build())
    }
}
