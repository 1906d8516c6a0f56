use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{base64, jwk::Jwk, jws::Jws};

/// 載荷驗證或序列化失敗。
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Invalid payload: {0}")]
    Invalid(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// 定義所有 API 載荷（Payload）必須實作的功能。
///
/// 實作者只需提供 `validate`；[`PayloadT::to_base64`] 會先驗證再序列化。
pub trait PayloadT: Serialize {
    /// 驗證載荷資料是否符合協議要求。
    fn validate(&self) -> Result<(), PayloadError> {
        Ok(())
    }

    /// 驗證後序列化為 JSON，並以 URL-safe Base64 編碼。
    fn to_base64(&self) -> Result<String, PayloadError> {
        self.validate()?;
        Ok(base64::encode_url(serde_json::to_vec(self)?))
    }
}

/// 表示建立新帳號所需的載荷資料。
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAccountPayload {
    contact: Vec<String>,
    terms_of_service_agreed: bool,
}

impl NewAccountPayload {
    /// 每個 email 會自動補上 `mailto:` 前綴，並同意服務條款。
    pub fn new(emails: &[String]) -> Self {
        NewAccountPayload {
            contact: mailto(emails),
            terms_of_service_agreed: true,
        }
    }
}

impl PayloadT for NewAccountPayload {
    fn validate(&self) -> Result<(), PayloadError> {
        if !self.terms_of_service_agreed {
            return Err(PayloadError::Invalid(
                "Terms of service must be agreed".to_string(),
            ));
        }
        Ok(())
    }
}

/// 以帳戶金鑰查詢既有帳戶（`onlyReturnExisting`），不會建立新帳戶。
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountLookupPayload {
    only_return_existing: bool,
}

impl AccountLookupPayload {
    pub fn new() -> Self {
        Self {
            only_return_existing: true,
        }
    }
}

impl Default for AccountLookupPayload {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadT for AccountLookupPayload {}

/// 更新帳戶聯絡資訊。
#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateContactPayload {
    contact: Vec<String>,
}

impl UpdateContactPayload {
    pub fn new(emails: &[String]) -> Self {
        Self {
            contact: mailto(emails),
        }
    }
}

impl PayloadT for UpdateContactPayload {}

/// 停用帳戶，`status` 固定為 `deactivated`。
#[derive(Debug, Serialize, Deserialize)]
pub struct DeactivatePayload {
    status: String,
}

impl DeactivatePayload {
    pub fn new() -> Self {
        Self {
            status: "deactivated".to_string(),
        }
    }
}

impl Default for DeactivatePayload {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadT for DeactivatePayload {}

/// 金鑰輪替內層 JWS 的載荷：帳戶 URL 與舊金鑰。
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyChangePayload {
    pub account: String,
    pub old_key: Jwk,
}

impl PayloadT for KeyChangePayload {
    fn validate(&self) -> Result<(), PayloadError> {
        if self.account.is_empty() {
            return Err(PayloadError::Invalid(
                "Key change requires the account URL".to_string(),
            ));
        }
        Ok(())
    }
}

/// 內層 JWS 整個作為外層請求的載荷。
impl PayloadT for Jws {}

/// 表示一個識別項，用來描述證書所涵蓋的主機名稱。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub type_: String,
    pub value: String,
}

impl Identifier {
    pub fn dns(value: impl Into<String>) -> Self {
        Self {
            type_: "dns".to_string(),
            value: value.into(),
        }
    }
}

/// 表示建立新訂單時所需的載荷資料。
///
/// `notBefore`／`notAfter` 未指定時不會出現在 JSON 中。
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderPayload {
    pub identifiers: Vec<Identifier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<String>,
}

impl NewOrderPayload {
    /// 為每個域名建立類型為 `"dns"` 的識別項。
    pub fn new<S: AsRef<str>>(domains: &[S]) -> Self {
        NewOrderPayload {
            identifiers: domains
                .iter()
                .map(|domain| Identifier::dns(domain.as_ref()))
                .collect(),
            not_before: None,
            not_after: None,
        }
    }
}

impl PayloadT for NewOrderPayload {
    /// - 必須至少包含一個識別項。
    /// - 所有識別項的類型必須為 `"dns"` 且值不得為空。
    fn validate(&self) -> Result<(), PayloadError> {
        if self.identifiers.is_empty() {
            return Err(PayloadError::Invalid(
                "At least one identifier is required".to_string(),
            ));
        }
        for identifier in &self.identifiers {
            if identifier.type_ != "dns" {
                return Err(PayloadError::Invalid(
                    "Identifier type must be 'dns'".to_string(),
                ));
            }
            if identifier.value.is_empty() {
                return Err(PayloadError::Invalid(
                    "Identifier value cannot be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// 通知伺服器開始驗證挑戰。
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeValidationPayload {
    key_authorization: String,
}

impl ChallengeValidationPayload {
    pub fn new(key_authorization: impl Into<String>) -> Self {
        Self {
            key_authorization: key_authorization.into(),
        }
    }
}

impl PayloadT for ChallengeValidationPayload {}

/// 表示最終化訂單時所需的載荷資料，`csr` 為 DER 的 URL-safe Base64。
#[derive(Debug, Serialize, Deserialize)]
pub struct FinalizeOrderPayload {
    csr: String,
}

impl FinalizeOrderPayload {
    pub fn new(csr_der: &[u8]) -> Self {
        FinalizeOrderPayload {
            csr: base64::encode_url(csr_der),
        }
    }
}

impl PayloadT for FinalizeOrderPayload {}

/// 撤銷憑證；`reason` 為 RFC 5280 §5.3.1 的代碼，原樣送出。
#[derive(Debug, Serialize, Deserialize)]
pub struct RevokePayload {
    certificate: String,
    reason: u32,
}

impl RevokePayload {
    pub fn new(certificate_der: &[u8], reason: u32) -> Self {
        Self {
            certificate: base64::encode_url(certificate_der),
            reason,
        }
    }
}

impl PayloadT for RevokePayload {
    fn validate(&self) -> Result<(), PayloadError> {
        if self.certificate.is_empty() {
            return Err(PayloadError::Invalid(
                "Certificate cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn mailto(emails: &[String]) -> Vec<String> {
    emails
        .iter()
        .map(|email| {
            if email.starts_with("mailto:") {
                email.clone()
            } else {
                format!("mailto:{}", email)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn decode(encoded: &str) -> Value {
        serde_json::from_slice(&base64::decode_url(encoded).unwrap()).unwrap()
    }

    #[test]
    fn test_new_account_prefixes_mailto() {
        let emails = vec!["a@x.com".to_string(), "mailto:b@x.com".to_string()];
        let json = decode(&NewAccountPayload::new(&emails).to_base64().unwrap());
        assert_eq!(
            json,
            json!({
                "contact": ["mailto:a@x.com", "mailto:b@x.com"],
                "termsOfServiceAgreed": true
            })
        );
    }

    #[test]
    fn test_new_order_omits_validity_window() {
        let payload = NewOrderPayload::new(&["*.example.com", "example.com"]);
        let json = decode(&payload.to_base64().unwrap());
        assert_eq!(json["identifiers"][0], json!({"type": "dns", "value": "*.example.com"}));
        assert!(json.get("notBefore").is_none());
        assert!(json.get("notAfter").is_none());
    }

    #[test]
    fn test_new_order_requires_identifiers() {
        let payload = NewOrderPayload::new::<&str>(&[]);
        assert!(matches!(payload.to_base64(), Err(PayloadError::Invalid(_))));
    }

    #[test]
    fn test_lookup_and_deactivate() {
        assert_eq!(
            decode(&AccountLookupPayload::new().to_base64().unwrap()),
            json!({"onlyReturnExisting": true})
        );
        assert_eq!(
            decode(&DeactivatePayload::new().to_base64().unwrap()),
            json!({"status": "deactivated"})
        );
    }

    #[test]
    fn test_revoke_passes_reason_through() {
        let json = decode(&RevokePayload::new(&[1, 2, 3], 4).to_base64().unwrap());
        assert_eq!(json, json!({"certificate": "AQID", "reason": 4}));
    }
}
