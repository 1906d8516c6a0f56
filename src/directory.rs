use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, Level};

use crate::transport::{Rejection, RequestError, Transport};

/// 表示取得目錄時可能發生的錯誤類型。
#[derive(Debug, Error)]
pub enum EndpointError {
    /// HTTP 請求錯誤。
    #[error("Request error: {0}")]
    Request(#[from] RequestError),
    /// 目錄端點回傳非 200。
    #[error("Directory request rejected: {0}")]
    Rejected(Rejection),
    /// 目錄缺少必要欄位或格式錯誤。
    #[error("Invalid directory object: {0}")]
    Decode(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, EndpointError>;

/// ACME 目錄：協議各端點的 URL。
///
/// 每個 session 只取得一次，之後不再變動。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    pub new_nonce: String,
    pub new_account: String,
    pub new_order: String,
    pub revoke_cert: String,
    pub key_change: String,
    /// 預先授權端點，多數 CA 不提供。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_authz: Option<String>,
    /// ARI 續約資訊端點。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renewal_info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<DirectoryMeta>,
}

/// 目錄附帶的 CA 資訊。
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terms_of_service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default)]
    pub caa_identities: Vec<String>,
    #[serde(default)]
    pub external_account_required: bool,
}

impl Directory {
    /// 以一次 GET 取得目錄。
    #[instrument(level = Level::INFO, name = "Directory::fetch", err, skip(transport))]
    pub fn fetch(transport: &dyn Transport, url: &str) -> Result<Self> {
        let response = transport.get(url)?;
        if response.status != StatusCode::OK {
            return Err(EndpointError::Rejected(response.into_rejection()));
        }
        let directory: Directory = serde_json::from_slice(&response.body)?;
        debug!(?directory, "Resolved directory");
        Ok(directory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{HttpResponse, MockTransport};
    use reqwest::Method;
    use serde_json::json;

    const URL: &str = "https://x/directory";

    #[test]
    fn test_fetch_directory() {
        let transport = MockTransport::new();
        transport.on(
            Method::GET,
            URL,
            HttpResponse::new(StatusCode::OK).with_json(&json!({
                "newAccount": "https://x/acct",
                "newOrder": "https://x/order",
                "newNonce": "https://x/nonce",
                "keyChange": "https://x/key",
                "revokeCert": "https://x/revoke",
                "meta": {
                    "termsOfService": "https://x/tos",
                    "caaIdentities": ["x"]
                },
                "unknownField": 1
            })),
        );

        let directory = Directory::fetch(&transport, URL).unwrap();
        assert_eq!(directory.new_account, "https://x/acct");
        assert_eq!(directory.key_change, "https://x/key");
        assert!(directory.renewal_info.is_none());
        let meta = directory.meta.unwrap();
        assert_eq!(meta.terms_of_service.as_deref(), Some("https://x/tos"));
        assert!(!meta.external_account_required);
    }

    #[test]
    fn test_non_200_is_rejected() {
        let transport = MockTransport::new();
        transport.on(
            Method::GET,
            URL,
            HttpResponse::new(StatusCode::NOT_FOUND).with_body("missing"),
        );
        match Directory::fetch(&transport, URL) {
            Err(EndpointError::Rejected(rejection)) => {
                assert_eq!(rejection.status, StatusCode::NOT_FOUND);
                assert_eq!(rejection.body, "missing");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_missing_endpoint_is_decode_error() {
        let transport = MockTransport::new();
        transport.on(
            Method::GET,
            URL,
            HttpResponse::new(StatusCode::OK).with_json(&json!({"newAccount": "https://x/acct"})),
        );
        assert!(matches!(
            Directory::fetch(&transport, URL),
            Err(EndpointError::Decode(_))
        ));
    }
}
