//! 一次 ACME 作業所共用的環境：設定、傳輸層、儲存、時鐘、目錄與 nonce 快取。

use std::{env, path::PathBuf, sync::Arc, time::Duration};

use thiserror::Error;
use tracing::{debug, info, instrument, warn, Level};

use crate::{
    directory::{Directory, EndpointError},
    jws::Jws,
    key_pair::{CryptoError, KeyAlgorithm, KeyPair},
    nonce::{NonceError, NonceStore},
    poll::{Clock, SystemClock},
    protection::Protection,
    storage::{FsStorage, Storage},
    transport::{HttpResponse, RequestError, ReqwestTransport, Transport, REPLAY_NONCE},
};

/// 建立 session 時可能發生的錯誤。
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Directory error: {0}")]
    Endpoint(#[from] EndpointError),
    #[error("Request error: {0}")]
    Request(#[from] RequestError),
}

/// 送出簽名請求時可能發生的錯誤。
#[derive(Debug, Error)]
pub enum SignedRequestError {
    #[error("Nonce error: {0}")]
    Nonce(#[from] NonceError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Request error: {0}")]
    Request(#[from] RequestError),
}

type Result<T> = std::result::Result<T, SignedRequestError>;

/// session 的設定值。
#[derive(Debug, Clone)]
pub struct Settings {
    /// 聯絡 email，已去重、排序且不含空字串。
    pub contacts: Vec<String>,
    pub directory_url: String,
    /// 輪詢間隔，預設 3 秒。
    pub poll_interval: Duration,
    /// 帳戶 RSA 金鑰長度。
    pub account_key_bits: u32,
    /// 本地 DNS-01 檢查所用的 DNS-over-HTTPS JSON 端點。
    pub dns_resolver_url: String,
}

/// 共用的 ACME session。
///
/// 由 [`SessionBuilder`] 建立，以 `Arc` 在帳戶、訂單與挑戰之間共用。
#[derive(Debug)]
pub struct Session {
    pub settings: Settings,
    pub transport: Arc<dyn Transport>,
    pub storage: Arc<dyn Storage>,
    pub clock: Arc<dyn Clock>,
    pub directory: Directory,
    nonce: NonceStore,
}

impl Session {
    /// 遇到 `badNonce` 時的最大嘗試次數。
    const MAX_ATTEMPTS: usize = 3;

    /// 簽名並送出請求。
    ///
    /// `payload` 為已編碼的 Base64，空字串代表 POST-as-GET。`kid` 為 `None` 時使用 JWK 模式。
    /// 回應中的 `Replay-Nonce`（含錯誤回應）會寫回快取；伺服器回報 `badNonce` 時以新 nonce 重送。
    #[instrument(
        level = Level::DEBUG,
        name = "Session::post_signed",
        err,
        skip(self, payload, key_pair)
    )]
    pub fn post_signed(
        &self,
        url: &str,
        payload: &str,
        key_pair: &KeyPair,
        kid: Option<&str>,
    ) -> Result<HttpResponse> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let mut protection = Protection::new(key_pair).nonce(self.nonce.get()?);
            if let Some(kid) = kid {
                protection = protection.kid(kid);
            }
            let jws = Jws::sign(&protection.create_header(url)?, payload, key_pair)?;

            let response = self.transport.post_jose(url, &jws.to_json()?)?;
            match response.header(REPLAY_NONCE) {
                Some(nonce) => self.nonce.set(nonce),
                None => self.nonce.destroy(),
            }

            let bad_nonce = !response.status.is_success()
                && response.problem().is_some_and(|problem| problem.is_bad_nonce());
            if bad_nonce && attempt < Self::MAX_ATTEMPTS {
                warn!(attempt, "Server rejected nonce, retrying");
                continue;
            }
            debug!(status = %response.status, "Signed request completed");
            return Ok(response);
        }
    }

    /// 以空 payload 的 KID 模式請求取得資源。
    pub fn post_as_get(&self, url: &str, key_pair: &KeyPair, kid: &str) -> Result<HttpResponse> {
        self.post_signed(url, "", key_pair, Some(kid))
    }
}

/// 用於構建 [`Session`] 的構造器。
#[derive(Debug)]
pub struct SessionBuilder {
    contacts: Vec<String>,
    staging: bool,
    directory_url: Option<String>,
    storage_path: Option<PathBuf>,
    storage: Option<Arc<dyn Storage>>,
    transport: Option<Arc<dyn Transport>>,
    clock: Option<Arc<dyn Clock>>,
    poll_interval: Duration,
    account_key_bits: u32,
    dns_resolver_url: String,
}

impl SessionBuilder {
    /// Let's Encrypt 正式環境目錄。
    pub const PRODUCTION_DIRECTORY: &'static str = "https://acme-v02.api.letsencrypt.org/directory";
    /// Let's Encrypt 測試環境目錄。
    pub const STAGING_DIRECTORY: &'static str =
        "https://acme-staging-v02.api.letsencrypt.org/directory";
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
    pub const DEFAULT_DNS_RESOLVER: &'static str = "https://dns.google/resolve";

    pub fn new() -> Self {
        Self {
            contacts: Vec::new(),
            staging: false,
            directory_url: None,
            storage_path: None,
            storage: None,
            transport: None,
            clock: None,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            account_key_bits: KeyAlgorithm::DEFAULT_RSA_BITS,
            dns_resolver_url: Self::DEFAULT_DNS_RESOLVER.to_string(),
        }
    }

    /// 加入一個聯絡 email。
    pub fn contact(mut self, email: impl Into<String>) -> Self {
        self.contacts.push(email.into());
        self
    }

    pub fn contacts<I, S>(mut self, emails: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.contacts.extend(emails.into_iter().map(Into::into));
        self
    }

    /// 改用測試環境目錄。
    pub fn staging(mut self, staging: bool) -> Self {
        self.staging = staging;
        self
    }

    /// 指定目錄 URL，優先於 `staging`。
    pub fn directory_url(mut self, url: impl Into<String>) -> Self {
        self.directory_url = Some(url.into());
        self
    }

    /// 以檔案系統路徑作為儲存根目錄。
    pub fn storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    /// 注入自訂儲存，優先於 `storage_path`。
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn account_key_bits(mut self, bits: u32) -> Self {
        self.account_key_bits = bits;
        self
    }

    pub fn dns_resolver_url(mut self, url: impl Into<String>) -> Self {
        self.dns_resolver_url = url.into();
        self
    }

    /// 根據當前環境返回預設的存儲路徑：`$HOME/.local/share/<crate 名稱>`。
    fn default_storage_path() -> PathBuf {
        env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join(".local/share")
            .join(env!("CARGO_PKG_NAME"))
    }

    /// 取得目錄並建立 session。
    #[instrument(
        level = Level::INFO,
        name = "SessionBuilder::build",
        err,
        skip(self),
        fields(staging = self.staging)
    )]
    pub fn build(self) -> std::result::Result<Arc<Session>, SessionError> {
        let directory_url = match (self.directory_url, self.staging) {
            (Some(url), _) => url,
            (None, true) => Self::STAGING_DIRECTORY.to_string(),
            (None, false) => Self::PRODUCTION_DIRECTORY.to_string(),
        };
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };
        let storage: Arc<dyn Storage> = match (self.storage, self.storage_path) {
            (Some(storage), _) => storage,
            (None, Some(path)) => Arc::new(FsStorage::new(path)),
            (None, None) => Arc::new(FsStorage::new(Self::default_storage_path())),
        };
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let directory = Directory::fetch(transport.as_ref(), &directory_url)?;
        let nonce = NonceStore::new(transport.clone(), directory.new_nonce.clone());
        info!(directory = %directory_url, "Session ready");

        Ok(Arc::new(Session {
            settings: Settings {
                contacts: normalize_contacts(self.contacts),
                directory_url,
                poll_interval: self.poll_interval,
                account_key_bits: self.account_key_bits,
                dns_resolver_url: self.dns_resolver_url,
            },
            transport,
            storage,
            clock,
            directory,
            nonce,
        }))
    }
}

/// 去除 `mailto:` 前綴與空白，移除空字串後排序去重。
pub(crate) fn normalize_contacts(contacts: Vec<String>) -> Vec<String> {
    let mut contacts: Vec<String> = contacts
        .into_iter()
        .map(|email| {
            let email = email.trim();
            email.strip_prefix("mailto:").unwrap_or(email).to_string()
        })
        .filter(|email| !email.is_empty())
        .collect();
    contacts.sort();
    contacts.dedup();
    contacts
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
