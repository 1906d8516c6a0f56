//! 憑證訂單：建立或恢復、列出待驗證的挑戰、下訂與下載憑證，以及撤銷。

use std::{collections::BTreeMap, fmt, time::Duration};

use openssl::x509::X509Req;
use reqwest::{header::LOCATION, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn, Level};

use crate::{
    account::Account,
    authorization::{Authorization, AuthorizationError, AuthorizationStatus},
    certificate::{Certificate, CertificateInfo},
    challenge::{ChallengeError, ChallengeService, ChallengeType},
    csr::CSR,
    key_pair::{CryptoError, KeyAlgorithm, KeyPair},
    payload::{
        FinalizeOrderPayload, Identifier, NewOrderPayload, PayloadError, PayloadT, RevokePayload,
    },
    poll::{poll_until, Poll},
    session::SignedRequestError,
    storage::{Storage, StorageError, StoragePaths},
    transport::{HttpResponse, Rejection, RequestError},
};

/// 定義所有訂單操作可能產生的錯誤。
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("Signed request failed: {0}")]
    Request(#[from] SignedRequestError),
    #[error("Failed to decode order: {0}")]
    Decode(#[from] RequestError),
    #[error("Request failed: {0}")]
    Rejected(Rejection),
    #[error("Location header not found: {0}")]
    MissingLocation(Rejection),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Authorization error: {0}")]
    Authorization(#[from] AuthorizationError),
    #[error("Challenge error: {0}")]
    Challenge(#[from] ChallengeError),
    #[error("At least one identifier is required")]
    NoIdentifiers,
    #[error("Wildcard identifier {0} requires dns-01")]
    WildcardNeedsDns(String),
    #[error("Authorizations not valid yet: {0:?}")]
    NotReady(Vec<String>),
    #[error("Order {0} is invalid")]
    Invalid(String),
    #[error("Order is {0}, expected valid")]
    NotIssued(OrderStatus),
    #[error("Order {url} still {status} after {timeout:?}")]
    PollTimeout {
        url: String,
        status: OrderStatus,
        timeout: Duration,
    },
    #[error("Order has no certificate URL")]
    MissingCertificateUrl,
    #[error("Missing stored artifact: {0}")]
    MissingArtifact(String),
}

/// 訂單操作的結果類型。
pub type Result<T> = std::result::Result<T, OrderError>;

/// 訂單狀態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

impl OrderStatus {
    /// 已送出 finalize，挑戰不需要再驗證。
    pub fn is_finalized(&self) -> bool {
        matches!(self, Self::Processing | Self::Valid)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Processing => "processing",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
        })
    }
}

#[derive(Debug, Deserialize)]
struct OrderResource {
    status: OrderStatus,
    #[serde(default)]
    expires: Option<String>,
    #[serde(default)]
    identifiers: Vec<Identifier>,
    #[serde(default)]
    authorizations: Vec<String>,
    finalize: String,
    #[serde(default)]
    certificate: Option<String>,
}

/// 寫入 `order.json` 的訂單紀錄，用於跨程序恢復同一張訂單。
#[derive(Debug, Serialize, Deserialize)]
struct OrderRecord {
    url: String,
    identifiers: Vec<String>,
}

/// 用於建立 [`Order`] 的構造器，為每個域名指定挑戰類型。
#[derive(Debug, Clone)]
pub struct OrderBuilder {
    challenges: BTreeMap<String, ChallengeType>,
    algorithm: KeyAlgorithm,
    renew: bool,
    poll_timeout: Option<Duration>,
    distinguished_name: Option<DistinguishedName>,
}

/// CSR 主體中除 CN 以外的欄位。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistinguishedName {
    pub organization: String,
    pub country: String,
}

impl OrderBuilder {
    pub fn new() -> Self {
        Self {
            challenges: BTreeMap::new(),
            algorithm: KeyAlgorithm::Rsa,
            renew: false,
            poll_timeout: None,
            distinguished_name: None,
        }
    }

    /// 以 HTTP-01 驗證 `domain`。
    pub fn http01(self, domain: &str) -> Self {
        self.challenge(domain, ChallengeType::Http01)
    }

    /// 以 DNS-01 驗證 `domain`，萬用字元域名只能使用此類型。
    pub fn dns01(self, domain: &str) -> Self {
        self.challenge(domain, ChallengeType::Dns01)
    }

    /// 同一域名重複指定時以最後一次為準。
    pub fn challenge(mut self, domain: &str, challenge_type: ChallengeType) -> Self {
        let domain = domain.trim().to_lowercase();
        if !domain.is_empty() {
            self.challenges.insert(domain, challenge_type);
        }
        self
    }

    /// 憑證金鑰的演算法，預設 RSA。
    pub fn algorithm(mut self, algorithm: KeyAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// 忽略已儲存的訂單，強制建立新訂單。
    pub fn renew(mut self, renew: bool) -> Self {
        self.renew = renew;
        self
    }

    /// finalize 後等待簽發的上限，預設不限。
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// CSR 主體的組織名稱（`O`）與國家代碼（`C`）。
    pub fn distinguished_name(mut self, organization: &str, country: &str) -> Self {
        self.distinguished_name = Some(DistinguishedName {
            organization: organization.to_string(),
            country: country.to_string(),
        });
        self
    }

    /// 恢復或建立訂單。
    #[instrument(
        level = Level::INFO,
        name = "OrderBuilder::build",
        err,
        skip(self, account),
        fields(
            identifiers = ?self.challenges.keys().collect::<Vec<_>>(),
            algorithm = %self.algorithm
        )
    )]
    pub fn build(self, account: &Account) -> Result<Order> {
        if self.challenges.is_empty() {
            return Err(OrderError::NoIdentifiers);
        }
        if let Some(domain) = self.challenges.iter().find_map(|(domain, challenge_type)| {
            (domain.starts_with("*.") && *challenge_type == ChallengeType::Http01).then_some(domain)
        }) {
            return Err(OrderError::WildcardNeedsDns(domain.clone()));
        }

        let identifiers: Vec<String> = self.challenges.keys().cloned().collect();
        let dir = StoragePaths::order_dir(&identifiers, self.algorithm);
        let storage = account.session.storage.clone();

        let mut order = Order {
            url: String::new(),
            status: OrderStatus::Pending,
            expires: None,
            identifiers,
            authorization_urls: Vec::new(),
            authorizations: Vec::new(),
            finalize: String::new(),
            certificate: None,
            algorithm: self.algorithm,
            challenge_types: self.challenges,
            poll_timeout: self.poll_timeout,
            distinguished_name: self.distinguished_name,
            dir,
        };

        if self.renew {
            if let Err(e) = storage.remove(&order.dir) {
                warn!(
                    dir = %order.dir,
                    error = %e,
                    "Failed to remove previous order files"
                );
            }
        } else if let Some(record) = order.stored_record(storage.as_ref())? {
            match order.resume(account, &record.url) {
                Ok(()) if order.status != OrderStatus::Invalid => {
                    info!(order = %order.url, status = %order.status, "Order resumed");
                    return Ok(order);
                }
                Ok(()) => warn!(
                    order = %record.url,
                    "Stored order is invalid, creating a new one"
                ),
                Err(OrderError::Rejected(rejection))
                | Err(OrderError::Authorization(AuthorizationError::Rejected(rejection))) => {
                    warn!(
                        order = %record.url,
                        status = %rejection.status,
                        "Stored order rejected, creating a new one"
                    )
                }
                Err(e) => return Err(e),
            }
        }

        order.create(account)?;
        Ok(order)
    }
}

impl Default for OrderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 一張憑證訂單。
///
/// 憑證金鑰、CSR 與憑證都存放在由「排序後的識別項雜湊 + 演算法」決定的目錄下，
/// 因此以相同參數重新建立時會回到同一張訂單。
#[derive(Debug)]
pub struct Order {
    /// 伺服器回傳的訂單 URL
    pub url: String,
    pub status: OrderStatus,
    pub expires: Option<String>,
    /// 排序、去重後的域名
    pub identifiers: Vec<String>,
    pub authorization_urls: Vec<String>,
    /// 依 `authorization_urls` 順序取得的授權
    pub authorizations: Vec<Authorization>,
    pub finalize: String,
    /// 憑證 URL（僅在有效時存在）
    pub certificate: Option<String>,
    pub algorithm: KeyAlgorithm,
    challenge_types: BTreeMap<String, ChallengeType>,
    poll_timeout: Option<Duration>,
    distinguished_name: Option<DistinguishedName>,
    dir: String,
}

impl Order {
    /// 以帳戶的 KID 模式送出新訂單，伺服器必須回傳 201 與 `Location`。
    /// 訂單 URL 在取得授權之前就寫入儲存。
    fn create(&mut self, account: &Account) -> Result<()> {
        let payload = NewOrderPayload::new(&self.identifiers).to_base64()?;
        let response = account.post(&account.session.directory.new_order, &payload)?;
        if response.status != StatusCode::CREATED {
            return Err(OrderError::Rejected(response.into_rejection()));
        }
        let url = response
            .header(LOCATION.as_str())
            .ok_or_else(|| OrderError::MissingLocation(response.clone().into_rejection()))?;

        let record = OrderRecord {
            url: url.clone(),
            identifiers: self.identifiers.clone(),
        };
        account.session.storage.write_file(
            &self.path(StoragePaths::ORDER),
            &serde_json::to_vec(&record).map_err(RequestError::from)?,
        )?;
        info!(order = %url, "Order created");

        self.url = url;
        self.apply(&response)?;
        self.load_authorizations(account)
    }

    fn resume(&mut self, account: &Account, url: &str) -> Result<()> {
        self.url = url.to_string();
        self.refresh(account)?;
        if self.status != OrderStatus::Invalid {
            self.load_authorizations(account)?;
        }
        Ok(())
    }

    /// 重新取得訂單狀態。
    pub fn refresh(&mut self, account: &Account) -> Result<()> {
        let response = account.post_as_get(&self.url)?;
        if response.status != StatusCode::OK {
            return Err(OrderError::Rejected(response.into_rejection()));
        }
        self.apply(&response)?;
        debug!(order = %self.url, status = %self.status, "Order refreshed");
        Ok(())
    }

    /// 回傳仍待驗證的授權各自對應的挑戰。
    ///
    /// 訂單已 finalize 或所有授權皆有效時回傳空清單，可重複呼叫。
    #[instrument(
        level = Level::DEBUG,
        name = "Order::get_pending_challenge_list",
        err,
        skip(self, account),
        fields(order = %self.url)
    )]
    pub fn get_pending_challenge_list(
        &mut self,
        account: &Account,
    ) -> Result<Vec<ChallengeService>> {
        if self.status.is_finalized() {
            return Ok(Vec::new());
        }
        self.refresh_pending_authorizations(account)?;

        self.authorizations
            .iter()
            .filter(|authorization| authorization.status == AuthorizationStatus::Pending)
            .map(|authorization| -> Result<ChallengeService> {
                let challenge_type = self.challenge_type_for(authorization);
                Ok(ChallengeService::new(account, authorization.clone(), challenge_type)?)
            })
            .collect()
    }

    /// 下訂並下載憑證。
    ///
    /// 所有授權都必須有效。必要時先建立憑證金鑰與 CSR 並送出 finalize，
    /// 接著輪詢直到訂單有效，再下載並儲存憑證鏈。
    #[instrument(
        level = Level::INFO,
        name = "Order::get_certificate_file",
        err,
        skip(self, account),
        fields(order = %self.url)
    )]
    pub fn get_certificate_file(&mut self, account: &Account) -> Result<CertificateInfo> {
        let storage = account.session.storage.clone();

        if !self.status.is_finalized() {
            self.refresh_pending_authorizations(account)?;
            let not_valid: Vec<String> = self
                .authorizations
                .iter()
                .filter(|authorization| authorization.status != AuthorizationStatus::Valid)
                .map(Authorization::domain)
                .collect();
            if !not_valid.is_empty() {
                return Err(OrderError::NotReady(not_valid));
            }

            self.refresh(account)?;
            match self.status {
                OrderStatus::Pending | OrderStatus::Ready => self.finalize_order(account)?,
                OrderStatus::Invalid => return Err(OrderError::Invalid(self.url.clone())),
                OrderStatus::Processing | OrderStatus::Valid => {}
            }
        }

        self.wait_until_valid(account)?;

        let certificate_url = self
            .certificate
            .clone()
            .ok_or(OrderError::MissingCertificateUrl)?;
        let response = account.post_as_get(&certificate_url)?;
        if response.status != StatusCode::OK {
            return Err(OrderError::Rejected(response.into_rejection()));
        }

        let info = CertificateInfo::from_chain(
            &response.text(),
            self.read_artifact(storage.as_ref(), StoragePaths::PRIVATE_KEY)?,
            self.read_artifact(storage.as_ref(), StoragePaths::PUBLIC_KEY)?,
            self.read_artifact(storage.as_ref(), StoragePaths::CSR)?,
        )?;
        storage.write_file(
            &self.path(StoragePaths::CERTIFICATE),
            info.certificate.as_bytes(),
        )?;
        storage.write_file(
            &self.path(StoragePaths::CERTIFICATE_FULL_CHAINED),
            info.certificate_full_chained.as_bytes(),
        )?;
        info!(valid_to = %info.valid_to, "Certificate stored");
        Ok(info)
    }

    /// 撤銷已簽發的憑證。請求以憑證自己的私鑰、JWK 模式簽署。
    #[instrument(
        level = Level::INFO,
        name = "Order::revoke_certificate",
        err,
        skip(self, account),
        fields(order = %self.url)
    )]
    pub fn revoke_certificate(&self, account: &Account, reason: u32) -> Result<()> {
        if self.status != OrderStatus::Valid {
            return Err(OrderError::NotIssued(self.status));
        }
        let storage = account.session.storage.as_ref();
        let certificate =
            Certificate::new(&self.read_artifact(storage, StoragePaths::CERTIFICATE)?)?;
        let key_pair =
            KeyPair::from_pem(self.read_artifact(storage, StoragePaths::PRIVATE_KEY)?.as_bytes())?;

        let payload = RevokePayload::new(&certificate.to_der()?, reason).to_base64()?;
        let session = &account.session;
        let response =
            session.post_signed(&session.directory.revoke_cert, &payload, &key_pair, None)?;
        if response.status != StatusCode::OK {
            return Err(OrderError::Rejected(response.into_rejection()));
        }
        info!(reason, "Certificate revoked");
        Ok(())
    }

    /// 訂單檔案所在的儲存目錄。
    pub fn storage_dir(&self) -> &str {
        &self.dir
    }

    fn finalize_order(&mut self, account: &Account) -> Result<()> {
        let storage = account.session.storage.as_ref();
        let key_pair = self.certificate_key(storage)?;
        let csr = self.csr(storage, &key_pair)?;

        let der = csr.to_der().map_err(CryptoError::Csr)?;
        let payload = FinalizeOrderPayload::new(&der).to_base64()?;
        let response = account.post(&self.finalize, &payload)?;
        if response.status != StatusCode::OK {
            return Err(OrderError::Rejected(response.into_rejection()));
        }
        self.apply(&response)?;
        info!(status = %self.status, "Order finalized");
        Ok(())
    }

    fn wait_until_valid(&mut self, account: &Account) -> Result<()> {
        let clock = account.session.clock.clone();
        let interval = account.session.settings.poll_interval;

        let timeout = self.poll_timeout;
        let issued = poll_until(clock.as_ref(), interval, timeout, || -> Result<Poll<()>> {
            if self.status != OrderStatus::Valid {
                self.refresh(account)?;
            }
            match self.status {
                OrderStatus::Valid => Ok(Poll::Ready(())),
                OrderStatus::Invalid => Err(OrderError::Invalid(self.url.clone())),
                _ => Ok(Poll::Pending),
            }
        })?;

        issued.ok_or_else(|| OrderError::PollTimeout {
            url: self.url.clone(),
            status: self.status,
            timeout: self.poll_timeout.unwrap_or_default(),
        })
    }

    /// 讀取或產生憑證金鑰。
    fn certificate_key(&self, storage: &dyn Storage) -> Result<KeyPair> {
        if let Some(pem) = storage.read_optional(&self.path(StoragePaths::PRIVATE_KEY))? {
            return Ok(KeyPair::from_pem(&pem)?);
        }
        let key_pair = KeyPair::generate(self.algorithm, None)?;
        storage.write_file(&self.path(StoragePaths::PRIVATE_KEY), &key_pair.private_pem()?)?;
        storage.write_file(&self.path(StoragePaths::PUBLIC_KEY), &key_pair.public_pem()?)?;
        debug!(algorithm = %self.algorithm, "Certificate key generated");
        Ok(key_pair)
    }

    /// 讀取或產生涵蓋所有域名的 CSR。
    fn csr(&self, storage: &dyn Storage, key_pair: &KeyPair) -> Result<X509Req> {
        if let Some(pem) = storage.read_optional(&self.path(StoragePaths::CSR))? {
            return Ok(X509Req::from_pem(&pem).map_err(CryptoError::Csr)?);
        }
        let mut csr = CSR::new().set_sans(&self.identifiers);
        if let Some(name) = &self.distinguished_name {
            csr = csr.organization(&name.organization).country(&name.country);
        }
        let csr = csr.build(key_pair)?;
        storage.write_file(
            &self.path(StoragePaths::CSR),
            &csr.to_pem().map_err(CryptoError::Csr)?,
        )?;
        Ok(csr)
    }

    fn refresh_pending_authorizations(&mut self, account: &Account) -> Result<()> {
        for authorization in &mut self.authorizations {
            if authorization.status == AuthorizationStatus::Pending {
                authorization.refresh(account)?;
            }
        }
        Ok(())
    }

    fn load_authorizations(&mut self, account: &Account) -> Result<()> {
        self.authorizations = self
            .authorization_urls
            .iter()
            .map(|url| Authorization::fetch(account, url))
            .collect::<std::result::Result<_, _>>()?;
        Ok(())
    }

    /// 套用伺服器回傳的訂單物件；授權只記下 URL，內容由 `load_authorizations` 取得。
    fn apply(&mut self, response: &HttpResponse) -> Result<()> {
        let resource: OrderResource = response.json()?;
        debug!(identifiers = ?resource.identifiers, "Order resource decoded");

        self.authorization_urls = resource.authorizations;
        self.status = resource.status;
        self.expires = resource.expires;
        self.finalize = resource.finalize;
        self.certificate = resource.certificate;
        Ok(())
    }

    /// 未指定類型的授權：萬用字元用 DNS-01，其他用 HTTP-01。
    fn challenge_type_for(&self, authorization: &Authorization) -> ChallengeType {
        self.challenge_types
            .get(&authorization.domain())
            .copied()
            .unwrap_or(if authorization.wildcard {
                ChallengeType::Dns01
            } else {
                ChallengeType::Http01
            })
    }

    fn stored_record(&self, storage: &dyn Storage) -> Result<Option<OrderRecord>> {
        let key = self.path(StoragePaths::ORDER);
        match storage.read_optional(&key)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|_| StorageError::CorruptedFile(key).into()),
            None => Ok(None),
        }
    }

    fn read_artifact(&self, storage: &dyn Storage, name: &str) -> Result<String> {
        let key = self.path(name);
        storage
            .read_optional(&key)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .ok_or(OrderError::MissingArtifact(key))
    }

    fn path(&self, name: &str) -> String {
        format!("{}/{}", self.dir, name)
    }
}
