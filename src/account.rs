//! ACME 帳戶的生命週期：建立或恢復、更新聯絡資訊、金鑰輪替與停用。

use std::{fmt, sync::Arc};

use reqwest::{header::LOCATION, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, instrument, warn, Level};

use crate::{
    jws::Jws,
    key_pair::{CryptoError, KeyAlgorithm, KeyPair},
    payload::{
        AccountLookupPayload, DeactivatePayload, KeyChangePayload, NewAccountPayload, PayloadError,
        PayloadT, UpdateContactPayload,
    },
    protection::Protection,
    session::{normalize_contacts, Session, SignedRequestError},
    storage::{Storage, StorageError, StoragePaths},
    transport::{HttpResponse, Rejection, RequestError},
};

/// 錯誤類型，用於描述在處理 ACME 帳戶相關操作時可能發生的各類錯誤。
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("Signed request failed: {0}")]
    Request(#[from] SignedRequestError),
    #[error("Failed to decode account: {0}")]
    Decode(#[from] RequestError),
    #[error("Request failed: {0}")]
    Rejected(Rejection),
    #[error("Location header not found: {0}")]
    MissingLocation(Rejection),
    #[error("Account is {0}")]
    NotValid(AccountStatus),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// 結果類型，當操作成功返回 `T`，失敗則返回 [`AccountError`].
pub type Result<T> = std::result::Result<T, AccountError>;

/// 帳戶狀態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Valid,
    Deactivated,
    Revoked,
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Valid => "valid",
            Self::Deactivated => "deactivated",
            Self::Revoked => "revoked",
        })
    }
}

/// 伺服器回傳的帳戶物件，只取流程用得到的欄位。
#[derive(Debug, Deserialize)]
struct AccountResource {
    status: AccountStatus,
    #[serde(default)]
    contact: Vec<String>,
    #[serde(default)]
    orders: Option<String>,
}

/// 表示 ACME 帳戶的結構體。
///
/// 帳戶金鑰固定為 RSA，與憑證金鑰的演算法無關。
#[derive(Debug)]
pub struct Account {
    pub session: Arc<Session>,
    /// 帳戶使用的密鑰對。
    pub key_pair: KeyPair,
    /// ACME 帳戶 URL，也是 KID 模式的 key identifier。
    pub url: String,
    /// 伺服器記錄的聯絡方式（`mailto:` URI），已排序。
    pub contacts: Vec<String>,
    pub status: AccountStatus,
    pub orders: Option<String>,
}

impl Account {
    /// 建立或恢復帳戶。
    ///
    /// 儲存中已有帳戶金鑰時沿用它並向伺服器取得帳戶；否則產生新金鑰並註冊。
    /// 新帳戶的 URL 會在註冊成功後立即寫入儲存。
    #[instrument(level = Level::INFO, name = "Account::init", err, skip(session))]
    pub fn init(session: Arc<Session>) -> Result<Self> {
        let storage = session.storage.clone();
        if storage.exists(StoragePaths::ACCOUNT_PRIVATE_KEY)?
            && storage.exists(StoragePaths::ACCOUNT_PUBLIC_KEY)?
        {
            let key_pair =
                KeyPair::from_pem(&storage.read_file(StoragePaths::ACCOUNT_PRIVATE_KEY)?)?;
            return Self::get_account(session, key_pair);
        }

        Self::remove_key_material(storage.as_ref());
        let key_pair = KeyPair::generate(
            KeyAlgorithm::Rsa,
            Some(session.settings.account_key_bits),
        )?;
        Self::store_key_pair(storage.as_ref(), &key_pair)?;
        Self::create_account(session, key_pair)
    }

    /// 以 JWK 模式註冊新帳戶，伺服器必須回傳 201 與 `Location`。
    fn create_account(session: Arc<Session>, key_pair: KeyPair) -> Result<Self> {
        let payload = NewAccountPayload::new(&session.settings.contacts).to_base64()?;
        let response =
            session.post_signed(&session.directory.new_account, &payload, &key_pair, None)?;
        if response.status != StatusCode::CREATED {
            return Err(AccountError::Rejected(response.into_rejection()));
        }
        let url = location(&response)?;
        session
            .storage
            .write_file(StoragePaths::ACCOUNT_URL, url.as_bytes())?;
        info!(account = %url, "Account created");

        let mut account = Self::resolved(session, key_pair, url);
        account.apply(&response)?;
        Ok(account)
    }

    /// 以既有金鑰恢復帳戶：帳戶 URL 優先取自儲存，否則以 `onlyReturnExisting` 查詢。
    fn get_account(session: Arc<Session>, key_pair: KeyPair) -> Result<Self> {
        let storage = session.storage.clone();
        let url = if storage.exists(StoragePaths::ACCOUNT_URL)? {
            storage
                .read_string(StoragePaths::ACCOUNT_URL)?
                .trim()
                .to_string()
        } else {
            let url = Self::lookup_account_url(&session, &key_pair)?;
            storage.write_file(StoragePaths::ACCOUNT_URL, url.as_bytes())?;
            url
        };

        let mut account = Self::resolved(session, key_pair, url);
        account.refresh()?;
        info!(account = %account.url, status = %account.status, "Account resumed");
        Ok(account)
    }

    fn lookup_account_url(session: &Session, key_pair: &KeyPair) -> Result<String> {
        let payload = AccountLookupPayload::new().to_base64()?;
        let response =
            session.post_signed(&session.directory.new_account, &payload, key_pair, None)?;
        if response.status != StatusCode::OK {
            return Err(AccountError::Rejected(response.into_rejection()));
        }
        location(&response)
    }

    fn resolved(session: Arc<Session>, key_pair: KeyPair, url: String) -> Self {
        Self {
            session,
            key_pair,
            url,
            contacts: Vec::new(),
            status: AccountStatus::Valid,
            orders: None,
        }
    }

    /// 重新取得帳戶物件。
    pub fn refresh(&mut self) -> Result<()> {
        let response = self.post_as_get(&self.url)?;
        if response.status != StatusCode::OK {
            return Err(AccountError::Rejected(response.into_rejection()));
        }
        self.apply(&response)
    }

    /// 更新帳戶的聯絡 email，空字串會被忽略。
    #[instrument(
        level = Level::INFO,
        name = "Account::update_account_contact",
        err,
        skip(self),
        fields(account = %self.url)
    )]
    pub fn update_account_contact(&mut self, emails: &[String]) -> Result<()> {
        self.ensure_valid()?;
        let payload = UpdateContactPayload::new(&normalize_contacts(emails.to_vec())).to_base64()?;
        let response = self.post(&self.url, &payload)?;
        if response.status != StatusCode::OK {
            return Err(AccountError::Rejected(response.into_rejection()));
        }
        self.apply(&response)?;
        info!(contacts = ?self.contacts, "Account contact updated");
        Ok(())
    }

    /// 以新產生的 RSA 金鑰取代帳戶金鑰。
    ///
    /// 內層 JWS 以新金鑰、JWK 模式簽署 `{account, oldKey}`，不帶 nonce；
    /// 外層以目前的金鑰、KID 模式送出。成功後才覆寫儲存中的金鑰。
    #[instrument(
        level = Level::INFO,
        name = "Account::update_account_key",
        err,
        skip(self),
        fields(account = %self.url)
    )]
    pub fn update_account_key(&mut self) -> Result<()> {
        self.ensure_valid()?;
        let new_key = KeyPair::generate(
            KeyAlgorithm::Rsa,
            Some(self.session.settings.account_key_bits),
        )?;
        let key_change_url = self.session.directory.key_change.clone();

        let inner_payload = KeyChangePayload {
            account: self.url.clone(),
            old_key: self.key_pair.jwk()?,
        }
        .to_base64()?;
        let inner_header = Protection::new(&new_key).create_header(&key_change_url)?;
        let inner = Jws::sign(&inner_header, &inner_payload, &new_key)?;

        let response = self.post(&key_change_url, &inner.to_base64()?)?;
        if response.status != StatusCode::OK {
            return Err(AccountError::Rejected(response.into_rejection()));
        }

        Self::store_key_pair(self.session.storage.as_ref(), &new_key)?;
        self.key_pair = new_key;
        info!("Account key rotated");

        if response.body.is_empty() {
            self.refresh()
        } else {
            self.apply(&response)
        }
    }

    /// 停用帳戶，並刪除儲存中的帳戶金鑰與 URL。
    #[instrument(
        level = Level::INFO,
        name = "Account::deactivate_account",
        err,
        skip(self),
        fields(account = %self.url)
    )]
    pub fn deactivate_account(&mut self) -> Result<()> {
        self.ensure_valid()?;
        let payload = DeactivatePayload::new().to_base64()?;
        let response = self.post(&self.url, &payload)?;
        if response.status != StatusCode::OK {
            return Err(AccountError::Rejected(response.into_rejection()));
        }
        self.apply(&response)?;

        let storage = self.session.storage.clone();
        storage.remove(StoragePaths::ACCOUNT_PRIVATE_KEY)?;
        storage.remove(StoragePaths::ACCOUNT_PUBLIC_KEY)?;
        storage.remove(StoragePaths::ACCOUNT_URL)?;
        info!(status = %self.status, "Account deactivated");
        Ok(())
    }

    /// `token + "." + thumbprint(帳戶公鑰)`。
    pub fn key_authorization(&self, token: &str) -> std::result::Result<String, CryptoError> {
        Ok(format!("{}.{}", token, self.key_pair.thumbprint()?))
    }

    /// 以帳戶金鑰、KID 模式送出請求。
    pub fn post(
        &self,
        url: &str,
        payload: &str,
    ) -> std::result::Result<HttpResponse, SignedRequestError> {
        self.session
            .post_signed(url, payload, &self.key_pair, Some(&self.url))
    }

    /// POST-as-GET 取得帳戶可存取的資源。
    pub fn post_as_get(&self, url: &str) -> std::result::Result<HttpResponse, SignedRequestError> {
        self.session.post_as_get(url, &self.key_pair, &self.url)
    }

    fn ensure_valid(&self) -> Result<()> {
        match self.status {
            AccountStatus::Valid => Ok(()),
            status => Err(AccountError::NotValid(status)),
        }
    }

    fn apply(&mut self, response: &HttpResponse) -> Result<()> {
        let resource: AccountResource = response.json()?;
        let mut contacts = resource.contact;
        contacts.sort();
        contacts.dedup();

        self.status = resource.status;
        self.contacts = contacts;
        self.orders = resource.orders;
        Ok(())
    }

    fn store_key_pair(storage: &dyn Storage, key_pair: &KeyPair) -> Result<()> {
        storage.write_file(StoragePaths::ACCOUNT_PRIVATE_KEY, &key_pair.private_pem()?)?;
        storage.write_file(StoragePaths::ACCOUNT_PUBLIC_KEY, &key_pair.public_pem()?)?;
        Ok(())
    }

    /// 刪除殘留的帳戶檔案，失敗只記錄警告。
    fn remove_key_material(storage: &dyn Storage) {
        for key in [
            StoragePaths::ACCOUNT_PRIVATE_KEY,
            StoragePaths::ACCOUNT_PUBLIC_KEY,
            StoragePaths::ACCOUNT_URL,
        ] {
            if let Err(e) = storage.remove(key) {
                warn!(key, error = %e, "Failed to remove stale account file");
            }
        }
    }
}

fn location(response: &HttpResponse) -> Result<String> {
    response
        .header(LOCATION.as_str())
        .ok_or_else(|| AccountError::MissingLocation(response.clone().into_rejection()))
}
