//! 挑戰憑據的計算與驗證流程。
//!
//! 驗證分成兩段，各自有獨立的逾時：先在本地確認 HTTP 檔案或 DNS TXT 記錄已可見，
//! 再通知 CA 並輪詢授權直到離開 `pending`。

use std::{fmt, time::Duration};

use openssl::sha::sha256;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, instrument, Level};

use crate::{
    account::Account,
    authorization::{Authorization, AuthorizationError, AuthorizationStatus},
    base64,
    key_pair::CryptoError,
    payload::{ChallengeValidationPayload, PayloadT},
    poll::Deadline,
    session::Session,
};

/// 定義與挑戰（Challenge）流程相關的錯誤類型。
#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("Authorization error: {0}")]
    Authorization(#[from] AuthorizationError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Local verification for {domain} timed out after {elapsed:?}")]
    VerifyLocallyTimeout { domain: String, elapsed: Duration },
    #[error("CA verification for {domain} timed out after {elapsed:?}")]
    VerifyCaTimeout { domain: String, elapsed: Duration },
    #[error("Invalid DNS resolver URL: {0}")]
    ResolverUrl(String),
}

type Result<T> = std::result::Result<T, ChallengeError>;

/// 表示 ACME 挑戰的類型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChallengeType {
    Http01,
    Dns01,
}

impl ChallengeType {
    /// 根據協議名稱返回對應的挑戰類型，不支援的類型返回 `None`。
    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "http-01" => Some(Self::Http01),
            "dns-01" => Some(Self::Dns01),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http01 => "http-01",
            Self::Dns01 => "dns-01",
        }
    }
}

impl fmt::Display for ChallengeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 表示 ACME 挑戰的狀態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

/// 授權中的一個挑戰。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub challenge_type: ChallengeType,
    pub url: String,
    /// 挑戰 token，用於生成 key authorization
    pub token: String,
    pub status: ChallengeStatus,
}

/// 呼叫端需要佈署的挑戰內容，由 key authorization 推導，不會送往伺服器保存。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeCredential {
    /// 在 `http://<identifier>/.well-known/acme-challenge/<file_name>` 提供 `file_content`。
    Http {
        identifier: String,
        file_name: String,
        file_content: String,
    },
    /// 在 `_acme-challenge.<identifier>` 設定 TXT 記錄 `dns_content`。
    Dns {
        identifier: String,
        dns_content: String,
    },
}

impl ChallengeCredential {
    pub fn new(
        challenge_type: ChallengeType,
        identifier: &str,
        token: &str,
        key_authorization: &str,
    ) -> Self {
        match challenge_type {
            ChallengeType::Http01 => Self::Http {
                identifier: identifier.to_string(),
                file_name: token.to_string(),
                file_content: key_authorization.to_string(),
            },
            ChallengeType::Dns01 => Self::Dns {
                identifier: identifier.to_string(),
                dns_content: base64::encode_url(sha256(key_authorization.as_bytes())),
            },
        }
    }

    pub fn identifier(&self) -> &str {
        match self {
            Self::Http { identifier, .. } | Self::Dns { identifier, .. } => identifier,
        }
    }

    /// HTTP-01 檔案的 URL 路徑。
    pub fn http_path(&self) -> Option<String> {
        match self {
            Self::Http { file_name, .. } => {
                Some(format!("/.well-known/acme-challenge/{}", file_name))
            }
            Self::Dns { .. } => None,
        }
    }

    /// DNS-01 TXT 記錄名稱，萬用字元域名去掉 `*.`。
    pub fn dns_record_name(&self) -> Option<String> {
        match self {
            Self::Dns { identifier, .. } => Some(format!(
                "_acme-challenge.{}",
                identifier.strip_prefix("*.").unwrap_or(identifier)
            )),
            Self::Http { .. } => None,
        }
    }
}

/// 本地確認與 CA 確認各自的逾時；`None` 表示一直等下去。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyTimeouts {
    pub local: Option<Duration>,
    pub ca: Option<Duration>,
}

impl VerifyTimeouts {
    /// 以秒數建立，`0` 表示不逾時。
    pub fn from_secs(local: u64, ca: u64) -> Self {
        let timeout = |secs| (secs > 0).then(|| Duration::from_secs(secs));
        Self {
            local: timeout(local),
            ca: timeout(ca),
        }
    }
}

/// 一個待驗證的授權，以及呼叫端為它選定的挑戰類型。
#[derive(Debug, Clone)]
pub struct ChallengeService {
    authorization: Authorization,
    challenge_type: ChallengeType,
    key_authorization: String,
    credential: ChallengeCredential,
}

impl ChallengeService {
    /// 授權未提供指定類型的挑戰時回傳錯誤。
    pub fn new(
        account: &Account,
        authorization: Authorization,
        challenge_type: ChallengeType,
    ) -> Result<Self> {
        let domain = authorization.domain();
        let challenge = authorization.get_challenge(challenge_type).ok_or_else(|| {
            AuthorizationError::ChallengeNotOffered {
                domain: domain.clone(),
                challenge_type,
            }
        })?;
        let key_authorization = account.key_authorization(&challenge.token)?;
        let credential =
            ChallengeCredential::new(challenge_type, &domain, &challenge.token, &key_authorization);

        Ok(Self {
            authorization,
            challenge_type,
            key_authorization,
            credential,
        })
    }

    pub fn domain(&self) -> String {
        self.authorization.domain()
    }

    pub fn challenge_type(&self) -> ChallengeType {
        self.challenge_type
    }

    pub fn credential(&self) -> &ChallengeCredential {
        &self.credential
    }

    pub fn key_authorization(&self) -> &str {
        &self.key_authorization
    }

    pub fn authorization(&self) -> &Authorization {
        &self.authorization
    }

    pub fn challenge(&self) -> Option<&Challenge> {
        self.authorization.get_challenge(self.challenge_type)
    }

    /// 建立可由外部排程逐步推進的驗證器。
    pub fn verifier<'a>(
        &'a mut self,
        account: &'a Account,
        timeouts: VerifyTimeouts,
    ) -> ChallengeVerifier<'a> {
        ChallengeVerifier::new(self, account, timeouts)
    }

    /// 以 session 的時鐘驅動驗證直到完成。
    #[instrument(
        level = Level::INFO,
        name = "ChallengeService::verify",
        err,
        skip(self, account),
        fields(domain = %self.domain(), challenge = %self.challenge_type)
    )]
    pub fn verify(&mut self, account: &Account, timeouts: VerifyTimeouts) -> Result<()> {
        let clock = account.session.clock.clone();
        let mut verifier = self.verifier(account, timeouts);
        loop {
            match verifier.step()? {
                Step::Continue => {}
                Step::Wait(duration) => clock.sleep(duration),
                Step::Done => return Ok(()),
            }
        }
    }

    /// 本地確認挑戰內容是否已可見；請求失敗視為尚未就緒。
    fn check_locally(&self, session: &Session) -> Result<bool> {
        match &self.credential {
            ChallengeCredential::Http {
                identifier,
                file_name,
                file_content,
            } => Ok(["http", "https"].iter().any(|scheme| {
                let url = format!(
                    "{}://{}/.well-known/acme-challenge/{}",
                    scheme, identifier, file_name
                );
                match session.transport.get(&url) {
                    Ok(response) => {
                        response.status == StatusCode::OK
                            && response.body == file_content.as_bytes()
                    }
                    Err(e) => {
                        debug!(%url, error = %e, "HTTP challenge not reachable");
                        false
                    }
                }
            })),
            ChallengeCredential::Dns { dns_content, .. } => {
                let record = self.credential.dns_record_name().unwrap_or_default();
                let records = lookup_txt(session, &record)?;
                debug!(%record, ?records, "Resolved TXT records");
                Ok(records.iter().any(|value| value == dns_content))
            }
        }
    }

    /// 通知 CA 開始驗證挑戰。
    fn notify(&self, account: &Account) -> Result<()> {
        let challenge = self
            .challenge()
            .ok_or_else(|| AuthorizationError::ChallengeNotOffered {
                domain: self.domain(),
                challenge_type: self.challenge_type,
            })?;
        let payload = ChallengeValidationPayload::new(&self.key_authorization)
            .to_base64()
            .map_err(AuthorizationError::from)?;
        let response = account
            .post(&challenge.url, &payload)
            .map_err(AuthorizationError::from)?;
        if response.status != StatusCode::OK {
            return Err(AuthorizationError::Rejected(response.into_rejection()).into());
        }
        info!(
            domain = %self.domain(),
            challenge = %self.challenge_type,
            "Challenge submitted to CA"
        );
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct DnsResolveResponse {
    #[serde(rename = "Answer", default)]
    answer: Vec<DnsAnswer>,
}

#[derive(Debug, Deserialize)]
struct DnsAnswer {
    data: String,
}

/// 透過 DNS-over-HTTPS JSON API 查詢 TXT 記錄；查詢失敗回傳空清單。
fn lookup_txt(session: &Session, name: &str) -> Result<Vec<String>> {
    let url = Url::parse_with_params(
        &session.settings.dns_resolver_url,
        &[("name", name), ("type", "TXT")],
    )
    .map_err(|e| ChallengeError::ResolverUrl(e.to_string()))?;

    let response = match session.transport.get(url.as_str()) {
        Ok(response) if response.status == StatusCode::OK => response,
        Ok(response) => {
            debug!(status = %response.status, "DNS resolver rejected query");
            return Ok(Vec::new());
        }
        Err(e) => {
            debug!(error = %e, "DNS resolver unreachable");
            return Ok(Vec::new());
        }
    };

    Ok(response
        .json::<DnsResolveResponse>()
        .map(|resolved| {
            resolved
                .answer
                .into_iter()
                .map(|answer| answer.data.trim_matches('"').to_string())
                .collect()
        })
        .unwrap_or_default())
}

/// 驗證器目前所在的階段。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    LocalCheck,
    Notify,
    CaPoll,
    Done,
}

/// 單步執行的結果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// 立即執行下一步。
    Continue,
    /// 等待指定時間後再執行下一步。
    Wait(Duration),
    Done,
}

/// 挑戰驗證的狀態機：`LocalCheck → Notify → CaPoll → Done`。
///
/// 每次 [`ChallengeVerifier::step`] 只做一個動作且不睡眠，由呼叫端決定如何等待。
/// 兩個階段的期限在各自第一次執行時才開始計時。
#[derive(Debug)]
pub struct ChallengeVerifier<'a> {
    service: &'a mut ChallengeService,
    account: &'a Account,
    timeouts: VerifyTimeouts,
    phase: Phase,
    local_deadline: Option<Deadline>,
    ca_deadline: Option<Deadline>,
}

impl<'a> ChallengeVerifier<'a> {
    fn new(
        service: &'a mut ChallengeService,
        account: &'a Account,
        timeouts: VerifyTimeouts,
    ) -> Self {
        let challenge_pending = service
            .challenge()
            .is_some_and(|challenge| challenge.status == ChallengeStatus::Pending);
        let phase = if service.authorization.status == AuthorizationStatus::Pending
            && challenge_pending
        {
            Phase::LocalCheck
        } else {
            debug!(domain = %service.domain(), "Challenge already handled");
            Phase::Done
        };

        Self {
            service,
            account,
            timeouts,
            phase,
            local_deadline: None,
            ca_deadline: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// 推進一步。
    pub fn step(&mut self) -> Result<Step> {
        let account = self.account;
        let clock = account.session.clock.as_ref();
        let interval = account.session.settings.poll_interval;

        match self.phase {
            Phase::LocalCheck => {
                let timeout = self.timeouts.local;
                let deadline = *self
                    .local_deadline
                    .get_or_insert_with(|| Deadline::new(clock, timeout));
                if self.service.check_locally(&account.session)? {
                    info!(domain = %self.service.domain(), "Challenge visible locally");
                    self.phase = Phase::Notify;
                    return Ok(Step::Continue);
                }
                deadline
                    .next_wait(clock, interval)
                    .map(Step::Wait)
                    .ok_or_else(|| ChallengeError::VerifyLocallyTimeout {
                        domain: self.service.domain(),
                        elapsed: deadline.elapsed(clock),
                    })
            }
            Phase::Notify => {
                self.service.notify(account)?;
                self.phase = Phase::CaPoll;
                Ok(Step::Continue)
            }
            Phase::CaPoll => {
                let timeout = self.timeouts.ca;
                let deadline = *self
                    .ca_deadline
                    .get_or_insert_with(|| Deadline::new(clock, timeout));
                self.service.authorization.refresh(account)?;
                match self.service.authorization.status {
                    AuthorizationStatus::Pending => deadline
                        .next_wait(clock, interval)
                        .map(Step::Wait)
                        .ok_or_else(|| ChallengeError::VerifyCaTimeout {
                            domain: self.service.domain(),
                            elapsed: deadline.elapsed(clock),
                        }),
                    AuthorizationStatus::Valid => {
                        info!(domain = %self.service.domain(), "Authorization valid");
                        self.phase = Phase::Done;
                        Ok(Step::Done)
                    }
                    status => Err(AuthorizationError::NotValid {
                        domain: self.service.domain(),
                        status,
                    }
                    .into()),
                }
            }
            Phase::Done => Ok(Step::Done),
        }
    }
}
