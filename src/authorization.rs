use std::fmt;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument, Level};

use crate::{
    account::Account,
    challenge::{Challenge, ChallengeStatus, ChallengeType},
    payload::{Identifier, PayloadError},
    session::SignedRequestError,
    transport::{HttpResponse, Rejection, RequestError},
};

/// 授權相關操作的錯誤。
#[derive(Debug, Error)]
pub enum AuthorizationError {
    #[error("Signed request failed: {0}")]
    Request(#[from] SignedRequestError),
    #[error("Failed to decode authorization: {0}")]
    Decode(#[from] RequestError),
    #[error("Request failed: {0}")]
    Rejected(Rejection),
    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),
    #[error("Authorization for {domain} is {status}")]
    NotValid {
        domain: String,
        status: AuthorizationStatus,
    },
    #[error("Challenge {challenge_type} is not offered for {domain}")]
    ChallengeNotOffered {
        domain: String,
        challenge_type: ChallengeType,
    },
}

type Result<T> = std::result::Result<T, AuthorizationError>;

/// 授權狀態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

impl fmt::Display for AuthorizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Deactivated => "deactivated",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        })
    }
}

#[derive(Debug, Deserialize)]
struct AuthorizationResource {
    identifier: Identifier,
    status: AuthorizationStatus,
    #[serde(default)]
    expires: Option<String>,
    #[serde(default)]
    wildcard: bool,
    #[serde(default)]
    challenges: Vec<ChallengeResource>,
}

#[derive(Debug, Deserialize)]
struct ChallengeResource {
    #[serde(rename = "type")]
    typ: String,
    url: String,
    #[serde(default)]
    token: String,
    status: ChallengeStatus,
}

/// 訂單中單一識別項的授權。
#[derive(Debug, Clone)]
pub struct Authorization {
    pub url: String,
    pub identifier: Identifier,
    pub status: AuthorizationStatus,
    pub expires: Option<String>,
    pub wildcard: bool,
    /// 伺服器提供、且本用戶端支援的挑戰。
    pub challenges: Vec<Challenge>,
}

impl Authorization {
    /// 以授權 URL 取得授權內容。
    #[instrument(level = Level::DEBUG, name = "Authorization::fetch", err, skip(account))]
    pub fn fetch(account: &Account, url: &str) -> Result<Self> {
        let response = account.post_as_get(url)?;
        Self::from_response(url, &response)
    }

    /// 重新取得授權，更新狀態與挑戰。
    pub fn refresh(&mut self, account: &Account) -> Result<()> {
        *self = Self::fetch(account, &self.url)?;
        debug!(domain = %self.domain(), status = %self.status, "Authorization refreshed");
        Ok(())
    }

    fn from_response(url: &str, response: &HttpResponse) -> Result<Self> {
        if response.status != StatusCode::OK {
            return Err(AuthorizationError::Rejected(response.clone().into_rejection()));
        }
        let resource: AuthorizationResource = response.json()?;

        let challenges = resource
            .challenges
            .into_iter()
            .filter_map(|challenge| {
                Some(Challenge {
                    challenge_type: ChallengeType::from_name(&challenge.typ)?,
                    url: challenge.url,
                    token: challenge.token,
                    status: challenge.status,
                })
            })
            .collect();

        Ok(Self {
            url: url.to_string(),
            identifier: resource.identifier,
            status: resource.status,
            expires: resource.expires,
            wildcard: resource.wildcard,
            challenges,
        })
    }

    /// 實際的域名；萬用字元授權會補回 `*.` 前綴。
    pub fn domain(&self) -> String {
        if self.wildcard {
            format!("*.{}", self.identifier.value)
        } else {
            self.identifier.value.clone()
        }
    }

    /// 依類型找出挑戰。
    pub fn get_challenge(&self, challenge_type: ChallengeType) -> Option<&Challenge> {
        self.challenges
            .iter()
            .find(|challenge| challenge.challenge_type == challenge_type)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires
            .as_deref()
            .and_then(|expires| DateTime::parse_from_rfc3339(expires).ok())
            .map(|expires| expires.with_timezone(&Utc))
    }
}
