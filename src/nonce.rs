use std::sync::{Arc, Mutex, PoisonError};

use reqwest::StatusCode;
use thiserror::Error;
use tracing::debug;

use crate::transport::{Rejection, RequestError, Transport, REPLAY_NONCE};

/// 表示在取得 Nonce 時可能發生的錯誤狀況。
#[derive(Error, Debug)]
pub enum NonceError {
    /// 當請求過程中發生錯誤時回傳此錯誤。
    #[error("Failed to request nonce: {0}")]
    Request(#[from] RequestError),
    /// nonce 端點回傳非預期的狀態碼。
    #[error("Nonce endpoint rejected request: {0}")]
    UnexpectedStatus(Rejection),
    /// 當回應中缺少 `Replay-Nonce` 標頭時回傳此錯誤。
    #[error("No Replay-Nonce header found in response")]
    NoNonceHeader,
}

type Result<T> = std::result::Result<T, NonceError>;

/// 保存至多一個 `Replay-Nonce` 的快取。
///
/// 每個簽名請求消耗一個 nonce；快取為空時才向 `newNonce` 端點發送 HEAD 請求。
/// 內部以 `Mutex` 保護，取出與寫回互斥。
#[derive(Debug)]
pub struct NonceStore {
    transport: Arc<dyn Transport>,
    url: String,
    cached: Mutex<Option<String>>,
}

impl NonceStore {
    /// 以 `newNonce` 端點建立空的快取。
    pub fn new(transport: Arc<dyn Transport>, url: impl Into<String>) -> Self {
        Self {
            transport,
            url: url.into(),
            cached: Mutex::new(None),
        }
    }

    /// 取出快取中的 nonce（取出後快取清空），沒有時向伺服器取得新的。
    pub fn get(&self) -> Result<String> {
        let cached = self
            .cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(nonce) = cached {
            return Ok(nonce);
        }

        debug!(url = %self.url, "Fetching fresh nonce");
        let response = self.transport.head(&self.url)?;
        if response.status != StatusCode::OK && response.status != StatusCode::NO_CONTENT {
            return Err(NonceError::UnexpectedStatus(response.into_rejection()));
        }
        response
            .header(REPLAY_NONCE)
            .ok_or(NonceError::NoNonceHeader)
    }

    /// 以回應中的 nonce 覆寫快取，錯誤回應也一樣。
    pub fn set(&self, value: impl Into<String>) {
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = Some(value.into());
    }

    /// 清空快取。
    pub fn destroy(&self) {
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{HttpResponse, MockTransport};
    use reqwest::Method;

    const URL: &str = "https://x/nonce";

    fn store_with(response: HttpResponse) -> (Arc<MockTransport>, NonceStore) {
        let transport = Arc::new(MockTransport::new());
        transport.on(Method::HEAD, URL, response);
        let store = NonceStore::new(transport.clone(), URL);
        (transport, store)
    }

    #[test]
    fn test_cached_nonce_is_consumed_once() {
        let (transport, store) = store_with(HttpResponse::new(StatusCode::OK).with_nonce("fresh"));

        store.set("cached");
        assert_eq!(store.get().unwrap(), "cached");
        assert_eq!(transport.count(&Method::HEAD, URL), 0);

        assert_eq!(store.get().unwrap(), "fresh");
        assert_eq!(transport.count(&Method::HEAD, URL), 1);
    }

    #[test]
    fn test_destroy_forces_refresh() {
        let (transport, store) =
            store_with(HttpResponse::new(StatusCode::NO_CONTENT).with_nonce("fresh"));

        store.set("stale");
        store.destroy();
        assert_eq!(store.get().unwrap(), "fresh");
        assert_eq!(transport.count(&Method::HEAD, URL), 1);
    }

    #[test]
    fn test_missing_header() {
        let (_, store) = store_with(HttpResponse::new(StatusCode::OK));
        assert!(matches!(store.get(), Err(NonceError::NoNonceHeader)));
    }

    #[test]
    fn test_unexpected_status() {
        let (_, store) =
            store_with(HttpResponse::new(StatusCode::SERVICE_UNAVAILABLE).with_nonce("n"));
        assert!(matches!(store.get(), Err(NonceError::UnexpectedStatus(_))));
    }
}
