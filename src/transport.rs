//! 與 ACME 伺服器之間的 HTTP 傳輸層。
//!
//! 協議引擎只依賴 [`Transport`] trait，正式環境使用 [`ReqwestTransport`]，
//! 測試則以 [`MockTransport`] 預先編排回應。

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{Mutex, PoisonError},
};

use reqwest::{
    blocking::{Client, Response},
    header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE},
    Method, StatusCode,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// 每個 ACME 回應都可能攜帶的 nonce 標頭。
pub const REPLAY_NONCE: &str = "replay-nonce";

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// 傳輸層錯誤：連線、TLS，或無法解析的回應內容。
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Request error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Failed to decode response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("No response available for {method} {url}")]
    Unreachable { method: Method, url: String },
}

type Result<T> = std::result::Result<T, RequestError>;

/// 伺服器回應的完整內容，狀態碼、標頭與原始 body。
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// 建立一個空 body 的回應，通常搭配下列 `with_*` 方法組裝測試資料。
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// 加入一個標頭；無法表示為標頭值的字串會被略過。
    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        match HeaderValue::from_str(value) {
            Ok(value) => {
                self.headers.append(name, value);
            }
            Err(_) => warn!(header = %name, "Dropping invalid header value"),
        }
        self
    }

    /// 加入 `Replay-Nonce` 標頭。
    pub fn with_nonce(self, nonce: &str) -> Self {
        self.with_header(HeaderName::from_static(REPLAY_NONCE), nonce)
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// 以 JSON 作為 body，並設定對應的 `Content-Type`。
    pub fn with_json<T: Serialize>(self, value: &T) -> Self {
        let body = serde_json::to_vec(value).unwrap_or_default();
        self.with_header(CONTENT_TYPE, "application/json")
            .with_body(body)
    }

    /// 取得標頭的字串值，不存在或非 ASCII 時回傳 `None`。
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// 將 body 解碼為指定的結構。
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// 若 body 是 RFC 7807 problem document，回傳其內容。
    pub fn problem(&self) -> Option<Problem> {
        serde_json::from_slice(&self.body).ok()
    }

    /// 轉換成保留狀態碼、標頭與原始 body 的拒絕資訊。
    pub fn into_rejection(self) -> Rejection {
        Rejection {
            body: self.text(),
            status: self.status,
            headers: self.headers,
        }
    }
}

/// ACME 伺服器回傳的錯誤文件（`application/problem+json`）。
#[derive(Debug, Clone, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub typ: Option<String>,
    pub detail: Option<String>,
    pub status: Option<u16>,
}

impl Problem {
    pub const BAD_NONCE: &'static str = "urn:ietf:params:acme:error:badNonce";

    pub fn is_bad_nonce(&self) -> bool {
        self.typ.as_deref() == Some(Self::BAD_NONCE)
    }
}

/// 伺服器以非預期狀態碼拒絕請求時的完整診斷資訊。
#[derive(Debug, Clone)]
pub struct Rejection {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {:?}, {}", self.status, self.headers, self.body)
    }
}

/// 發送 ACME 請求所需的最小 HTTP 介面。
pub trait Transport: Send + Sync + fmt::Debug {
    fn get(&self, url: &str) -> Result<HttpResponse>;

    fn head(&self, url: &str) -> Result<HttpResponse>;

    /// 以 `application/jose+json` 送出已簽名的 JWS。
    fn post_jose(&self, url: &str, body: &str) -> Result<HttpResponse>;
}

/// 以 `reqwest` 阻塞式用戶端實作的傳輸層。
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let client = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self { client })
    }

    fn collect(response: Response) -> Result<HttpResponse> {
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes()?.to_vec();
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

impl Transport for ReqwestTransport {
    fn get(&self, url: &str) -> Result<HttpResponse> {
        debug!(url, "GET");
        Self::collect(self.client.get(url).send()?)
    }

    fn head(&self, url: &str) -> Result<HttpResponse> {
        debug!(url, "HEAD");
        Self::collect(self.client.head(url).send()?)
    }

    fn post_jose(&self, url: &str, body: &str) -> Result<HttpResponse> {
        debug!(url, "POST");
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/jose+json")
            .body(body.to_string())
            .send()?;
        Self::collect(response)
    }
}

/// [`MockTransport`] 記錄下來的一筆請求。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<String>,
}

/// 測試用的傳輸層。
///
/// 每個 (method, URL) 對應一個回應佇列，依序取出；佇列只剩最後一個時會重複使用它，
/// 直到再有新的回應加入為止。所有請求都會被記錄下來供斷言使用。
#[derive(Debug, Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<(Method, String), Route>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

#[derive(Debug, Default)]
struct Route {
    queue: VecDeque<HttpResponse>,
    /// 佇列中最後一個回應已被回傳過。
    drained: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 為 `method url` 追加一個回應。
    pub fn on(&self, method: Method, url: impl Into<String>, response: HttpResponse) -> &Self {
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        let route = routes.entry((method, url.into())).or_default();
        if route.drained {
            route.queue.clear();
            route.drained = false;
        }
        route.queue.push_back(response);
        self
    }

    /// 目前為止收到的所有請求，依時間排序。
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 計算 `method url` 被呼叫的次數。
    pub fn count(&self, method: &Method, url: &str) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|request| &request.method == method && request.url == url)
            .count()
    }

    fn respond(&self, method: Method, url: &str, body: Option<&str>) -> Result<HttpResponse> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedRequest {
                method: method.clone(),
                url: url.to_string(),
                body: body.map(ToString::to_string),
            });

        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        let unreachable = || RequestError::Unreachable {
            method: method.clone(),
            url: url.to_string(),
        };
        let route = routes
            .get_mut(&(method.clone(), url.to_string()))
            .ok_or_else(unreachable)?;
        if route.queue.len() > 1 {
            return route.queue.pop_front().ok_or_else(unreachable);
        }
        route.drained = true;
        route.queue.front().cloned().ok_or_else(unreachable)
    }
}

impl Transport for MockTransport {
    fn get(&self, url: &str) -> Result<HttpResponse> {
        self.respond(Method::GET, url, None)
    }

    fn head(&self, url: &str) -> Result<HttpResponse> {
        self.respond(Method::HEAD, url, None)
    }

    fn post_jose(&self, url: &str, body: &str) -> Result<HttpResponse> {
        self.respond(Method::POST, url, Some(body))
    }
}
