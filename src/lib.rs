//! # ACME Certificate Automation Library
//!
//! 以阻塞式 API 與 ACME v2 服務（例如 Let's Encrypt）交互，涵蓋帳戶生命週期、訂單、
//! HTTP-01／DNS-01 挑戰驗證、憑證下載與撤銷。
//!
//! ## 模組
//!
//! - **session**: 共用的設定、傳輸層、儲存、時鐘、目錄與 nonce 快取，所有簽名請求都經由 [`Session::post_signed`]。
//! - **account**: 帳戶的建立或恢復、聯絡資訊更新、金鑰輪替與停用。
//! - **order**: 訂單的建立或恢復、列出待驗證挑戰、下訂、下載與撤銷憑證。
//! - **authorization** / **challenge**: 授權狀態與挑戰憑據，以及「本地確認 → 通知 CA → 輪詢」的驗證流程。
//! - **key_pair**、**jwk**、**jws**、**protection**、**signature**、**csr**、**certificate**: 密碼學原語與 JWS 封裝。
//! - **storage**: 以 key 存取的持久化介面，提供檔案系統與記憶體兩種實作。
//!
//! ## 示例
//!
//! ```no_run
//! use acme_flow::{
//!     account::Account,
//!     challenge::{ChallengeCredential, VerifyTimeouts},
//!     order::OrderBuilder,
//!     session::SessionBuilder,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 1. 建立 session 並註冊或恢復帳戶
//!     let session = SessionBuilder::new()
//!         .contact("admin@example.com")
//!         .staging(true)
//!         .build()?;
//!     let account = Account::init(session)?;
//!
//!     // 2. 為每個域名指定挑戰類型並建立訂單
//!     let mut order = OrderBuilder::new()
//!         .http01("example.com")
//!         .dns01("*.example.com")
//!         .build(&account)?;
//!
//!     // 3. 佈署挑戰內容後驗證
//!     for mut service in order.get_pending_challenge_list(&account)? {
//!         match service.credential() {
//!             ChallengeCredential::Http { file_name, file_content, .. } => {
//!                 println!("serve {} with {}", file_name, file_content)
//!             }
//!             ChallengeCredential::Dns { dns_content, .. } => {
//!                 println!("set TXT {}", dns_content)
//!             }
//!         }
//!         service.verify(&account, VerifyTimeouts::from_secs(300, 300))?;
//!     }
//!
//!     // 4. 下訂並下載憑證
//!     let certificate = order.get_certificate_file(&account)?;
//!     println!("{}", certificate.certificate_full_chained);
//!     Ok(())
//! }
//! ```

pub mod account;
pub mod authorization;
pub mod base64;
pub mod certificate;
pub mod challenge;
pub mod csr;
pub mod directory;
pub mod jwk;
pub mod jws;
pub mod key_pair;
pub mod nonce;
pub mod order;
pub mod payload;
pub mod poll;
pub mod protection;
pub mod session;
pub mod signature;
pub mod storage;
pub mod transport;

pub use session::{Session, SessionBuilder};
