use std::{
    collections::HashMap,
    fmt, fs, io,
    path::{Component, Path, PathBuf},
    sync::{PoisonError, RwLock},
};

use data_encoding::HEXLOWER;
use openssl::sha::sha256;
use thiserror::Error;

use crate::key_pair::KeyAlgorithm;

/// 儲存操作可能發生的錯誤類型。
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Key is invalid: {0}")]
    InvalidKey(String),
    #[error("Key not found: {0}")]
    NotFound(String),
    #[error("Key is a dir: {0}")]
    IsDir(String),
    #[error("File is corrupted: {0}")]
    CorruptedFile(String),
}

/// 儲存操作的結果類型，封裝 [`StorageError`]。
pub type Result<T> = std::result::Result<T, StorageError>;

/// 以 key 存取不透明資料的儲存介面。
///
/// key 以 `/` 分隔，例如 `account/private.pem`；刪除一個前綴時會連同底下所有項目一併移除。
pub trait Storage: Send + Sync + fmt::Debug {
    /// 讀取指定 key 的內容，不存在時回傳 [`StorageError::NotFound`]。
    fn read_file(&self, key: &str) -> Result<Vec<u8>>;

    /// 寫入（覆寫）指定 key 的內容。
    fn write_file(&self, key: &str, value: &[u8]) -> Result<()>;

    /// 刪除指定 key 或其下所有項目；不存在時視為成功。
    fn remove(&self, key: &str) -> Result<()>;

    fn exists(&self, key: &str) -> Result<bool>;

    /// 讀取內容，不存在時回傳 `None`。
    fn read_optional(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.read_file(key) {
            Ok(value) => Ok(Some(value)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// 以 UTF-8 字串讀取內容。
    fn read_string(&self, key: &str) -> Result<String> {
        String::from_utf8(self.read_file(key)?)
            .map_err(|_| StorageError::CorruptedFile(key.to_string()))
    }
}

/// 帳戶與訂單資料在儲存中的位置。
pub struct StoragePaths;

impl StoragePaths {
    pub const ACCOUNT_PRIVATE_KEY: &'static str = "account/private.pem";
    pub const ACCOUNT_PUBLIC_KEY: &'static str = "account/public.pem";
    pub const ACCOUNT_URL: &'static str = "account/account_url";

    pub const PRIVATE_KEY: &'static str = "private.pem";
    pub const PUBLIC_KEY: &'static str = "public.pem";
    pub const CSR: &'static str = "certificate.csr";
    pub const CERTIFICATE: &'static str = "certificate.crt";
    pub const CERTIFICATE_FULL_CHAINED: &'static str = "certificate-fullchained.crt";
    pub const ORDER: &'static str = "order.json";

    /// 訂單目錄：`domains/<sha256(排序後的識別項以逗號串接)>/<演算法>`。
    ///
    /// 傳入的識別項必須已排序且去重，同一組域名與演算法永遠對應同一個目錄。
    pub fn order_dir<S: AsRef<str>>(identifiers: &[S], algorithm: KeyAlgorithm) -> String {
        let joined = identifiers
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "domains/{}/{}",
            HEXLOWER.encode(&sha256(joined.as_bytes())),
            algorithm
        )
    }
}

/// 私有工具，提供 key 正規化與驗證等輔助函式。
struct KeyUtils;

impl KeyUtils {
    /// 將 key 正規化為不含根目錄的相對路徑，並拒絕不合法字元與跳出根目錄的 `..`。
    fn normalize(key: &str) -> Result<PathBuf> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey("Empty key".to_string()));
        }
        if key.contains('\0') || key.contains('\n') || key.contains('\r') {
            return Err(StorageError::InvalidKey(format!(
                "Invalid characters in key: {}",
                key
            )));
        }
        if key.contains("//") {
            return Err(StorageError::InvalidKey(format!(
                "Double slashes not allowed in key: {}",
                key
            )));
        }

        let mut normalized = PathBuf::new();
        for component in Path::new(key).components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(StorageError::InvalidKey(format!(
                            "Cannot use '..' to escape root directory: {}",
                            key
                        )));
                    }
                }
                Component::Normal(name) => match name.to_str() {
                    Some(name) if !name.contains('\\') => normalized.push(name),
                    _ => {
                        return Err(StorageError::InvalidKey(format!(
                            "Invalid path component in: {}",
                            key
                        )))
                    }
                },
                Component::Prefix(_) => {
                    return Err(StorageError::InvalidKey(format!("Invalid path: {}", key)))
                }
            }
        }

        if normalized.as_os_str().is_empty() {
            return Err(StorageError::InvalidKey(format!("Empty path: {}", key)));
        }
        Ok(normalized)
    }
}

/// 將每個 key 存成根目錄下的一個檔案，父目錄會自動建立。
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        Ok(self.root.join(KeyUtils::normalize(key)?))
    }
}

impl Storage for FsStorage {
    fn read_file(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path(key)?;
        if path.is_dir() {
            return Err(StorageError::IsDir(key.to_string()));
        }
        fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
            _ => StorageError::Io(e),
        })
    }

    fn write_file(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path(key)?;
        if path.is_dir() {
            return Err(StorageError::IsDir(key.to_string()));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, value)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path(key)?;
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(StorageError::Io(e)),
            _ => Ok(()),
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.path(key)?.exists())
    }
}

/// 記憶體內的儲存實作，用於測試或不需持久化的情境。
#[derive(Debug, Default)]
pub struct MemStorage {
    entries: RwLock<HashMap<PathBuf, Vec<u8>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// 目前所有 key，已排序。
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .map(|path| path.to_string_lossy().into_owned())
            .collect();
        keys.sort();
        keys
    }
}

impl Storage for MemStorage {
    fn read_file(&self, key: &str) -> Result<Vec<u8>> {
        let path = KeyUtils::normalize(key)?;
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(value) = entries.get(&path) {
            return Ok(value.clone());
        }
        if entries.keys().any(|entry| entry.starts_with(&path)) {
            return Err(StorageError::IsDir(key.to_string()));
        }
        Err(StorageError::NotFound(key.to_string()))
    }

    fn write_file(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = KeyUtils::normalize(key)?;
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries
            .keys()
            .any(|entry| entry != &path && entry.starts_with(&path))
        {
            return Err(StorageError::IsDir(key.to_string()));
        }
        entries.insert(path, value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = KeyUtils::normalize(key)?;
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|entry, _| !entry.starts_with(&path));
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let path = KeyUtils::normalize(key)?;
        Ok(self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .any(|entry| entry.starts_with(&path)))
    }
}
