//! 连接持久化
//!
//! 只保存非机密标识（账户、网络、钱包ID、时间戳），从不保存密钥材料。
//! 过期采用惰性判定：读取时超过 24 小时视为不存在，不做后台清扫。

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    config::PersistenceConfig,
    domain::{PairingProtocol, Session, SessionState},
    error::{WalletError, WalletResult},
};

/// 键值存储后端（浏览器 localStorage 的对应物）
pub trait KeyValueStorage: Send + Sync {
    fn get(&self, key: &str) -> WalletResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> WalletResult<()>;
    fn remove(&self, key: &str) -> WalletResult<()>;
}

#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> WalletResult<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| WalletError::Storage("memory storage poisoned".into()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> WalletResult<()> {
        self.entries
            .lock()
            .map_err(|_| WalletError::Storage("memory storage poisoned".into()))?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> WalletResult<()> {
        self.entries
            .lock()
            .map_err(|_| WalletError::Storage("memory storage poisoned".into()))?
            .remove(key);
        Ok(())
    }
}

/// 以 JSON 文件保存的键值存储
pub struct FileStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    fn read_all(&self) -> WalletResult<HashMap<String, String>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn write_all(&self, entries: &HashMap<String, String>) -> WalletResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(entries)?)?;
        Ok(())
    }
}

impl KeyValueStorage for FileStorage {
    fn get(&self, key: &str) -> WalletResult<Option<String>> {
        let _guard = self.lock.lock();
        Ok(self.read_all()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> WalletResult<()> {
        let _guard = self.lock.lock();
        let mut entries = self.read_all().unwrap_or_default();
        entries.insert(key.to_string(), value.to_string());
        self.write_all(&entries)
    }

    fn remove(&self, key: &str) -> WalletResult<()> {
        let _guard = self.lock.lock();
        let mut entries = self.read_all().unwrap_or_default();
        if entries.remove(key).is_some() {
            self.write_all(&entries)?;
        }
        Ok(())
    }
}

/// 持久化记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub provider_id: String,
    pub account_id: String,
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    pub protocol: PairingProtocol,
    pub established_at: DateTime<Utc>,
}

impl From<&Session> for PersistedSession {
    fn from(session: &Session) -> Self {
        Self {
            provider_id: session.provider_id.clone(),
            account_id: session.account_id.clone(),
            network: session.network.clone(),
            topic: session.topic.clone(),
            protocol: session.protocol,
            established_at: session.established_at,
        }
    }
}

impl PersistedSession {
    /// 还原为会话（状态由调用方在校验后决定）
    pub fn into_session(self, epoch: u64) -> Session {
        Session {
            provider_id: self.provider_id,
            account_id: self.account_id,
            network: self.network,
            topic: self.topic,
            protocol: self.protocol,
            established_at: self.established_at,
            state: SessionState::Idle,
            epoch,
        }
    }
}

/// 最近一次成功会话的持久化
///
/// 所有失败在此吸收并降级为“没有可恢复的会话”
#[derive(Clone)]
pub struct SessionStore {
    storage: Arc<dyn KeyValueStorage>,
    key: String,
    max_age: Duration,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn KeyValueStorage>, key: impl Into<String>, max_age: Duration) -> Self {
        Self {
            storage,
            key: key.into(),
            max_age,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryStorage::new()),
            "rights_wallet.session",
            Duration::hours(24),
        )
    }

    pub fn from_config(config: &PersistenceConfig) -> Self {
        let storage: Arc<dyn KeyValueStorage> = match (config.backend.as_str(), &config.path) {
            ("file", Some(path)) => Arc::new(FileStorage::new(path)),
            ("file", None) => Arc::new(FileStorage::new("./data/wallet_session.json")),
            _ => Arc::new(MemoryStorage::new()),
        };
        Self::new(
            storage,
            config.storage_key.clone(),
            Duration::hours(config.max_age_hours),
        )
    }

    pub fn save(&self, session: &Session) {
        let record = PersistedSession::from(session);
        let result = serde_json::to_string(&record)
            .map_err(WalletError::from)
            .and_then(|json| self.storage.set(&self.key, &json));
        match result {
            Ok(()) => tracing::debug!(
                provider_id = %session.provider_id,
                network = %session.network,
                "session persisted"
            ),
            Err(e) => tracing::warn!(error = %e, "failed to persist session"),
        }
    }

    /// 读取最近一次会话；超期、损坏或读取失败都视为不存在
    pub fn load(&self) -> Option<PersistedSession> {
        self.load_at(Utc::now())
    }

    pub fn load_at(&self, now: DateTime<Utc>) -> Option<PersistedSession> {
        let raw = match self.storage.get(&self.key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read persisted session");
                return None;
            }
        };

        let record: PersistedSession = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(error = %e, "discarding unreadable persisted session");
                self.clear();
                return None;
            }
        };

        if now.signed_duration_since(record.established_at) > self.max_age {
            tracing::info!(
                provider_id = %record.provider_id,
                established_at = %record.established_at,
                "persisted session expired"
            );
            self.clear();
            return None;
        }

        Some(record)
    }

    pub fn clear(&self) {
        if let Err(e) = self.storage.remove(&self.key) {
            tracing::warn!(error = %e, "failed to clear persisted session");
        }
    }

    /// 只在记录属于该钱包（或无法读取）时清除
    pub fn clear_for(&self, provider_id: &str) {
        let owner = self
            .storage
            .get(&self.key)
            .ok()
            .flatten()
            .and_then(|raw| serde_json::from_str::<PersistedSession>(&raw).ok())
            .map(|record| record.provider_id);
        match owner {
            Some(owner) if owner != provider_id => {}
            _ => self.clear(),
        }
    }
}
