//! 配置管理模块
//! 支持从环境变量和配置文件加载配置

use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// 钱包子系统配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub pairing: PairingConfig,
    #[serde(default)]
    pub signing: SigningConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 钱包检测配置（扩展注入是异步的，必须带退避重试）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    pub budget_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

/// 配对配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingConfig {
    pub timeout_secs: u64,
    /// dApp 名称，随中继配对提案一起展示给用户
    pub app_name: String,
    #[serde(default)]
    pub app_url: Option<String>,
}

/// 签名配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningConfig {
    pub timeout_secs: u64,
}

/// 会话持久化配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub backend: String, // "file" or "memory"
    pub path: Option<String>,
    pub storage_key: String,
    pub max_age_hours: i64,
}

/// 链上下文配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// "mainnet" / "testnet" / "previewnet"
    pub hedera_network: String,
    pub hedera_node_account_ids: Vec<String>,
    pub max_transaction_fee_tinybars: u64,
    pub transaction_valid_duration_secs: i64,
    #[serde(default)]
    pub transaction_memo: String,
    pub evm_chain_id: u64,
    pub evm_gas_limit: u64,
    pub evm_max_fee_per_gas: u64,
    pub evm_max_priority_fee_per_gas: u64,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "text"
    pub enable_file_logging: bool,
    pub log_file_path: Option<String>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            budget_ms: std::env::var("WALLET_DETECTION_BUDGET_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1500),
            initial_backoff_ms: std::env::var("WALLET_DETECTION_BACKOFF_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(50),
            max_backoff_ms: std::env::var("WALLET_DETECTION_MAX_BACKOFF_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(400),
        }
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            timeout_secs: std::env::var("WALLET_PAIRING_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60),
            app_name: std::env::var("WALLET_APP_NAME")
                .unwrap_or_else(|_| "Rights Marketplace".into()),
            app_url: std::env::var("WALLET_APP_URL").ok(),
        }
    }
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            timeout_secs: std::env::var("WALLET_SIGNING_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: std::env::var("WALLET_SESSION_BACKEND").unwrap_or_else(|_| "file".into()),
            path: std::env::var("WALLET_SESSION_PATH").ok(),
            storage_key: std::env::var("WALLET_SESSION_KEY")
                .unwrap_or_else(|_| "rights_wallet.session".into()),
            max_age_hours: 24,
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            hedera_network: std::env::var("HEDERA_NETWORK").unwrap_or_else(|_| "testnet".into()),
            hedera_node_account_ids: std::env::var("HEDERA_NODE_ACCOUNT_IDS")
                .ok()
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_else(|| vec!["0.0.3".to_string()]),
            max_transaction_fee_tinybars: std::env::var("HEDERA_MAX_TX_FEE_TINYBARS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2_000_000_000), // 20 hbar
            transaction_valid_duration_secs: 120,
            transaction_memo: std::env::var("HEDERA_TX_MEMO").unwrap_or_default(),
            evm_chain_id: std::env::var("EVM_CHAIN_ID")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(296), // Hedera EVM testnet
            evm_gas_limit: std::env::var("EVM_GAS_LIMIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(300_000),
            evm_max_fee_per_gas: 600_000_000_000,
            evm_max_priority_fee_per_gas: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".into()),
            enable_file_logging: std::env::var("LOG_FILE_ENABLED")
                .ok()
                .map(|v| v == "1")
                .unwrap_or(false),
            log_file_path: std::env::var("LOG_FILE_PATH").ok(),
        }
    }
}

impl DetectionConfig {
    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.budget_ms)
    }
}

impl PairingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SigningConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            detection: DetectionConfig::default(),
            pairing: PairingConfig::default(),
            signing: SigningConfig::default(),
            persistence: PersistenceConfig::default(),
            ledger: LedgerConfig::default(),
            logging: LoggingConfig::default(),
        })
    }

    /// 从配置文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: Config =
            toml::from_str(&content).with_context(|| "Failed to parse config file as TOML")?;

        Ok(config)
    }

    /// 从环境变量和配置文件合并加载（配置文件优先级更高，缺失的段落回落到环境变量）
    pub fn from_env_and_file<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut config = Self::from_env()?;

        if let Some(path) = path {
            if path.as_ref().exists() {
                config = Self::from_file(path)?;
            }
        }

        Ok(config)
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<()> {
        if self.detection.budget_ms == 0 || self.detection.budget_ms > 5_000 {
            anyhow::bail!("detection budget must be between 1 and 5000 ms");
        }
        if self.detection.initial_backoff_ms == 0
            || self.detection.initial_backoff_ms > self.detection.max_backoff_ms
        {
            anyhow::bail!("detection backoff must be positive and not exceed max backoff");
        }

        if self.pairing.timeout_secs == 0 {
            anyhow::bail!("pairing timeout must be positive");
        }
        if self.signing.timeout_secs == 0 {
            anyhow::bail!("signing timeout must be positive");
        }

        if self.persistence.backend != "file" && self.persistence.backend != "memory" {
            anyhow::bail!("WALLET_SESSION_BACKEND must be 'file' or 'memory'");
        }
        if self.persistence.max_age_hours <= 0 {
            anyhow::bail!("session max age must be positive");
        }

        let valid_networks = ["mainnet", "testnet", "previewnet"];
        if !valid_networks.contains(&self.ledger.hedera_network.as_str()) {
            anyhow::bail!("HEDERA_NETWORK must be one of: {:?}", valid_networks);
        }
        if self.ledger.hedera_node_account_ids.is_empty() {
            anyhow::bail!("at least one Hedera node account id is required");
        }
        for node in &self.ledger.hedera_node_account_ids {
            if !crate::utils::account_validator::AccountValidator::is_hedera_entity_id(node) {
                anyhow::bail!("invalid Hedera node account id: {}", node);
            }
        }

        // 验证日志级别
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("LOG_LEVEL must be one of: {:?}", valid_levels);
        }

        // 验证日志格式
        if self.logging.format != "json" && self.logging.format != "text" {
            anyhow::bail!("LOG_FORMAT must be 'json' or 'text'");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_config_from_env() {
        let config = Config::from_env().unwrap();
        assert_eq!(config.persistence.max_age_hours, 24);
        assert_eq!(config.ledger.transaction_valid_duration_secs, 120);
    }

    #[test]
    fn test_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[detection]
budget_ms = 1000
initial_backoff_ms = 25
max_backoff_ms = 200

[pairing]
timeout_secs = 45
app_name = "Rights Market"

[signing]
timeout_secs = 30

[persistence]
backend = "memory"
storage_key = "test.session"
max_age_hours = 24

[ledger]
hedera_network = "mainnet"
hedera_node_account_ids = ["0.0.3", "0.0.4"]
max_transaction_fee_tinybars = 100000000
transaction_valid_duration_secs = 120
evm_chain_id = 295
evm_gas_limit = 250000
evm_max_fee_per_gas = 1000
evm_max_priority_fee_per_gas = 0

[logging]
level = "debug"
format = "json"
enable_file_logging = false
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.pairing.timeout_secs, 45);
        assert_eq!(config.ledger.hedera_node_account_ids.len(), 2);
        assert_eq!(config.signing.timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::from_env().unwrap();
        config.logging.level = "info".into();
        config.logging.format = "text".into();
        config.ledger.hedera_network = "testnet".into();
        config.persistence.backend = "memory".into();
        assert!(config.validate().is_ok());

        config.ledger.hedera_node_account_ids = vec!["node-3".into()];
        assert!(config.validate().is_err());
    }
}
