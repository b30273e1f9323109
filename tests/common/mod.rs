//! 测试辅助模块
//! 提供配置、脚本化钱包环境和服务构造

#![allow(dead_code)]

use std::sync::Arc;

use rights_wallet::{
    config::{
        Config, DetectionConfig, LedgerConfig, LoggingConfig, PairingConfig, PersistenceConfig,
        SigningConfig,
    },
    infrastructure::{
        environment::{ScriptedProvider, ScriptedReply, StaticEnvironment},
        relay::LoopbackRelay,
        session_store::SessionStore,
    },
    service::WalletService,
};
use serde_json::json;

pub const BLADE_ACCOUNT: &str = "0.0.1234";

/// 固定的测试配置（不读环境变量）
pub fn test_config() -> Config {
    Config {
        detection: DetectionConfig {
            budget_ms: 1500,
            initial_backoff_ms: 50,
            max_backoff_ms: 400,
        },
        pairing: PairingConfig {
            timeout_secs: 60,
            app_name: "Rights Marketplace".into(),
            app_url: None,
        },
        signing: SigningConfig { timeout_secs: 60 },
        persistence: PersistenceConfig {
            backend: "memory".into(),
            path: None,
            storage_key: "rights_wallet.session".into(),
            max_age_hours: 24,
        },
        ledger: LedgerConfig {
            hedera_network: "testnet".into(),
            hedera_node_account_ids: vec!["0.0.3".into()],
            max_transaction_fee_tinybars: 2_000_000_000,
            transaction_valid_duration_secs: 120,
            transaction_memo: String::new(),
            evm_chain_id: 296,
            evm_gas_limit: 300_000,
            evm_max_fee_per_gas: 600_000_000_000,
            evm_max_priority_fee_per_gas: 0,
        },
        logging: LoggingConfig {
            level: "debug".into(),
            format: "text".into(),
            enable_file_logging: false,
            log_file_path: None,
        },
    }
}

/// 直连钱包：连接时返回 0.0.1234
pub fn blade_wallet() -> Arc<ScriptedProvider> {
    let wallet = ScriptedProvider::builder().with_events().build();
    wallet.reply_always(
        "hedera_requestAccounts",
        ScriptedReply::Respond(Ok(json!([BLADE_ACCOUNT]))),
    );
    wallet
}

/// 服务与其依赖的测试替身
pub struct Harness {
    pub service: WalletService,
    pub env: Arc<StaticEnvironment>,
    pub relay: Arc<LoopbackRelay>,
    pub store: SessionStore,
}

pub fn harness() -> Harness {
    harness_with(Arc::new(StaticEnvironment::new()), LoopbackRelay::new(), SessionStore::in_memory())
}

/// 共享同一中继与存储，模拟页面重新加载
pub fn harness_with(
    env: Arc<StaticEnvironment>,
    relay: Arc<LoopbackRelay>,
    store: SessionStore,
) -> Harness {
    let service = WalletService::new(&test_config(), env.clone(), relay.clone(), store.clone())
        .expect("Failed to build wallet service");
    Harness {
        service,
        env,
        relay,
        store,
    }
}
