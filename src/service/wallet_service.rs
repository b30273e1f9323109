//! 钱包服务门面
//!
//! 应用启动时构造一次，持有检测器、会话管理器、交易构建器与签名调度器。
//! 控制流：connect → 检测确认 → 配对 → 持久化；mint → 构建 → 调度 → `SignResult`

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::{
    config::Config,
    domain::{MintRequest, ProviderRegistry, Session, SignResult},
    error::{WalletError, WalletResult},
    infrastructure::{
        environment::WalletEnvironment,
        event_bus::{EventEnvelope, SessionEventBus},
        probe::ProbePolicy,
        relay::RelayChannel,
        session_store::SessionStore,
    },
    service::{
        pairing::PairingService,
        provider_detector::{DetectedProvider, ProviderDetector},
        session_manager::SessionManager,
        signing_dispatcher::SigningDispatcher,
        transaction_builder::TransactionBuilder,
    },
};

pub struct WalletService {
    detector: Arc<ProviderDetector>,
    sessions: SessionManager,
    builder: TransactionBuilder,
    dispatcher: SigningDispatcher,
    events: SessionEventBus,
}

impl WalletService {
    pub fn new(
        config: &Config,
        environment: Arc<dyn WalletEnvironment>,
        relay: Arc<dyn RelayChannel>,
        store: SessionStore,
    ) -> WalletResult<Self> {
        Self::with_registry(config, ProviderRegistry::builtin(), environment, relay, store)
    }

    pub fn with_registry(
        config: &Config,
        registry: ProviderRegistry,
        environment: Arc<dyn WalletEnvironment>,
        relay: Arc<dyn RelayChannel>,
        store: SessionStore,
    ) -> WalletResult<Self> {
        let events = SessionEventBus::default();
        let detector = Arc::new(ProviderDetector::new(
            Arc::new(registry),
            environment,
            ProbePolicy::from(&config.detection),
        ));
        let pairing = PairingService::new(
            relay.clone(),
            events.clone(),
            config.pairing.clone(),
            &config.ledger,
        );
        let sessions = SessionManager::new(
            detector.clone(),
            pairing,
            relay,
            store,
            events.clone(),
            chrono::Duration::hours(config.persistence.max_age_hours),
        );

        Ok(Self {
            detector,
            sessions,
            builder: TransactionBuilder::new(config.ledger.clone())?,
            dispatcher: SigningDispatcher::new(config.signing.timeout(), events.clone()),
            events,
        })
    }

    /// 扫描可用钱包（钱包选择器每次打开时调用）
    pub async fn available_providers(&self) -> Vec<DetectedProvider> {
        self.detector.scan().await
    }

    /// 连接钱包；最近一次扫描中没有该钱包时先扫描一次
    pub async fn connect(&self, provider_id: &str) -> WalletResult<String> {
        if self.detector.find(provider_id).is_none() {
            self.detector.scan().await;
        }
        self.sessions.connect(provider_id).await
    }

    /// 用最近建立的会话铸造
    ///
    /// 付费方即会话账户。签名被拒或超时以 `SignResult` 返回；构建失败返回错误
    pub async fn mint(&self, collection_id: &str, metadata_pointer: &str) -> WalletResult<SignResult> {
        let session = self.sessions.primary_session().ok_or_else(|| WalletError::NotConnected {
            provider_id: "any".into(),
        })?;
        let request = MintRequest {
            collection_id: collection_id.to_string(),
            metadata_pointer: metadata_pointer.to_string(),
            payer_account_id: session.account_id.clone(),
        };
        self.mint_with(&session.provider_id, &request).await
    }

    pub async fn mint_with(&self, provider_id: &str, request: &MintRequest) -> WalletResult<SignResult> {
        let handle = self.sessions.active_session(provider_id)?;
        let envelope = self.builder.build(request, &handle.session)?;
        Ok(self.dispatcher.dispatch(envelope, &handle).await)
    }

    pub async fn disconnect(&self, provider_id: &str) {
        self.sessions.disconnect(provider_id).await
    }

    /// 启动时恢复上次的会话
    pub async fn restore(&self) -> Option<Session> {
        self.sessions.restore().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &SessionEventBus {
        &self.events
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn detector(&self) -> &ProviderDetector {
        &self.detector
    }

    pub fn shutdown(&self) {
        self.sessions.shutdown();
    }
}
