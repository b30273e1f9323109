//! 会话管理服务
//!
//! 每个钱包一条状态机，同一钱包最多一个活动会话。
//! - `connect()` 同一钱包同时只有一个配对在进行，重复调用合并到同一个 future
//! - 配对成功后持久化并广播；新的配对取代旧会话（代次 +1，旧监听任务终止）
//! - 钱包推送的账户/网络变更原地更新会话
//! - 会话超过有效期在访问时惰性过期

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};

use crate::{
    domain::{PairingProtocol, ProviderDescriptor, ResponseShape, Session, SessionState, WalletRequest},
    error::{WalletError, WalletResult},
    infrastructure::{
        environment::{ProviderCallError, ProviderEvent, ProviderRef},
        event_bus::{EventEnvelope, SessionEvent, SessionEventBus},
        relay::RelayChannel,
        session_store::{PersistedSession, SessionStore},
    },
    service::{
        pairing::{PairingApproval, PairingService},
        provider_detector::{DetectedProvider, ProviderDetector},
    },
    utils::{
        account_validator::AccountValidator,
        network::{normalize_network, parse_caip_account},
    },
};

/// 断开通知与恢复校验这类静默调用的等待上限
const SILENT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

type ConnectFuture = Shared<BoxFuture<'static, WalletResult<String>>>;

/// 会话所用的通信通道，由配对协议决定
pub enum SessionChannel {
    Direct(ProviderRef),
    Relay {
        relay: Arc<dyn RelayChannel>,
        topic: String,
    },
    Broker(ProviderRef),
}

impl SessionChannel {
    pub async fn send(&self, request: &WalletRequest) -> Result<Value, ProviderCallError> {
        match self {
            Self::Direct(handle) | Self::Broker(handle) => {
                handle.request(&request.method, request.params.clone()).await
            }
            Self::Relay { relay, topic } => {
                relay
                    .request(topic, &request.method, request.params.clone())
                    .await
            }
        }
    }

    fn events(&self) -> Option<tokio::sync::broadcast::Receiver<ProviderEvent>> {
        match self {
            Self::Direct(handle) | Self::Broker(handle) => handle.events(),
            Self::Relay { relay, topic } => relay.events(topic),
        }
    }

    async fn notify_disconnect(&self, descriptor: &ProviderDescriptor) -> Result<(), String> {
        match self {
            Self::Direct(handle) | Self::Broker(handle) => {
                match descriptor.call_surface.disconnect_method.as_deref() {
                    Some(method) => handle
                        .request(method, Value::Null)
                        .await
                        .map(|_| ())
                        .map_err(|e| e.to_string()),
                    None => Ok(()),
                }
            }
            Self::Relay { relay, topic } => relay.disconnect(topic).await.map_err(|e| e.to_string()),
        }
    }
}

/// 签名调度使用的会话句柄（会话快照 + 通道 + 串行化锁）
#[derive(Clone)]
pub struct SessionHandle {
    pub session: Session,
    pub descriptor: ProviderDescriptor,
    channel: Arc<SessionChannel>,
    dispatch_lock: Arc<tokio::sync::Mutex<()>>,
}

impl SessionHandle {
    /// 不经会话管理器的独立句柄（自带串行化锁）
    pub fn new(session: Session, descriptor: ProviderDescriptor, channel: SessionChannel) -> Self {
        Self {
            session,
            descriptor,
            channel: Arc::new(channel),
            dispatch_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn channel(&self) -> &SessionChannel {
        &self.channel
    }

    pub fn response_shape(&self) -> ResponseShape {
        self.descriptor.response_shape
    }

    pub(crate) fn dispatch_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.dispatch_lock
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session", &self.session)
            .field("provider_id", &self.descriptor.id)
            .finish()
    }
}

struct LiveSession {
    session: Session,
    descriptor: ProviderDescriptor,
    channel: Arc<SessionChannel>,
    dispatch_lock: Arc<tokio::sync::Mutex<()>>,
    listener: Option<JoinHandle<()>>,
}

impl LiveSession {
    fn stop_listener(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

struct Inner {
    detector: Arc<ProviderDetector>,
    pairing: PairingService,
    relay: Arc<dyn RelayChannel>,
    store: SessionStore,
    events: SessionEventBus,
    max_age: chrono::Duration,
    states: Mutex<HashMap<String, SessionState>>,
    sessions: Mutex<HashMap<String, LiveSession>>,
    inflight: Mutex<HashMap<String, ConnectFuture>>,
    epoch: AtomicU64,
}

/// 会话管理器：应用启动时构造，通过依赖注入传递
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionManager {
    pub fn new(
        detector: Arc<ProviderDetector>,
        pairing: PairingService,
        relay: Arc<dyn RelayChannel>,
        store: SessionStore,
        events: SessionEventBus,
        max_age: chrono::Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                detector,
                pairing,
                relay,
                store,
                events,
                max_age,
                states: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                inflight: Mutex::new(HashMap::new()),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EventEnvelope> {
        self.inner.events.subscribe()
    }

    pub fn state(&self, provider_id: &str) -> SessionState {
        lock(&self.inner.states)
            .get(provider_id)
            .copied()
            .unwrap_or(SessionState::Idle)
    }

    /// 会话只读快照
    pub fn session(&self, provider_id: &str) -> Option<Session> {
        lock(&self.inner.sessions)
            .get(provider_id)
            .map(|live| live.session.clone())
    }

    pub fn sessions(&self) -> Vec<Session> {
        lock(&self.inner.sessions)
            .values()
            .map(|live| live.session.clone())
            .collect()
    }

    /// 最近建立的会话
    pub fn primary_session(&self) -> Option<Session> {
        lock(&self.inner.sessions)
            .values()
            .max_by_key(|live| live.session.epoch)
            .map(|live| live.session.clone())
    }

    /// 连接钱包，返回账户标识
    ///
    /// 钱包必须出现在最近一次扫描结果中。配对进行中再次调用会等待同一次配对。
    pub async fn connect(&self, provider_id: &str) -> WalletResult<String> {
        let attempt = {
            let mut inflight = lock(&self.inner.inflight);
            match inflight.get(provider_id) {
                Some(existing) => {
                    tracing::debug!(provider_id = %provider_id, "joining in-flight pairing");
                    existing.clone()
                }
                None => {
                    let detected = self.inner.detector.find(provider_id).ok_or_else(|| {
                        WalletError::ProviderUnavailable {
                            provider_id: provider_id.to_string(),
                            install_url: self
                                .inner
                                .detector
                                .registry()
                                .get(provider_id)
                                .map(|d| d.install_url.clone()),
                        }
                    })?;
                    self.transition(provider_id, SessionState::Detecting);

                    let manager = self.clone();
                    let id = provider_id.to_string();
                    let task = tokio::spawn(async move {
                        let result = manager.run_connect(detected).await;
                        lock(&manager.inner.inflight).remove(&id);
                        result
                    });
                    let attempt = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(WalletError::provider_fault(format!("pairing task failed: {}", e)))
                        })
                    }
                    .boxed()
                    .shared();
                    inflight.insert(provider_id.to_string(), attempt.clone());
                    attempt
                }
            }
        };

        attempt.await
    }

    async fn run_connect(&self, detected: DetectedProvider) -> WalletResult<String> {
        let provider_id = detected.descriptor.id.clone();
        self.transition(&provider_id, SessionState::Pairing);

        let on_awaiting = || {
            self.transition(&provider_id, SessionState::AwaitingApproval);
        };
        let outcome = self
            .inner
            .pairing
            .pair(&detected.descriptor, &detected.handle, &on_awaiting)
            .await;

        match outcome {
            Ok(approval) => {
                let account_id = approval.account_id.clone();
                let session = self.establish(&detected, approval);
                self.inner.store.save(&session);
                self.inner.events.publish(SessionEvent::Connected {
                    provider_id: session.provider_id.clone(),
                    account_id: session.account_id.clone(),
                    network: session.network.clone(),
                });
                tracing::info!(
                    provider_id = %session.provider_id,
                    account_id = %session.account_id,
                    network = %session.network,
                    epoch = session.epoch,
                    "wallet connected"
                );
                Ok(account_id)
            }
            Err(e) => {
                self.fail(&provider_id, &e);
                Err(e)
            }
        }
    }

    fn fail(&self, provider_id: &str, error: &WalletError) {
        if error.is_user_rejection() {
            tracing::info!(provider_id = %provider_id, reason = %error, "pairing declined by user");
        } else if error.is_retryable() {
            tracing::warn!(provider_id = %provider_id, error = %error, "pairing failed");
        } else {
            tracing::error!(provider_id = %provider_id, error = %error, "pairing failed");
        }

        self.transition(provider_id, SessionState::Error);
        if lock(&self.inner.sessions).contains_key(provider_id) {
            // 重新配对失败不影响仍然有效的旧会话
            lock(&self.inner.states).insert(provider_id.to_string(), SessionState::Connected);
        }
    }

    /// 登记新会话并启动事件监听；同一钱包的旧会话被取代
    fn establish(&self, detected: &DetectedProvider, approval: PairingApproval) -> Session {
        let descriptor = detected.descriptor.clone();
        let channel = match descriptor.protocol {
            PairingProtocol::Direct => SessionChannel::Direct(detected.handle.clone()),
            PairingProtocol::Broker => SessionChannel::Broker(detected.handle.clone()),
            PairingProtocol::Relay => SessionChannel::Relay {
                relay: self.inner.relay.clone(),
                topic: approval.topic.clone().unwrap_or_default(),
            },
        };

        let session = Session {
            provider_id: descriptor.id.clone(),
            account_id: approval.account_id,
            network: approval.network,
            topic: approval.topic,
            protocol: descriptor.protocol,
            established_at: Utc::now(),
            state: SessionState::Connected,
            epoch: self.next_epoch(),
        };
        self.install(session.clone(), descriptor, channel);
        self.transition(&session.provider_id, SessionState::Connected);
        session
    }

    fn install(&self, session: Session, descriptor: ProviderDescriptor, channel: SessionChannel) {
        let channel = Arc::new(channel);
        let listener = self.spawn_listener(&session, &channel);
        let previous = lock(&self.inner.sessions).insert(
            session.provider_id.clone(),
            LiveSession {
                session: session.clone(),
                descriptor,
                channel,
                dispatch_lock: Arc::new(tokio::sync::Mutex::new(())),
                listener,
            },
        );

        if let Some(mut previous) = previous {
            previous.stop_listener();
            tracing::info!(
                provider_id = %session.provider_id,
                superseded_epoch = previous.session.epoch,
                epoch = session.epoch,
                "previous session superseded"
            );
        }
    }

    fn next_epoch(&self) -> u64 {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn spawn_listener(&self, session: &Session, channel: &SessionChannel) -> Option<JoinHandle<()>> {
        let mut events = channel.events()?;
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let provider_id = session.provider_id.clone();
        let epoch = session.epoch;

        Some(tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(provider_id = %provider_id, skipped, "provider events lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let manager = SessionManager { inner };
                if !manager.apply_provider_event(&provider_id, epoch, event) {
                    break;
                }
            }
        }))
    }

    /// 处理连接后钱包推送的事件，返回是否继续监听
    fn apply_provider_event(&self, provider_id: &str, epoch: u64, event: ProviderEvent) -> bool {
        match event {
            ProviderEvent::AccountsChanged(accounts) => match accounts.first() {
                Some(raw) => {
                    let account = parse_caip_account(raw)
                        .map(|(_, account)| account)
                        .unwrap_or_else(|| raw.clone());
                    let family = lock(&self.inner.sessions)
                        .get(provider_id)
                        .map(|live| live.descriptor.network);
                    if !family.map_or(false, |f| AccountValidator::validate(f, &account)) {
                        tracing::warn!(provider_id = %provider_id, account = %raw, "ignoring malformed account change");
                        return true;
                    }
                    let updated = self.update_live(provider_id, epoch, |session| {
                        if session.account_id == account {
                            return false;
                        }
                        session.account_id = account.clone();
                        true
                    });
                    if let Some(session) = updated {
                        tracing::info!(provider_id = %provider_id, account_id = %account, "wallet account changed");
                        self.inner.store.save(&session);
                        self.inner.events.publish(SessionEvent::AccountChanged {
                            provider_id: provider_id.to_string(),
                            account_id: account,
                        });
                    }
                    true
                }
                None => {
                    self.end_session(
                        provider_id,
                        Some(epoch),
                        SessionState::Disconnected,
                        "wallet reported no accounts",
                    );
                    false
                }
            },
            ProviderEvent::ChainChanged(raw) => {
                let family = lock(&self.inner.sessions)
                    .get(provider_id)
                    .map(|live| live.descriptor.network);
                let Some(network) = family.and_then(|f| normalize_network(f, &raw)) else {
                    tracing::warn!(provider_id = %provider_id, chain = %raw, "ignoring unrecognized chain change");
                    return true;
                };
                let updated = self.update_live(provider_id, epoch, |session| {
                    if session.network == network {
                        return false;
                    }
                    session.network = network.clone();
                    true
                });
                if let Some(session) = updated {
                    tracing::info!(provider_id = %provider_id, network = %network, "wallet network changed");
                    self.inner.store.save(&session);
                    self.inner.events.publish(SessionEvent::NetworkChanged {
                        provider_id: provider_id.to_string(),
                        network,
                    });
                }
                true
            }
            ProviderEvent::Disconnected { reason } => {
                self.end_session(provider_id, Some(epoch), SessionState::Disconnected, &reason);
                false
            }
            // 配对类事件只在配对阶段消费
            _ => true,
        }
    }

    /// 代次匹配时原地修改会话；`apply` 返回 false 表示无变化
    fn update_live<F>(&self, provider_id: &str, epoch: u64, apply: F) -> Option<Session>
    where
        F: FnOnce(&mut Session) -> bool,
    {
        let mut sessions = lock(&self.inner.sessions);
        let live = sessions
            .get_mut(provider_id)
            .filter(|live| live.session.epoch == epoch)?;
        apply(&mut live.session).then(|| live.session.clone())
    }

    /// 结束会话并清除持久化记录；`epoch` 不匹配（已被取代）时不做任何事
    fn end_session(&self, provider_id: &str, epoch: Option<u64>, state: SessionState, reason: &str) -> bool {
        let removed = {
            let mut sessions = lock(&self.inner.sessions);
            let matches = sessions
                .get(provider_id)
                .map(|live| epoch.map_or(true, |e| live.session.epoch == e))
                .unwrap_or(false);
            if matches {
                sessions.remove(provider_id)
            } else {
                None
            }
        };
        let Some(mut live) = removed else {
            return false;
        };

        live.stop_listener();
        self.inner.store.clear_for(provider_id);
        self.transition(provider_id, state);

        match state {
            SessionState::Expired => {
                tracing::info!(provider_id = %provider_id, "session expired");
                self.inner.events.publish(SessionEvent::Expired {
                    provider_id: provider_id.to_string(),
                });
                self.transition(provider_id, SessionState::Idle);
            }
            _ => {
                tracing::info!(provider_id = %provider_id, reason = %reason, "session ended");
                self.inner.events.publish(SessionEvent::Disconnected {
                    provider_id: provider_id.to_string(),
                    reason: reason.to_string(),
                });
            }
        }
        true
    }

    /// 断开：尽力通知钱包/中继，然后无条件清除本地状态与持久化记录
    pub async fn disconnect(&self, provider_id: &str) {
        let removed = lock(&self.inner.sessions).remove(provider_id);
        self.inner.store.clear_for(provider_id);

        let Some(mut live) = removed else {
            tracing::debug!(provider_id = %provider_id, "disconnect without active session");
            return;
        };
        live.stop_listener();
        self.transition(provider_id, SessionState::Disconnected);
        self.inner.events.publish(SessionEvent::Disconnected {
            provider_id: provider_id.to_string(),
            reason: "disconnected by user".into(),
        });

        let notify = live.channel.notify_disconnect(&live.descriptor);
        match tokio::time::timeout(SILENT_CALL_TIMEOUT, notify).await {
            Ok(Ok(())) => tracing::info!(provider_id = %provider_id, "wallet disconnected"),
            Ok(Err(e)) => {
                tracing::warn!(provider_id = %provider_id, error = %e, "disconnect notify failed")
            }
            Err(_) => tracing::warn!(provider_id = %provider_id, "disconnect notify timed out"),
        }
    }

    /// 启动时恢复持久化的会话，不重新配对
    ///
    /// 钱包报告会话无效时清除记录并停留在 `Idle`
    pub async fn restore(&self) -> Option<Session> {
        let record = self.inner.store.load()?;
        let provider_id = record.provider_id.clone();

        if let Some(existing) = self.session(&provider_id) {
            return Some(existing);
        }

        let Some(descriptor) = self.inner.detector.registry().get(&provider_id).cloned() else {
            tracing::warn!(provider_id = %provider_id, "persisted session for unknown provider");
            self.inner.store.clear();
            return None;
        };

        let channel = match self.validate_restore(&descriptor, &record).await {
            Some(channel) => channel,
            None => {
                tracing::info!(provider_id = %provider_id, "persisted session rejected by wallet");
                self.inner.store.clear();
                return None;
            }
        };

        let mut session = record.into_session(self.next_epoch());
        session.state = SessionState::Connected;
        self.install(session.clone(), descriptor, channel);
        self.transition(&provider_id, SessionState::Connected);

        self.inner.events.publish(SessionEvent::Restored {
            provider_id: session.provider_id.clone(),
            account_id: session.account_id.clone(),
            network: session.network.clone(),
        });
        tracing::info!(
            provider_id = %session.provider_id,
            account_id = %session.account_id,
            "wallet session restored"
        );
        Some(session)
    }

    async fn validate_restore(
        &self,
        descriptor: &ProviderDescriptor,
        record: &PersistedSession,
    ) -> Option<SessionChannel> {
        if record.protocol == PairingProtocol::Relay {
            let topic = record.topic.clone()?;
            let alive = tokio::time::timeout(SILENT_CALL_TIMEOUT, self.inner.relay.ping(&topic))
                .await
                .unwrap_or(false);
            return alive.then(|| SessionChannel::Relay {
                relay: self.inner.relay.clone(),
                topic,
            });
        }

        let detected = match self.inner.detector.find(&descriptor.id) {
            Some(detected) => detected,
            None => {
                self.inner.detector.scan().await;
                self.inner.detector.find(&descriptor.id)?
            }
        };

        if let Some(method) = descriptor.call_surface.accounts_method.as_deref() {
            let reply = tokio::time::timeout(
                SILENT_CALL_TIMEOUT,
                detected.handle.request(method, Value::Null),
            )
            .await
            .ok()?;
            match reply {
                Ok(accounts) if lists_account(&accounts, &record.account_id) => {}
                Ok(_) => return None,
                // 无静默查询入口，无法证明失效
                Err(ProviderCallError::MethodNotFound(_)) => {}
                Err(e) => {
                    tracing::debug!(provider_id = %descriptor.id, error = %e, "restore validation failed");
                    return None;
                }
            }
        }

        Some(match record.protocol {
            PairingProtocol::Broker => SessionChannel::Broker(detected.handle),
            _ => SessionChannel::Direct(detected.handle),
        })
    }

    /// 取得可用于签名的会话；过期会话在此被清除
    pub fn active_session(&self, provider_id: &str) -> WalletResult<SessionHandle> {
        self.active_session_at(provider_id, Utc::now())
    }

    pub(crate) fn active_session_at(
        &self,
        provider_id: &str,
        now: DateTime<Utc>,
    ) -> WalletResult<SessionHandle> {
        let (handle, epoch) = {
            let sessions = lock(&self.inner.sessions);
            let live = sessions
                .get(provider_id)
                .ok_or_else(|| WalletError::NotConnected {
                    provider_id: provider_id.to_string(),
                })?;
            let handle = SessionHandle {
                session: live.session.clone(),
                descriptor: live.descriptor.clone(),
                channel: live.channel.clone(),
                dispatch_lock: live.dispatch_lock.clone(),
            };
            (handle, live.session.epoch)
        };

        if handle.session.is_expired(now, self.inner.max_age) {
            self.end_session(provider_id, Some(epoch), SessionState::Expired, "expired");
            return Err(WalletError::SessionExpired {
                provider_id: provider_id.to_string(),
            });
        }
        Ok(handle)
    }

    /// 终止所有后台任务；持久化记录保留，供下次启动恢复
    pub fn shutdown(&self) {
        let mut sessions = lock(&self.inner.sessions);
        for live in sessions.values_mut() {
            live.stop_listener();
        }
        let count = sessions.len();
        sessions.clear();
        lock(&self.inner.inflight).clear();
        tracing::info!(sessions = count, "session manager shut down");
    }

    fn transition(&self, provider_id: &str, to: SessionState) -> bool {
        let mut states = lock(&self.inner.states);
        let from = states.get(provider_id).copied().unwrap_or(SessionState::Idle);
        if from == to {
            return true;
        }
        if !SessionState::can_transition(from, to) {
            tracing::warn!(
                provider_id = %provider_id,
                from = from.as_str(),
                to = to.as_str(),
                "refusing invalid session transition"
            );
            return false;
        }
        states.insert(provider_id.to_string(), to);
        tracing::debug!(
            provider_id = %provider_id,
            from = from.as_str(),
            to = to.as_str(),
            "session state changed"
        );
        true
    }
}

fn lists_account(reply: &Value, account_id: &str) -> bool {
    let matches = |raw: &str| {
        let account = parse_caip_account(raw).map(|(_, a)| a);
        account.as_deref().unwrap_or(raw).eq_ignore_ascii_case(account_id)
    };
    match reply {
        Value::Array(items) => items.iter().filter_map(Value::as_str).any(matches),
        Value::String(s) => matches(s),
        Value::Object(map) => map
            .get("accountId")
            .or_else(|| map.get("accounts"))
            .map(|inner| lists_account(inner, account_id))
            .unwrap_or(false),
        _ => false,
    }
}
