//! 宿主环境绑定
//!
//! 浏览器扩展注入的全局对象、多钱包代理列表、以及每个钱包的调用面。
//! 本模块只读取环境，从不修改环境。

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};

/// EIP-1193 用户拒绝
pub const RPC_USER_REJECTED: i64 = 4001;
/// JSON-RPC 方法不存在
pub const RPC_METHOD_NOT_FOUND: i64 = -32601;

pub type ProviderRef = Arc<dyn ProviderHandle>;

/// 钱包调用失败
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ProviderCallError {
    #[error("user rejected the request: {message}")]
    UserRejected { message: String },
    #[error("method `{0}` is not supported by the provider")]
    MethodNotFound(String),
    #[error("provider error (code {code:?}): {message}")]
    Failed { code: Option<i64>, message: String },
}

impl ProviderCallError {
    /// 按 JSON-RPC 错误码归类
    pub fn from_rpc(code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            RPC_USER_REJECTED => Self::UserRejected { message },
            RPC_METHOD_NOT_FOUND => Self::MethodNotFound(message),
            _ => Self::Failed {
                code: Some(code),
                message,
            },
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            code: None,
            message: message.into(),
        }
    }
}

/// 钱包推送的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    AccountsChanged(Vec<String>),
    ChainChanged(String),
    Disconnected {
        reason: String,
    },
    /// 连接器完成配对
    Paired {
        correlation_id: String,
        account_id: String,
        network: String,
        topic: Option<String>,
    },
    /// 连接器生成了需要展示给用户的配对串
    PairingUri {
        correlation_id: String,
        uri: String,
    },
    PairingRejected {
        correlation_id: String,
        reason: String,
    },
}

/// 钱包运行时对象的调用面
#[async_trait]
pub trait ProviderHandle: Send + Sync {
    /// 对象上暴露的方法（`request`、`connect`、`on` ...）
    fn has_method(&self, name: &str) -> bool;

    /// 对象上暴露的状态字段（`isConnected`、`selectedAddress`、`chainId` ...）
    fn has_field(&self, name: &str) -> bool;

    /// 身份标记（`isMetaMask` ...）
    fn flag(&self, name: &str) -> bool;

    async fn request(&self, method: &str, params: Value) -> Result<Value, ProviderCallError>;

    /// 事件订阅；不支持事件的钱包返回 None
    fn events(&self) -> Option<broadcast::Receiver<ProviderEvent>> {
        None
    }
}

/// 物理钱包实例的身份（同一对象可能从多个注入点被看到）
pub fn handle_identity(handle: &ProviderRef) -> usize {
    Arc::as_ptr(handle) as *const () as usize
}

/// 多钱包代理列表中的一条
#[derive(Clone)]
pub struct BrokerEntry {
    pub name: String,
    pub rdns: Option<String>,
    pub flags: Vec<String>,
    pub handle: ProviderRef,
}

impl BrokerEntry {
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag) || self.handle.flag(flag)
    }
}

impl std::fmt::Debug for BrokerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerEntry")
            .field("name", &self.name)
            .field("rdns", &self.rdns)
            .field("flags", &self.flags)
            .finish()
    }
}

/// 宿主环境（只读视图）
pub trait WalletEnvironment: Send + Sync {
    fn global(&self, name: &str) -> Option<ProviderRef>;

    fn global_names(&self) -> Vec<String>;

    fn broker_entries(&self) -> Vec<BrokerEntry>;
}

/// 内存环境，支持在运行中注入（模拟扩展的异步注入）
#[derive(Default)]
pub struct StaticEnvironment {
    globals: RwLock<BTreeMap<String, ProviderRef>>,
    broker: RwLock<Vec<BrokerEntry>>,
}

impl StaticEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject_global(&self, name: impl Into<String>, handle: ProviderRef) {
        if let Ok(mut globals) = self.globals.write() {
            globals.insert(name.into(), handle);
        }
    }

    pub fn announce(&self, entry: BrokerEntry) {
        if let Ok(mut broker) = self.broker.write() {
            broker.push(entry);
        }
    }
}

impl WalletEnvironment for StaticEnvironment {
    fn global(&self, name: &str) -> Option<ProviderRef> {
        self.globals.read().ok()?.get(name).cloned()
    }

    fn global_names(&self) -> Vec<String> {
        self.globals
            .read()
            .map(|g| g.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn broker_entries(&self) -> Vec<BrokerEntry> {
        self.broker.read().map(|b| b.clone()).unwrap_or_default()
    }
}

// ============ 环境快照（诊断工具使用） ============

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SurfaceSnapshot {
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSnapshot {
    pub name: String,
    #[serde(default)]
    pub rdns: Option<String>,
    #[serde(default)]
    pub flags: Vec<String>,
    /// 与某个全局对象是同一实例时填写该全局名
    #[serde(default)]
    pub global: Option<String>,
    #[serde(default)]
    pub surface: SurfaceSnapshot,
}

/// 环境的 JSON 描述
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    #[serde(default)]
    pub globals: BTreeMap<String, SurfaceSnapshot>,
    #[serde(default)]
    pub broker: Vec<BrokerSnapshot>,
}

impl EnvironmentSnapshot {
    pub fn into_environment(self) -> StaticEnvironment {
        let env = StaticEnvironment::new();
        for (name, surface) in &self.globals {
            env.inject_global(name.clone(), ScriptedProvider::from_surface(surface));
        }
        for entry in self.broker {
            let handle = entry
                .global
                .as_deref()
                .and_then(|g| env.global(g))
                .unwrap_or_else(|| ScriptedProvider::from_surface(&entry.surface));
            env.announce(BrokerEntry {
                name: entry.name,
                rdns: entry.rdns,
                flags: entry.flags,
                handle,
            });
        }
        env
    }
}

// ============ 脚本化钱包 ============

/// 脚本化回复
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Respond(Result<Value, ProviderCallError>),
    Delayed(Duration, Result<Value, ProviderCallError>),
    /// 挂起，直到通过 [`ScriptedProvider::take_deferred`] 手动回复
    Deferred,
    /// 永不回复
    Pending,
    /// 立即确认，随后按请求里的 `correlationId` 推送配对完成事件
    ApprovePairing {
        account_id: String,
        network: String,
        delay: Duration,
    },
    /// 立即确认，随后推送配对被拒事件
    RejectPairing { reason: String, delay: Duration },
}

/// 一次被记录的调用
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderCall {
    pub method: String,
    pub params: Value,
}

/// 挂起中的回复句柄
#[derive(Debug)]
pub struct DeferredReply {
    pub method: String,
    sender: oneshot::Sender<Result<Value, ProviderCallError>>,
}

impl DeferredReply {
    /// 返回请求方是否仍在等待
    pub fn resolve(self, result: Result<Value, ProviderCallError>) -> bool {
        self.sender.send(result).is_ok()
    }
}

/// 行为可脚本化的钱包对象
pub struct ScriptedProvider {
    methods: HashSet<String>,
    fields: HashSet<String>,
    flags: HashSet<String>,
    queued: Mutex<HashMap<String, VecDeque<ScriptedReply>>>,
    sticky: Mutex<HashMap<String, ScriptedReply>>,
    deferred: Mutex<VecDeque<DeferredReply>>,
    calls: Mutex<Vec<ProviderCall>>,
    events: Option<broadcast::Sender<ProviderEvent>>,
}

#[derive(Default)]
pub struct ScriptedProviderBuilder {
    methods: HashSet<String>,
    fields: HashSet<String>,
    flags: HashSet<String>,
    with_events: bool,
}

impl ScriptedProviderBuilder {
    pub fn method(mut self, name: &str) -> Self {
        self.methods.insert(name.to_string());
        self
    }

    pub fn field(mut self, name: &str) -> Self {
        self.fields.insert(name.to_string());
        self
    }

    pub fn flag(mut self, name: &str) -> Self {
        self.flags.insert(name.to_string());
        self
    }

    pub fn with_events(mut self) -> Self {
        self.with_events = true;
        self
    }

    pub fn build(self) -> Arc<ScriptedProvider> {
        let events = self.with_events.then(|| broadcast::channel(64).0);
        Arc::new(ScriptedProvider {
            methods: self.methods,
            fields: self.fields,
            flags: self.flags,
            queued: Mutex::new(HashMap::new()),
            sticky: Mutex::new(HashMap::new()),
            deferred: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            events,
        })
    }
}

impl ScriptedProvider {
    pub fn builder() -> ScriptedProviderBuilder {
        ScriptedProviderBuilder::default()
    }

    fn from_surface(surface: &SurfaceSnapshot) -> ProviderRef {
        let mut builder = Self::builder();
        for m in &surface.methods {
            builder = builder.method(m);
        }
        for f in &surface.fields {
            builder = builder.field(f);
        }
        for f in &surface.flags {
            builder = builder.flag(f);
        }
        builder.build()
    }

    /// 排队一次性回复
    pub fn reply(&self, method: &str, reply: ScriptedReply) {
        if let Ok(mut queued) = self.queued.lock() {
            queued.entry(method.to_string()).or_default().push_back(reply);
        }
    }

    /// 队列为空时使用的固定回复
    pub fn reply_always(&self, method: &str, reply: ScriptedReply) {
        if let Ok(mut sticky) = self.sticky.lock() {
            sticky.insert(method.to_string(), reply);
        }
    }

    pub fn emit(&self, event: ProviderEvent) -> usize {
        self.events
            .as_ref()
            .and_then(|tx| tx.send(event).ok())
            .unwrap_or(0)
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.calls().iter().filter(|c| c.method == method).count()
    }

    pub fn take_deferred(&self) -> Option<DeferredReply> {
        self.deferred.lock().ok()?.pop_front()
    }

    fn next_reply(&self, method: &str) -> Option<ScriptedReply> {
        let queued = self
            .queued
            .lock()
            .ok()
            .and_then(|mut q| q.get_mut(method).and_then(|r| r.pop_front()));
        queued.or_else(|| self.sticky.lock().ok()?.get(method).cloned())
    }

    fn spawn_event(&self, delay: Duration, event: ProviderEvent) {
        if let Some(tx) = self.events.clone() {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(event);
            });
        }
    }
}

#[async_trait]
impl ProviderHandle for ScriptedProvider {
    fn has_method(&self, name: &str) -> bool {
        self.methods.contains(name)
    }

    fn has_field(&self, name: &str) -> bool {
        self.fields.contains(name)
    }

    fn flag(&self, name: &str) -> bool {
        self.flags.contains(name)
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, ProviderCallError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(ProviderCall {
                method: method.to_string(),
                params: params.clone(),
            });
        }

        let reply = self
            .next_reply(method)
            .ok_or_else(|| ProviderCallError::MethodNotFound(method.to_string()))?;

        match reply {
            ScriptedReply::Respond(result) => result,
            ScriptedReply::Delayed(delay, result) => {
                tokio::time::sleep(delay).await;
                result
            }
            ScriptedReply::Deferred => {
                let (sender, receiver) = oneshot::channel();
                if let Ok(mut deferred) = self.deferred.lock() {
                    deferred.push_back(DeferredReply {
                        method: method.to_string(),
                        sender,
                    });
                }
                receiver
                    .await
                    .unwrap_or_else(|_| Err(ProviderCallError::failed("deferred reply dropped")))
            }
            ScriptedReply::Pending => std::future::pending().await,
            ScriptedReply::ApprovePairing {
                account_id,
                network,
                delay,
            } => {
                let correlation_id = correlation_of(&params);
                self.spawn_event(
                    delay,
                    ProviderEvent::Paired {
                        correlation_id,
                        account_id,
                        network,
                        topic: None,
                    },
                );
                Ok(Value::Bool(true))
            }
            ScriptedReply::RejectPairing { reason, delay } => {
                let correlation_id = correlation_of(&params);
                self.spawn_event(
                    delay,
                    ProviderEvent::PairingRejected {
                        correlation_id,
                        reason,
                    },
                );
                Ok(Value::Bool(true))
            }
        }
    }

    fn events(&self) -> Option<broadcast::Receiver<ProviderEvent>> {
        self.events.as_ref().map(|tx| tx.subscribe())
    }
}

fn correlation_of(params: &Value) -> String {
    params
        .get("correlationId")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_scripted_reply_order() {
        let provider = ScriptedProvider::builder().method("request").build();
        provider.reply("eth_accounts", ScriptedReply::Respond(Ok(json!(["0x01"]))));
        provider.reply_always("eth_accounts", ScriptedReply::Respond(Ok(json!([]))));

        assert_eq!(
            provider.request("eth_accounts", Value::Null).await.unwrap(),
            json!(["0x01"])
        );
        assert_eq!(
            provider.request("eth_accounts", Value::Null).await.unwrap(),
            json!([])
        );
        assert_eq!(
            provider.request("eth_chainId", Value::Null).await,
            Err(ProviderCallError::MethodNotFound("eth_chainId".into()))
        );
        assert_eq!(provider.call_count("eth_accounts"), 2);
    }

    #[tokio::test]
    async fn test_deferred_reply() {
        let provider = ScriptedProvider::builder().build();
        provider.reply("sign", ScriptedReply::Deferred);

        let p = provider.clone();
        let pending = tokio::spawn(async move { p.request("sign", Value::Null).await });
        tokio::task::yield_now().await;

        let deferred = loop {
            if let Some(d) = provider.take_deferred() {
                break d;
            }
            tokio::task::yield_now().await;
        };
        assert!(deferred.resolve(Ok(json!("done"))));
        assert_eq!(pending.await.unwrap().unwrap(), json!("done"));
    }

    #[test]
    fn test_rpc_error_classification() {
        assert!(matches!(
            ProviderCallError::from_rpc(4001, "User denied"),
            ProviderCallError::UserRejected { .. }
        ));
        assert!(matches!(
            ProviderCallError::from_rpc(-32601, "eth_foo"),
            ProviderCallError::MethodNotFound(_)
        ));
    }

    #[test]
    fn test_snapshot_shares_broker_handle() {
        let snapshot: EnvironmentSnapshot = serde_json::from_value(json!({
            "globals": { "ethereum": { "methods": ["request"], "flags": ["isMetaMask"] } },
            "broker": [ { "name": "MetaMask", "rdns": "io.metamask", "global": "ethereum" } ]
        }))
        .unwrap();
        let env = snapshot.into_environment();
        let global = env.global("ethereum").unwrap();
        let entry = &env.broker_entries()[0];
        assert_eq!(handle_identity(&global), handle_identity(&entry.handle));
        assert!(entry.has_flag("isMetaMask"));
    }
}
