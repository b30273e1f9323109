//! 中继配对通道
//!
//! 协议：连接 → 提交会话提案 → 等待审批事件 → 每次签名一问一答，全部按 topic 关联。
//! `LoopbackRelay` 是进程内实现，钱包一侧通过同一对象的 wallet-side 方法驱动。

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    task::{Context, Poll},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, oneshot::{self, error::RecvError}, Notify};
use uuid::Uuid;

use super::environment::{ProviderCallError, ProviderEvent};

/// 会话提案
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingProposal {
    pub provider_id: String,
    pub app_name: String,
    pub app_url: Option<String>,
    /// `hedera` / `eip155`
    pub namespace: String,
    pub chains: Vec<String>,
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

/// 钱包对提案的答复
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    /// CAIP-10 账户列表
    Approved { accounts: Vec<String> },
    Rejected { reason: String },
}

/// 等待审批中的配对
#[derive(Debug)]
pub struct PendingPairing {
    pub topic: String,
    /// 展示给用户扫码的配对串
    pub uri: String,
    pub approval: ProposalReply,
}

type Withdraw = Box<dyn FnOnce() + Send + Sync>;

/// 等待钱包答复的 future；提前丢弃时撤回中继上的提案
pub struct ProposalReply {
    receiver: oneshot::Receiver<ApprovalOutcome>,
    withdraw: Option<Withdraw>,
}

impl ProposalReply {
    pub fn new(receiver: oneshot::Receiver<ApprovalOutcome>) -> Self {
        Self {
            receiver,
            withdraw: None,
        }
    }

    /// 丢弃时执行的撤回动作
    pub fn on_withdraw<F>(mut self, withdraw: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        self.withdraw = Some(Box::new(withdraw));
        self
    }
}

impl Future for ProposalReply {
    type Output = Result<ApprovalOutcome, RecvError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx)
    }
}

impl Drop for ProposalReply {
    fn drop(&mut self) {
        if let Some(withdraw) = self.withdraw.take() {
            withdraw();
        }
    }
}

impl std::fmt::Debug for ProposalReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProposalReply")
            .field("withdrawable", &self.withdraw.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("relay unavailable: {0}")]
    Unavailable(String),
    #[error("unknown relay topic `{0}`")]
    UnknownTopic(String),
}

#[async_trait]
pub trait RelayChannel: Send + Sync {
    async fn propose(&self, proposal: PairingProposal) -> Result<PendingPairing, RelayError>;

    async fn request(
        &self,
        topic: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, ProviderCallError>;

    /// 会话是否仍被钱包端承认
    async fn ping(&self, topic: &str) -> bool;

    async fn disconnect(&self, topic: &str) -> Result<(), RelayError>;

    fn events(&self, topic: &str) -> Option<broadcast::Receiver<ProviderEvent>>;
}

/// 钱包端收到的一次请求
#[derive(Debug, Clone, PartialEq)]
pub struct RelayInbound {
    pub request_id: u64,
    pub topic: String,
    pub method: String,
    pub params: Value,
}

struct ProposalSlot {
    proposal: PairingProposal,
    answer: oneshot::Sender<ApprovalOutcome>,
}

#[derive(Default)]
struct RelayState {
    proposals: HashMap<String, ProposalSlot>,
    proposal_order: VecDeque<String>,
    sessions: HashMap<String, broadcast::Sender<ProviderEvent>>,
    pending: HashMap<u64, oneshot::Sender<Result<Value, ProviderCallError>>>,
    inbox: VecDeque<RelayInbound>,
}

/// 进程内中继
#[derive(Default)]
pub struct LoopbackRelay {
    state: Arc<Mutex<RelayState>>,
    next_request_id: AtomicU64,
    proposal_ready: Notify,
    request_ready: Notify,
}

/// 请求方放弃等待时（超时被丢弃），撤销挂起的关联项
struct PendingGuard<'a> {
    relay: &'a LoopbackRelay,
    request_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.relay.state.lock() {
            state.pending.remove(&self.request_id);
        }
    }
}

impl LoopbackRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // ============ 钱包端 ============

    /// 等待下一个会话提案
    pub async fn next_proposal(&self) -> (String, PairingProposal) {
        loop {
            if let Some(found) = self.pop_proposal() {
                return found;
            }
            self.proposal_ready.notified().await;
        }
    }

    fn pop_proposal(&self) -> Option<(String, PairingProposal)> {
        let mut state = self.state.lock().ok()?;
        while let Some(topic) = state.proposal_order.pop_front() {
            if let Some(slot) = state.proposals.get(&topic) {
                return Some((topic, slot.proposal.clone()));
            }
        }
        None
    }

    /// 批准提案；dApp 端已放弃等待时返回 false 且不建立会话
    pub fn approve(&self, topic: &str, accounts: Vec<String>) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        let Some(slot) = state.proposals.remove(topic) else {
            return false;
        };
        if slot
            .answer
            .send(ApprovalOutcome::Approved { accounts })
            .is_err()
        {
            tracing::debug!(topic = %topic, "discarding late pairing approval");
            return false;
        }
        state
            .sessions
            .insert(topic.to_string(), broadcast::channel(64).0);
        true
    }

    pub fn reject(&self, topic: &str, reason: &str) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        match state.proposals.remove(topic) {
            Some(slot) => slot
                .answer
                .send(ApprovalOutcome::Rejected {
                    reason: reason.to_string(),
                })
                .is_ok(),
            None => false,
        }
    }

    /// 等待下一个签名请求；请求方已放弃的请求不再投递
    pub async fn next_request(&self) -> RelayInbound {
        loop {
            if let Some(inbound) = self.pop_request() {
                return inbound;
            }
            self.request_ready.notified().await;
        }
    }

    fn pop_request(&self) -> Option<RelayInbound> {
        let mut state = self.state.lock().ok()?;
        while let Some(inbound) = state.inbox.pop_front() {
            if state.pending.contains_key(&inbound.request_id) {
                return Some(inbound);
            }
            tracing::debug!(request_id = inbound.request_id, "skipping abandoned relay request");
        }
        None
    }

    /// 尚未被钱包答复的提案数
    pub fn open_proposals(&self) -> usize {
        self.state.lock().map(|s| s.proposals.len()).unwrap_or(0)
    }

    /// 回复请求；关联项已不存在（超时后的迟到回复）时丢弃并返回 false
    pub fn respond(&self, request_id: u64, result: Result<Value, ProviderCallError>) -> bool {
        let sender = self
            .state
            .lock()
            .ok()
            .and_then(|mut s| s.pending.remove(&request_id));
        match sender {
            Some(sender) => sender.send(result).is_ok(),
            None => {
                tracing::debug!(request_id, "discarding stale relay response");
                false
            }
        }
    }

    /// 钱包端推送会话事件
    pub fn emit(&self, topic: &str, event: ProviderEvent) -> bool {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.sessions.get(topic).map(|tx| tx.send(event).is_ok()))
            .unwrap_or(false)
    }

    /// 钱包端删除会话
    pub fn drop_session(&self, topic: &str) {
        let removed = self.state.lock().ok().and_then(|mut s| s.sessions.remove(topic));
        if let Some(tx) = removed {
            let _ = tx.send(ProviderEvent::Disconnected {
                reason: "session deleted by wallet".into(),
            });
        }
    }

    pub fn has_session(&self, topic: &str) -> bool {
        self.state
            .lock()
            .map(|s| s.sessions.contains_key(topic))
            .unwrap_or(false)
    }

    /// 直接登记一个已存在的会话（恢复场景）
    pub fn restore_session(&self, topic: &str) {
        if let Ok(mut state) = self.state.lock() {
            state
                .sessions
                .entry(topic.to_string())
                .or_insert_with(|| broadcast::channel(64).0);
        }
    }
}

#[async_trait]
impl RelayChannel for LoopbackRelay {
    async fn propose(&self, proposal: PairingProposal) -> Result<PendingPairing, RelayError> {
        let sym_key = hex::encode(Sha256::digest(Uuid::new_v4().as_bytes()));
        let topic = hex::encode(Sha256::digest(sym_key.as_bytes()));
        let uri = format!("wc:{}@2?relay-protocol=irn&symKey={}", topic, sym_key);

        let (answer, approval) = oneshot::channel();
        {
            let mut state = self
                .state
                .lock()
                .map_err(|_| RelayError::Unavailable("relay state poisoned".into()))?;
            state
                .proposals
                .insert(topic.clone(), ProposalSlot { proposal, answer });
            state.proposal_order.push_back(topic.clone());
        }
        self.proposal_ready.notify_one();

        let state: Weak<Mutex<RelayState>> = Arc::downgrade(&self.state);
        let withdrawn = topic.clone();
        let approval = ProposalReply::new(approval).on_withdraw(move || {
            let Some(state) = state.upgrade() else {
                return;
            };
            if let Ok(mut state) = state.lock() {
                if state.proposals.remove(&withdrawn).is_some() {
                    tracing::debug!(topic = %withdrawn, "withdrawing unanswered pairing proposal");
                }
                state.proposal_order.retain(|topic| topic != &withdrawn);
            };
        });

        Ok(PendingPairing {
            topic,
            uri,
            approval,
        })
    }

    async fn request(
        &self,
        topic: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, ProviderCallError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (sender, receiver) = oneshot::channel();
        {
            let mut state = self
                .state
                .lock()
                .map_err(|_| ProviderCallError::failed("relay state poisoned"))?;
            if !state.sessions.contains_key(topic) {
                return Err(ProviderCallError::failed(format!(
                    "no relay session for topic {}",
                    topic
                )));
            }
            state.pending.insert(request_id, sender);
            state.inbox.push_back(RelayInbound {
                request_id,
                topic: topic.to_string(),
                method: method.to_string(),
                params,
            });
        }
        self.request_ready.notify_one();

        let _guard = PendingGuard {
            relay: self,
            request_id,
        };
        receiver
            .await
            .unwrap_or_else(|_| Err(ProviderCallError::failed("relay request dropped")))
    }

    async fn ping(&self, topic: &str) -> bool {
        self.has_session(topic)
    }

    async fn disconnect(&self, topic: &str) -> Result<(), RelayError> {
        let removed = self
            .state
            .lock()
            .map_err(|_| RelayError::Unavailable("relay state poisoned".into()))?
            .sessions
            .remove(topic);
        removed
            .map(|_| ())
            .ok_or_else(|| RelayError::UnknownTopic(topic.to_string()))
    }

    fn events(&self, topic: &str) -> Option<broadcast::Receiver<ProviderEvent>> {
        self.state.lock().ok()?.sessions.get(topic).map(|tx| tx.subscribe())
    }
}
