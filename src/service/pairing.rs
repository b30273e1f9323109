//! 配对协议
//!
//! 三种配对方式统一为一个契约：成功时给出账户、网络和（中继类）topic，失败时返回类型化错误。
//! 每次配对是一个可取消的 future；超时后丢弃 future 即丢弃其订阅，迟到的审批不会再被消费。

use std::{sync::Arc, time::Duration};

use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::{
    config::{LedgerConfig, PairingConfig},
    domain::{LedgerFamily, PairingProtocol, ProviderDescriptor},
    error::{WalletError, WalletResult},
    infrastructure::{
        environment::{ProviderCallError, ProviderEvent, ProviderRef},
        event_bus::{SessionEvent, SessionEventBus},
        relay::{ApprovalOutcome, PairingProposal, RelayChannel},
    },
    utils::{
        account_validator::AccountValidator,
        network::{normalize_network, parse_caip_account},
    },
};

/// 配对成功的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingApproval {
    pub account_id: String,
    /// 已标准化，如 `hedera:testnet` / `eip155:296`
    pub network: String,
    pub topic: Option<String>,
}

#[derive(Clone)]
pub struct PairingService {
    relay: Arc<dyn RelayChannel>,
    events: SessionEventBus,
    config: PairingConfig,
    hedera_network: String,
    evm_network: String,
}

impl PairingService {
    pub fn new(
        relay: Arc<dyn RelayChannel>,
        events: SessionEventBus,
        config: PairingConfig,
        ledger: &LedgerConfig,
    ) -> Self {
        Self {
            relay,
            events,
            config,
            hedera_network: format!("hedera:{}", ledger.hedera_network),
            evm_network: format!("eip155:{}", ledger.evm_chain_id),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout()
    }

    /// 应用配置的默认网络
    pub fn default_network(&self, family: LedgerFamily) -> &str {
        match family {
            LedgerFamily::Hedera => &self.hedera_network,
            LedgerFamily::Evm => &self.evm_network,
        }
    }

    /// 执行钱包的配对协议，整体受配对超时约束
    ///
    /// `on_awaiting` 在进入等待异步审批阶段时调用一次（直连协议不会调用）
    pub async fn pair(
        &self,
        descriptor: &ProviderDescriptor,
        handle: &ProviderRef,
        on_awaiting: &(dyn Fn() + Send + Sync),
    ) -> WalletResult<PairingApproval> {
        tracing::info!(
            provider_id = %descriptor.id,
            protocol = descriptor.protocol.as_str(),
            "starting wallet pairing"
        );

        let attempt = async {
            match descriptor.protocol {
                PairingProtocol::Direct => self.pair_direct(descriptor, handle).await,
                PairingProtocol::Relay => self.pair_relay(descriptor, on_awaiting).await,
                PairingProtocol::Broker => self.pair_broker(descriptor, handle, on_awaiting).await,
            }
        };

        match tokio::time::timeout(self.config.timeout(), attempt).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    provider_id = %descriptor.id,
                    timeout_secs = self.config.timeout_secs,
                    "wallet pairing timed out"
                );
                Err(WalletError::PairingTimeout {
                    provider_id: descriptor.id.clone(),
                    after_secs: self.config.timeout_secs,
                })
            }
        }
    }

    async fn pair_direct(
        &self,
        descriptor: &ProviderDescriptor,
        handle: &ProviderRef,
    ) -> WalletResult<PairingApproval> {
        let method = connect_method(descriptor)?;
        let reply = handle
            .request(method, Value::Null)
            .await
            .map_err(|e| pairing_error(descriptor, e))?;

        let (account, reported_network) = extract_account(&reply).ok_or_else(|| {
            WalletError::provider_fault(format!(
                "`{}` returned no account from {}: {}",
                descriptor.id, method, reply
            ))
        })?;

        let network = match reported_network {
            Some(network) => network,
            None => self.query_network(descriptor, handle).await,
        };

        approval(descriptor, account, network, None)
    }

    /// EVM 钱包查询当前链；不支持查询时回落到配置的默认网络
    async fn query_network(&self, descriptor: &ProviderDescriptor, handle: &ProviderRef) -> String {
        let fallback = self.default_network(descriptor.network).to_string();
        let Some(method) = descriptor.call_surface.chain_method.as_deref() else {
            return fallback;
        };

        match handle.request(method, Value::Null).await {
            Ok(Value::String(chain)) => chain,
            Ok(Value::Number(chain)) => chain.to_string(),
            Ok(other) => {
                tracing::warn!(provider_id = %descriptor.id, reply = %other, "unexpected chain id reply");
                fallback
            }
            Err(ProviderCallError::MethodNotFound(_)) => fallback,
            Err(e) => {
                tracing::warn!(provider_id = %descriptor.id, error = %e, "chain id query failed");
                fallback
            }
        }
    }

    async fn pair_relay(
        &self,
        descriptor: &ProviderDescriptor,
        on_awaiting: &(dyn Fn() + Send + Sync),
    ) -> WalletResult<PairingApproval> {
        let proposal = PairingProposal {
            provider_id: descriptor.id.clone(),
            app_name: self.config.app_name.clone(),
            app_url: self.config.app_url.clone(),
            namespace: namespace(descriptor.network).to_string(),
            chains: vec![self.default_network(descriptor.network).to_string()],
            methods: relay_methods(descriptor.network),
            events: vec!["accountsChanged".into(), "chainChanged".into()],
        };

        let pending = self
            .relay
            .propose(proposal)
            .await
            .map_err(|e| WalletError::provider_fault(e.to_string()))?;

        on_awaiting();
        self.events.publish(SessionEvent::PairingUri {
            provider_id: descriptor.id.clone(),
            uri: pending.uri.clone(),
        });
        tracing::debug!(provider_id = %descriptor.id, topic = %pending.topic, "awaiting relay approval");

        match pending.approval.await {
            Ok(ApprovalOutcome::Approved { accounts }) => {
                let first = accounts.first().ok_or_else(|| {
                    WalletError::provider_fault("relay approval carried no accounts")
                })?;
                let (network, account) = parse_caip_account(first).ok_or_else(|| {
                    WalletError::provider_fault(format!("malformed relay account `{}`", first))
                })?;
                approval(descriptor, account, network, Some(pending.topic))
            }
            Ok(ApprovalOutcome::Rejected { reason }) => Err(WalletError::PairingRejected {
                provider_id: descriptor.id.clone(),
                reason,
            }),
            Err(_) => Err(WalletError::provider_fault(
                "relay closed the pairing proposal without an answer",
            )),
        }
    }

    async fn pair_broker(
        &self,
        descriptor: &ProviderDescriptor,
        handle: &ProviderRef,
        on_awaiting: &(dyn Fn() + Send + Sync),
    ) -> WalletResult<PairingApproval> {
        let method = connect_method(descriptor)?;
        // 先订阅再发起，避免错过连接器立即发出的事件
        let mut events = handle.events().ok_or_else(|| {
            WalletError::provider_fault(format!("`{}` connector exposes no events", descriptor.id))
        })?;
        let correlation_id = Uuid::new_v4().to_string();

        handle
            .request(method, json!({ "correlationId": correlation_id }))
            .await
            .map_err(|e| pairing_error(descriptor, e))?;
        on_awaiting();

        loop {
            match events.recv().await {
                Ok(ProviderEvent::PairingUri {
                    correlation_id: id,
                    uri,
                }) if id == correlation_id => {
                    self.events.publish(SessionEvent::PairingUri {
                        provider_id: descriptor.id.clone(),
                        uri,
                    });
                }
                Ok(ProviderEvent::Paired {
                    correlation_id: id,
                    account_id,
                    network,
                    topic,
                }) if id == correlation_id => {
                    let (network, account) = match parse_caip_account(&account_id) {
                        Some(parsed) => parsed,
                        None => (network, account_id),
                    };
                    return approval(descriptor, account, network, topic);
                }
                Ok(ProviderEvent::PairingRejected {
                    correlation_id: id,
                    reason,
                }) if id == correlation_id => {
                    return Err(WalletError::PairingRejected {
                        provider_id: descriptor.id.clone(),
                        reason,
                    });
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(provider_id = %descriptor.id, skipped, "connector events lagged");
                }
                Err(RecvError::Closed) => {
                    return Err(WalletError::provider_fault(format!(
                        "`{}` connector closed its event stream during pairing",
                        descriptor.id
                    )));
                }
            }
        }
    }
}

fn connect_method(descriptor: &ProviderDescriptor) -> WalletResult<&str> {
    descriptor
        .call_surface
        .connect_method
        .as_deref()
        .ok_or_else(|| {
            WalletError::provider_fault(format!("`{}` has no connect entry point", descriptor.id))
        })
}

fn namespace(family: LedgerFamily) -> &'static str {
    match family {
        LedgerFamily::Hedera => "hedera",
        LedgerFamily::Evm => "eip155",
    }
}

fn relay_methods(family: LedgerFamily) -> Vec<String> {
    match family {
        LedgerFamily::Hedera => vec![
            "hedera_signAndExecuteTransaction".into(),
            "hedera_executeTransaction".into(),
        ],
        LedgerFamily::Evm => vec!["eth_sendTransaction".into()],
    }
}

fn pairing_error(descriptor: &ProviderDescriptor, error: ProviderCallError) -> WalletError {
    match error {
        ProviderCallError::UserRejected { message } => WalletError::PairingRejected {
            provider_id: descriptor.id.clone(),
            reason: message,
        },
        other => WalletError::provider_fault(format!("`{}`: {}", descriptor.id, other)),
    }
}

/// 从连接入口的返回值中取出账户（以及钱包顺带报告的网络）
///
/// 支持 `["0.0.1234"]`、`["hedera:testnet:0.0.1234"]`、
/// `{"accountId": "...", "network": "..."}`、`{"accounts": [...]}`
fn extract_account(reply: &Value) -> Option<(String, Option<String>)> {
    let raw = match reply {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.first()?.as_str()?.to_string(),
        Value::Object(map) => {
            let account = map
                .get("accountId")
                .or_else(|| map.get("account_id"))
                .or_else(|| map.get("account"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| {
                    map.get("accounts")?
                        .as_array()?
                        .first()?
                        .as_str()
                        .map(str::to_string)
                })?;
            let network = map.get("network").and_then(Value::as_str).map(str::to_string);
            return match parse_caip_account(&account) {
                Some((n, a)) => Some((a, Some(n))),
                None => Some((account, network)),
            };
        }
        _ => return None,
    };

    match parse_caip_account(&raw) {
        Some((network, account)) => Some((account, Some(network))),
        None => Some((raw, None)),
    }
}

/// 校验审批结果的账本类型与账户格式
fn approval(
    descriptor: &ProviderDescriptor,
    account_id: String,
    network: String,
    topic: Option<String>,
) -> WalletResult<PairingApproval> {
    let normalized = normalize_network(descriptor.network, &network).ok_or_else(|| {
        WalletError::provider_fault(format!(
            "`{}` approved on network `{}` outside the {} family",
            descriptor.id,
            network,
            descriptor.network.as_str()
        ))
    })?;

    if !AccountValidator::validate(descriptor.network, &account_id) {
        return Err(WalletError::provider_fault(format!(
            "`{}` returned malformed account `{}`",
            descriptor.id, account_id
        )));
    }

    if descriptor.protocol == PairingProtocol::Relay && topic.is_none() {
        return Err(WalletError::provider_fault("relay approval without topic"));
    }

    Ok(PairingApproval {
        account_id,
        network: normalized,
        topic,
    })
}
