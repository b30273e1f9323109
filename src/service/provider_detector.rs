//! 钱包检测服务
//!
//! 每个描述的检测线索按强度分三轮匹配：
//! 1. 直接全局对象（含身份标记）
//! 2. 多钱包代理列表
//! 3. 能力形状启发式（只考虑尚未被认领的全局对象）
//!
//! 同一物理钱包只会被认领一次。整个过程包在有界重试里，预算内晚注入的钱包不会漏检。

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
};

use serde::Serialize;
use tokio::time::Instant;

use crate::{
    domain::{DetectionHint, ProviderDescriptor, ProviderRegistry},
    infrastructure::{
        environment::{handle_identity, BrokerEntry, ProviderRef, WalletEnvironment},
        probe::{poll_with_backoff, ProbePolicy, ProbeStep},
    },
};

/// 命中的检测方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    DirectGlobal,
    Broker,
    Heuristic,
}

impl DetectionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectGlobal => "direct_global",
            Self::Broker => "broker",
            Self::Heuristic => "heuristic",
        }
    }
}

/// 一次检测得到的钱包，不持久化
#[derive(Clone)]
pub struct DetectedProvider {
    pub descriptor: ProviderDescriptor,
    pub handle: ProviderRef,
    pub detection_method: DetectionMethod,
    /// 命中的注入点（全局名或代理条目名），用于诊断
    pub source: String,
}

impl std::fmt::Debug for DetectedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectedProvider")
            .field("provider_id", &self.descriptor.id)
            .field("detection_method", &self.detection_method)
            .field("source", &self.source)
            .finish()
    }
}

pub struct ProviderDetector {
    registry: Arc<ProviderRegistry>,
    environment: Arc<dyn WalletEnvironment>,
    policy: ProbePolicy,
    last_scan: RwLock<HashMap<String, DetectedProvider>>,
}

impl ProviderDetector {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        environment: Arc<dyn WalletEnvironment>,
        policy: ProbePolicy,
    ) -> Self {
        Self {
            registry,
            environment,
            policy,
            last_scan: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// 扫描当前可用钱包
    ///
    /// 幂等，可反复调用。全部已知钱包都找到时提前返回，否则等满预算。
    pub async fn scan(&self) -> Vec<DetectedProvider> {
        let started = Instant::now();
        let expected = self.registry.list_known().len();

        let detected = poll_with_backoff(self.policy, |round| {
            let found = self.detect_once();
            tracing::trace!(round, found = found.len(), "detection pass");
            if found.len() == expected {
                ProbeStep::Done(found)
            } else {
                ProbeStep::Partial(found)
            }
        })
        .await;

        if let Ok(mut last) = self.last_scan.write() {
            *last = detected
                .iter()
                .map(|d| (d.descriptor.id.clone(), d.clone()))
                .collect();
        }

        tracing::info!(
            found = detected.len(),
            known = expected,
            elapsed_ms = started.elapsed().as_millis() as u64,
            providers = ?detected.iter().map(|d| d.descriptor.id.as_str()).collect::<Vec<_>>(),
            "wallet scan finished"
        );

        detected
    }

    /// 最近一次扫描中的钱包
    pub fn find(&self, provider_id: &str) -> Option<DetectedProvider> {
        self.last_scan.read().ok()?.get(provider_id).cloned()
    }

    pub fn last_scan(&self) -> Vec<DetectedProvider> {
        self.last_scan
            .read()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// 单次检测（不等待）
    pub fn detect_once(&self) -> Vec<DetectedProvider> {
        let descriptors = self.registry.list_known();
        let broker = self.environment.broker_entries();
        let mut claimed: HashSet<usize> = HashSet::new();
        let mut matches: Vec<Option<DetectedProvider>> = vec![None; descriptors.len()];

        for (i, descriptor) in descriptors.iter().enumerate() {
            matches[i] = self.match_direct(descriptor, &mut claimed);
        }

        for (i, descriptor) in descriptors.iter().enumerate() {
            if matches[i].is_none() {
                matches[i] = match_broker(descriptor, &broker, &mut claimed);
            }
        }

        for (i, descriptor) in descriptors.iter().enumerate() {
            if matches[i].is_none() {
                matches[i] = self.match_heuristic(descriptor, &mut claimed);
            }
        }

        matches.into_iter().flatten().collect()
    }

    fn match_direct(
        &self,
        descriptor: &ProviderDescriptor,
        claimed: &mut HashSet<usize>,
    ) -> Option<DetectedProvider> {
        descriptor.detection_hints.iter().find_map(|hint| {
            let (name, handle) = match hint {
                DetectionHint::Global { name } => (name, self.environment.global(name)?),
                DetectionHint::GlobalFlag { name, flag } => {
                    let handle = self.environment.global(name)?;
                    if !handle.flag(flag) {
                        return None;
                    }
                    (name, handle)
                }
                _ => return None,
            };
            claim(
                descriptor,
                handle,
                DetectionMethod::DirectGlobal,
                name,
                claimed,
            )
        })
    }

    fn match_heuristic(
        &self,
        descriptor: &ProviderDescriptor,
        claimed: &mut HashSet<usize>,
    ) -> Option<DetectedProvider> {
        descriptor.detection_hints.iter().find_map(|hint| {
            let DetectionHint::Capability { methods, fields } = hint else {
                return None;
            };
            self.environment.global_names().into_iter().find_map(|name| {
                let handle = self.environment.global(&name)?;
                if claimed.contains(&handle_identity(&handle)) {
                    return None;
                }
                let has_methods =
                    !methods.is_empty() && methods.iter().all(|m| handle.has_method(m));
                let has_fields = !fields.is_empty() && fields.iter().all(|f| handle.has_field(f));
                if !(has_methods || has_fields) {
                    return None;
                }
                claim(
                    descriptor,
                    handle,
                    DetectionMethod::Heuristic,
                    &name,
                    claimed,
                )
            })
        })
    }
}

fn match_broker(
    descriptor: &ProviderDescriptor,
    broker: &[BrokerEntry],
    claimed: &mut HashSet<usize>,
) -> Option<DetectedProvider> {
    descriptor.detection_hints.iter().find_map(|hint| {
        let DetectionHint::Broker { flag } = hint else {
            return None;
        };
        let entry = broker
            .iter()
            .find(|e| e.has_flag(flag) && !claimed.contains(&handle_identity(&e.handle)))?;
        claim(
            descriptor,
            entry.handle.clone(),
            DetectionMethod::Broker,
            &entry.name,
            claimed,
        )
    })
}

fn claim(
    descriptor: &ProviderDescriptor,
    handle: ProviderRef,
    method: DetectionMethod,
    source: &str,
    claimed: &mut HashSet<usize>,
) -> Option<DetectedProvider> {
    if !claimed.insert(handle_identity(&handle)) {
        return None;
    }
    tracing::debug!(
        provider_id = %descriptor.id,
        method = method.as_str(),
        source = %source,
        "wallet provider detected"
    );
    Some(DetectedProvider {
        descriptor: descriptor.clone(),
        handle,
        detection_method: method,
        source: source.to_string(),
    })
}
