// Session Event Bus
// 会话事件发布/订阅：连接、账户/网络变更、断开、签名结果都经此广播给订阅方

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{sync::broadcast, task::JoinHandle};
use uuid::Uuid;

use crate::domain::SignResult;

// ============ 事件类型定义 ============

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum SessionEvent {
    /// 中继/连接器配对串，UI 渲染为二维码
    PairingUri {
        provider_id: String,
        uri: String,
    },
    Connected {
        provider_id: String,
        account_id: String,
        network: String,
    },
    Restored {
        provider_id: String,
        account_id: String,
        network: String,
    },
    AccountChanged {
        provider_id: String,
        account_id: String,
    },
    NetworkChanged {
        provider_id: String,
        network: String,
    },
    Disconnected {
        provider_id: String,
        reason: String,
    },
    Expired {
        provider_id: String,
    },
    SignSettled {
        provider_id: String,
        correlation_id: String,
        result: SignResult,
    },
}

impl SessionEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PairingUri { .. } => "PairingUri",
            Self::Connected { .. } => "Connected",
            Self::Restored { .. } => "Restored",
            Self::AccountChanged { .. } => "AccountChanged",
            Self::NetworkChanged { .. } => "NetworkChanged",
            Self::Disconnected { .. } => "Disconnected",
            Self::Expired { .. } => "Expired",
            Self::SignSettled { .. } => "SignSettled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event: SessionEvent,
    pub published_at: chrono::DateTime<chrono::Utc>,
}

// ============ Event Handler Trait ============

#[async_trait]
pub trait SessionEventHandler: Send + Sync {
    async fn handle(&self, event: &SessionEvent);
    fn event_types(&self) -> Vec<&'static str>;
}

// ============ 广播实现 ============

#[derive(Clone)]
pub struct SessionEventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl Default for SessionEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl SessionEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// 发布事件；没有订阅方时直接丢弃
    pub fn publish(&self, event: SessionEvent) {
        tracing::debug!(event_type = event.event_type(), "session event");
        let envelope = EventEnvelope {
            event_id: Uuid::new_v4(),
            event,
            published_at: chrono::Utc::now(),
        };
        let _ = self.sender.send(envelope);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// 后台任务：把事件分发给处理器
    pub fn subscribe_handler(&self, handler: Arc<dyn SessionEventHandler>) -> JoinHandle<()> {
        let mut receiver = self.sender.subscribe();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(envelope) => {
                        if handler
                            .event_types()
                            .contains(&envelope.event.event_type())
                        {
                            handler.handle(&envelope.event).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "session event handler lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// 把会话事件写入日志
pub struct LoggingEventHandler;

#[async_trait]
impl SessionEventHandler for LoggingEventHandler {
    async fn handle(&self, event: &SessionEvent) {
        match event {
            SessionEvent::PairingUri { provider_id, uri } => {
                tracing::info!(provider_id = %provider_id, uri = %uri, "pairing uri ready")
            }
            SessionEvent::Connected {
                provider_id,
                account_id,
                network,
            }
            | SessionEvent::Restored {
                provider_id,
                account_id,
                network,
            } => tracing::info!(
                provider_id = %provider_id,
                account_id = %account_id,
                network = %network,
                "wallet session active"
            ),
            SessionEvent::SignSettled {
                provider_id,
                correlation_id,
                result,
            } => tracing::info!(
                provider_id = %provider_id,
                correlation_id = %correlation_id,
                result = ?result,
                "sign request settled"
            ),
            other => tracing::info!(event = ?other, "session event"),
        }
    }

    fn event_types(&self) -> Vec<&'static str> {
        vec![
            "PairingUri",
            "Connected",
            "Restored",
            "AccountChanged",
            "NetworkChanged",
            "Disconnected",
            "Expired",
            "SignSettled",
        ]
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct Recorder {
        seen: Mutex<Vec<SessionEvent>>,
    }

    #[async_trait]
    impl SessionEventHandler for Recorder {
        async fn handle(&self, event: &SessionEvent) {
            self.seen.lock().unwrap().push(event.clone());
        }

        fn event_types(&self) -> Vec<&'static str> {
            vec!["Expired"]
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = SessionEventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(SessionEvent::Expired {
            provider_id: "blade".into(),
        });

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.event.event_type(), "Expired");
    }

    #[tokio::test]
    async fn test_handler_filters_event_types() {
        let bus = SessionEventBus::default();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let task = bus.subscribe_handler(recorder.clone());

        bus.publish(SessionEvent::AccountChanged {
            provider_id: "blade".into(),
            account_id: "0.0.2".into(),
        });
        bus.publish(SessionEvent::Expired {
            provider_id: "blade".into(),
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
        task.abort();
    }

    #[test]
    fn test_event_serialization() {
        let event = SessionEvent::NetworkChanged {
            provider_id: "metamask".into(),
            network: "eip155:296".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("NetworkChanged"));
        let parsed: SessionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
