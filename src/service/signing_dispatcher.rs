//! 签名调度服务
//!
//! 通过会话通道把交易信封交给钱包审批，总在超时窗口内给出 `SignResult`。
//! 同一会话上的调度串行执行：钱包界面一次只能展示一个审批弹窗。

use std::time::Duration;

use tokio::time::Instant;

use crate::{
    domain::{SignResult, TransactionEnvelope},
    infrastructure::event_bus::{SessionEvent, SessionEventBus},
    service::{response_adapter, session_manager::SessionHandle},
};

pub struct SigningDispatcher {
    timeout: Duration,
    events: SessionEventBus,
}

impl SigningDispatcher {
    pub fn new(timeout: Duration, events: SessionEventBus) -> Self {
        Self { timeout, events }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 提交交易等待签名
    ///
    /// 超时窗口从调用时开始计算，包含排队等待前一个审批的时间。
    /// 超时只取消本方的等待；之后到达的钱包响应随 future 一起被丢弃
    pub async fn dispatch(&self, envelope: TransactionEnvelope, session: &SessionHandle) -> SignResult {
        let provider_id = session.session.provider_id.as_str();

        let queued_at = Instant::now();
        let deadline = queued_at + self.timeout;

        let result = match tokio::time::timeout_at(deadline, session.dispatch_lock().lock()).await {
            Ok(_turn) => {
                let waited = queued_at.elapsed();
                if waited > Duration::from_millis(1) {
                    tracing::debug!(
                        provider_id = %provider_id,
                        correlation_id = %envelope.correlation_id,
                        waited_ms = waited.as_millis() as u64,
                        "waited for previous sign request"
                    );
                }

                tracing::info!(
                    provider_id = %provider_id,
                    correlation_id = %envelope.correlation_id,
                    transaction_id = %envelope.transaction_id,
                    method = %envelope.encoded_for_wallet.method,
                    digest = %envelope.digest_hex(),
                    "dispatching transaction for approval"
                );

                let reply =
                    tokio::time::timeout_at(deadline, session.channel().send(&envelope.encoded_for_wallet))
                        .await;
                match reply {
                    Ok(Ok(response)) => response_adapter::normalize(
                        session.response_shape(),
                        &response,
                        &envelope.transaction_id,
                    ),
                    Ok(Err(error)) => response_adapter::from_call_error(error),
                    Err(_) => SignResult::TimedOut,
                }
            }
            // 前一个审批占满了整个窗口，本次请求不再送达钱包
            Err(_) => SignResult::TimedOut,
        };

        let elapsed_ms = queued_at.elapsed().as_millis() as u64;
        match &result {
            SignResult::Signed { transaction_id } => tracing::info!(
                provider_id = %provider_id,
                correlation_id = %envelope.correlation_id,
                transaction_id = %transaction_id,
                elapsed_ms,
                "transaction signed"
            ),
            SignResult::Rejected { reason } => tracing::info!(
                provider_id = %provider_id,
                correlation_id = %envelope.correlation_id,
                reason = %reason,
                "signing declined by user"
            ),
            SignResult::TimedOut => tracing::warn!(
                provider_id = %provider_id,
                correlation_id = %envelope.correlation_id,
                timeout_secs = self.timeout.as_secs(),
                "signing timed out"
            ),
            SignResult::ProviderError { message } => tracing::error!(
                provider_id = %provider_id,
                correlation_id = %envelope.correlation_id,
                error = %message,
                "wallet failed to sign"
            ),
        }

        self.events.publish(SessionEvent::SignSettled {
            provider_id: provider_id.to_string(),
            correlation_id: envelope.correlation_id.clone(),
            result: result.clone(),
        });

        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::{
        domain::{PairingProtocol, ProviderRegistry, Session, SessionState, WalletRequest},
        infrastructure::environment::{ProviderCallError, ScriptedProvider, ScriptedReply},
        service::session_manager::SessionChannel,
    };

    fn handle(wallet: Arc<ScriptedProvider>) -> SessionHandle {
        let session = Session {
            provider_id: "blade".into(),
            account_id: "0.0.1234".into(),
            network: "hedera:testnet".into(),
            topic: None,
            protocol: PairingProtocol::Direct,
            established_at: Utc::now(),
            state: SessionState::Connected,
            epoch: 1,
        };
        let descriptor = ProviderRegistry::builtin().get("blade").cloned().unwrap();
        SessionHandle::new(session, descriptor, SessionChannel::Direct(wallet))
    }

    fn envelope(correlation_id: &str) -> TransactionEnvelope {
        TransactionEnvelope {
            raw_bytes: vec![1, 2, 3],
            encoded_for_wallet: WalletRequest {
                method: "hedera_signAndExecuteTransaction".into(),
                params: json!({}),
            },
            correlation_id: correlation_id.into(),
            transaction_id: "0.0.1234@1700000000.000000001".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_within_timeout_for_every_outcome() {
        let replies = [
            ScriptedReply::Respond(Ok(json!({"transactionId": "0.0.1234@1.1"}))),
            ScriptedReply::Respond(Err(ProviderCallError::from_rpc(4001, "User rejected"))),
            ScriptedReply::Pending,
        ];
        let timeout = Duration::from_secs(60);

        for reply in replies {
            let wallet = ScriptedProvider::builder().build();
            wallet.reply("hedera_signAndExecuteTransaction", reply);
            let dispatcher = SigningDispatcher::new(timeout, SessionEventBus::default());

            let start = Instant::now();
            let _ = dispatcher.dispatch(envelope("c"), &handle(wallet)).await;
            assert!(start.elapsed() <= timeout + Duration::from_millis(10));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_event_published_once() {
        let wallet = ScriptedProvider::builder().build();
        wallet.reply(
            "hedera_signAndExecuteTransaction",
            ScriptedReply::Respond(Err(ProviderCallError::from_rpc(4001, "User rejected"))),
        );
        let bus = SessionEventBus::default();
        let mut events = bus.subscribe();
        let dispatcher = SigningDispatcher::new(Duration::from_secs(60), bus);

        let result = dispatcher.dispatch(envelope("corr-1"), &handle(wallet)).await;
        assert!(matches!(result, SignResult::Rejected { .. }));

        let settled = events.recv().await.unwrap();
        assert!(matches!(
            settled.event,
            SessionEvent::SignSettled { ref correlation_id, .. } if correlation_id == "corr-1"
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatches_are_serialized_per_session() {
        let wallet = ScriptedProvider::builder().build();
        wallet.reply(
            "hedera_signAndExecuteTransaction",
            ScriptedReply::Delayed(
                Duration::from_secs(10),
                Ok(json!({"transactionId": "0.0.1234@1.1"})),
            ),
        );
        wallet.reply(
            "hedera_signAndExecuteTransaction",
            ScriptedReply::Respond(Ok(json!({"transactionId": "0.0.1234@2.2"}))),
        );
        let session = handle(wallet);
        let dispatcher = Arc::new(SigningDispatcher::new(
            Duration::from_secs(60),
            SessionEventBus::default(),
        ));

        let start = Instant::now();
        let (first, second) = tokio::join!(
            dispatcher.dispatch(envelope("a"), &session),
            dispatcher.dispatch(envelope("b"), &session)
        );
        assert_eq!(first.transaction_id(), Some("0.0.1234@1.1"));
        assert_eq!(second.transaction_id(), Some("0.0.1234@2.2"));
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_dispatch_bounded_from_call() {
        let wallet = ScriptedProvider::builder().build();
        wallet.reply_always("hedera_signAndExecuteTransaction", ScriptedReply::Pending);
        let session = handle(wallet.clone());

        // 前一个审批占住会话的时间比本次窗口更长
        let slow = Arc::new(SigningDispatcher::new(
            Duration::from_secs(120),
            SessionEventBus::default(),
        ));
        let first = tokio::spawn({
            let session = session.clone();
            async move { slow.dispatch(envelope("a"), &session).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;

        let dispatcher = SigningDispatcher::new(Duration::from_secs(60), SessionEventBus::default());
        let called_at = Instant::now();
        let second = dispatcher.dispatch(envelope("b"), &session).await;

        assert_eq!(second, SignResult::TimedOut);
        assert!(called_at.elapsed() <= Duration::from_secs(60) + Duration::from_millis(10));
        assert_eq!(wallet.call_count("hedera_signAndExecuteTransaction"), 1);

        first.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_dispatch_behind_silent_wallet_times_out_on_its_own_clock() {
        let wallet = ScriptedProvider::builder().build();
        wallet.reply_always("hedera_signAndExecuteTransaction", ScriptedReply::Pending);
        let session = handle(wallet);
        let dispatcher = Arc::new(SigningDispatcher::new(
            Duration::from_secs(60),
            SessionEventBus::default(),
        ));

        let first = tokio::spawn({
            let dispatcher = dispatcher.clone();
            let session = session.clone();
            async move { dispatcher.dispatch(envelope("a"), &session).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;

        let called_at = Instant::now();
        let second = dispatcher.dispatch(envelope("b"), &session).await;
        assert_eq!(second, SignResult::TimedOut);
        assert!(called_at.elapsed() <= Duration::from_secs(60) + Duration::from_millis(10));
        assert_eq!(first.await.unwrap(), SignResult::TimedOut);
    }
}
