//! 钱包子系统集成测试
//!
//! 测试覆盖：
//! - ✅ 检测 → 配对 → 构建 → 调度的完整流程
//! - ✅ 签名超时与迟到响应
//! - ✅ 并发连接合并
//! - ✅ 会话恢复（直连与中继）
//! - ✅ 断开与钱包事件
//!
//! 全部测试使用暂停的 tokio 时钟，不依赖真实等待

mod common;

use std::time::Duration;

use common::{blade_wallet, harness, harness_with, BLADE_ACCOUNT};
use rights_wallet::{
    domain::{SessionState, SignResult},
    infrastructure::{
        environment::{ProviderCallError, ProviderEvent, ScriptedProvider, ScriptedReply},
        event_bus::SessionEvent,
    },
    WalletError,
};
use serde_json::json;
use tokio::time::Instant;

// ============ 完整流程 ============

#[tokio::test(start_paused = true)]
async fn test_connect_and_mint_end_to_end() {
    let h = harness();
    let wallet = blade_wallet();
    wallet.reply(
        "hedera_signAndExecuteTransaction",
        ScriptedReply::Respond(Ok(json!({ "transactionId": "0.0.1234@1700000000.000000001" }))),
    );
    h.env.inject_global("bladeWallet", wallet.clone());

    let detected = h.service.available_providers().await;
    assert!(detected.iter().any(|p| p.descriptor.id == "blade"));

    let account = h.service.connect("blade").await.unwrap();
    assert_eq!(account, BLADE_ACCOUNT);

    let result = h.service.mint("0.0.9999", "ipfs://abc123").await.unwrap();
    assert_eq!(
        result,
        SignResult::Signed {
            transaction_id: "0.0.1234@1700000000.000000001".into()
        }
    );

    let sign_call = wallet
        .calls()
        .into_iter()
        .find(|c| c.method == "hedera_signAndExecuteTransaction")
        .unwrap();
    assert_eq!(sign_call.params["signerAccountId"], BLADE_ACCOUNT);
}

#[tokio::test(start_paused = true)]
async fn test_mint_without_session_is_not_connected() {
    let h = harness();
    let err = h.service.mint("0.0.9999", "ipfs://abc123").await.unwrap_err();
    assert!(matches!(err, WalletError::NotConnected { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_oversized_pointer_never_reaches_wallet() {
    let h = harness();
    let wallet = blade_wallet();
    h.env.inject_global("bladeWallet", wallet.clone());
    h.service.connect("blade").await.unwrap();

    let err = h
        .service
        .mint("0.0.9999", &"a".repeat(101))
        .await
        .unwrap_err();
    assert_eq!(err, WalletError::PayloadTooLarge { size: 101, limit: 100 });
    assert_eq!(wallet.call_count("hedera_signAndExecuteTransaction"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_missing_wallet_reports_install_url() {
    let h = harness();
    let err = h.service.connect("hashpack").await.unwrap_err();
    match err {
        WalletError::ProviderUnavailable { install_url, .. } => {
            assert_eq!(install_url.as_deref(), Some("https://www.hashpack.app/download"))
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

// ============ 超时与迟到响应 ============

#[tokio::test(start_paused = true)]
async fn test_sign_timeout_discards_late_response() {
    let h = harness();
    let wallet = blade_wallet();
    wallet.reply("hedera_signAndExecuteTransaction", ScriptedReply::Deferred);
    h.env.inject_global("bladeWallet", wallet.clone());
    h.service.connect("blade").await.unwrap();
    let mut events = h.service.subscribe();

    let start = Instant::now();
    let result = h.service.mint("0.0.9999", "ipfs://abc123").await.unwrap();
    assert_eq!(result, SignResult::TimedOut);
    assert!(start.elapsed() >= Duration::from_secs(60));
    assert!(start.elapsed() < Duration::from_secs(61));

    tokio::time::sleep_until(start + Duration::from_secs(65)).await;
    let late = wallet.take_deferred().unwrap();
    assert!(!late.resolve(Ok(json!({ "transactionId": "0.0.1234@1.1" }))));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut settled = 0;
    while let Ok(envelope) = events.try_recv() {
        if let SessionEvent::SignSettled { result, .. } = envelope.event {
            assert_eq!(result, SignResult::TimedOut);
            settled += 1;
        }
    }
    assert_eq!(settled, 1);
}

#[tokio::test(start_paused = true)]
async fn test_user_rejection_is_a_result_not_an_error() {
    let h = harness();
    let wallet = blade_wallet();
    wallet.reply(
        "hedera_signAndExecuteTransaction",
        ScriptedReply::Respond(Err(ProviderCallError::from_rpc(4001, "User rejected"))),
    );
    h.env.inject_global("bladeWallet", wallet);
    h.service.connect("blade").await.unwrap();

    let result = h.service.mint("0.0.9999", "ipfs://abc123").await.unwrap();
    assert!(matches!(result, SignResult::Rejected { .. }));
    assert_eq!(h.service.sessions().state("blade"), SessionState::Connected);
}

// ============ 并发连接 ============

#[tokio::test(start_paused = true)]
async fn test_concurrent_connects_share_one_pairing() {
    let h = harness();
    let wallet = ScriptedProvider::builder().with_events().build();
    wallet.reply_always(
        "hedera_requestAccounts",
        ScriptedReply::Delayed(Duration::from_secs(2), Ok(json!([BLADE_ACCOUNT]))),
    );
    h.env.inject_global("bladeWallet", wallet.clone());
    h.service.available_providers().await;

    let (first, second) = tokio::join!(h.service.connect("blade"), h.service.connect("blade"));
    assert_eq!(first.unwrap(), BLADE_ACCOUNT);
    assert_eq!(second.unwrap(), BLADE_ACCOUNT);
    assert_eq!(wallet.call_count("hedera_requestAccounts"), 1);
    assert_eq!(h.service.sessions().sessions().len(), 1);
}

// ============ 会话恢复 ============

#[tokio::test(start_paused = true)]
async fn test_restore_direct_session_after_reload() {
    let first = harness();
    let wallet = blade_wallet();
    wallet.reply_always(
        "hedera_getAccounts",
        ScriptedReply::Respond(Ok(json!([BLADE_ACCOUNT]))),
    );
    first.env.inject_global("bladeWallet", wallet.clone());
    first.service.connect("blade").await.unwrap();
    first.service.shutdown();

    let reloaded = harness_with(first.env.clone(), first.relay.clone(), first.store.clone());
    let session = reloaded.service.restore().await.unwrap();
    assert_eq!(session.account_id, BLADE_ACCOUNT);
    assert_eq!(reloaded.service.sessions().state("blade"), SessionState::Connected);
    // 恢复不重新配对
    assert_eq!(wallet.call_count("hedera_requestAccounts"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_restore_rejected_by_wallet_clears_record() {
    let first = harness();
    let wallet = blade_wallet();
    wallet.reply_always("hedera_getAccounts", ScriptedReply::Respond(Ok(json!([]))));
    first.env.inject_global("bladeWallet", wallet);
    first.service.connect("blade").await.unwrap();
    first.service.shutdown();

    let reloaded = harness_with(first.env.clone(), first.relay.clone(), first.store.clone());
    assert!(reloaded.service.restore().await.is_none());
    assert!(reloaded.store.load().is_none());
    assert_eq!(reloaded.service.sessions().state("blade"), SessionState::Idle);
}

async fn pair_hashpack(h: &common::Harness) -> String {
    h.env
        .inject_global("hashpack", ScriptedProvider::builder().build());
    h.service.available_providers().await;

    let relay = h.relay.clone();
    let wallet_side = tokio::spawn(async move {
        let (topic, proposal) = relay.next_proposal().await;
        assert_eq!(proposal.namespace, "hedera");
        relay.approve(&topic, vec!["hedera:testnet:0.0.4321".into()]);
        topic
    });

    let account = h.service.connect("hashpack").await.unwrap();
    assert_eq!(account, "0.0.4321");
    wallet_side.await.unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_restore_relay_session_while_topic_alive() {
    let first = harness();
    let topic = pair_hashpack(&first).await;
    first.service.shutdown();

    let reloaded = harness_with(first.env.clone(), first.relay.clone(), first.store.clone());
    let session = reloaded.service.restore().await.unwrap();
    assert_eq!(session.topic.as_deref(), Some(topic.as_str()));

    let relay = reloaded.relay.clone();
    let wallet_side = tokio::spawn(async move {
        let inbound = relay.next_request().await;
        relay.respond(
            inbound.request_id,
            Ok(json!({ "transactionId": "0.0.4321@1700000000.000000009" })),
        )
    });
    let result = reloaded
        .service
        .mint("0.0.9999", "ipfs://abc123")
        .await
        .unwrap();
    assert!(wallet_side.await.unwrap());
    assert_eq!(result.transaction_id(), Some("0.0.4321@1700000000.000000009"));
}

#[tokio::test(start_paused = true)]
async fn test_restore_relay_session_after_wallet_dropped_it() {
    let first = harness();
    let topic = pair_hashpack(&first).await;
    first.service.shutdown();
    first.relay.drop_session(&topic);

    let reloaded = harness_with(first.env.clone(), first.relay.clone(), first.store.clone());
    assert!(reloaded.service.restore().await.is_none());
    assert!(reloaded.store.load().is_none());
    assert_eq!(reloaded.service.sessions().state("hashpack"), SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_persisted_record_expires() {
    let h = harness();
    h.env.inject_global("bladeWallet", blade_wallet());
    h.service.connect("blade").await.unwrap();

    assert!(h.store.load().is_some());
    let later = chrono::Utc::now() + chrono::Duration::hours(25);
    assert!(h.store.load_at(later).is_none());
}

// ============ 断开与钱包事件 ============

#[tokio::test(start_paused = true)]
async fn test_disconnect_clears_state_even_if_wallet_never_answers() {
    let h = harness();
    let wallet = blade_wallet();
    wallet.reply("hedera_disconnect", ScriptedReply::Pending);
    h.env.inject_global("bladeWallet", wallet.clone());
    h.service.connect("blade").await.unwrap();

    h.service.disconnect("blade").await;

    assert_eq!(wallet.call_count("hedera_disconnect"), 1);
    assert!(h.store.load().is_none());
    assert!(h.service.sessions().session("blade").is_none());
    assert_eq!(h.service.sessions().state("blade"), SessionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_clears_state_when_notify_fails() {
    let h = harness();
    let wallet = blade_wallet();
    wallet.reply(
        "hedera_disconnect",
        ScriptedReply::Respond(Err(ProviderCallError::failed("extension crashed"))),
    );
    h.env.inject_global("bladeWallet", wallet);
    h.service.connect("blade").await.unwrap();

    h.service.disconnect("blade").await;

    assert!(h.store.load().is_none());
    assert_eq!(h.service.sessions().state("blade"), SessionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_account_change_is_persisted_and_used_for_next_mint() {
    let h = harness();
    let wallet = blade_wallet();
    wallet.reply(
        "hedera_signAndExecuteTransaction",
        ScriptedReply::Respond(Ok(json!({ "receipt": { "status": "SUCCESS" } }))),
    );
    h.env.inject_global("bladeWallet", wallet.clone());
    h.service.connect("blade").await.unwrap();

    wallet.emit(ProviderEvent::AccountsChanged(vec!["0.0.5678".into()]));
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(h.store.load().unwrap().account_id, "0.0.5678");
    let result = h.service.mint("0.0.9999", "ipfs://abc123").await.unwrap();
    let transaction_id = result.transaction_id().unwrap();
    assert!(transaction_id.starts_with("0.0.5678@"));
}

#[tokio::test(start_paused = true)]
async fn test_wallet_side_disconnect_ends_session() {
    let h = harness();
    let wallet = blade_wallet();
    h.env.inject_global("bladeWallet", wallet.clone());
    h.service.connect("blade").await.unwrap();
    let mut events = h.service.subscribe();

    wallet.emit(ProviderEvent::Disconnected {
        reason: "locked".into(),
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(h.service.sessions().session("blade").is_none());
    assert!(h.store.load().is_none());
    let envelope = events.recv().await.unwrap();
    assert!(matches!(
        envelope.event,
        SessionEvent::Disconnected { ref reason, .. } if reason == "locked"
    ));
}
