use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use rights_wallet::{
    config::Config,
    infrastructure::{
        environment::{EnvironmentSnapshot, ScriptedProvider, ScriptedReply, StaticEnvironment},
        event_bus::LoggingEventHandler,
        logging::init_logging,
        relay::LoopbackRelay,
        session_store::SessionStore,
    },
    service::WalletService,
};
use serde_json::json;

const USAGE: &str = "usage: rights-wallet <scan <snapshot.json> | simulate>";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // ✅ 1. 加载配置（CONFIG_PATH 指向的 TOML 优先，否则读环境变量）
    let config_path = std::env::var("CONFIG_PATH").ok();
    let config = Config::from_env_and_file(config_path.as_deref())?;
    config.validate()?;

    // ✅ 2. 初始化日志（guard 需持有到进程结束）
    let _log_guard = init_logging(&config.logging)?;

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("scan") => {
            let path = args.next().map(PathBuf::from).context(USAGE)?;
            scan(&config, path).await
        }
        Some("simulate") => simulate(&config).await,
        _ => anyhow::bail!(USAGE),
    }
}

/// 按环境快照运行一次检测，打印可用钱包与缺失钱包的安装地址
async fn scan(config: &Config, path: PathBuf) -> Result<()> {
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read snapshot: {:?}", path))?;
    let snapshot: EnvironmentSnapshot =
        serde_json::from_str(&content).context("Failed to parse environment snapshot")?;

    let service = WalletService::new(
        config,
        Arc::new(snapshot.into_environment()),
        LoopbackRelay::new(),
        SessionStore::in_memory(),
    )?;

    let detected = service.available_providers().await;
    tracing::info!(count = detected.len(), snapshot = ?path, "scan complete");

    println!("detected:");
    for provider in &detected {
        println!(
            "  {:<10} {:<16} via {:<14} ({})",
            provider.descriptor.id,
            provider.descriptor.display_name,
            provider.detection_method.as_str(),
            provider.source
        );
    }

    println!("not installed:");
    for descriptor in service.detector().registry().list_known() {
        if !detected.iter().any(|p| p.descriptor.id == descriptor.id) {
            println!("  {:<10} {}", descriptor.id, descriptor.install_url);
        }
    }

    Ok(())
}

/// 对脚本化的直连钱包跑一遍 connect → build → dispatch
async fn simulate(config: &Config) -> Result<()> {
    let wallet = ScriptedProvider::builder().with_events().build();
    wallet.reply_always(
        "hedera_requestAccounts",
        ScriptedReply::Respond(Ok(json!(["0.0.1234"]))),
    );
    wallet.reply_always(
        "hedera_signAndExecuteTransaction",
        ScriptedReply::Respond(Ok(json!({ "receipt": { "status": "SUCCESS" } }))),
    );
    wallet.reply_always("hedera_disconnect", ScriptedReply::Respond(Ok(json!(true))));

    let env = StaticEnvironment::new();
    env.inject_global("bladeWallet", wallet);

    let service = WalletService::new(
        config,
        Arc::new(env),
        LoopbackRelay::new(),
        SessionStore::in_memory(),
    )?;
    let _event_log = service.events().subscribe_handler(Arc::new(LoggingEventHandler));

    let account = service.connect("blade").await?;
    println!("connected blade as {}", account);

    let signed = service
        .mint("0.0.9999", "ipfs://abc123")
        .await?
        .into_result(config.signing.timeout_secs);

    service.disconnect("blade").await;
    service.shutdown();

    let transaction_id = signed?;
    println!("signed: {}", transaction_id);
    Ok(())
}
