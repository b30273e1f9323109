//! Rights Wallet - 版权市场的钱包连接与交易签名子系统
//!
//! 非托管模式：零私钥存储，付费方始终是用户自己的钱包账户

pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod service;
pub mod utils;

// 重新导出常用类型
pub use error::{WalletError, WalletErrorCode, WalletResult};

pub mod prelude {
    pub use crate::{
        config::Config,
        domain::{MintRequest, ProviderRegistry, Session, SessionState, SignResult},
        error::{WalletError, WalletErrorCode, WalletResult},
        infrastructure::{
            environment::{StaticEnvironment, WalletEnvironment},
            event_bus::SessionEvent,
            relay::{LoopbackRelay, RelayChannel},
            session_store::SessionStore,
        },
        service::WalletService,
    };
}
