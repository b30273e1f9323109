//! 领域模型：钱包描述、会话、铸造交易

pub mod mint;
pub mod provider;
pub mod session;

pub use mint::{
    MintRequest, SignResult, TransactionEnvelope, WalletRequest, METADATA_POINTER_MAX_BYTES,
};
pub use provider::{
    DetectionHint, LedgerFamily, PairingProtocol, ProviderDescriptor, ProviderRegistry,
    ResponseShape,
};
pub use session::{Session, SessionState};
