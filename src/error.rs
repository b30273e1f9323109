//! 钱包子系统错误定义
//!
//! 检测与持久化失败在本地吸收；配对与签名失败一律以类型化结果返回调用方

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletErrorCode {
    ProviderUnavailable,
    PairingTimeout,
    PairingRejected,
    PayloadTooLarge,
    SigningTimeout,
    SigningRejected,
    ProviderFault,
    SessionExpired,
    NotConnected,
    InvalidRequest,
    Storage,
}

impl WalletErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProviderUnavailable => "provider_unavailable",
            Self::PairingTimeout => "pairing_timeout",
            Self::PairingRejected => "pairing_rejected",
            Self::PayloadTooLarge => "payload_too_large",
            Self::SigningTimeout => "signing_timeout",
            Self::SigningRejected => "signing_rejected",
            Self::ProviderFault => "provider_fault",
            Self::SessionExpired => "session_expired",
            Self::NotConnected => "not_connected",
            Self::InvalidRequest => "invalid_request",
            Self::Storage => "storage",
        }
    }
}

/// 钱包子系统统一错误
///
/// 需要 `Clone`：同一次进行中的配对结果会被多个 `connect()` 调用方共享
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WalletError {
    /// 检测预算内没有找到对应的钱包注入（提示用户安装或解锁）
    #[error("wallet provider `{provider_id}` is not available")]
    ProviderUnavailable {
        provider_id: String,
        install_url: Option<String>,
    },

    #[error("pairing with `{provider_id}` timed out after {after_secs}s")]
    PairingTimeout { provider_id: String, after_secs: u64 },

    /// 用户明确拒绝，本次尝试终止，不属于告警级错误
    #[error("pairing with `{provider_id}` was rejected: {reason}")]
    PairingRejected { provider_id: String, reason: String },

    /// 调用方错误，不可原样重试
    #[error("metadata pointer is {size} bytes, limit is {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("signing request timed out after {after_secs}s")]
    SigningTimeout { after_secs: u64 },

    #[error("signing request was rejected: {reason}")]
    SigningRejected { reason: String },

    /// 钱包返回了无法识别的响应，携带原始诊断信息
    #[error("provider fault: {detail}")]
    ProviderFault { detail: String },

    #[error("session for `{provider_id}` has expired")]
    SessionExpired { provider_id: String },

    #[error("no active session for `{provider_id}`")]
    NotConnected { provider_id: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("session storage error: {0}")]
    Storage(String),
}

impl WalletError {
    pub fn code(&self) -> WalletErrorCode {
        match self {
            Self::ProviderUnavailable { .. } => WalletErrorCode::ProviderUnavailable,
            Self::PairingTimeout { .. } => WalletErrorCode::PairingTimeout,
            Self::PairingRejected { .. } => WalletErrorCode::PairingRejected,
            Self::PayloadTooLarge { .. } => WalletErrorCode::PayloadTooLarge,
            Self::SigningTimeout { .. } => WalletErrorCode::SigningTimeout,
            Self::SigningRejected { .. } => WalletErrorCode::SigningRejected,
            Self::ProviderFault { .. } => WalletErrorCode::ProviderFault,
            Self::SessionExpired { .. } => WalletErrorCode::SessionExpired,
            Self::NotConnected { .. } => WalletErrorCode::NotConnected,
            Self::InvalidRequest(_) => WalletErrorCode::InvalidRequest,
            Self::Storage(_) => WalletErrorCode::Storage,
        }
    }

    /// 用户可以直接再次发起的失败（超时、未安装）
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable { .. }
                | Self::PairingTimeout { .. }
                | Self::SigningTimeout { .. }
        )
    }

    /// 用户主动取消，属于正常结果
    pub fn is_user_rejection(&self) -> bool {
        matches!(
            self,
            Self::PairingRejected { .. } | Self::SigningRejected { .. }
        )
    }

    pub fn provider_fault(detail: impl Into<String>) -> Self {
        Self::ProviderFault {
            detail: detail.into(),
        }
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }
}

impl From<serde_json::Error> for WalletError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("JSON serialization error: {}", err))
    }
}

impl From<std::io::Error> for WalletError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(format!("IO error: {}", err))
    }
}

pub type WalletResult<T> = Result<T, WalletError>;
