//! 铸造请求、交易信封与签名结果

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WalletError;

/// 链上元数据指针的字节上限（UTF-8）
pub const METADATA_POINTER_MAX_BYTES: usize = 100;

/// 铸造请求，每次尝试构造一次，不持久化
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MintRequest {
    /// Hedera 代币ID 或 EVM 合约地址
    pub collection_id: String,
    /// 链下元数据定位串（如 `ipfs://...`），元数据本体不上链
    pub metadata_pointer: String,
    pub payer_account_id: String,
}

/// 发给钱包的请求：方法名 + 参数，由交易构建器按配对协议决定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletRequest {
    pub method: String,
    pub params: Value,
}

/// 交易信封，由构建器产出、调度器消费一次后丢弃
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionEnvelope {
    /// 未签名、已绑定付费方的规范字节
    pub raw_bytes: Vec<u8>,
    pub encoded_for_wallet: WalletRequest,
    pub correlation_id: String,
    /// 本次尝试生成的交易标识（Hedera 为 `payer@seconds.nanos`）
    pub transaction_id: String,
}

impl TransactionEnvelope {
    /// raw_bytes 的 sha256，用于日志关联
    pub fn digest_hex(&self) -> String {
        use sha2::{Digest, Sha256};
        hex::encode(Sha256::digest(&self.raw_bytes))
    }
}

/// 签名结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SignResult {
    Signed { transaction_id: String },
    /// 用户取消或拒绝，属于正常结果
    Rejected { reason: String },
    TimedOut,
    ProviderError { message: String },
}

impl SignResult {
    pub fn is_signed(&self) -> bool {
        matches!(self, Self::Signed { .. })
    }

    pub fn transaction_id(&self) -> Option<&str> {
        match self {
            Self::Signed { transaction_id } => Some(transaction_id),
            _ => None,
        }
    }

    /// 转为错误分类，`timeout_secs` 为调度超时
    pub fn into_result(self, timeout_secs: u64) -> Result<String, WalletError> {
        match self {
            Self::Signed { transaction_id } => Ok(transaction_id),
            Self::Rejected { reason } => Err(WalletError::SigningRejected { reason }),
            Self::TimedOut => Err(WalletError::SigningTimeout {
                after_secs: timeout_secs,
            }),
            Self::ProviderError { message } => Err(WalletError::ProviderFault { detail: message }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_result_into_result() {
        let signed = SignResult::Signed {
            transaction_id: "0.0.1234@1700000000.000000001".into(),
        };
        assert_eq!(signed.transaction_id(), Some("0.0.1234@1700000000.000000001"));
        assert!(signed.into_result(60).is_ok());

        let err = SignResult::TimedOut.into_result(60).unwrap_err();
        assert_eq!(err, WalletError::SigningTimeout { after_secs: 60 });
    }

    #[test]
    fn test_sign_result_serialization() {
        let json = serde_json::to_value(SignResult::Rejected {
            reason: "user rejected".into(),
        })
        .unwrap();
        assert_eq!(json["status"], "rejected");
        assert_eq!(json["reason"], "user rejected");
    }
}
