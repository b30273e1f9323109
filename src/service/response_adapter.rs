//! 钱包响应适配
//!
//! 各钱包把交易标识放在不同字段下，有的只返回回执对象。
//! 这里按描述中的响应形状解码为统一的 `SignResult`，调度器本身不关心具体钱包。

use serde_json::Value;

use crate::{
    domain::{ResponseShape, SignResult},
    infrastructure::environment::ProviderCallError,
};

/// 诊断信息中原始响应的最大长度
const RAW_DETAIL_LIMIT: usize = 256;

const HEDERA_ID_FIELDS: &[&str] = &["transactionId", "transaction_id", "txId"];
const EVM_HASH_FIELDS: &[&str] = &["hash", "transactionHash", "txHash"];

/// 解码成功返回值
///
/// `generated_id` 为构建器生成的交易标识，钱包只返回成功回执时使用
pub fn normalize(shape: ResponseShape, response: &Value, generated_id: &str) -> SignResult {
    let response = response.get("result").unwrap_or(response);

    if let Some(error) = embedded_error(response) {
        return from_call_error(error);
    }

    let decoded = match shape {
        ResponseShape::HederaReceipt => hedera_transaction_id(response, generated_id),
        ResponseShape::EvmHash => evm_transaction_hash(response),
    };

    match decoded {
        Ok(transaction_id) => SignResult::Signed { transaction_id },
        Err(message) => SignResult::ProviderError { message },
    }
}

/// 调用失败归类：用户拒绝是正常结果，其余为钱包故障
pub fn from_call_error(error: ProviderCallError) -> SignResult {
    match error {
        ProviderCallError::UserRejected { message } => SignResult::Rejected { reason: message },
        other => SignResult::ProviderError {
            message: other.to_string(),
        },
    }
}

/// 钱包以 JSON-RPC 错误对象作为“成功”返回值的情况
fn embedded_error(response: &Value) -> Option<ProviderCallError> {
    let error = response.get("error")?;
    let code = error.get("code").and_then(Value::as_i64);
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string());
    Some(match code {
        Some(code) => ProviderCallError::from_rpc(code, message),
        None => ProviderCallError::failed(message),
    })
}

fn hedera_transaction_id(response: &Value, generated_id: &str) -> Result<String, String> {
    if let Some(id) = response.as_str().filter(|s| !s.is_empty()) {
        return Ok(id.to_string());
    }

    let candidates = [
        Some(response),
        response.get("receipt"),
        response.get("response"),
    ];
    for candidate in candidates.into_iter().flatten() {
        if let Some(id) = string_field(candidate, HEDERA_ID_FIELDS) {
            return Ok(id);
        }
    }

    // 只有回执：以状态判断成败，标识取本次生成的交易ID
    let status = response
        .get("receipt")
        .and_then(|r| r.get("status"))
        .or_else(|| response.get("status"))
        .and_then(Value::as_str);
    match status {
        Some(status) if status.eq_ignore_ascii_case("success") => Ok(generated_id.to_string()),
        Some(status) => Err(format!("transaction failed with status {}", status)),
        None => Err(unrecognized(response)),
    }
}

fn evm_transaction_hash(response: &Value) -> Result<String, String> {
    if let Some(hash) = response.as_str().filter(|s| is_tx_hash(s)) {
        return Ok(hash.to_string());
    }
    string_field(response, EVM_HASH_FIELDS)
        .filter(|s| is_tx_hash(s))
        .ok_or_else(|| unrecognized(response))
}

fn string_field(value: &Value, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|field| {
        value
            .get(*field)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

fn is_tx_hash(value: &str) -> bool {
    value
        .strip_prefix("0x")
        .map(|hex_part| hex_part.len() == 64 && hex_part.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false)
}

fn unrecognized(response: &Value) -> String {
    let mut raw = response.to_string();
    if raw.len() > RAW_DETAIL_LIMIT {
        let mut cut = RAW_DETAIL_LIMIT;
        while !raw.is_char_boundary(cut) {
            cut -= 1;
        }
        raw.truncate(cut);
        raw.push_str("...");
    }
    format!("unrecognized wallet response: {}", raw)
}
