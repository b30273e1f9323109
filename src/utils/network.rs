//! 网络标识标准化模块
//!
//! 会话中的网络统一为 `<namespace>:<reference>` 形式：
//! Hedera 为 `hedera:testnet`，EVM 为 `eip155:<chain id>`

use crate::domain::provider::LedgerFamily;

const HEDERA_NETWORKS: &[&str] = &["mainnet", "testnet", "previewnet", "devnet"];

/// 标准化钱包报告的网络标识
///
/// 接受 `testnet`、`hedera:testnet`、`0x128`、`296`、`eip155:296` 等写法
pub fn normalize_network(family: LedgerFamily, raw: &str) -> Option<String> {
    let raw = raw.trim();
    match family {
        LedgerFamily::Hedera => {
            let name = raw.strip_prefix("hedera:").unwrap_or(raw).to_lowercase();
            HEDERA_NETWORKS
                .contains(&name.as_str())
                .then(|| format!("hedera:{}", name))
        }
        LedgerFamily::Evm => {
            let reference = raw.strip_prefix("eip155:").unwrap_or(raw);
            parse_chain_id(reference).map(|id| format!("eip155:{}", id))
        }
    }
}

/// 解析十进制或 0x 十六进制链ID
pub fn parse_chain_id(raw: &str) -> Option<u64> {
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex_part) => u64::from_str_radix(hex_part, 16).ok(),
        None => raw.parse().ok(),
    }
}

/// 从 `eip155:<id>` 取出链ID
pub fn evm_chain_id(network: &str) -> Option<u64> {
    network.strip_prefix("eip155:").and_then(parse_chain_id)
}

/// 解析 CAIP-10 账户串（`hedera:testnet:0.0.1234` / `eip155:1:0xabc...`）
///
/// 返回 `(network, account)`
pub fn parse_caip_account(value: &str) -> Option<(String, String)> {
    let mut parts = value.splitn(3, ':');
    let namespace = parts.next()?;
    let reference = parts.next()?;
    let account = parts.next()?;
    if namespace.is_empty() || reference.is_empty() || account.is_empty() {
        return None;
    }
    Some((format!("{}:{}", namespace, reference), account.to_string()))
}

/// 网络标识所属的账本类型
pub fn family_of(network: &str) -> Option<LedgerFamily> {
    match network.split(':').next()? {
        "hedera" => Some(LedgerFamily::Hedera),
        "eip155" => Some(LedgerFamily::Evm),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_hedera() {
        assert_eq!(
            normalize_network(LedgerFamily::Hedera, "testnet").as_deref(),
            Some("hedera:testnet")
        );
        assert_eq!(
            normalize_network(LedgerFamily::Hedera, "hedera:MAINNET").as_deref(),
            Some("hedera:mainnet")
        );
        assert!(normalize_network(LedgerFamily::Hedera, "ropsten").is_none());
    }

    #[test]
    fn test_normalize_evm() {
        assert_eq!(
            normalize_network(LedgerFamily::Evm, "0x128").as_deref(),
            Some("eip155:296")
        );
        assert_eq!(
            normalize_network(LedgerFamily::Evm, "eip155:1").as_deref(),
            Some("eip155:1")
        );
        assert_eq!(evm_chain_id("eip155:296"), Some(296));
    }

    #[test]
    fn test_parse_caip_account() {
        let (network, account) = parse_caip_account("hedera:testnet:0.0.1234").unwrap();
        assert_eq!(network, "hedera:testnet");
        assert_eq!(account, "0.0.1234");
        assert!(parse_caip_account("0.0.1234").is_none());
        assert_eq!(family_of(&network), Some(LedgerFamily::Hedera));
    }
}
