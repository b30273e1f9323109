//! 账户标识验证模块
//!
//! 统一 Hedera 实体ID（shard.realm.num）与 EVM 地址的格式校验

use once_cell::sync::Lazy;
use regex::Regex;

use crate::domain::provider::LedgerFamily;

static HEDERA_ENTITY_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(0|[1-9][0-9]{0,9})\.(0|[1-9][0-9]{0,9})\.(0|[1-9][0-9]{0,18})$")
        .expect("static regex")
});

/// Hedera 实体ID（账户、代币、节点共用同一格式）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityId {
    pub shard: i64,
    pub realm: i64,
    pub num: i64,
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.shard, self.realm, self.num)
    }
}

/// 账户验证器
pub struct AccountValidator;

impl AccountValidator {
    /// 按账本类型验证账户标识
    pub fn validate(family: LedgerFamily, account: &str) -> bool {
        match family {
            LedgerFamily::Hedera => Self::is_hedera_entity_id(account),
            LedgerFamily::Evm => Self::is_evm_address(account),
        }
    }

    pub fn is_hedera_entity_id(value: &str) -> bool {
        Self::parse_entity_id(value).is_some()
    }

    /// 解析 `shard.realm.num`
    pub fn parse_entity_id(value: &str) -> Option<EntityId> {
        let caps = HEDERA_ENTITY_ID.captures(value)?;
        Some(EntityId {
            shard: caps[1].parse().ok()?,
            realm: caps[2].parse().ok()?,
            num: caps[3].parse().ok()?,
        })
    }

    /// 验证EVM地址（支持EIP-55 Checksum）
    pub fn is_evm_address(address: &str) -> bool {
        let Some(hex_part) = address.strip_prefix("0x") else {
            return false;
        };

        if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return false;
        }

        // 全小写或全大写不带校验信息
        let has_upper = hex_part.chars().any(|c| c.is_ascii_uppercase());
        let has_lower = hex_part.chars().any(|c| c.is_ascii_lowercase());
        if has_upper && has_lower {
            return Self::verify_eip55_checksum(hex_part);
        }

        true
    }

    /// 验证EIP-55 Checksum
    /// https://eips.ethereum.org/EIPS/eip-55
    fn verify_eip55_checksum(hex_part: &str) -> bool {
        use sha3::{Digest, Keccak256};

        let hash = Keccak256::digest(hex_part.to_lowercase().as_bytes());

        hex_part.chars().enumerate().all(|(i, ch)| {
            if !ch.is_ascii_alphabetic() {
                return true;
            }
            let hash_byte = hash[i / 2];
            let nibble = if i % 2 == 0 {
                hash_byte >> 4
            } else {
                hash_byte & 0x0f
            };
            ch.is_ascii_uppercase() == (nibble >= 8)
        })
    }

    /// 解析 EVM 地址为 20 字节
    pub fn evm_address_bytes(address: &str) -> Option<[u8; 20]> {
        if !Self::is_evm_address(address) {
            return None;
        }
        let bytes = hex::decode(&address[2..]).ok()?;
        bytes.try_into().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hedera_entity_id() {
        assert!(AccountValidator::is_hedera_entity_id("0.0.1234"));
        assert!(AccountValidator::is_hedera_entity_id("0.0.3"));
        assert!(!AccountValidator::is_hedera_entity_id("0.0"));
        assert!(!AccountValidator::is_hedera_entity_id("0.0.01"));
        assert!(!AccountValidator::is_hedera_entity_id("0.0.12a"));

        let id = AccountValidator::parse_entity_id("1.2.9999").unwrap();
        assert_eq!(id.num, 9999);
        assert_eq!(id.to_string(), "1.2.9999");
    }

    #[test]
    fn test_evm_address() {
        assert!(AccountValidator::is_evm_address(
            "0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed"
        ));
        // EIP-55 规范示例
        assert!(AccountValidator::is_evm_address(
            "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"
        ));
        assert!(!AccountValidator::is_evm_address(
            "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAeD"
        ));
        assert!(!AccountValidator::is_evm_address("0x1234"));
        assert_eq!(
            AccountValidator::evm_address_bytes("0x0000000000000000000000000000000000000001")
                .unwrap()[19],
            1
        );
    }
}
