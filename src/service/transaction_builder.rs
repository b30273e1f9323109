//! 铸造交易构建器
//!
//! 把铸造请求构造成未签名、已绑定付费方的交易，并按配对协议包装成钱包请求。
//! - Hedera：`TokenMint` 交易体的 protobuf 编码
//! - EVM：`mint(address,string)` 调用的 EIP-1559 未签名 RLP
//!
//! 付费方必须是当前会话账户，平台不持有任何私钥。
//! 同一请求两次构建只有交易标识（有效起始时间）不同。

use std::sync::Mutex;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use protobuf::CodedOutputStream;
use rlp::RlpStream;
use serde_json::json;
use sha3::{Digest, Keccak256};
use uuid::Uuid;

use crate::{
    config::LedgerConfig,
    domain::{
        LedgerFamily, MintRequest, PairingProtocol, Session, TransactionEnvelope, WalletRequest,
        METADATA_POINTER_MAX_BYTES,
    },
    error::{WalletError, WalletResult},
    utils::{
        account_validator::{AccountValidator, EntityId},
        network::{evm_chain_id, family_of},
    },
};

const NANOS_PER_SECOND: i128 = 1_000_000_000;

/// EIP-1559 交易类型前缀
const EIP1559_TX_TYPE: u8 = 0x02;

/// Hedera protobuf 字段号
mod field {
    pub const TIMESTAMP_SECONDS: u32 = 1;
    pub const TIMESTAMP_NANOS: u32 = 2;

    pub const ENTITY_SHARD: u32 = 1;
    pub const ENTITY_REALM: u32 = 2;
    pub const ENTITY_NUM: u32 = 3;

    pub const TRANSACTION_ID_VALID_START: u32 = 1;
    pub const TRANSACTION_ID_ACCOUNT: u32 = 2;

    pub const BODY_TRANSACTION_ID: u32 = 1;
    pub const BODY_NODE_ACCOUNT: u32 = 2;
    pub const BODY_FEE: u32 = 3;
    pub const BODY_VALID_DURATION: u32 = 4;
    pub const BODY_MEMO: u32 = 6;
    pub const BODY_TOKEN_MINT: u32 = 37;

    pub const MINT_TOKEN: u32 = 1;
    pub const MINT_METADATA: u32 = 3;

    pub const SIGNED_BODY_BYTES: u32 = 1;
    pub const TRANSACTION_SIGNED_BYTES: u32 = 5;
    pub const TRANSACTION_LIST: u32 = 1;
}

pub struct TransactionBuilder {
    ledger: LedgerConfig,
    node_account: EntityId,
    /// 上一次使用的有效起始时间（纳秒），保证交易ID严格递增
    last_valid_start: Mutex<i128>,
}

impl TransactionBuilder {
    pub fn new(ledger: LedgerConfig) -> WalletResult<Self> {
        let node_account = ledger
            .hedera_node_account_ids
            .first()
            .and_then(|id| AccountValidator::parse_entity_id(id))
            .ok_or_else(|| WalletError::invalid_request("no valid Hedera node account configured"))?;

        Ok(Self {
            ledger,
            node_account,
            last_valid_start: Mutex::new(0),
        })
    }

    /// 为当前会话构建铸造交易
    pub fn build(&self, request: &MintRequest, session: &Session) -> WalletResult<TransactionEnvelope> {
        self.build_with_valid_start(request, session, Utc::now())
    }

    /// 指定有效起始时间构建；时间不晚于上次时自动顺延 1ns
    pub fn build_with_valid_start(
        &self,
        request: &MintRequest,
        session: &Session,
        now: DateTime<Utc>,
    ) -> WalletResult<TransactionEnvelope> {
        validate_pointer(&request.metadata_pointer)?;

        let family = family_of(&session.network).ok_or_else(|| {
            WalletError::invalid_request(format!("unsupported network `{}`", session.network))
        })?;

        let payer_matches = match family {
            LedgerFamily::Hedera => request.payer_account_id == session.account_id,
            LedgerFamily::Evm => request.payer_account_id.eq_ignore_ascii_case(&session.account_id),
        };
        if !payer_matches {
            return Err(WalletError::invalid_request(format!(
                "payer `{}` is not the connected account `{}`",
                request.payer_account_id, session.account_id
            )));
        }

        let envelope = match family {
            LedgerFamily::Hedera => self.build_hedera(request, session, now)?,
            LedgerFamily::Evm => self.build_evm(request, session)?,
        };

        tracing::debug!(
            provider_id = %session.provider_id,
            correlation_id = %envelope.correlation_id,
            transaction_id = %envelope.transaction_id,
            bytes = envelope.raw_bytes.len(),
            "mint transaction built"
        );
        Ok(envelope)
    }

    fn build_hedera(
        &self,
        request: &MintRequest,
        session: &Session,
        now: DateTime<Utc>,
    ) -> WalletResult<TransactionEnvelope> {
        let token = AccountValidator::parse_entity_id(&request.collection_id).ok_or_else(|| {
            WalletError::invalid_request(format!("invalid token id `{}`", request.collection_id))
        })?;
        let payer = AccountValidator::parse_entity_id(&request.payer_account_id).ok_or_else(|| {
            WalletError::invalid_request(format!(
                "invalid payer account `{}`",
                request.payer_account_id
            ))
        })?;

        let (seconds, nanos) = self.next_valid_start(now);
        let valid_start = encode_message(|os| {
            os.write_int64(field::TIMESTAMP_SECONDS, seconds)?;
            if nanos != 0 {
                os.write_int32(field::TIMESTAMP_NANOS, nanos)?;
            }
            Ok(())
        })?;
        let payer_id = encode_entity(&payer)?;
        let transaction_id = encode_message(|os| {
            os.write_bytes(field::TRANSACTION_ID_VALID_START, &valid_start)?;
            os.write_bytes(field::TRANSACTION_ID_ACCOUNT, &payer_id)
        })?;
        let node_account = encode_entity(&self.node_account)?;
        let valid_duration = encode_message(|os| {
            os.write_int64(
                field::TIMESTAMP_SECONDS,
                self.ledger.transaction_valid_duration_secs,
            )
        })?;
        let token_id = encode_entity(&token)?;
        let mint = encode_message(|os| {
            os.write_bytes(field::MINT_TOKEN, &token_id)?;
            os.write_bytes(field::MINT_METADATA, request.metadata_pointer.as_bytes())
        })?;

        let body = encode_message(|os| {
            os.write_bytes(field::BODY_TRANSACTION_ID, &transaction_id)?;
            os.write_bytes(field::BODY_NODE_ACCOUNT, &node_account)?;
            os.write_uint64(field::BODY_FEE, self.ledger.max_transaction_fee_tinybars)?;
            os.write_bytes(field::BODY_VALID_DURATION, &valid_duration)?;
            if !self.ledger.transaction_memo.is_empty() {
                os.write_string(field::BODY_MEMO, &self.ledger.transaction_memo)?;
            }
            os.write_bytes(field::BODY_TOKEN_MINT, &mint)
        })?;

        let signed = encode_message(|os| os.write_bytes(field::SIGNED_BODY_BYTES, &body))?;
        let transaction =
            encode_message(|os| os.write_bytes(field::TRANSACTION_SIGNED_BYTES, &signed))?;

        let encoded_for_wallet = match session.protocol {
            PairingProtocol::Direct => WalletRequest {
                method: "hedera_signAndExecuteTransaction".into(),
                params: json!({
                    "signerAccountId": session.account_id,
                    "transaction": BASE64.encode(&transaction),
                }),
            },
            PairingProtocol::Relay => {
                let list = encode_message(|os| os.write_bytes(field::TRANSACTION_LIST, &transaction))?;
                WalletRequest {
                    method: "hedera_signAndExecuteTransaction".into(),
                    params: json!({
                        "signerAccountId": session.caip_account(),
                        "transactionList": BASE64.encode(&list),
                    }),
                }
            }
            PairingProtocol::Broker => WalletRequest {
                method: "hedera_executeTransaction".into(),
                params: json!({ "transaction": hex::encode(&transaction) }),
            },
        };

        Ok(TransactionEnvelope {
            raw_bytes: transaction,
            encoded_for_wallet,
            correlation_id: Uuid::new_v4().to_string(),
            transaction_id: format!("{}@{}.{:09}", request.payer_account_id, seconds, nanos),
        })
    }

    fn build_evm(&self, request: &MintRequest, session: &Session) -> WalletResult<TransactionEnvelope> {
        let contract = AccountValidator::evm_address_bytes(&request.collection_id).ok_or_else(|| {
            WalletError::invalid_request(format!(
                "invalid collection contract `{}`",
                request.collection_id
            ))
        })?;
        let recipient = AccountValidator::evm_address_bytes(&request.payer_account_id)
            .ok_or_else(|| {
                WalletError::invalid_request(format!(
                    "invalid payer address `{}`",
                    request.payer_account_id
                ))
            })?;
        let chain_id = evm_chain_id(&session.network).ok_or_else(|| {
            WalletError::invalid_request(format!("no chain id in network `{}`", session.network))
        })?;

        let data = mint_calldata(&recipient, &request.metadata_pointer);

        // 未签名 EIP-1559：nonce 由钱包分配，这里占位 0
        let mut stream = RlpStream::new_list(9);
        stream.append(&chain_id);
        stream.append(&0u64);
        stream.append(&self.ledger.evm_max_priority_fee_per_gas);
        stream.append(&self.ledger.evm_max_fee_per_gas);
        stream.append(&self.ledger.evm_gas_limit);
        stream.append(&contract.to_vec());
        stream.append(&0u64);
        stream.append(&data);
        stream.begin_list(0);

        let mut raw_bytes = vec![EIP1559_TX_TYPE];
        raw_bytes.extend_from_slice(&stream.out());

        let correlation_id = Uuid::new_v4().to_string();
        let encoded_for_wallet = WalletRequest {
            method: "eth_sendTransaction".into(),
            params: json!([{
                "from": request.payer_account_id,
                "to": request.collection_id,
                "data": format!("0x{}", hex::encode(&data)),
                "value": "0x0",
                "gas": format!("0x{:x}", self.ledger.evm_gas_limit),
                "maxFeePerGas": format!("0x{:x}", self.ledger.evm_max_fee_per_gas),
                "maxPriorityFeePerGas": format!("0x{:x}", self.ledger.evm_max_priority_fee_per_gas),
                "chainId": format!("0x{:x}", chain_id),
            }]),
        };

        Ok(TransactionEnvelope {
            raw_bytes,
            encoded_for_wallet,
            transaction_id: correlation_id.clone(),
            correlation_id,
        })
    }

    fn next_valid_start(&self, now: DateTime<Utc>) -> (i64, i32) {
        let candidate =
            now.timestamp() as i128 * NANOS_PER_SECOND + now.timestamp_subsec_nanos() as i128;
        let mut last = self
            .last_valid_start
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let next = candidate.max(*last + 1);
        *last = next;
        (
            (next / NANOS_PER_SECOND) as i64,
            (next % NANOS_PER_SECOND) as i32,
        )
    }
}

/// 元数据指针只能是短定位串，元数据本体在链下
fn validate_pointer(pointer: &str) -> WalletResult<()> {
    if pointer.trim().is_empty() {
        return Err(WalletError::invalid_request("metadata pointer is empty"));
    }
    let size = pointer.len();
    if size > METADATA_POINTER_MAX_BYTES {
        return Err(WalletError::PayloadTooLarge {
            size,
            limit: METADATA_POINTER_MAX_BYTES,
        });
    }
    Ok(())
}

fn encode_message<F>(write: F) -> WalletResult<Vec<u8>>
where
    F: FnOnce(&mut CodedOutputStream<'_>) -> protobuf::Result<()>,
{
    let mut buf = Vec::new();
    {
        let mut os = CodedOutputStream::vec(&mut buf);
        write(&mut os)
            .and_then(|_| os.flush())
            .map_err(|e| WalletError::invalid_request(format!("failed to encode transaction: {}", e)))?;
    }
    Ok(buf)
}

/// AccountID / TokenID：三个字段号相同，零值省略
fn encode_entity(id: &EntityId) -> WalletResult<Vec<u8>> {
    encode_message(|os| {
        if id.shard != 0 {
            os.write_int64(field::ENTITY_SHARD, id.shard)?;
        }
        if id.realm != 0 {
            os.write_int64(field::ENTITY_REALM, id.realm)?;
        }
        os.write_int64(field::ENTITY_NUM, id.num)
    })
}

/// `mint(address,string)` 的 ABI 编码
pub(crate) fn mint_calldata(recipient: &[u8; 20], pointer: &str) -> Vec<u8> {
    let selector = &Keccak256::digest(b"mint(address,string)")[..4];
    let pointer = pointer.as_bytes();
    let padded_len = pointer.len().div_ceil(32) * 32;

    let mut data = Vec::with_capacity(4 + 32 * 3 + padded_len);
    data.extend_from_slice(selector);
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(recipient);
    data.extend_from_slice(&abi_word(64));
    data.extend_from_slice(&abi_word(pointer.len() as u64));
    data.extend_from_slice(pointer);
    data.resize(4 + 32 * 3 + padded_len, 0);
    data
}

fn abi_word(value: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}
