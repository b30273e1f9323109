//! 钱包提供方注册表
//!
//! 静态描述系统支持的每一个钱包产品：账本类型、配对协议、检测线索、安装链接。
//! 启动时加载一次，之后只读。

use serde::{Deserialize, Serialize};

/// 账本类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerFamily {
    Hedera,
    Evm,
}

impl LedgerFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hedera => "hedera",
            Self::Evm => "evm",
        }
    }
}

/// 配对协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingProtocol {
    /// 直接调用扩展的账户入口，秒级完成
    Direct,
    /// 通过中继通道配对，等待异步审批事件
    Relay,
    /// 交给连接器库完成配对，连接器发出配对事件
    Broker,
}

impl PairingProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Relay => "relay",
            Self::Broker => "broker",
        }
    }
}

/// 环境探测线索，按顺序尝试
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetectionHint {
    /// 扩展注入的固定全局对象
    Global { name: String },
    /// 共享全局对象上带有的身份标记（如 `ethereum.isMetaMask`）
    GlobalFlag { name: String, flag: String },
    /// 多钱包代理列表中携带该标记的条目
    Broker { flag: String },
    /// 能力形状启发式：具备全部方法或全部状态字段
    Capability {
        methods: Vec<String>,
        fields: Vec<String>,
    },
}

/// 钱包返回交易标识的形状，决定使用哪个响应适配器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseShape {
    /// `transactionId` / `receipt.transactionId` 等 Hedera 风格字段
    HederaReceipt,
    /// 直接返回 `0x` 交易哈希，或 `hash` / `transactionHash` 字段
    EvmHash,
}

/// 钱包调用面（方法名因产品而异）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSurface {
    /// 会弹出授权的连接入口；中继类钱包经中继配对，没有该入口
    pub connect_method: Option<String>,
    /// 静默查询当前账户，用于恢复会话时校验
    pub accounts_method: Option<String>,
    /// 链ID查询（EVM）
    pub chain_method: Option<String>,
    pub disconnect_method: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub id: String,
    pub display_name: String,
    pub network: LedgerFamily,
    pub protocol: PairingProtocol,
    pub detection_hints: Vec<DetectionHint>,
    pub install_url: String,
    pub call_surface: CallSurface,
    pub response_shape: ResponseShape,
}

/// 钱包注册表
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    descriptors: Vec<ProviderDescriptor>,
}

impl ProviderRegistry {
    pub fn new(descriptors: Vec<ProviderDescriptor>) -> Self {
        Self { descriptors }
    }

    /// 内置的钱包列表
    pub fn builtin() -> Self {
        Self::new(vec![
            ProviderDescriptor {
                id: "hashpack".into(),
                display_name: "HashPack".into(),
                network: LedgerFamily::Hedera,
                protocol: PairingProtocol::Relay,
                detection_hints: vec![
                    DetectionHint::Global {
                        name: "hashpack".into(),
                    },
                    DetectionHint::Broker {
                        flag: "isHashPack".into(),
                    },
                ],
                install_url: "https://www.hashpack.app/download".into(),
                call_surface: CallSurface {
                    connect_method: None,
                    accounts_method: None,
                    chain_method: None,
                    disconnect_method: None,
                },
                response_shape: ResponseShape::HederaReceipt,
            },
            ProviderDescriptor {
                id: "blade".into(),
                display_name: "Blade Wallet".into(),
                network: LedgerFamily::Hedera,
                protocol: PairingProtocol::Direct,
                detection_hints: vec![
                    DetectionHint::Global {
                        name: "bladeWallet".into(),
                    },
                    DetectionHint::Broker {
                        flag: "isBlade".into(),
                    },
                ],
                install_url: "https://bladewallet.io".into(),
                call_surface: CallSurface {
                    connect_method: Some("hedera_requestAccounts".into()),
                    accounts_method: Some("hedera_getAccounts".into()),
                    chain_method: None,
                    disconnect_method: Some("hedera_disconnect".into()),
                },
                response_shape: ResponseShape::HederaReceipt,
            },
            ProviderDescriptor {
                id: "kabila".into(),
                display_name: "Kabila".into(),
                network: LedgerFamily::Hedera,
                protocol: PairingProtocol::Broker,
                detection_hints: vec![
                    DetectionHint::Global {
                        name: "kabila".into(),
                    },
                    DetectionHint::Broker {
                        flag: "isKabila".into(),
                    },
                ],
                install_url: "https://wallet.kabila.app".into(),
                call_surface: CallSurface {
                    connect_method: Some("connector_connect".into()),
                    accounts_method: Some("connector_getAccounts".into()),
                    chain_method: None,
                    disconnect_method: Some("connector_disconnect".into()),
                },
                response_shape: ResponseShape::HederaReceipt,
            },
            ProviderDescriptor {
                id: "metamask".into(),
                display_name: "MetaMask".into(),
                network: LedgerFamily::Evm,
                protocol: PairingProtocol::Direct,
                detection_hints: vec![
                    DetectionHint::GlobalFlag {
                        name: "ethereum".into(),
                        flag: "isMetaMask".into(),
                    },
                    DetectionHint::Broker {
                        flag: "isMetaMask".into(),
                    },
                ],
                install_url: "https://metamask.io/download".into(),
                call_surface: evm_call_surface(),
                response_shape: ResponseShape::EvmHash,
            },
            ProviderDescriptor {
                id: "injected".into(),
                display_name: "Browser Wallet".into(),
                network: LedgerFamily::Evm,
                protocol: PairingProtocol::Direct,
                detection_hints: vec![DetectionHint::Capability {
                    methods: vec!["request".into(), "on".into()],
                    fields: vec![
                        "isConnected".into(),
                        "selectedAddress".into(),
                        "chainId".into(),
                    ],
                }],
                install_url: "https://ethereum.org/wallets".into(),
                call_surface: evm_call_surface(),
                response_shape: ResponseShape::EvmHash,
            },
        ])
    }

    pub fn list_known(&self) -> &[ProviderDescriptor] {
        &self.descriptors
    }

    pub fn get(&self, id: &str) -> Option<&ProviderDescriptor> {
        self.descriptors.iter().find(|d| d.id == id)
    }
}

fn evm_call_surface() -> CallSurface {
    CallSurface {
        connect_method: Some("eth_requestAccounts".into()),
        accounts_method: Some("eth_accounts".into()),
        chain_method: Some("eth_chainId".into()),
        disconnect_method: None,
    }
}
