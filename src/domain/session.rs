//! 会话模型与状态机
//!
//! 每个钱包一条状态机：
//! `Idle → Detecting → Pairing → AwaitingApproval → Connected → (Disconnected | Expired | Error)`

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::provider::PairingProtocol;

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Detecting,
    Pairing,
    AwaitingApproval,
    Connected,
    Disconnected,
    Expired,
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Detecting => "detecting",
            Self::Pairing => "pairing",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Expired => "expired",
            Self::Error => "error",
        }
    }

    /// 验证状态转换是否合法
    pub fn can_transition(from: SessionState, to: SessionState) -> bool {
        use SessionState::*;

        matches!(
            (from, to),
            // 正常流程
            (Idle, Detecting)
            | (Detecting, Pairing)
            | (Pairing, AwaitingApproval)
            | (AwaitingApproval, Connected)
            // 直连协议无需等待审批事件
            | (Pairing, Connected)

            // 失败分支
            | (Detecting, Error)
            | (Pairing, Error)
            | (AwaitingApproval, Error)

            // 已连接后的结束方式
            | (Connected, Disconnected)
            | (Connected, Expired)
            | (Connected, Error)

            // 新的配对会取代旧会话
            | (Connected, Detecting)

            // 终止状态可以重新发起
            | (Disconnected, Detecting)
            | (Expired, Detecting)
            | (Error, Detecting)

            // 回到空闲
            | (Disconnected, Idle)
            | (Expired, Idle)
            | (Error, Idle)
            | (Idle, Connected)
        )
    }
}

/// 钱包会话
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub provider_id: String,
    pub account_id: String,
    /// 链 + 环境，如 `hedera:testnet`
    pub network: String,
    /// 中继配对通道标识，仅中继类钱包存在
    pub topic: Option<String>,
    pub protocol: PairingProtocol,
    pub established_at: DateTime<Utc>,
    pub state: SessionState,
    /// 会话代次；被取代的会话发出的事件按代次丢弃
    #[serde(default)]
    pub epoch: u64,
}

impl Session {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.established_at)
    }

    pub fn is_expired(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.age(now) > max_age
    }

    /// CAIP-10 形式的签名账户，中继请求使用
    pub fn caip_account(&self) -> String {
        format!("{}:{}", self.network, self.account_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(established_at: DateTime<Utc>) -> Session {
        Session {
            provider_id: "blade".into(),
            account_id: "0.0.1234".into(),
            network: "hedera:testnet".into(),
            topic: None,
            protocol: PairingProtocol::Direct,
            established_at,
            state: SessionState::Connected,
            epoch: 1,
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        use SessionState::*;
        assert!(SessionState::can_transition(Idle, Detecting));
        assert!(SessionState::can_transition(Detecting, Pairing));
        assert!(SessionState::can_transition(Pairing, AwaitingApproval));
        assert!(SessionState::can_transition(AwaitingApproval, Connected));
        assert!(SessionState::can_transition(Connected, Disconnected));
    }

    #[test]
    fn test_invalid_transitions() {
        use SessionState::*;
        assert!(!SessionState::can_transition(Idle, AwaitingApproval));
        assert!(!SessionState::can_transition(Disconnected, Connected));
        assert!(!SessionState::can_transition(Detecting, Connected));
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let fresh = session(now - Duration::hours(23));
        let stale = session(now - Duration::hours(25));
        assert!(!fresh.is_expired(now, Duration::hours(24)));
        assert!(stale.is_expired(now, Duration::hours(24)));
        assert_eq!(fresh.caip_account(), "hedera:testnet:0.0.1234");
    }
}
