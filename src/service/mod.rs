pub mod pairing;
pub mod provider_detector;
pub mod response_adapter;
pub mod session_manager;
pub mod signing_dispatcher;
pub mod transaction_builder;
pub mod wallet_service;

pub use provider_detector::{DetectedProvider, DetectionMethod, ProviderDetector};
pub use session_manager::{SessionChannel, SessionHandle, SessionManager};
pub use signing_dispatcher::SigningDispatcher;
pub use transaction_builder::TransactionBuilder;
pub use wallet_service::WalletService;
