pub mod account_validator;
pub mod network;

pub use account_validator::{AccountValidator, EntityId};
