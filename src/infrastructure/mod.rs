pub mod environment;
pub mod event_bus;
pub mod logging;
pub mod probe;
pub mod relay;
pub mod session_store;
