//! chatkey-exchange: per-chat key lifecycle.
//!
//! Creates, delivers, activates, rotates and expires the symmetric key of
//! each one-to-one chat. The durable record store is the source of truth;
//! the relay only shortens the time to activation.

pub mod cache;
pub mod config;
pub mod directory;
pub mod error;
pub mod events;
pub mod http_presence;
pub mod identity;
pub mod poller;
pub mod presence;
pub mod relay;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod ws_relay;

pub use config::ExchangeConfig;
pub use error::ExchangeError;
pub use events::ExchangeEvent;
pub use scheduler::RotationOutcome;
pub use http_presence::HttpPresence;
pub use service::{KeyExchangeService, ServiceDeps};
pub use ws_relay::WsRelay;
