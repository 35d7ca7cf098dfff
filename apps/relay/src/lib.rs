//! chatkey-relay: low-latency signal relay and presence endpoint.
//!
//! Clients connect over WebSocket and exchange key signals by user id. The
//! relay keeps no durable state; anything it cannot deliver is picked up by
//! clients polling the key record store.

pub mod config;
pub mod connection;
pub mod error;
pub mod handlers;
pub mod router;
pub mod shutdown;
pub mod state;
