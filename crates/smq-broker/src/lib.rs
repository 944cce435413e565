//! SMQ broker: a publish/subscribe and queue server over TCP/TLS.
//!
//! The broker speaks one of two framings per instance (native SMQ or an
//! MQTT 3.1.1 subset), routes by destination prefix (`/queue/…` competes,
//! everything else fans out) and retains queue messages with no live
//! subscriber in the [`smq_store`] memory-mapped store, replaying them to
//! the next subscriber in publish order.
//!
//! Dependencies are explicit: the readiness [`Multiplexer`] is built by the
//! embedder and handed to [`Broker::start`], so several brokers can share a
//! process.

mod broker;
pub mod client;
pub mod config;
mod connection;
mod delivery;
mod error;
mod mux;
mod retained;
mod subscription;
mod transport;

pub use broker::Broker;
pub use client::{Client, ClientOptions, TlsOptions};
pub use config::Config;
pub use error::BrokerError;
pub use mux::Multiplexer;
