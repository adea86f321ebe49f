//! # Session layer
//!
//! ## Why This Module Exists
//!
//! Broker and client lifetimes in this crate are deliberately explicit. A
//! session object owns at most one engine or transport at a time, every
//! transition is observable as a [`SessionEvent`](crate::dispatch::SessionEvent),
//! and nothing reconnects or retries behind the caller's back. Commands fail
//! fast when the session is in the wrong state instead of queueing work for
//! a connection that may never come back.
//!
//! Both session kinds share the same shape: a small struct the caller owns,
//! a background task driving the actual I/O, and a watch channel carrying the
//! current [`ConnectionState`] between them.
//!
//! ## Architecture
//!
//! ```text
//! session/
//! ├── broker.rs   - BrokerSession: embedded listener lifecycle
//! ├── client.rs   - ClientSession: rumqttc-backed connector
//! ├── message.rs  - Message and SubscriptionSet
//! └── state.rs    - SessionStatus, ConnectionState, Endpoint
//! ```

pub mod broker;
pub mod client;
pub mod message;
pub mod state;

pub use broker::{BrokerSession, ListenOptions, ListeningInfo};
pub use client::ClientSession;
pub use message::{Message, SubscriptionSet};
pub use state::{ConnectionState, Credentials, Endpoint, SessionStatus, TlsOptions};

#[cfg(test)]
mod tests;
