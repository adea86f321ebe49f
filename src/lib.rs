//! # mqsession
//!
//! MQTT session and event-dispatch core: explicit broker and client
//! lifecycles over an embedded MQTT 3.1.1 engine, with every observable
//! change fanned out as session events.
//!
//! - [`session`] holds [`BrokerSession`] and [`ClientSession`], the two
//!   lifecycle state machines callers own. Nothing reconnects or queues
//!   behind the caller's back.
//! - [`dispatch`] holds [`EventDispatcher`] and [`EventStream`], the
//!   fan-out path between sessions and consumers.
//! - [`engine`] is the embedded broker serving plain-TCP MQTT 3.1.1, with
//!   the wire codec delegated to `rumqttc::mqttbytes`.
//! - [`config`] and [`net`] carry the TOML surface and the small network
//!   helpers the demo binary uses.

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod net;
pub mod session;

pub use dispatch::{DispatchHandle, EventDispatcher, EventStream, SessionEvent, SessionId};
pub use error::SessionError;
pub use rumqttc::QoS;
pub use session::{
    BrokerSession, ClientSession, ConnectionState, Credentials, Endpoint, ListenOptions,
    ListeningInfo, Message, SessionStatus, SubscriptionSet, TlsOptions,
};
