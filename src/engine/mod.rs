//! # Embedded MQTT 3.1.1 broker engine
//!
//! A small in-process broker serving plain-TCP MQTT 3.1.1 clients. It exists
//! so a [`BrokerSession`](crate::session::BrokerSession) can own a real,
//! restartable listener without pulling in an external daemon; every engine
//! instance is built for exactly one Start and discarded on Stop.
//!
//! ## Module layout
//!
//! ```text
//! engine/
//! ├── broker.rs      - TCP bind, accept loop, engine control handle
//! ├── connection.rs  - per-client handshake and packet loop
//! └── router.rs      - subscription registry and message fan-out
//! ```
//!
//! ## What it does, and deliberately does not do
//!
//! The engine speaks protocol level 4: CONNECT/CONNACK (empty client ids get
//! an auto-generated one), keep-alive enforcement at 1.5x the negotiated
//! interval, PINGREQ/PINGRESP, SUBSCRIBE/UNSUBSCRIBE with wildcard filters,
//! and PUBLISH at QoS 0, 1 and 2 including the inbound REC/REL/COMP exchange
//! with packet-id de-duplication. Packet encoding and decoding is delegated
//! to `rumqttc::mqttbytes`; no wire format lives here.
//!
//! Outbound deliveries are sent once at the lower of the publish QoS and the
//! subscription grant. There is no retransmit tracking, no retained-message
//! store, no persistence and no ACL. Sessions surface everything observable
//! (client connects, disconnects, accepted publishes) as [`EngineEvent`]s and
//! leave policy to their caller.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::session::Message;

mod broker;
mod connection;
mod router;

pub use broker::{Engine, EngineHandle};

/// Default cap on a single decoded packet.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Publish acceptance predicate, evaluated before fan-out.
pub type AcceptPublish = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// What the engine reports to its owning session.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    /// A client completed the CONNECT handshake.
    ClientConnected { client_id: String },
    /// A client connection ended, gracefully or not.
    ClientDisconnected { client_id: String, reason: String },
    /// An inbound publish passed the accept policy.
    PublishReceived { message: Message },
    /// The accept loop died; the engine is no longer serving.
    Fault { reason: String },
}

/// Listener configuration for one engine instance.
#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub addr: SocketAddr,
    pub max_packet_size: usize,
}

impl EngineSettings {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    pub fn max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }
}
