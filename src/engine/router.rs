//! Subscription registry and publish fan-out.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rumqttc::mqttbytes::v4::{SubscribeFilter, SubscribeReasonCode};
use rumqttc::mqttbytes::{self, QoS};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::session::Message;

/// One delivery queued for a subscriber, at its effective QoS.
#[derive(Clone, Debug)]
pub(crate) struct Outbound {
    pub message: Message,
    pub qos: QoS,
}

/// A connection's registration with the router. Cloned into the connection
/// task so cleanup can prove it still owns the registry entry.
#[derive(Clone)]
pub(crate) struct ClientHandle {
    pub client_id: String,
    pub tx: mpsc::Sender<Outbound>,
}

struct ClientEntry {
    tx: mpsc::Sender<Outbound>,
    subscriptions: HashMap<String, QoS>,
}

/// Tracks connected clients and their filters, and fans publishes out to
/// every match. Shared across all connection tasks of one engine.
pub(crate) struct Router {
    clients: Mutex<HashMap<String, ClientEntry>>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn lock_clients(&self) -> MutexGuard<'_, HashMap<String, ClientEntry>> {
        // Guard holders never panic, so a poisoned lock still has valid data.
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a connection. A live connection under the same client id is
    /// superseded: its entry is replaced and it stops receiving deliveries.
    pub fn register(&self, handle: &ClientHandle) {
        let replaced = self.lock_clients().insert(
            handle.client_id.clone(),
            ClientEntry {
                tx: handle.tx.clone(),
                subscriptions: HashMap::new(),
            },
        );
        if replaced.is_some() {
            debug!("Client {} superseded an existing connection", handle.client_id);
        }
    }

    /// Removes the entry, but only if this handle still owns it. A superseded
    /// connection cleaning up late must not evict its successor.
    pub fn disconnect(&self, handle: &ClientHandle) {
        let mut clients = self.lock_clients();
        if let Some(entry) = clients.get(&handle.client_id) {
            if entry.tx.same_channel(&handle.tx) {
                clients.remove(&handle.client_id);
            }
        }
    }

    /// Records the requested filters and returns the per-filter grants for
    /// the SUBACK, in request order. Invalid filters are granted `Failure`;
    /// a repeated filter overwrites its previous QoS.
    pub fn subscribe(&self, client_id: &str, filters: &[SubscribeFilter]) -> Vec<SubscribeReasonCode> {
        let mut clients = self.lock_clients();
        filters
            .iter()
            .map(|filter| {
                if !mqttbytes::valid_filter(&filter.path) {
                    warn!("Client {} requested invalid filter {:?}", client_id, filter.path);
                    return SubscribeReasonCode::Failure;
                }
                match clients.get_mut(client_id) {
                    Some(entry) => {
                        entry.subscriptions.insert(filter.path.clone(), filter.qos);
                        SubscribeReasonCode::Success(filter.qos)
                    }
                    None => SubscribeReasonCode::Failure,
                }
            })
            .collect()
    }

    pub fn unsubscribe(&self, client_id: &str, topics: &[String]) {
        if let Some(entry) = self.lock_clients().get_mut(client_id) {
            for topic in topics {
                entry.subscriptions.remove(topic);
            }
        }
    }

    /// Fans one publish out to every subscriber with a matching filter. Each
    /// client receives the message at most once, at the lower of the publish
    /// QoS and its highest matching grant. Senders are collected under the
    /// lock but sent outside it; a full queue drops the delivery rather than
    /// stalling the publisher.
    pub fn route(&self, message: &Message) {
        let deliveries: Vec<(String, mpsc::Sender<Outbound>, QoS)> = {
            let clients = self.lock_clients();
            clients
                .iter()
                .filter_map(|(client_id, entry)| {
                    best_grant(&entry.subscriptions, message.topic()).map(|grant| {
                        (
                            client_id.clone(),
                            entry.tx.clone(),
                            effective_qos(message.qos(), grant),
                        )
                    })
                })
                .collect()
        };

        for (client_id, tx, qos) in deliveries {
            trace!("Routing {} to {} at {:?}", message.topic(), client_id, qos);
            let outbound = Outbound {
                message: message.clone(),
                qos,
            };
            if tx.try_send(outbound).is_err() {
                warn!(
                    "Dropping delivery of {} to {}: queue full or closed",
                    message.topic(),
                    client_id
                );
            }
        }
    }
}

/// Highest QoS among the filters matching `topic`, if any match.
fn best_grant(subscriptions: &HashMap<String, QoS>, topic: &str) -> Option<QoS> {
    let mut best: Option<QoS> = None;
    for (filter, qos) in subscriptions {
        if mqttbytes::matches(topic, filter) {
            best = Some(match best {
                Some(current) if current as u8 >= *qos as u8 => current,
                _ => *qos,
            });
        }
    }
    best
}

/// Delivery QoS is the lower of publish QoS and subscription grant.
fn effective_qos(publish: QoS, grant: QoS) -> QoS {
    if (publish as u8) <= (grant as u8) {
        publish
    } else {
        grant
    }
}
