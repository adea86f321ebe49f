//! Client session: explicit connect/disconnect wrapper around rumqttc.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS,
    SubscribeReasonCode, TlsConfiguration, Transport,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::dispatch::{DispatchHandle, SessionEvent, SessionId};
use crate::error::SessionError;

use super::message::{Message, SubscriptionSet};
use super::state::{ConnectionState, Endpoint, SessionStatus};

const KEEP_ALIVE: Duration = Duration::from_secs(5);
const ACK_TIMEOUT: Duration = Duration::from_secs(10);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Broker acknowledgements relayed from the driver task to the command side.
/// Commands are serialized through `&mut self` and drain stale notices before
/// issuing, so matching by kind is unambiguous.
#[derive(Clone, Debug)]
enum AckNotice {
    Published(u16),
    Completed(u16),
    Subscribed { pkid: u16, codes: Vec<SubscribeReasonCode> },
    Unsubscribed(u16),
}

/// One MQTT client connection at a time, driven to completion in the open.
///
/// `connect` spins up a fresh transport and returns once the attempt is under
/// way; the outcome arrives as a `StateChanged` event. There is no implicit
/// reconnect and no offline queue: a lost connection leaves the session in
/// `Disconnected` and every command fails fast until the caller connects
/// again. QoS 1 and 2 publishes resolve only when the broker has acked them.
pub struct ClientSession {
    id: SessionId,
    label: String,
    dispatch: DispatchHandle,
    state: Arc<watch::Sender<ConnectionState>>,
    subscriptions: Arc<Mutex<SubscriptionSet>>,
    client: Option<AsyncClient>,
    driver: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    acks: mpsc::UnboundedReceiver<AckNotice>,
}

impl ClientSession {
    /// Creates an idle session. The label doubles as the MQTT client id.
    pub fn new(label: impl Into<String>, dispatch: DispatchHandle) -> Self {
        let (_ack_tx, acks) = mpsc::unbounded_channel();
        Self {
            id: SessionId::next(),
            label: label.into(),
            dispatch,
            state: Arc::new(watch::Sender::new(ConnectionState::default())),
            subscriptions: Arc::new(Mutex::new(SubscriptionSet::new())),
            client: None,
            driver: None,
            cancel: CancellationToken::new(),
            acks,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.state.borrow().status
    }

    /// Snapshot of the live subscriptions.
    pub fn subscriptions(&self) -> SubscriptionSet {
        lock_subscriptions(&self.subscriptions).clone()
    }

    /// Starts a fresh connection attempt against `endpoint`.
    ///
    /// Returns once the transport is under way; `Connected` or `Failed`
    /// arrives as an event. Each attempt builds a clean session: previous
    /// subscriptions do not carry over.
    pub async fn connect(&mut self, endpoint: Endpoint) -> Result<(), SessionError> {
        let status = self.status();
        if !status.accepts_start() {
            return Err(SessionError::AlreadyInProgressError(format!(
                "client session {} is {}",
                self.label, status
            )));
        }
        // A driver from an earlier connection may still be winding down;
        // join it so its final events land before this attempt's.
        if let Some(stale) = self.driver.take() {
            self.cancel.cancel();
            let _ = stale.await;
        }

        let mut options = MqttOptions::new(self.label.clone(), endpoint.host.clone(), endpoint.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        if let Some(credentials) = &endpoint.credentials {
            options.set_credentials(credentials.username.clone(), credentials.password.clone());
        }
        if let Some(tls) = &endpoint.tls {
            let ca = match tokio::fs::read(&tls.ca_file).await {
                Ok(ca) => ca,
                Err(e) => {
                    let error = format!("CA file {}: {}", tls.ca_file.display(), e);
                    self.fail(error.clone());
                    return Err(SessionError::ConnectError(error));
                }
            };
            options.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth: None,
            }));
        }

        let (client, event_loop) = AsyncClient::new(options, 10);
        lock_subscriptions(&self.subscriptions).clear();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        self.acks = ack_rx;
        let cancel = CancellationToken::new();
        self.cancel = cancel.clone();

        info!("Client session {} connecting to {}", self.label, endpoint);
        self.transition(SessionStatus::Connecting, Some(endpoint.clone()), None);

        let driver = Driver {
            session: self.id,
            label: self.label.clone(),
            dispatch: self.dispatch.clone(),
            state: Arc::clone(&self.state),
            subscriptions: Arc::clone(&self.subscriptions),
            acks: ack_tx,
            cancel,
            endpoint,
        };
        self.driver = Some(tokio::spawn(driver.run(event_loop)));
        self.client = Some(client);
        Ok(())
    }

    /// Subscribes and waits for the broker's SUBACK.
    pub async fn subscribe(&mut self, filter: impl Into<String>, qos: QoS) -> Result<(), SessionError> {
        let filter = filter.into();
        let client = self.ensure_connected("subscribe")?.clone();
        self.drain_acks();
        client
            .subscribe(filter.clone(), qos)
            .await
            .map_err(|e| SessionError::EngineFault(format!("subscribe {}: {}", filter, e)))?;

        let (pkid, codes) = self
            .await_ack("SUBACK", |notice| match notice {
                AckNotice::Subscribed { pkid, codes } => Some((pkid, codes)),
                _ => None,
            })
            .await
            .map_err(SessionError::EngineFault)?;
        if codes.iter().any(|code| matches!(code, SubscribeReasonCode::Failure)) {
            return Err(SessionError::EngineFault(format!(
                "broker rejected subscription to {:?}",
                filter
            )));
        }
        let granted = match codes.first() {
            Some(SubscribeReasonCode::Success(granted)) => *granted,
            _ => qos,
        };
        lock_subscriptions(&self.subscriptions).insert(filter.clone(), granted);
        debug!(
            "Client session {} subscribed to {:?} at {:?} (pkid {})",
            self.label, filter, granted, pkid
        );
        Ok(())
    }

    /// Unsubscribes and waits for the broker's UNSUBACK.
    pub async fn unsubscribe(&mut self, filter: impl Into<String>) -> Result<(), SessionError> {
        let filter = filter.into();
        let client = self.ensure_connected("unsubscribe")?.clone();
        self.drain_acks();
        client
            .unsubscribe(filter.clone())
            .await
            .map_err(|e| SessionError::EngineFault(format!("unsubscribe {}: {}", filter, e)))?;
        self.await_ack("UNSUBACK", |notice| match notice {
            AckNotice::Unsubscribed(pkid) => Some(pkid),
            _ => None,
        })
        .await
        .map_err(SessionError::EngineFault)?;
        lock_subscriptions(&self.subscriptions).remove(&filter);
        debug!("Client session {} unsubscribed from {:?}", self.label, filter);
        Ok(())
    }

    /// Publishes one message. QoS 0 resolves once handed to the transport;
    /// QoS 1 and 2 resolve when the broker's PUBACK or PUBCOMP arrives.
    /// There is no offline queue: publishing while not connected fails.
    pub async fn publish(
        &mut self,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), SessionError> {
        let topic = topic.into();
        let payload = payload.into();
        let size = payload.len();
        let client = self.ensure_connected("publish")?.clone();
        self.drain_acks();
        client
            .publish(topic.clone(), qos, retain, payload)
            .await
            .map_err(|e| SessionError::PublishError(format!("publish to {}: {}", topic, e)))?;

        match qos {
            QoS::AtMostOnce => {}
            QoS::AtLeastOnce => {
                let pkid = self
                    .await_ack("PUBACK", |notice| match notice {
                        AckNotice::Published(pkid) => Some(pkid),
                        _ => None,
                    })
                    .await
                    .map_err(SessionError::PublishError)?;
                trace!("Publish to {} acked (pkid {})", topic, pkid);
            }
            QoS::ExactlyOnce => {
                let pkid = self
                    .await_ack("PUBCOMP", |notice| match notice {
                        AckNotice::Completed(pkid) => Some(pkid),
                        _ => None,
                    })
                    .await
                    .map_err(SessionError::PublishError)?;
                trace!("Publish to {} completed (pkid {})", topic, pkid);
            }
        }
        debug!(
            "Client session {} published {} bytes to {}",
            self.label, size, topic
        );
        Ok(())
    }

    /// Disconnects and always lands in `Idle`, tearing the driver down
    /// forcefully if the graceful path stalls. Safe to call when already
    /// disconnected.
    pub async fn disconnect(&mut self) {
        if self.status() == SessionStatus::Idle && self.driver.is_none() {
            debug!("Client session {} disconnect ignored: already idle", self.label);
            return;
        }
        let endpoint = self.state.borrow().endpoint.clone();
        self.transition(SessionStatus::Disconnecting, endpoint, None);

        if let Some(client) = self.client.take() {
            if let Err(e) = client.disconnect().await {
                debug!(
                    "Client session {} disconnect request failed: {}",
                    self.label, e
                );
            }
        }
        if let Some(mut driver) = self.driver.take() {
            match tokio::time::timeout(DISCONNECT_TIMEOUT, &mut driver).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(
                        "Client session {} driver did not wind down, cancelling",
                        self.label
                    );
                    self.cancel.cancel();
                    let _ = driver.await;
                }
            }
        }
        lock_subscriptions(&self.subscriptions).clear();
        self.transition(SessionStatus::Idle, None, None);
        info!("Client session {} disconnected", self.label);
    }

    fn ensure_connected(&self, action: &str) -> Result<&AsyncClient, SessionError> {
        if self.status() != SessionStatus::Connected {
            return Err(SessionError::NotConnectedError(format!(
                "{} requires a connected session (currently {})",
                action,
                self.status()
            )));
        }
        self.client.as_ref().ok_or_else(|| {
            SessionError::NotConnectedError(format!("{}: no active transport", action))
        })
    }

    /// Leftover notices from an earlier command or connection must not be
    /// mistaken for the answer to the next one.
    fn drain_acks(&mut self) {
        while let Ok(stale) = self.acks.try_recv() {
            trace!("Client session {} discarding stale {:?}", self.label, stale);
        }
    }

    async fn await_ack<T>(
        &mut self,
        what: &str,
        mut pick: impl FnMut(AckNotice) -> Option<T>,
    ) -> Result<T, String> {
        let waited = tokio::time::timeout(ACK_TIMEOUT, async {
            while let Some(notice) = self.acks.recv().await {
                if let Some(value) = pick(notice) {
                    return Some(value);
                }
            }
            None
        })
        .await;
        match waited {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(format!("connection lost while waiting for {}", what)),
            Err(_) => Err(format!("timed out waiting for {}", what)),
        }
    }

    fn transition(&self, status: SessionStatus, endpoint: Option<Endpoint>, last_error: Option<String>) {
        self.state.send_modify(|state| {
            state.status = status;
            state.endpoint = endpoint;
            state.last_error = last_error;
        });
        self.dispatch.post(SessionEvent::StateChanged {
            session: self.id,
            state: self.state.borrow().clone(),
        });
    }

    /// Attempt refused before the driver exists: the event carries `Failed`,
    /// the stored state returns to `Idle` with the error retained, so the
    /// session stays startable.
    fn fail(&self, error: String) {
        self.state.send_modify(|state| {
            state.status = SessionStatus::Idle;
            state.endpoint = None;
            state.last_error = Some(error.clone());
        });
        self.dispatch.post(SessionEvent::StateChanged {
            session: self.id,
            state: ConnectionState {
                status: SessionStatus::Failed,
                endpoint: None,
                last_error: Some(error),
            },
        });
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn lock_subscriptions(subscriptions: &Mutex<SubscriptionSet>) -> MutexGuard<'_, SubscriptionSet> {
    // Guard holders never panic, so a poisoned lock still has valid data.
    subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Background task owning the rumqttc event loop for one connection.
struct Driver {
    session: SessionId,
    label: String,
    dispatch: DispatchHandle,
    state: Arc<watch::Sender<ConnectionState>>,
    subscriptions: Arc<Mutex<SubscriptionSet>>,
    acks: mpsc::UnboundedSender<AckNotice>,
    cancel: CancellationToken,
    endpoint: Endpoint,
}

impl Driver {
    async fn run(self, mut event_loop: EventLoop) {
        let mut connected = false;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Client session {} driver cancelled", self.label);
                    break;
                }
                polled = event_loop.poll() => match polled {
                    Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            connected = true;
                            info!("Client session {} connected to {}", self.label, self.endpoint);
                            self.transition(
                                SessionStatus::Connected,
                                Some(self.endpoint.clone()),
                                None,
                            );
                        } else {
                            self.fail(format!("broker refused connection: {:?}", ack.code));
                            break;
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        let wanted = lock_subscriptions(&self.subscriptions)
                            .matches(&publish.topic);
                        if wanted {
                            let message = Message::new(
                                publish.topic,
                                publish.payload,
                                publish.qos,
                                publish.retain,
                            );
                            self.dispatch.post(SessionEvent::MessageReceived {
                                session: self.session,
                                message,
                            });
                        } else {
                            trace!(
                                "Client session {} ignoring publish on {}",
                                self.label,
                                publish.topic
                            );
                        }
                    }
                    Ok(Event::Incoming(Incoming::SubAck(suback))) => {
                        let _ = self.acks.send(AckNotice::Subscribed {
                            pkid: suback.pkid,
                            codes: suback.return_codes,
                        });
                    }
                    Ok(Event::Incoming(Incoming::UnsubAck(unsuback))) => {
                        let _ = self.acks.send(AckNotice::Unsubscribed(unsuback.pkid));
                    }
                    Ok(Event::Incoming(Incoming::PubAck(puback))) => {
                        let _ = self.acks.send(AckNotice::Published(puback.pkid));
                    }
                    Ok(Event::Incoming(Incoming::PubComp(pubcomp))) => {
                        let _ = self.acks.send(AckNotice::Completed(pubcomp.pkid));
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        // Requested teardown; disconnect() owns the state
                        // transitions from here.
                        debug!("Client session {} sent DISCONNECT", self.label);
                        break;
                    }
                    Ok(event) => {
                        trace!("Client session {} event {:?}", self.label, event);
                    }
                    Err(e) => {
                        let reason = e.to_string();
                        if connected {
                            warn!("Client session {} connection lost: {}", self.label, reason);
                            self.transition(
                                SessionStatus::Disconnected,
                                Some(self.endpoint.clone()),
                                Some(reason),
                            );
                        } else {
                            warn!("Client session {} connect failed: {}", self.label, reason);
                            self.fail(reason);
                        }
                        break;
                    }
                }
            }
        }
    }

    fn transition(&self, status: SessionStatus, endpoint: Option<Endpoint>, last_error: Option<String>) {
        self.state.send_modify(|state| {
            state.status = status;
            state.endpoint = endpoint;
            state.last_error = last_error;
        });
        self.dispatch.post(SessionEvent::StateChanged {
            session: self.session,
            state: self.state.borrow().clone(),
        });
    }

    /// Failed attempt: the event carries `Failed`, the stored state returns
    /// to `Idle` with the error retained, so the session stays startable.
    fn fail(&self, error: String) {
        self.state.send_modify(|state| {
            state.status = SessionStatus::Idle;
            state.endpoint = None;
            state.last_error = Some(error.clone());
        });
        self.dispatch.post(SessionEvent::StateChanged {
            session: self.session,
            state: ConnectionState {
                status: SessionStatus::Failed,
                endpoint: None,
                last_error: Some(error),
            },
        });
    }
}
