//! Broker session: lifecycle wrapper around the embedded engine.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatch::{DispatchHandle, SessionEvent, SessionId};
use crate::engine::{AcceptPublish, Engine, EngineEvent, EngineHandle, EngineSettings};
use crate::error::SessionError;
use crate::net;

use super::message::Message;
use super::state::{ConnectionState, Endpoint, SessionStatus};

/// How long the occupied-port probe waits for the resident listener.
const PROBE_TIMEOUT: Duration = Duration::from_millis(400);

/// Listener settings for one [`BrokerSession::start`] call.
#[derive(Clone, Debug)]
pub struct ListenOptions {
    pub port: u16,
    pub bind: String,
    pub tls: bool,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            port: 1883,
            bind: "0.0.0.0".to_string(),
            tls: false,
        }
    }
}

impl ListenOptions {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    pub fn bind(mut self, bind: impl Into<String>) -> Self {
        self.bind = bind.into();
        self
    }
}

/// Where a started broker session is reachable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListeningInfo {
    pub local_addr: SocketAddr,
}

/// Owns one embedded engine at a time and reports its lifecycle through the
/// dispatcher. Every successful [`start`](Self::start) builds a fresh engine;
/// [`stop`](Self::stop) discards it, so a session can be started and stopped
/// repeatedly without accumulating state.
pub struct BrokerSession {
    id: SessionId,
    label: String,
    dispatch: DispatchHandle,
    state: Arc<watch::Sender<ConnectionState>>,
    accept: Arc<RwLock<AcceptPublish>>,
    engine: Option<EngineHandle>,
    forwarder: Option<JoinHandle<()>>,
    listening: Option<ListeningInfo>,
    adopted: bool,
}

impl BrokerSession {
    /// Creates an idle session. No sockets are touched until [`start`](Self::start).
    pub fn new(label: impl Into<String>, dispatch: DispatchHandle) -> Self {
        let accept: AcceptPublish = Arc::new(|_: &Message| true);
        Self {
            id: SessionId::next(),
            label: label.into(),
            dispatch,
            state: Arc::new(watch::Sender::new(ConnectionState::default())),
            accept: Arc::new(RwLock::new(accept)),
            engine: None,
            forwarder: None,
            listening: None,
            adopted: false,
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

    /// Listener address while serving, resolved port included.
    pub fn listening(&self) -> Option<ListeningInfo> {
        self.listening
    }

    /// Replaces the publish acceptance policy. Takes effect for the next
    /// inbound publish, also on an engine that is already serving. Rejected
    /// publishes are acked at the wire but never surfaced or fanned out.
    pub fn set_accept_publish<F>(&self, policy: F)
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        let mut guard = self.accept.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(policy);
    }

    /// Binds and serves a fresh engine.
    ///
    /// If the port is already occupied by something that accepts TCP
    /// connections, the session adopts that external listener instead of
    /// failing: it reports `Connected` and later stops without touching it.
    /// Any other bind failure is a [`SessionError::BindError`].
    pub async fn start(&mut self, options: ListenOptions) -> Result<ListeningInfo, SessionError> {
        let status = self.status();
        if !status.accepts_start() {
            return Err(SessionError::AlreadyInProgressError(format!(
                "broker session {} is {}",
                self.label, status
            )));
        }
        // An engine fault leaves the old handle behind; stop its remaining
        // connection tasks before a fresh engine takes over.
        if let Some(stale) = self.engine.take() {
            stale.cancel();
        }
        if options.tls {
            // The config surface carries a TLS listener but the engine does
            // not terminate TLS. Refuse instead of serving plaintext.
            let error = "TLS listener configured but not supported".to_string();
            self.fail(error.clone());
            return Err(SessionError::BindError(error));
        }
        let ip: IpAddr = match options.bind.parse() {
            Ok(ip) => ip,
            Err(e) => {
                let error = format!("invalid bind address {:?}: {}", options.bind, e);
                self.fail(error.clone());
                return Err(SessionError::BindError(error));
            }
        };
        let addr = SocketAddr::new(ip, options.port);

        self.transition(SessionStatus::Connecting, None);

        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        match Engine::bind(EngineSettings::new(addr), engine_tx, Arc::clone(&self.accept)).await {
            Ok(engine) => {
                let local_addr = engine.local_addr();
                self.engine = Some(engine.serve());
                self.forwarder = Some(tokio::spawn(forward_events(
                    self.id,
                    engine_rx,
                    self.dispatch.clone(),
                    Arc::clone(&self.state),
                )));
                self.adopted = false;
                let info = ListeningInfo { local_addr };
                self.listening = Some(info);
                let endpoint = Endpoint::new(options.bind.clone(), local_addr.port());
                self.transition(SessionStatus::Connected, Some(endpoint));
                info!("Broker session {} listening on {}", self.label, local_addr);
                Ok(info)
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                warn!(
                    "Broker session {} found {} occupied, probing resident listener",
                    self.label, addr
                );
                match net::probe_listener(addr, PROBE_TIMEOUT).await {
                    Ok(peer) => {
                        warn!(
                            "Broker session {} adopting external listener at {}",
                            self.label, peer
                        );
                        self.adopted = true;
                        let info = ListeningInfo { local_addr: peer };
                        self.listening = Some(info);
                        let endpoint = Endpoint::new(options.bind.clone(), peer.port());
                        self.transition(SessionStatus::Connected, Some(endpoint));
                        Ok(info)
                    }
                    Err(probe) => {
                        let error =
                            format!("address {} in use and probe failed: {}", addr, probe);
                        self.fail(error.clone());
                        Err(SessionError::BindError(error))
                    }
                }
            }
            Err(e) => {
                let error = format!("bind {} failed: {}", addr, e);
                self.fail(error.clone());
                Err(SessionError::BindError(error))
            }
        }
    }

    /// Stops the engine and returns once its tasks have wound down. Safe to
    /// call in any state: a stop on an already idle session is a no-op, a
    /// stop on an adopted external listener only updates session state, and
    /// a stop after a `start` future was dropped at an await point clears
    /// the half-made state so the session is startable again.
    pub async fn stop(&mut self) {
        if self.status() == SessionStatus::Idle && self.engine.is_none() {
            debug!("Broker session {} stop ignored: already idle", self.label);
            return;
        }
        let endpoint = self.state.borrow().endpoint.clone();
        self.transition(SessionStatus::Disconnecting, endpoint);

        if let Some(engine) = self.engine.take() {
            engine.shutdown().await;
        }
        // Once the engine tasks are gone their event senders are dropped and
        // the forwarder drains out, so remaining client events land before
        // the final Idle transition.
        if let Some(forwarder) = self.forwarder.take() {
            let _ = forwarder.await;
        }
        self.adopted = false;
        self.listening = None;
        self.transition(SessionStatus::Idle, None);
        info!("Broker session {} stopped", self.label);
    }

    fn transition(&self, status: SessionStatus, endpoint: Option<Endpoint>) {
        self.state.send_modify(|state| {
            state.status = status;
            state.endpoint = endpoint;
            state.last_error = None;
        });
        self.dispatch.post(SessionEvent::StateChanged {
            session: self.id,
            state: self.state.borrow().clone(),
        });
    }

    /// Failed start: the event carries `Failed`, the stored state returns to
    /// `Idle` with the error retained, so the session stays startable.
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

impl Drop for BrokerSession {
    fn drop(&mut self) {
        if let Some(engine) = &self.engine {
            engine.cancel();
        }
    }
}

/// Relays engine events into the dispatcher until every engine sender is
/// gone. An engine fault folds the session back to startable.
async fn forward_events(
    session: SessionId,
    mut engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
    dispatch: DispatchHandle,
    state: Arc<watch::Sender<ConnectionState>>,
) {
    while let Some(event) = engine_rx.recv().await {
        match event {
            EngineEvent::ClientConnected { client_id } => {
                dispatch.post(SessionEvent::ClientConnected { session, client_id });
            }
            EngineEvent::ClientDisconnected { client_id, reason } => {
                dispatch.post(SessionEvent::ClientDisconnected {
                    session,
                    client_id,
                    reason,
                });
            }
            EngineEvent::PublishReceived { message } => {
                dispatch.post(SessionEvent::MessageReceived { session, message });
            }
            EngineEvent::Fault { reason } => {
                warn!("Broker session {} engine fault: {}", session, reason);
                state.send_modify(|s| {
                    s.status = SessionStatus::Idle;
                    s.endpoint = None;
                    s.last_error = Some(reason.clone());
                });
                dispatch.post(SessionEvent::StateChanged {
                    session,
                    state: ConnectionState {
                        status: SessionStatus::Failed,
                        endpoint: None,
                        last_error: Some(reason),
                    },
                });
            }
        }
    }
}
