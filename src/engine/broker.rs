//! Listener binding, accept loop and engine shutdown.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::connection::Connection;
use super::router::Router;
use super::{AcceptPublish, EngineEvent, EngineSettings};

/// A bound, not-yet-serving engine. Dropping it releases the port.
pub struct Engine {
    listener: TcpListener,
    local_addr: SocketAddr,
    settings: EngineSettings,
    router: Arc<Router>,
    events: mpsc::UnboundedSender<EngineEvent>,
    accept: Arc<RwLock<AcceptPublish>>,
}

impl Engine {
    /// Binds the listener. Failures surface as raw `io::Error` so the caller
    /// can distinguish an occupied port from other bind problems.
    pub async fn bind(
        settings: EngineSettings,
        events: mpsc::UnboundedSender<EngineEvent>,
        accept: Arc<RwLock<AcceptPublish>>,
    ) -> io::Result<Engine> {
        let listener = TcpListener::bind(settings.addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Engine {
            listener,
            local_addr,
            settings,
            router: Arc::new(Router::new()),
            events,
            accept,
        })
    }

    /// Resolved address, with the real port when bound to port zero.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawns the accept loop and hands back the running engine's handle.
    pub fn serve(self) -> EngineHandle {
        let Engine {
            listener,
            local_addr,
            settings,
            router,
            events,
            accept,
        } = self;
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let loop_cancel = cancel.clone();
        let loop_tracker = tracker.clone();
        tracker.spawn(async move {
            info!("Engine listening on {}", local_addr);
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => {
                        debug!("Engine on {} stopping", local_addr);
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!("Accepted connection from {}", peer);
                            let connection = Connection::new(
                                Arc::clone(&router),
                                events.clone(),
                                Arc::clone(&accept),
                                loop_cancel.clone(),
                                settings.max_packet_size,
                            );
                            loop_tracker.spawn(connection.run(stream, peer));
                        }
                        Err(e) => {
                            warn!("Engine on {} accept failed: {}", local_addr, e);
                            let _ = events.send(EngineEvent::Fault {
                                reason: e.to_string(),
                            });
                            break;
                        }
                    }
                }
            }
        });

        EngineHandle {
            local_addr,
            cancel,
            tracker,
        }
    }
}

/// Control handle for a serving engine.
pub struct EngineHandle {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl EngineHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signals every engine task to stop without waiting for them.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancels and waits until the accept loop and all connection tasks have
    /// wound down. The port is free again once this returns.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
