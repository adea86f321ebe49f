//! Per-client connection handling: CONNECT handshake, packet loop, cleanup.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use bytes::BytesMut;
use rumqttc::mqttbytes::v4::{
    self, ConnAck, ConnectReturnCode, Packet, PingResp, PubAck, PubComp, PubRec, PubRel, Publish,
    SubAck, UnsubAck,
};
use rumqttc::mqttbytes::{self, QoS};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::router::{ClientHandle, Outbound, Router};
use super::{AcceptPublish, EngineEvent};
use crate::error::EngineError;
use crate::session::Message;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_QUEUE_CAPACITY: usize = 100;

static NEXT_AUTO_ID: AtomicU64 = AtomicU64::new(1);

/// Everything one connection task needs from its engine.
pub(crate) struct Connection {
    router: Arc<Router>,
    events: mpsc::UnboundedSender<EngineEvent>,
    accept: Arc<RwLock<AcceptPublish>>,
    cancel: CancellationToken,
    max_packet_size: usize,
}

impl Connection {
    pub fn new(
        router: Arc<Router>,
        events: mpsc::UnboundedSender<EngineEvent>,
        accept: Arc<RwLock<AcceptPublish>>,
        cancel: CancellationToken,
        max_packet_size: usize,
    ) -> Self {
        Self {
            router,
            events,
            accept,
            cancel,
            max_packet_size,
        }
    }

    /// Drives one client socket from handshake to cleanup. Failures are
    /// logged and reported as events, never returned to the spawner.
    pub async fn run(self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = self.serve(stream, peer).await {
            debug!("Connection from {} ended: {}", peer, e);
        }
    }

    async fn serve(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), EngineError> {
        let (mut reader, mut writer) = stream.into_split();
        let mut read_buf = BytesMut::with_capacity(4096);

        let first = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            read_packet(&mut reader, &mut read_buf, self.max_packet_size),
        )
        .await
        .map_err(|_| EngineError::KeepAliveTimeout)??;

        let connect = match first {
            Packet::Connect(connect) => connect,
            other => {
                return Err(EngineError::Protocol(format!(
                    "expected CONNECT, got {:?}",
                    other
                )));
            }
        };

        // An empty client id is only valid for a clean session (3.1.1).
        if connect.client_id.is_empty() && !connect.clean_session {
            let nack = ConnAck {
                session_present: false,
                code: ConnectReturnCode::BadClientId,
            };
            write_packet(&mut writer, Packet::ConnAck(nack)).await?;
            return Err(EngineError::Protocol(
                "empty client id without clean session".to_string(),
            ));
        }

        let client_id = if connect.client_id.is_empty() {
            format!("client-{}", NEXT_AUTO_ID.fetch_add(1, Ordering::Relaxed))
        } else {
            connect.client_id.clone()
        };
        let keep_alive = connect.keep_alive;

        let connack = ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        };
        write_packet(&mut writer, Packet::ConnAck(connack)).await?;

        let (tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let handle = ClientHandle {
            client_id: client_id.clone(),
            tx,
        };
        self.router.register(&handle);
        info!(
            "Client {} connected from {} (keep-alive {}s)",
            client_id, peer, keep_alive
        );
        let _ = self.events.send(EngineEvent::ClientConnected {
            client_id: client_id.clone(),
        });

        let reason = self
            .client_loop(
                &client_id,
                keep_alive,
                &mut reader,
                &mut writer,
                &mut read_buf,
                outbound_rx,
            )
            .await;

        self.router.disconnect(&handle);
        info!("Client {} disconnected: {}", client_id, reason);
        let _ = self.events.send(EngineEvent::ClientDisconnected { client_id, reason });
        Ok(())
    }

    /// Serves an established connection until something ends it, returning
    /// the reason. Registration and the connected/disconnected event pair
    /// stay in the caller so they always balance.
    async fn client_loop(
        &self,
        client_id: &str,
        keep_alive: u16,
        reader: &mut OwnedReadHalf,
        writer: &mut OwnedWriteHalf,
        read_buf: &mut BytesMut,
        mut outbound_rx: mpsc::Receiver<Outbound>,
    ) -> String {
        // 1.5x the negotiated interval; zero disables the deadline.
        let deadline =
            (keep_alive > 0).then(|| Duration::from_millis(u64::from(keep_alive) * 1500));
        let mut pending_qos2: HashSet<u16> = HashSet::new();
        let mut next_pkid: u16 = 0;

        loop {
            let turn = async {
                tokio::select! {
                    _ = self.cancel.cancelled() => Ok(Some("broker stopping".to_string())),
                    delivery = outbound_rx.recv() => match delivery {
                        Some(outbound) => {
                            write_outbound(writer, outbound, &mut next_pkid).await?;
                            Ok(None)
                        }
                        None => Ok(Some("delivery queue closed".to_string())),
                    },
                    packet = read_packet(reader, read_buf, self.max_packet_size) => {
                        self.handle_packet(client_id, packet?, writer, &mut pending_qos2).await
                    }
                }
            };
            let outcome = match deadline {
                Some(window) => match tokio::time::timeout(window, turn).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(EngineError::KeepAliveTimeout),
                },
                None => turn.await,
            };
            match outcome {
                Ok(None) => continue,
                Ok(Some(reason)) => return reason,
                Err(e) => return e.to_string(),
            }
        }
    }

    async fn handle_packet(
        &self,
        client_id: &str,
        packet: Packet,
        writer: &mut OwnedWriteHalf,
        pending_qos2: &mut HashSet<u16>,
    ) -> Result<Option<String>, EngineError> {
        match packet {
            Packet::Publish(publish) => {
                self.handle_publish(client_id, publish, writer, pending_qos2)
                    .await?;
                Ok(None)
            }
            Packet::PubRel(pubrel) => {
                pending_qos2.remove(&pubrel.pkid);
                write_packet(writer, Packet::PubComp(PubComp { pkid: pubrel.pkid })).await?;
                Ok(None)
            }
            Packet::PubAck(puback) => {
                trace!("Client {} acked delivery {}", client_id, puback.pkid);
                Ok(None)
            }
            Packet::PubRec(pubrec) => {
                // Deliveries are fire-once; answering PUBREL completes the
                // exchange on the client side.
                write_packet(writer, Packet::PubRel(PubRel { pkid: pubrec.pkid })).await?;
                Ok(None)
            }
            Packet::PubComp(pubcomp) => {
                trace!("Client {} completed delivery {}", client_id, pubcomp.pkid);
                Ok(None)
            }
            Packet::Subscribe(subscribe) => {
                let return_codes = self.router.subscribe(client_id, &subscribe.filters);
                debug!("Client {} subscribed {:?}", client_id, subscribe.filters);
                let suback = SubAck {
                    pkid: subscribe.pkid,
                    return_codes,
                };
                write_packet(writer, Packet::SubAck(suback)).await?;
                Ok(None)
            }
            Packet::Unsubscribe(unsubscribe) => {
                self.router.unsubscribe(client_id, &unsubscribe.topics);
                debug!("Client {} unsubscribed {:?}", client_id, unsubscribe.topics);
                let unsuback = UnsubAck {
                    pkid: unsubscribe.pkid,
                };
                write_packet(writer, Packet::UnsubAck(unsuback)).await?;
                Ok(None)
            }
            Packet::PingReq => {
                write_packet(writer, Packet::PingResp).await?;
                Ok(None)
            }
            Packet::Disconnect => Ok(Some("client disconnect".to_string())),
            other => {
                trace!("Client {} sent unexpected {:?}", client_id, other);
                Ok(None)
            }
        }
    }

    async fn handle_publish(
        &self,
        client_id: &str,
        publish: Publish,
        writer: &mut OwnedWriteHalf,
        pending_qos2: &mut HashSet<u16>,
    ) -> Result<(), EngineError> {
        let Publish {
            qos,
            pkid,
            retain,
            topic,
            payload,
            ..
        } = publish;
        if !mqttbytes::valid_topic(&topic) {
            return Err(EngineError::Protocol(format!(
                "invalid publish topic {:?}",
                topic
            )));
        }

        // A QoS 2 pkid stays pending until its PUBREL; a retransmission in
        // that window is acked again but delivered only once.
        let duplicate = qos == QoS::ExactlyOnce && !pending_qos2.insert(pkid);

        if !duplicate {
            let message = Message::from_client(client_id, topic, payload, qos, retain);
            let policy = {
                let guard = self.accept.read().unwrap_or_else(PoisonError::into_inner);
                Arc::clone(&*guard)
            };
            if policy(&message) {
                trace!("Publish on {} from {}", message.topic(), client_id);
                let _ = self.events.send(EngineEvent::PublishReceived {
                    message: message.clone(),
                });
                self.router.route(&message);
            } else {
                debug!(
                    "Publish on {} from {} rejected by accept policy",
                    message.topic(),
                    client_id
                );
            }
        }

        // 3.1.1 has no negative publish ack; rejected publishes ack the same.
        match qos {
            QoS::AtMostOnce => {}
            QoS::AtLeastOnce => write_packet(writer, Packet::PubAck(PubAck { pkid })).await?,
            QoS::ExactlyOnce => write_packet(writer, Packet::PubRec(PubRec { pkid })).await?,
        }
        Ok(())
    }
}

/// Reads one full packet, pulling more bytes as needed. The buffer lives
/// outside the call so a cancelled read never loses a partial frame.
async fn read_packet(
    reader: &mut OwnedReadHalf,
    buf: &mut BytesMut,
    max_packet_size: usize,
) -> Result<Packet, EngineError> {
    loop {
        match v4::read(buf, max_packet_size) {
            Ok(packet) => return Ok(packet),
            Err(mqttbytes::Error::InsufficientBytes(_)) => {
                if reader.read_buf(buf).await? == 0 {
                    return Err(EngineError::ConnectionClosed);
                }
            }
            Err(e) => return Err(EngineError::Protocol(e.to_string())),
        }
    }
}

/// Writes one routed delivery, assigning a fresh non-zero pkid for QoS > 0.
async fn write_outbound(
    writer: &mut OwnedWriteHalf,
    outbound: Outbound,
    next_pkid: &mut u16,
) -> Result<(), EngineError> {
    let Outbound { message, qos } = outbound;
    let pkid = match qos {
        QoS::AtMostOnce => 0,
        _ => {
            *next_pkid = next_pkid.wrapping_add(1);
            if *next_pkid == 0 {
                *next_pkid = 1;
            }
            *next_pkid
        }
    };
    let publish = Publish {
        dup: false,
        qos,
        retain: message.retain(),
        topic: message.topic().to_string(),
        pkid,
        payload: message.payload().clone(),
    };
    write_packet(writer, Packet::Publish(publish)).await
}

async fn write_packet(writer: &mut OwnedWriteHalf, packet: Packet) -> Result<(), EngineError> {
    let mut buf = BytesMut::new();
    let encoded = match &packet {
        Packet::ConnAck(p) => p.write(&mut buf),
        Packet::Publish(p) => p.write(&mut buf),
        Packet::PubAck(p) => p.write(&mut buf),
        Packet::PubRec(p) => p.write(&mut buf),
        Packet::PubRel(p) => p.write(&mut buf),
        Packet::PubComp(p) => p.write(&mut buf),
        Packet::SubAck(p) => p.write(&mut buf),
        Packet::UnsubAck(p) => p.write(&mut buf),
        Packet::PingResp => PingResp.write(&mut buf),
        other => {
            return Err(EngineError::Protocol(format!(
                "unsupported outbound packet {:?}",
                other
            )));
        }
    };
    encoded.map_err(|e| EngineError::Protocol(e.to_string()))?;
    writer.write_all(&buf).await?;
    Ok(())
}
