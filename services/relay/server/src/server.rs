//! The relay server: accept loop, handshake sequencing, and message
//! dispatch.
//!
//! Each socket gets its own task. A fresh transport is "connecting" until
//! its first frame: the server sends WELCOME immediately, requires HELLO
//! as the first client frame (anything else closes with `WrongMessage`,
//! running out of time closes with `ConnectCancelled`), promotes the
//! transport through the registry, acknowledges with CONNECTED, and only
//! then replays any resumed traffic.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use relay_session::{pong_body, Connection, RequestError, Transport, TransportReader};
use relay_wire::{Body, CloseReason, Envelope, PROTOCOL_VERSION};

use crate::broadcast::BroadcastRouter;
use crate::position::PositionTracker;
use crate::registry::TargetRegistry;
use crate::services::ServiceDirectory;

/// Relay server tunables
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Stable server identifier sent in WELCOME
    pub server_id: String,
    /// Human-readable banner sent in WELCOME
    pub banner: String,
    /// How long a fresh transport may take to produce its HELLO
    pub handshake_timeout: Duration,
    /// How long a forwarded service invocation may take end to end
    pub invoke_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_id: "searelay-1".to_string(),
            banner: "searelay".to_string(),
            handshake_timeout: Duration::from_secs(10),
            invoke_timeout: Duration::from_secs(30),
        }
    }
}

/// One relay server instance.
///
/// All collaborators are injected; nothing is process-global, so several
/// independent instances can run in one process.
pub struct RelayServer {
    config: ServerConfig,
    registry: Arc<TargetRegistry>,
    tracker: Arc<PositionTracker>,
    directory: Arc<ServiceDirectory>,
    router: Arc<BroadcastRouter>,
}

impl RelayServer {
    /// Assemble a server from its injected components
    pub fn new(
        config: ServerConfig,
        registry: Arc<TargetRegistry>,
        tracker: Arc<PositionTracker>,
        directory: Arc<ServiceDirectory>,
        router: Arc<BroadcastRouter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            tracker,
            directory,
            router,
        })
    }

    /// The identity registry backing this server
    pub fn registry(&self) -> &Arc<TargetRegistry> {
        &self.registry
    }

    /// The position tracker backing this server
    pub fn tracker(&self) -> &Arc<PositionTracker> {
        &self.tracker
    }

    /// Accept connections until the listener fails
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!(
            "relay {} listening on {}",
            self.config.server_id,
            listener.local_addr()?
        );

        loop {
            let (socket, peer) = listener.accept().await?;
            debug!("accepted transport from {}", peer);
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_socket(socket).await {
                    debug!("session with {} ended: {:#}", peer, e);
                }
            });
        }
    }

    /// Drive one socket from handshake to transport loss
    async fn handle_socket(&self, socket: TcpStream) -> anyhow::Result<()> {
        let (transport, mut reader) = Transport::new(socket)?;
        let peer = transport.peer();

        transport.send(&Envelope::new(Body::Welcome {
            protocol_version: PROTOCOL_VERSION,
            server_id: self.config.server_id.clone(),
            banner: self.config.banner.clone(),
        }));

        let first = match tokio::time::timeout(self.config.handshake_timeout, reader.next()).await
        {
            Ok(Ok(envelope)) => envelope,
            Ok(Err(reason)) => {
                debug!("{} closed during handshake: {}", peer, reason);
                return Ok(());
            }
            Err(_) => {
                transport.close(CloseReason::ConnectCancelled);
                anyhow::bail!("handshake with {} timed out", peer);
            }
        };

        let client_last_received = first.last_received.unwrap_or(0);
        let (identity, reconnect_token, lat, lon) = match first.body {
            Body::Hello {
                client_id,
                reconnect_token,
                protocol_version,
                lat,
                lon,
                ..
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    transport.close(CloseReason::WrongMessage);
                    anyhow::bail!(
                        "unsupported protocol version {} from {}",
                        protocol_version,
                        peer
                    );
                }
                (client_id, reconnect_token, lat, lon)
            }
            other => {
                transport.close(CloseReason::WrongMessage);
                anyhow::bail!("expected hello from {}, got {}", peer, other.kind());
            }
        };

        info!("hello from {} at {} ({:.4},{:.4})", identity, peer, lat, lon);
        self.tracker.update(&identity, lat, lon);

        let outcome = self
            .registry
            .on_hello(
                transport.clone(),
                &identity,
                reconnect_token.as_deref(),
                client_last_received,
            )
            .await;
        let connection = outcome.connection.clone();

        // CONNECTED must precede any replayed traffic on the new transport
        let _ = connection.send_control(Body::Connected {
            connection_id: connection.id().unwrap_or_default(),
            last_received_msg_id: outcome.last_received_msg_id,
        });
        if let Some(baseline) = outcome.resume_from {
            connection.resume(baseline);
        }

        let result = self.connection_loop(&connection, &identity, &mut reader).await;
        self.registry.on_transport_closed(&identity, &transport);
        result
    }

    async fn connection_loop(
        &self,
        connection: &Arc<Connection>,
        identity: &str,
        reader: &mut TransportReader,
    ) -> anyhow::Result<()> {
        loop {
            let envelope = match reader.next().await {
                Ok(envelope) => envelope,
                Err(reason) => {
                    debug!("{} transport done: {}", identity, reason);
                    return Ok(());
                }
            };

            let Some(envelope) = connection.on_envelope(envelope) else {
                continue;
            };

            // Handshake traffic after the handshake is a protocol violation
            if matches!(
                envelope.body,
                Body::Welcome { .. } | Body::Hello { .. } | Body::Connected { .. }
            ) {
                reader.transport().close(CloseReason::WrongMessage);
                anyhow::bail!("{} sent {} after handshake", identity, envelope.body.kind());
            }

            self.dispatch(connection, identity, envelope);
        }
    }

    /// Kind-specific dispatch of one inbound envelope
    fn dispatch(&self, connection: &Arc<Connection>, identity: &str, envelope: Envelope) {
        let reply_to = envelope.reply_to;
        match envelope.body {
            Body::Ping { corr_id } => {
                let _ = connection.send_control(pong_body(corr_id));
            }
            Body::Pong { .. } => {}

            Body::PositionReport { lat, lon } => self.tracker.update(identity, lat, lon),

            Body::RegisterService { name } => {
                self.directory.register(identity, &name);
                if let Some(request_id) = reply_to {
                    let _ = connection.send_response(
                        Body::RegisterServiceResult {
                            accepted: true,
                            reason: None,
                        },
                        request_id,
                    );
                }
            }

            Body::FindService {
                name,
                max_distance_m,
                max_count,
            } => {
                if let Some(request_id) = reply_to {
                    let targets =
                        self.directory
                            .find(&name, identity, max_distance_m, max_count as usize);
                    let _ = connection
                        .send_response(Body::FindServiceResult { targets }, request_id);
                }
            }

            Body::InvokeService {
                service,
                target,
                payload,
                ..
            } => self.forward_invoke(connection, identity, reply_to, service, target, payload),

            Body::BroadcastSend {
                channel,
                radius_m,
                ack,
                payload,
            } => {
                self.router
                    .broadcast(identity, &channel, radius_m, ack, payload);
            }

            Body::BroadcastAck { channel, origin } => match self.registry.connection(&origin) {
                Some(origin_conn) => {
                    let _ = origin_conn.send(Body::BroadcastAck {
                        channel,
                        origin: identity.to_string(),
                    });
                }
                None => debug!("broadcast ack from {} for unknown origin {}", identity, origin),
            },

            Body::Relay { to, payload, .. } => match self.registry.connection(&to) {
                Some(dest) => {
                    let _ = dest.send(Body::Relay {
                        to,
                        from: Some(identity.to_string()),
                        payload,
                    });
                }
                None => warn!("relay from {} to unknown identity {}, dropping", identity, to),
            },

            // A response body without msg_ack, or server-to-client kinds a
            // client should never originate: logged and dropped, not fatal
            other => warn!("unexpected {} from {}, dropping", other.kind(), identity),
        }
    }

    /// Forward a service invocation to the target's connection through the
    /// server's own correlator and report the outcome back to the caller
    fn forward_invoke(
        &self,
        caller: &Arc<Connection>,
        identity: &str,
        reply_to: Option<u64>,
        service: String,
        target: String,
        payload: Value,
    ) {
        let Some(request_id) = reply_to else {
            warn!("invoke from {} without reply_to, dropping", identity);
            return;
        };

        let Some(target_conn) = self.registry.connection(&target) else {
            let _ = caller.send_response(
                Body::InvokeServiceResult {
                    error: Some(format!("no connection for {}", target)),
                    payload: None,
                },
                request_id,
            );
            return;
        };

        match target_conn.send_request(Body::InvokeService {
            service,
            target: target.clone(),
            origin: Some(identity.to_string()),
            payload,
        }) {
            Ok(pending) => {
                let caller = caller.clone();
                let invoke_timeout = self.config.invoke_timeout;
                tokio::spawn(async move {
                    let body = match pending.wait_timeout(invoke_timeout).await {
                        Ok(envelope) => match envelope.body {
                            body @ Body::InvokeServiceResult { .. } => body,
                            other => Body::InvokeServiceResult {
                                error: Some(format!("unexpected {} from target", other.kind())),
                                payload: None,
                            },
                        },
                        Err(RequestError::Timeout) => Body::InvokeServiceResult {
                            error: Some(format!("invoke of {} timed out", target)),
                            payload: None,
                        },
                        Err(RequestError::ConnectionClosed) => Body::InvokeServiceResult {
                            error: Some(format!("{} disconnected", target)),
                            payload: None,
                        },
                    };
                    let _ = caller.send_response(body, request_id);
                });
            }
            Err(e) => {
                let _ = caller.send_response(
                    Body::InvokeServiceResult {
                        error: Some(format!("forward to {} failed: {}", target, e)),
                        payload: None,
                    },
                    request_id,
                );
            }
        }
    }
}

impl std::fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServer")
            .field("server_id", &self.config.server_id)
            .field("targets", &self.registry.len())
            .finish()
    }
}
