//! The relay client: connect, re-handshake on transport loss, dispatch.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use relay_session::{
    client_handshake, connect_tcp, now_corr_id, ping_body, pong_body, Connection, HelloParams,
    KeepaliveState, RequestError, SendError, Transport, TransportReader,
};
use relay_wire::{Body, CloseReason, Envelope};

use crate::broadcast::{BroadcastEvent, BroadcastSubscriptions};
use crate::services::ServiceRegistry;

/// Relay client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay server address
    pub server_addr: SocketAddr,
    /// Stable client identity, e.g. `mmsi://265547240`
    pub identity: String,
    /// Human-readable banner sent in HELLO
    pub banner: String,
    /// Initial latitude
    pub lat: f64,
    /// Initial longitude
    pub lon: f64,
    /// How long the handshake may take before being cancelled
    pub handshake_timeout: Duration,
    /// Default deadline for request/reply operations
    pub request_timeout: Duration,
    /// Interval between keepalive pings
    pub ping_interval: Duration,
    /// Drop the transport after this long without inbound traffic
    pub idle_timeout: Duration,
    /// Whether to reconnect automatically on transport loss
    pub reconnect: bool,
}

impl ClientConfig {
    /// Defaults for the given server and identity
    pub fn new(server_addr: SocketAddr, identity: impl Into<String>) -> Self {
        Self {
            server_addr,
            identity: identity.into(),
            banner: "searelay client".to_string(),
            lat: 0.0,
            lon: 0.0,
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            reconnect: true,
        }
    }
}

/// Client-facing failures.
///
/// [`RelayClient::invoke`] resolves to exactly four terminal outcomes: a
/// value, [`ClientError::Application`], [`ClientError::Timeout`], or
/// [`ClientError::ConnectionClosed`].
#[derive(Error, Debug)]
pub enum ClientError {
    /// The remote service reported a typed failure
    #[error("service error: {0}")]
    Application(String),

    /// No reply arrived within the request timeout
    #[error("request timed out")]
    Timeout,

    /// The logical connection is closed
    #[error("connection closed")]
    ConnectionClosed,

    /// A local service handler already owns this name
    #[error("service {0} already registered")]
    AlreadyRegistered(String),

    /// The server refused the registration
    #[error("registration rejected: {0}")]
    Rejected(String),
}

fn map_send_err(error: SendError) -> ClientError {
    match error {
        SendError::Closed => ClientError::ConnectionClosed,
        SendError::Wire(e) => ClientError::Application(e.to_string()),
    }
}

type RelayHandler = Arc<dyn Fn(String, Value) + Send + Sync>;

struct ClientShared {
    config: ClientConfig,
    connection: Arc<Connection>,
    services: ServiceRegistry,
    broadcasts: BroadcastSubscriptions,
    relay_handler: Mutex<Option<RelayHandler>>,
    position: Mutex<(f64, f64)>,
    last_rtt: Mutex<Option<Duration>>,
}

/// A vessel's handle to the relay.
///
/// Cheap to clone; all clones share one logical connection.
#[derive(Clone)]
pub struct RelayClient {
    shared: Arc<ClientShared>,
}

impl RelayClient {
    /// Dial the relay, run the handshake, and start the background task
    /// that drives inbound traffic and reconnects
    pub async fn connect(config: ClientConfig) -> anyhow::Result<Self> {
        let socket = connect_tcp(config.server_addr).await?;
        let (transport, mut reader) = Transport::new(socket)?;

        let connection = Connection::new(config.identity.as_str());
        connection.begin_connecting();

        let handshake = client_handshake(
            &mut reader,
            HelloParams {
                client_id: config.identity.clone(),
                banner: config.banner.clone(),
                reconnect_token: None,
                lat: config.lat,
                lon: config.lon,
                last_received: 0,
            },
            config.handshake_timeout,
        )
        .await?;

        info!(
            "connected to {} as connection {}",
            handshake.server_id, handshake.connection_id
        );
        connection.assign_id(handshake.connection_id);
        connection.set_transport(transport);

        let shared = Arc::new(ClientShared {
            position: Mutex::new((config.lat, config.lon)),
            config,
            connection,
            services: ServiceRegistry::new(),
            broadcasts: BroadcastSubscriptions::new(),
            relay_handler: Mutex::new(None),
            last_rtt: Mutex::new(None),
        });

        tokio::spawn(Self::run(shared.clone(), reader));
        Ok(Self { shared })
    }

    /// This client's stable identity
    pub fn identity(&self) -> &str {
        &self.shared.config.identity
    }

    /// The logical connection under this client
    pub fn connection(&self) -> &Arc<Connection> {
        &self.shared.connection
    }

    /// Most recent keepalive round-trip time
    pub fn last_rtt(&self) -> Option<Duration> {
        *self.shared.last_rtt.lock().unwrap()
    }

    /// Close the logical connection: all pending requests fail, no further
    /// sends are accepted, and the reconnect loop stops
    pub fn close(&self) {
        self.shared.connection.close(CloseReason::Normal);
    }

    /// Register a named service and advertise it to the relay. At most one
    /// registration per name; a duplicate is rejected locally.
    pub async fn register_service(
        &self,
        name: &str,
        handler: impl Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    ) -> Result<(), ClientError> {
        if !self.shared.services.register(name, Arc::new(handler)) {
            return Err(ClientError::AlreadyRegistered(name.to_string()));
        }

        let pending = match self.shared.connection.send_request(Body::RegisterService {
            name: name.to_string(),
        }) {
            Ok(pending) => pending,
            Err(e) => {
                self.shared.services.unregister(name);
                return Err(map_send_err(e));
            }
        };

        match pending
            .wait_timeout(self.shared.config.request_timeout)
            .await
        {
            Ok(envelope) => match envelope.body {
                Body::RegisterServiceResult { accepted: true, .. } => Ok(()),
                Body::RegisterServiceResult {
                    accepted: false,
                    reason,
                } => {
                    self.shared.services.unregister(name);
                    Err(ClientError::Rejected(
                        reason.unwrap_or_else(|| "registration rejected".to_string()),
                    ))
                }
                other => {
                    self.shared.services.unregister(name);
                    Err(ClientError::Application(format!(
                        "unexpected {} reply",
                        other.kind()
                    )))
                }
            },
            Err(RequestError::Timeout) => {
                self.shared.services.unregister(name);
                Err(ClientError::Timeout)
            }
            Err(RequestError::ConnectionClosed) => {
                self.shared.services.unregister(name);
                Err(ClientError::ConnectionClosed)
            }
        }
    }

    /// Invoke a named service on a remote identity.
    ///
    /// Exactly four terminal outcomes: the result payload, an
    /// application-level failure, a timeout, or connection-closed.
    pub async fn invoke(
        &self,
        target: &str,
        service: &str,
        payload: Value,
    ) -> Result<Value, ClientError> {
        let pending = self
            .shared
            .connection
            .send_request(Body::InvokeService {
                service: service.to_string(),
                target: target.to_string(),
                origin: None,
                payload,
            })
            .map_err(map_send_err)?;

        match pending
            .wait_timeout(self.shared.config.request_timeout)
            .await
        {
            Ok(envelope) => match envelope.body {
                Body::InvokeServiceResult {
                    error: Some(error), ..
                } => Err(ClientError::Application(error)),
                Body::InvokeServiceResult { error: None, payload } => {
                    Ok(payload.unwrap_or(Value::Null))
                }
                other => Err(ClientError::Application(format!(
                    "unexpected {} reply",
                    other.kind()
                ))),
            },
            Err(RequestError::Timeout) => Err(ClientError::Timeout),
            Err(RequestError::ConnectionClosed) => Err(ClientError::ConnectionClosed),
        }
    }

    /// Identities offering `name` within `max_distance_m` of this vessel,
    /// nearest first
    pub async fn find_service(
        &self,
        name: &str,
        max_distance_m: f64,
        max_count: u32,
    ) -> Result<Vec<String>, ClientError> {
        let pending = self
            .shared
            .connection
            .send_request(Body::FindService {
                name: name.to_string(),
                max_distance_m,
                max_count,
            })
            .map_err(map_send_err)?;

        match pending
            .wait_timeout(self.shared.config.request_timeout)
            .await
        {
            Ok(envelope) => match envelope.body {
                Body::FindServiceResult { targets } => Ok(targets),
                other => Err(ClientError::Application(format!(
                    "unexpected {} reply",
                    other.kind()
                ))),
            },
            Err(RequestError::Timeout) => Err(ClientError::Timeout),
            Err(RequestError::ConnectionClosed) => Err(ClientError::ConnectionClosed),
        }
    }

    /// Report this vessel's position to the relay
    pub fn report_position(&self, lat: f64, lon: f64) -> Result<(), ClientError> {
        *self.shared.position.lock().unwrap() = (lat, lon);
        self.shared
            .connection
            .send(Body::PositionReport { lat, lon })
            .map(|_| ())
            .map_err(map_send_err)
    }

    /// Broadcast a payload on a channel, optionally geofenced to
    /// `radius_m` meters around this vessel
    pub fn broadcast(
        &self,
        channel: &str,
        radius_m: Option<f64>,
        ack: bool,
        payload: Value,
    ) -> Result<(), ClientError> {
        self.shared
            .connection
            .send(Body::BroadcastSend {
                channel: channel.to_string(),
                radius_m,
                ack,
                payload,
            })
            .map(|_| ())
            .map_err(map_send_err)
    }

    /// Subscribe a listener to a broadcast channel
    pub fn subscribe(&self, channel: &str, listener: impl Fn(BroadcastEvent) + Send + Sync + 'static) {
        self.shared.broadcasts.subscribe(channel, Arc::new(listener));
    }

    /// Install the handler for inbound client-to-client relay messages
    pub fn on_relay(&self, handler: impl Fn(String, Value) + Send + Sync + 'static) {
        *self.shared.relay_handler.lock().unwrap() = Some(Arc::new(handler));
    }

    /// Fire-and-forget relay to another identity
    pub fn send_to(&self, identity: &str, payload: Value) -> Result<(), ClientError> {
        self.shared
            .connection
            .send(Body::Relay {
                to: identity.to_string(),
                from: None,
                payload,
            })
            .map(|_| ())
            .map_err(map_send_err)
    }

    /// Drive the current transport until it dies, then reconnect until the
    /// connection is closed
    async fn run(shared: Arc<ClientShared>, mut reader: TransportReader) {
        loop {
            let reason = Self::drive_transport(&shared, &mut reader).await;
            let transport_id = reader.transport().id().to_string();
            shared.connection.detach_transport(&transport_id);

            if shared.connection.is_closed() {
                debug!("client connection closed: {}", reason);
                return;
            }
            if !shared.config.reconnect {
                shared.connection.close(CloseReason::Normal);
                return;
            }

            info!(
                "transport lost ({}), reconnecting to {}",
                reason, shared.config.server_addr
            );
            match Self::reconnect(&shared).await {
                Some(new_reader) => reader = new_reader,
                None => return,
            }
        }
    }

    async fn drive_transport(
        shared: &Arc<ClientShared>,
        reader: &mut TransportReader,
    ) -> CloseReason {
        let mut ping_interval = tokio::time::interval(shared.config.ping_interval);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut keepalive = KeepaliveState::default();
        let mut last_activity = Instant::now();

        loop {
            tokio::select! {
                biased;

                _ = ping_interval.tick() => {
                    let corr_id = now_corr_id();
                    if shared.connection.send_control(ping_body(corr_id)).is_err() {
                        return CloseReason::Normal;
                    }
                    keepalive.record_ping(corr_id);
                }

                result = reader.next() => match result {
                    Ok(envelope) => {
                        last_activity = Instant::now();
                        let Some(envelope) = shared.connection.on_envelope(envelope) else {
                            continue;
                        };
                        if let Body::Pong { corr_id } = envelope.body {
                            if let Some(rtt) = keepalive.process_pong(corr_id) {
                                *shared.last_rtt.lock().unwrap() = Some(rtt);
                                debug!("rtt to relay: {:?}", rtt);
                            }
                            continue;
                        }
                        Self::dispatch(shared, envelope);
                    }
                    Err(reason) => return reason,
                },

                _ = tokio::time::sleep_until(last_activity + shared.config.idle_timeout) => {
                    warn!("idle timeout, dropping transport");
                    reader.transport().close(CloseReason::Normal);
                    return CloseReason::Normal;
                }
            }
        }
    }

    /// Kind-specific dispatch of one inbound envelope
    fn dispatch(shared: &Arc<ClientShared>, envelope: Envelope) {
        let reply_to = envelope.reply_to;
        let kind = envelope.body.kind();
        match envelope.body {
            Body::Ping { corr_id } => {
                let _ = shared.connection.send_control(pong_body(corr_id));
            }

            Body::InvokeService {
                service,
                origin,
                payload,
                ..
            } => {
                let Some(request_id) = reply_to else {
                    warn!("invoke of {} without reply_to, dropping", service);
                    return;
                };
                let connection = shared.connection.clone();
                match shared.services.handler(&service) {
                    Some(handler) => {
                        debug!(
                            "running service {} for {}",
                            service,
                            origin.as_deref().unwrap_or("unknown")
                        );
                        tokio::spawn(async move {
                            let body = match handler(payload) {
                                Ok(value) => Body::InvokeServiceResult {
                                    error: None,
                                    payload: Some(value),
                                },
                                Err(error) => Body::InvokeServiceResult {
                                    error: Some(error),
                                    payload: None,
                                },
                            };
                            let _ = connection.send_response(body, request_id);
                        });
                    }
                    None => {
                        let _ = connection.send_response(
                            Body::InvokeServiceResult {
                                error: Some(format!("no service {}", service)),
                                payload: None,
                            },
                            request_id,
                        );
                    }
                }
            }

            Body::BroadcastDeliver {
                channel,
                origin,
                ack,
                payload,
            } => {
                if ack {
                    let _ = shared.connection.send(Body::BroadcastAck {
                        channel: channel.clone(),
                        origin: origin.clone(),
                    });
                }
                shared.broadcasts.dispatch(BroadcastEvent {
                    channel,
                    origin,
                    payload,
                });
            }

            Body::BroadcastAck { channel, origin } => {
                debug!("broadcast on {} acknowledged by {}", channel, origin);
            }

            Body::Relay { from, payload, .. } => {
                let handler = shared.relay_handler.lock().unwrap().clone();
                match handler {
                    Some(handler) => {
                        let from = from.unwrap_or_default();
                        tokio::spawn(async move { handler(from, payload) });
                    }
                    None => debug!("relay message with no handler installed, dropping"),
                }
            }

            Body::Welcome { .. } | Body::Hello { .. } | Body::Connected { .. } => {
                warn!("{} after handshake, closing transport", kind);
                if let Some(transport) = shared.connection.bound_transport() {
                    transport.close(CloseReason::WrongMessage);
                }
            }

            _ => warn!("unexpected {} from relay, dropping", kind),
        }
    }

    async fn reconnect(shared: &Arc<ClientShared>) -> Option<TransportReader> {
        let mut backoff = Duration::from_secs(1);
        loop {
            if shared.connection.is_closed() {
                return None;
            }
            match Self::try_reconnect(shared).await {
                Ok(reader) => return Some(reader),
                Err(e) => {
                    warn!(
                        "reconnect to {} failed: {:#}; retrying in {:?}",
                        shared.config.server_addr, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
            }
        }
    }

    async fn try_reconnect(shared: &Arc<ClientShared>) -> anyhow::Result<TransportReader> {
        let socket = connect_tcp(shared.config.server_addr).await?;
        let (transport, mut reader) = Transport::new(socket)?;
        let (lat, lon) = *shared.position.lock().unwrap();

        let handshake = client_handshake(
            &mut reader,
            HelloParams {
                client_id: shared.config.identity.clone(),
                banner: shared.config.banner.clone(),
                reconnect_token: shared.connection.id(),
                lat,
                lon,
                last_received: shared.connection.last_received(),
            },
            shared.config.handshake_timeout,
        )
        .await?;

        shared.connection.assign_id(handshake.connection_id.clone());
        if !shared.connection.set_transport(transport) {
            anyhow::bail!("connection closed during reconnect");
        }
        shared.connection.resume(handshake.last_received_msg_id);
        info!("reconnected as connection {}", handshake.connection_id);
        Ok(reader)
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("identity", &self.identity())
            .field("connection", &self.shared.connection)
            .finish()
    }
}
