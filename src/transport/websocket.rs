//! MQTT 3.1.1 over a WebSocket, as spoken by the AWS IoT device gateway.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    time::{self, Instant, Interval, MissedTickBehavior},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        self, Message,
        client::IntoClientRequest,
        http::{HeaderValue, header::SEC_WEBSOCKET_PROTOCOL},
    },
};
use tracing::{debug, info, trace, warn};
use url::Url;

use super::{
    InboundMessage, Transport, TransportConfig, TransportSession,
    packet::{self, Packet},
};
use crate::{constants::MQTT_SUBPROTOCOL, error::TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on the DISCONNECT plus WebSocket close exchange
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct MqttWsTransport {
    config: TransportConfig,
}

impl MqttWsTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    async fn handshake(&self, url: &str, client_id: &str) -> Result<MqttSession, TransportError> {
        let mut request = url.into_client_request().map_err(map_ws_error)?;
        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(MQTT_SUBPROTOCOL),
        );

        let (ws, response) = connect_async(request).await.map_err(map_ws_error)?;
        debug!(status = %response.status(), "WebSocket upgrade accepted");

        let mut session = MqttSession::new(ws, self.config.keep_alive_secs);
        session
            .send(packet::connect(client_id, self.config.keep_alive_secs)?)
            .await?;

        match session.read_packet().await? {
            Packet::ConnAck { return_code: 0, .. } => Ok(session),
            Packet::ConnAck { return_code, .. } => Err(TransportError::Rejected(format!(
                "connection refused: {}",
                packet::connack_reason(return_code)
            ))),
            other => Err(TransportError::Protocol(format!(
                "expected CONNACK, got {other:?}"
            ))),
        }
    }
}

#[async_trait]
impl Transport for MqttWsTransport {
    async fn open(
        &self,
        url: &str,
        client_id: &str,
    ) -> Result<Box<dyn TransportSession>, TransportError> {
        let parsed =
            Url::parse(url).map_err(|e| TransportError::Protocol(format!("invalid URL: {e}")))?;
        info!(
            host = parsed.host_str().unwrap_or_default(),
            client_id, "Opening MQTT over WebSocket"
        );

        let session = time::timeout(self.config.connect_timeout, self.handshake(url, client_id))
            .await
            .map_err(|_| {
                TransportError::Timeout(format!(
                    "no CONNACK within {}s",
                    self.config.connect_timeout.as_secs()
                ))
            })??;

        Ok(Box::new(session))
    }
}

/// What woke the read loop up
enum Wakeup {
    Frame(Option<Result<Message, tungstenite::Error>>),
    KeepAlive,
}

pub struct MqttSession {
    ws: WsStream,
    buffer: BytesMut,
    pending: VecDeque<InboundMessage>,
    keep_alive: Option<Interval>,
    awaiting_pingresp: bool,
    next_packet_id: u16,
}

impl MqttSession {
    fn new(ws: WsStream, keep_alive_secs: u16) -> Self {
        let keep_alive = (keep_alive_secs > 0).then(|| {
            let period = Duration::from_secs(u64::from(keep_alive_secs));
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        Self {
            ws,
            buffer: BytesMut::new(),
            pending: VecDeque::new(),
            keep_alive,
            awaiting_pingresp: false,
            next_packet_id: 0,
        }
    }

    async fn send(&mut self, packet: Bytes) -> Result<(), TransportError> {
        self.ws
            .send(Message::Binary(packet.to_vec()))
            .await
            .map_err(map_ws_error)
    }

    /// Read until a full packet is buffered, sending PINGREQ on every keep-alive tick
    async fn read_packet(&mut self) -> Result<Packet, TransportError> {
        loop {
            if let Some(packet) = packet::decode(&mut self.buffer)? {
                if packet == Packet::PingResp {
                    self.awaiting_pingresp = false;
                    continue;
                }
                return Ok(packet);
            }

            let wakeup = tokio::select! {
                frame = self.ws.next() => Wakeup::Frame(frame),
                _ = tick(&mut self.keep_alive) => Wakeup::KeepAlive,
            };

            match wakeup {
                Wakeup::KeepAlive => self.ping().await?,
                Wakeup::Frame(None) => {
                    return Err(TransportError::Closed {
                        code: None,
                        reason: "stream ended".to_string(),
                    });
                }
                Wakeup::Frame(Some(Err(e))) => return Err(map_ws_error(e)),
                Wakeup::Frame(Some(Ok(Message::Binary(data)))) => {
                    self.buffer.extend_from_slice(&data)
                }
                Wakeup::Frame(Some(Ok(Message::Close(frame)))) => {
                    return Err(TransportError::Closed {
                        code: frame.as_ref().map(|f| u16::from(f.code)),
                        reason: frame.map(|f| f.reason.to_string()).unwrap_or_default(),
                    });
                }
                // Pings are answered by tungstenite itself
                Wakeup::Frame(Some(Ok(other))) => trace!(?other, "Ignoring frame"),
            }
        }
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        if self.awaiting_pingresp {
            return Err(TransportError::Timeout(
                "no PINGRESP within keep-alive interval".to_string(),
            ));
        }
        self.send(packet::pingreq()).await?;
        self.awaiting_pingresp = true;
        Ok(())
    }

    /// Acknowledge a QoS 1 delivery and hand back its message
    async fn accept_publish(
        &mut self,
        topic: String,
        qos: u8,
        packet_id: Option<u16>,
        payload: Bytes,
    ) -> Result<InboundMessage, TransportError> {
        if let (1, Some(id)) = (qos, packet_id) {
            self.send(packet::puback(id)).await?;
        }
        Ok(InboundMessage { topic, payload })
    }

    fn allocate_packet_id(&mut self) -> u16 {
        // Packet identifiers must be non-zero
        self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
        self.next_packet_id
    }
}

#[async_trait]
impl TransportSession for MqttSession {
    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let packet_id = self.allocate_packet_id();
        self.send(packet::subscribe(packet_id, topic)?).await?;

        loop {
            match self.read_packet().await? {
                Packet::SubAck {
                    packet_id: acked,
                    return_codes,
                } if acked == packet_id => {
                    if Packet::is_subscription_refused(&return_codes) {
                        return Err(TransportError::Rejected(format!(
                            "subscription to {topic} refused"
                        )));
                    }
                    info!(topic, "Subscribed");
                    return Ok(());
                }
                Packet::Publish {
                    topic,
                    qos,
                    packet_id,
                    payload,
                } => {
                    let message = self.accept_publish(topic, qos, packet_id, payload).await?;
                    self.pending.push_back(message);
                }
                other => trace!(?other, "Ignoring packet while subscribing"),
            }
        }
    }

    async fn next_message(&mut self) -> Result<InboundMessage, TransportError> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(message);
        }

        loop {
            match self.read_packet().await? {
                Packet::Publish {
                    topic,
                    qos,
                    packet_id,
                    payload,
                } => return self.accept_publish(topic, qos, packet_id, payload).await,
                other => trace!(?other, "Ignoring packet"),
            }
        }
    }

    async fn close(&mut self) {
        let teardown = async {
            let _ = self.send(packet::disconnect()).await;
            let _ = self.ws.close(None).await;
        };
        match time::timeout(CLOSE_TIMEOUT, teardown).await {
            Ok(()) => debug!("MQTT session closed"),
            Err(_) => warn!(
                timeout_secs = CLOSE_TIMEOUT.as_secs(),
                "Peer did not take the close in time, dropping the socket"
            ),
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn map_ws_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            if status == 401 || status == 403 {
                TransportError::Unauthorized { status }
            } else {
                TransportError::Handshake { status }
            }
        }
        err @ (tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
            TransportError::Closed {
                code: None,
                reason: err.to_string(),
            }
        }
        other => TransportError::Socket(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{
        accept_hdr_async,
        tungstenite::{
            handshake::server::{ErrorResponse, Request, Response},
            http::StatusCode,
        },
    };

    fn accept_mqtt(_: &Request, mut response: Response) -> Result<Response, ErrorResponse> {
        response.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(MQTT_SUBPROTOCOL),
        );
        Ok(response)
    }

    fn refuse(_: &Request, _: Response) -> Result<Response, ErrorResponse> {
        let mut response = ErrorResponse::new(Some("forbidden".to_string()));
        *response.status_mut() = StatusCode::FORBIDDEN;
        Err(response)
    }

    async fn read_binary(ws: &mut WebSocketStream<TcpStream>) -> Vec<u8> {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => return data,
                Some(Ok(_)) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/mqtt", listener.local_addr().unwrap());
        (listener, url)
    }

    #[tokio::test]
    async fn test_connect_subscribe_and_receive() {
        let (listener, url) = listener().await;

        let broker = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_hdr_async(stream, accept_mqtt).await.unwrap();

            let connect = read_binary(&mut ws).await;
            assert_eq!(connect, packet::connect("client-1", 60).unwrap().to_vec());
            ws.send(Message::Binary(vec![0x20, 2, 0, 0])).await.unwrap();

            let subscribe = read_binary(&mut ws).await;
            assert_eq!(
                subscribe,
                packet::subscribe(1, "plant/telemetry").unwrap().to_vec()
            );

            // SUBACK and the first PUBLISH share one frame
            let mut frame = vec![0x90, 3, 0, 1, 0];
            frame.extend_from_slice(&[0x30, 12, 0, 3, b'a', b'/', b'b']);
            frame.extend_from_slice(b"{\"v\":1}");
            ws.send(Message::Binary(frame)).await.unwrap();

            // QoS 1 delivery expects a PUBACK
            let mut publish = vec![0x32, 9, 0, 1, b'x', 0, 9];
            publish.extend_from_slice(b"1234");
            ws.send(Message::Binary(publish)).await.unwrap();
            assert_eq!(read_binary(&mut ws).await, vec![0x40, 2, 0, 9]);
        });

        let transport = MqttWsTransport::new(TransportConfig::default());
        let mut session = transport.open(&url, "client-1").await.unwrap();
        session.subscribe("plant/telemetry").await.unwrap();

        let first = session.next_message().await.unwrap();
        assert_eq!(first.topic, "a/b");
        assert_eq!(first.payload.as_ref(), b"{\"v\":1}");

        let second = session.next_message().await.unwrap();
        assert_eq!(second.topic, "x");
        assert_eq!(second.payload.as_ref(), b"1234");

        broker.await.unwrap();
        session.close().await;
    }

    #[tokio::test]
    async fn test_refused_connack_is_rejected() {
        let (listener, url) = listener().await;

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_hdr_async(stream, accept_mqtt).await.unwrap();
            read_binary(&mut ws).await;
            ws.send(Message::Binary(vec![0x20, 2, 0, 5])).await.unwrap();
        });

        let transport = MqttWsTransport::default();
        let err = transport.open(&url, "client-1").await.err().unwrap();
        assert_eq!(
            err,
            TransportError::Rejected("connection refused: not authorized".to_string())
        );
    }

    #[tokio::test]
    async fn test_forbidden_upgrade_is_unauthorized() {
        let (listener, url) = listener().await;

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = accept_hdr_async(stream, refuse).await;
        });

        let transport = MqttWsTransport::default();
        let err = transport.open(&url, "client-1").await.err().unwrap();
        assert_eq!(err, TransportError::Unauthorized { status: 403 });
        assert!(err.is_auth_related());
    }

    #[tokio::test]
    async fn test_server_close_ends_session() {
        let (listener, url) = listener().await;

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_hdr_async(stream, accept_mqtt).await.unwrap();
            read_binary(&mut ws).await;
            ws.send(Message::Binary(vec![0x20, 2, 0, 0])).await.unwrap();
            ws.close(None).await.unwrap();
        });

        let transport = MqttWsTransport::default();
        let mut session = transport.open(&url, "client-1").await.unwrap();
        let err = session.next_message().await.unwrap_err();
        assert!(matches!(err, TransportError::Closed { .. }));
    }

    #[tokio::test]
    async fn test_close_is_bounded_when_peer_stops_reading() {
        let (listener, url) = listener().await;

        let (stall_tx, stall_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_hdr_async(stream, accept_mqtt).await.unwrap();
            read_binary(&mut ws).await;
            ws.send(Message::Binary(vec![0x20, 2, 0, 0])).await.unwrap();
            // Hold the socket open without reading anything further
            let _ = stall_rx.await;
            drop(ws);
        });

        let transport = MqttWsTransport::default();
        let mut session = transport.open(&url, "client-1").await.unwrap();

        let closed = time::timeout(CLOSE_TIMEOUT + Duration::from_secs(1), session.close()).await;
        assert!(closed.is_ok());
        let _ = stall_tx.send(());
    }
}
