mod calls;
mod chat;

use calls::RingTimers;

use crate::config::{PushAdapter, ServerConfig};
use crate::metrics::{HealthSnapshot, Metrics};
use crate::security::limiter::{RateLimiter, RateScope};
use crate::util::token_digest;
use base64::engine::general_purpose::STANDARD as Base64;
use base64::Engine;
use chrono::{Duration, Utc};
use futures_util::{SinkExt, StreamExt};
use http::HeaderValue;
use peal_proto::signal::ConnectHello;
use peal_proto::{CodecError, ControlEnvelope, Frame, FrameType};
use peal_push::{DebugPushGateway, ExpoPushGateway, NullPushGateway, PushGateway, PushNote};
use peal_storage::{
    connect, CallRecord, MessageRecord, PresenceSnapshot, Storage, StorageError, UserProfile,
    UserStatus,
};
use pingora::apps::{HttpServerApp, HttpServerOptions, ReusedHttpStream};
use pingora::http::{RequestHeader, ResponseHeader};
use pingora::protocols::http::v2::server::H2Options;
use pingora::protocols::http::ServerSession;
use pingora::protocols::Stream as PingoraStream;
use pingora::server::ShutdownWatch;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, timeout};
use tokio_tungstenite::tungstenite::{
    handshake::derive_accept_key,
    protocol::{Message, Role},
};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

const LANDING_PAGE: &str = "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\" />\n<title>Peal</title>\n<style>body{font-family:-apple-system,BlinkMacSystemFont,'Segoe UI',sans-serif;background:#101418;color:#f4f6f8;margin:0;display:flex;align-items:center;justify-content:center;height:100vh;}main{max-width:480px;text-align:center;padding:2rem;background:rgba(22,28,34,0.9);border-radius:20px;}h1{font-size:2.25rem;margin-bottom:0.5rem;}p{margin:0.75rem 0;color:#aab4c0;}a{color:#4cc2ff;text-decoration:none;}a:hover{text-decoration:underline;}</style>\n</head>\n<body>\n<main>\n<h1>Peal Server</h1>\n<p>Call signaling and chat relay.</p>\n<p><a href=\"/healthz\">Health</a> · <a href=\"/readyz\">Readiness</a></p>\n</main>\n</body>\n</html>\n";

#[derive(Debug)]
pub enum ServerError {
    Storage,
    Codec,
    Invalid,
    Conflict,
    Missing,
    Unauthorized,
    Io,
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage => write!(f, "storage failure"),
            Self::Codec => write!(f, "codec failure"),
            Self::Invalid => write!(f, "invalid request"),
            Self::Conflict => write!(f, "conflicting state"),
            Self::Missing => write!(f, "missing record"),
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::Io => write!(f, "io failure"),
        }
    }
}

impl Error for ServerError {}

impl From<StorageError> for ServerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Missing => ServerError::Missing,
            StorageError::Conflict => ServerError::Conflict,
            StorageError::Invalid => ServerError::Invalid,
            _ => ServerError::Storage,
        }
    }
}

impl From<CodecError> for ServerError {
    fn from(_: CodecError) -> Self {
        ServerError::Codec
    }
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    BadRequest(String),
    NotFound,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectMode {
    Binary,
    Sse,
    WebSocket,
}

impl ConnectMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Sse => "sse",
            Self::WebSocket => "websocket",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HttpConnectFormat {
    Binary,
    Sse,
}

impl HttpConnectFormat {
    fn mode(self) -> ConnectMode {
        match self {
            Self::Binary => ConnectMode::Binary,
            Self::Sse => ConnectMode::Sse,
        }
    }

    fn content_type(self) -> &'static str {
        match self {
            Self::Binary => "application/octet-stream",
            Self::Sse => "text/event-stream",
        }
    }
}

struct HttpChannel {
    session: ServerSession,
    format: HttpConnectFormat,
    remote_addr: Option<String>,
    last_keepalive: Instant,
    keepalive_interval: StdDuration,
}

const SSE_KEEPALIVE: &[u8] = b":keepalive\n\n";

fn keepalive_period(base: u64) -> u64 {
    let half = base.saturating_div(2).max(1);
    half.max(5)
}

struct WebSocketChannel {
    stream: WebSocketStream<PingoraStream>,
    remote_addr: Option<String>,
}

#[allow(clippy::large_enum_variant)]
enum ConnectChannel {
    Http(HttpChannel),
    WebSocket(WebSocketChannel),
}

impl HttpChannel {
    fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, ServerError> {
        match self.session.read_request_body().await {
            Ok(Some(chunk)) => Ok(Some(chunk.to_vec())),
            Ok(None) => Ok(None),
            Err(_) => Err(ServerError::Io),
        }
    }

    async fn send_payload(&mut self, frame: &Frame, payload: Vec<u8>) -> Result<(), ServerError> {
        let chunk = match self.format {
            HttpConnectFormat::Binary => payload,
            HttpConnectFormat::Sse => format!(
                "event: frame\nid: {}\ndata: {}\n\n",
                frame.sequence,
                Base64.encode(payload)
            )
            .into_bytes(),
        };
        self.session
            .write_response_body(chunk.into(), false)
            .await
            .map_err(|_| ServerError::Io)?;
        self.last_keepalive = Instant::now();
        Ok(())
    }

    async fn sse_preamble(&mut self) -> Result<(), ServerError> {
        if matches!(self.format, HttpConnectFormat::Sse) {
            self.session
                .write_response_body(b":ready\n\n".to_vec().into(), false)
                .await
                .map_err(|_| ServerError::Io)?;
            self.last_keepalive = Instant::now();
        }
        Ok(())
    }

    async fn tick_keepalive(&mut self) -> Result<(), ServerError> {
        if !matches!(self.format, HttpConnectFormat::Sse) {
            return Ok(());
        }
        let now = Instant::now();
        if now.duration_since(self.last_keepalive) < self.keepalive_interval {
            return Ok(());
        }
        self.session
            .write_response_body(SSE_KEEPALIVE.to_vec().into(), false)
            .await
            .map_err(|_| ServerError::Io)?;
        self.last_keepalive = now;
        Ok(())
    }

    async fn finish(self) -> Result<(), ServerError> {
        let HttpChannel { session, .. } = self;
        session.finish().await.map_err(|_| ServerError::Io)?;
        Ok(())
    }

    fn set_keepalive_interval(&mut self, interval: StdDuration) {
        self.keepalive_interval = interval;
        self.last_keepalive = Instant::now();
    }
}

impl WebSocketChannel {
    fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, ServerError> {
        while let Some(next) = self.stream.next().await {
            let message = next.map_err(|err| {
                error!(error = %err, "websocket read failure");
                ServerError::Io
            })?;
            match message {
                Message::Binary(bytes) => return Ok(Some(bytes)),
                Message::Text(text) => match Base64.decode(text.trim().as_bytes()) {
                    Ok(bytes) => return Ok(Some(bytes)),
                    Err(err) => warn!(error = %err, "discarding non-base64 text frame"),
                },
                Message::Ping(body) => {
                    self.stream
                        .send(Message::Pong(body))
                        .await
                        .map_err(|_| ServerError::Io)?;
                }
                Message::Close(_) => return Ok(None),
                Message::Pong(_) | Message::Frame(_) => {}
            }
        }
        Ok(None)
    }

    async fn send_payload(&mut self, payload: Vec<u8>) -> Result<(), ServerError> {
        self.stream
            .send(Message::Binary(payload))
            .await
            .map_err(|_| ServerError::Io)
    }

    async fn finish(mut self) -> Result<(), ServerError> {
        if let Err(err) = self.stream.close(None).await {
            debug!(error = %err, "websocket close error");
        }
        Ok(())
    }
}

/// Validates the upgrade request headers and derives the accept key, or
/// reports the HTTP status the refusal should carry.
fn websocket_accept(req: &RequestHeader) -> Result<String, u16> {
    if !req.method.as_str().eq_ignore_ascii_case("GET") {
        return Err(405);
    }
    let upgraded = header_str(req, "Upgrade").is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let negotiated = req
        .headers
        .get("Connection")
        .is_some_and(|v| header_has_token(v, "upgrade"));
    if !upgraded || !negotiated {
        return Err(400);
    }
    if header_str(req, "Sec-WebSocket-Version").map(str::trim) != Some("13") {
        return Err(400);
    }
    let key = header_str(req, "Sec-WebSocket-Key").ok_or(400u16)?;
    Ok(derive_accept_key(key.trim().as_bytes()))
}

fn header_str<'a>(req: &'a RequestHeader, name: &str) -> Option<&'a str> {
    req.headers.get(name).and_then(|value| value.to_str().ok())
}

impl ConnectChannel {
    async fn open(session: ServerSession, mode: ConnectMode) -> Result<Self, ServerError> {
        match mode {
            ConnectMode::Binary => Self::open_http(session, HttpConnectFormat::Binary).await,
            ConnectMode::Sse => Self::open_http(session, HttpConnectFormat::Sse).await,
            ConnectMode::WebSocket => Self::open_websocket(session).await,
        }
    }

    fn remote_addr(&self) -> Option<&str> {
        match self {
            Self::Http(channel) => channel.remote_addr(),
            Self::WebSocket(channel) => channel.remote_addr(),
        }
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, ServerError> {
        match self {
            Self::Http(channel) => channel.next_chunk().await,
            Self::WebSocket(channel) => channel.next_chunk().await,
        }
    }

    async fn send_payload(&mut self, frame: &Frame, payload: Vec<u8>) -> Result<(), ServerError> {
        match self {
            Self::Http(channel) => channel.send_payload(frame, payload).await,
            Self::WebSocket(channel) => channel.send_payload(payload).await,
        }
    }

    async fn finish(self) -> Result<(), ServerError> {
        match self {
            Self::Http(channel) => channel.finish().await,
            Self::WebSocket(channel) => channel.finish().await,
        }
    }

    fn set_keepalive_interval(&mut self, interval: StdDuration) {
        if let Self::Http(channel) = self {
            channel.set_keepalive_interval(interval);
        }
    }

    async fn tick_keepalive(&mut self) -> Result<(), ServerError> {
        match self {
            Self::Http(channel) => channel.tick_keepalive().await,
            Self::WebSocket(_) => Ok(()),
        }
    }

    async fn open_http(
        mut session: ServerSession,
        format: HttpConnectFormat,
    ) -> Result<Self, ServerError> {
        let remote_addr = session.client_addr().map(|addr| addr.to_string());
        let mut response =
            ResponseHeader::build_no_case(200, None).map_err(|_| ServerError::Invalid)?;
        response
            .append_header("content-type", format.content_type())
            .map_err(|_| ServerError::Invalid)?;
        response
            .append_header("cache-control", "no-store")
            .map_err(|_| ServerError::Invalid)?;
        response
            .append_header("x-peal-connect-mode", format.mode().as_str())
            .map_err(|_| ServerError::Invalid)?;
        if matches!(format, HttpConnectFormat::Sse)
            && response.append_header("connection", "keep-alive").is_err()
        {
            return Err(ServerError::Invalid);
        }
        session
            .write_response_header(Box::new(response))
            .await
            .map_err(|_| ServerError::Io)?;
        let mut channel = HttpChannel {
            session,
            format,
            remote_addr,
            last_keepalive: Instant::now(),
            keepalive_interval: StdDuration::from_secs(25),
        };
        channel.sse_preamble().await?;
        Ok(Self::Http(channel))
    }

    async fn open_websocket(session: ServerSession) -> Result<Self, ServerError> {
        let remote_addr = session.client_addr().map(|addr| addr.to_string());
        let mut h1 = match session {
            ServerSession::H1(h1) => h1,
            mut other => {
                let _ = other.respond_error(400).await;
                return Err(ServerError::Invalid);
            }
        };
        let accept_key = match websocket_accept(h1.req_header()) {
            Ok(key) => key,
            Err(status) => {
                let mut session = ServerSession::H1(h1);
                let _ = session.respond_error(status).await;
                return Err(ServerError::Invalid);
            }
        };
        let mut response =
            ResponseHeader::build_no_case(101, None).map_err(|_| ServerError::Invalid)?;
        let headers = [
            ("upgrade", "websocket"),
            ("connection", "Upgrade"),
            ("sec-websocket-accept", accept_key.as_str()),
            ("x-peal-connect-mode", ConnectMode::WebSocket.as_str()),
        ];
        for (name, value) in headers {
            response
                .append_header(name, value)
                .map_err(|_| ServerError::Invalid)?;
        }
        h1.write_response_header(Box::new(response))
            .await
            .map_err(|_| ServerError::Io)?;
        let websocket =
            WebSocketStream::from_raw_socket(h1.into_inner(), Role::Server, None).await;
        Ok(Self::WebSocket(WebSocketChannel {
            stream: websocket,
            remote_addr,
        }))
    }
}

fn negotiate_mode(req: &RequestHeader) -> ConnectMode {
    if let Some(explicit) = header_str(req, "x-peal-connect-mode").and_then(mode_from_str) {
        return explicit;
    }
    let wants_upgrade =
        header_str(req, "Upgrade").is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if wants_upgrade
        && req
            .headers
            .get("Connection")
            .is_some_and(|v| header_has_token(v, "upgrade"))
    {
        return ConnectMode::WebSocket;
    }
    if req
        .headers
        .get("Accept")
        .is_some_and(|v| header_has_token(v, "text/event-stream"))
    {
        return ConnectMode::Sse;
    }
    ConnectMode::Binary
}

fn mode_from_str(value: &str) -> Option<ConnectMode> {
    match value.trim().to_ascii_lowercase().as_str() {
        "binary" | "stream" => Some(ConnectMode::Binary),
        "sse" | "event-stream" | "eventstream" => Some(ConnectMode::Sse),
        "websocket" | "ws" => Some(ConnectMode::WebSocket),
        _ => None,
    }
}

fn header_has_token(value: &HeaderValue, token: &str) -> bool {
    value
        .to_str()
        .ok()
        .map(|raw| {
            raw.split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
        .unwrap_or(false)
}

fn frame_label(frame_type: FrameType) -> &'static str {
    match frame_type {
        FrameType::Hello => "hello",
        FrameType::Ack => "ack",
        FrameType::CallRequest => "call_request",
        FrameType::CallAccept => "call_accept",
        FrameType::CallReject => "call_reject",
        FrameType::CallEnd => "call_end",
        FrameType::CallBusy => "call_busy",
        FrameType::CallTimeout => "call_timeout",
        FrameType::IceCandidate => "ice_candidate",
        FrameType::ChatMessage => "chat_message",
        FrameType::ChatTyping => "chat_typing",
        FrameType::ChatStopTyping => "chat_stop_typing",
        FrameType::MessageRead => "message_read",
        FrameType::Error => "error",
    }
}

pub struct AppState {
    pub config: ServerConfig,
    pub storage: Arc<Storage>,
    pub push: Box<dyn PushGateway>,
    pub metrics: Arc<Metrics>,
    pub connections: RwLock<HashMap<String, ConnectionEntry>>,
    pub(crate) ring_timers: RingTimers,
    pub rate_limits: Arc<RateLimiter>,
    pub presence_ttl: i64,
    pub started_at: Instant,
}

pub struct ConnectionEntry {
    pub sender: mpsc::Sender<Frame>,
    pub session_id: String,
    next_sequence: AtomicU64,
}

impl ConnectionEntry {
    pub fn new(sender: mpsc::Sender<Frame>, session_id: String) -> Self {
        ConnectionEntry {
            sender,
            session_id,
            next_sequence: AtomicU64::new(1),
        }
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::SeqCst)
    }
}

impl AppState {
    /// Delivers a frame to the user's current connection, looked up at
    /// emission time. A missing or closed connection is a silent routing
    /// miss, not an error.
    pub(crate) async fn deliver_to_user(
        &self,
        user_id: &str,
        frame_type: FrameType,
        properties: Value,
    ) -> bool {
        let target = {
            let connections = self.connections.read().await;
            connections
                .get(user_id)
                .map(|entry| (entry.sender.clone(), entry.next_sequence()))
        };
        let Some((sender, sequence)) = target else {
            debug!(target = %user_id, kind = frame_label(frame_type), "routing miss");
            return false;
        };
        let frame = Frame {
            sequence,
            frame_type,
            payload: ControlEnvelope { properties },
        };
        if sender.send(frame).await.is_err() {
            debug!(target = %user_id, "connection closed during delivery");
            return false;
        }
        true
    }

    /// Fires a best-effort push notification without blocking the caller.
    pub(crate) fn spawn_push(
        self: &Arc<Self>,
        user_id: String,
        title: String,
        body: String,
        data: Value,
    ) {
        let state = Arc::clone(self);
        tokio::spawn(async move {
            let profile = match state.storage.load_user(&user_id).await {
                Ok(profile) => profile,
                Err(err) => {
                    debug!(user = %user_id, error = %err, "push recipient lookup failed");
                    return;
                }
            };
            let Some(token) = profile.push_token else {
                return;
            };
            let note = PushNote {
                token,
                title,
                body,
                data,
            };
            match state.push.deliver(&note).await {
                Ok(()) => state.metrics.mark_push_sent(),
                Err(err) => {
                    state.metrics.mark_push_failed();
                    debug!(user = %user_id, error = %err, "push delivery failed");
                }
            }
        });
    }
}

pub struct PealApp {
    state: Arc<AppState>,
    http_server_options: HttpServerOptions,
}

impl PealApp {
    pub fn new(state: Arc<AppState>) -> Self {
        let http_server_options = HttpServerOptions::default();
        PealApp {
            state,
            http_server_options,
        }
    }

    pub async fn init(config: ServerConfig) -> Result<Arc<AppState>, ServerError> {
        let storage = Arc::new(
            connect(&config.postgres_dsn, &config.redis_url)
                .await
                .map_err(ServerError::from)?,
        );
        storage.migrate().await?;
        let push: Box<dyn PushGateway> = match config.push.adapter {
            PushAdapter::Null => Box::new(NullPushGateway),
            PushAdapter::Debug => Box::new(DebugPushGateway),
            PushAdapter::Expo => {
                let gateway = ExpoPushGateway::new(config.push.endpoint.clone()).map_err(|err| {
                    error!(error = %err, "push gateway initialisation failed");
                    ServerError::Invalid
                })?;
                Box::new(gateway)
            }
        };
        let metrics = Arc::new(Metrics::new());
        let rate_limits = Arc::new(RateLimiter::new(&config.rate_limit));
        let presence_ttl = config.presence_ttl_seconds;
        let state = Arc::new(AppState {
            storage: Arc::clone(&storage),
            push,
            metrics,
            connections: RwLock::new(HashMap::new()),
            ring_timers: RingTimers::new(),
            rate_limits,
            presence_ttl,
            started_at: Instant::now(),
            config,
        });
        let cleanup_state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut ticker = interval(StdDuration::from_secs(60));
            loop {
                ticker.tick().await;
                match cleanup_state.storage.purge_expired_sessions().await {
                    Ok(0) => {}
                    Ok(purged) => info!(sessions = purged, "expired sessions purged"),
                    Err(err) => warn!(error = %err, "session cleanup failed"),
                }
            }
        });
        Ok(state)
    }
}

impl HttpServerApp for PealApp {
    fn process_new_http<'life0, 'life1, 'async_trait>(
        self: &'life0 Arc<Self>,
        session: ServerSession,
        shutdown: &'life1 ShutdownWatch,
    ) -> Pin<Box<dyn Future<Output = Option<ReusedHttpStream>> + Send + 'async_trait>>
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move { self.handle_session(session, shutdown).await })
    }

    fn h2_options(&self) -> Option<H2Options> {
        None
    }

    fn server_options(&self) -> Option<&HttpServerOptions> {
        Some(&self.http_server_options)
    }
}

impl PealApp {
    async fn handle_session(
        self: &Arc<Self>,
        mut session: ServerSession,
        shutdown: &ShutdownWatch,
    ) -> Option<ReusedHttpStream> {
        match session.read_request().await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(err) => {
                error!(error = %err, "failed to read request");
                return None;
            }
        }
        let path = session.req_header().uri.path().to_string();
        let method = session.req_header().method.to_string();
        if path != "/connect" {
            if let Some(retry_after) = self.check_rate_limit(&session, RateScope::Http).await {
                self.state.metrics.mark_http_rate_limited();
                if let Err(err) = self.respond_rate_limited(session, retry_after).await {
                    error!(error = %err, "rate limit response failed");
                }
                return None;
            }
        }
        match path.as_str() {
            "/" | "/index.html" => {
                if let Err(err) = self
                    .respond_bytes(
                        &mut session,
                        200,
                        "text/html; charset=utf-8",
                        LANDING_PAGE.into(),
                    )
                    .await
                {
                    debug!(error = %err, "landing response failed");
                }
                return None;
            }
            "/healthz" => {
                let uptime = self.state.started_at.elapsed().as_secs();
                let health = HealthSnapshot {
                    status: "healthy".to_string(),
                    uptime_seconds: uptime,
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    connections: self.state.metrics.connections_active(),
                    frames_ingress: self.state.metrics.frames_ingress(),
                    frames_egress: self.state.metrics.frames_egress(),
                    calls_started: self.state.metrics.calls_started(),
                    calls_missed: self.state.metrics.calls_missed(),
                    chat_messages: self.state.metrics.chat_messages(),
                };
                let payload = serde_json::to_value(&health).unwrap_or_else(|_| {
                    json!({
                        "status": "unknown",
                    })
                });
                if let Err(err) = self.respond_json(&mut session, 200, payload).await {
                    error!(error = ?err, "health response failed");
                }
                return None;
            }
            "/readyz" => {
                let (status, body) = if self.state.storage.readiness().await.is_ok() {
                    (200, "ready")
                } else {
                    (503, "degraded")
                };
                if let Err(err) = self
                    .respond_bytes(&mut session, status, "text/plain", body.into())
                    .await
                {
                    debug!(error = %err, "readiness response failed");
                }
                return None;
            }
            "/metrics" => {
                if !self.authorize_admin(&session) {
                    let _ = self
                        .respond_api_error(&mut session, ApiError::Unauthorized)
                        .await;
                    return None;
                }
                let payload = self.state.metrics.encode_prometheus();
                if let Err(err) = self
                    .respond_bytes(
                        &mut session,
                        200,
                        "text/plain; version=0.0.4",
                        payload.into_bytes(),
                    )
                    .await
                {
                    debug!(error = %err, "metrics response failed");
                }
                return None;
            }
            "/connect" => {
                return self.process_connect(session, shutdown).await;
            }
            _ => {}
        }
        if path == "/api/calls/history" && method == "GET" {
            match self.handle_call_history(&mut session).await {
                Ok(()) => {}
                Err(err) => {
                    let _ = self.respond_api_error(&mut session, err).await;
                }
            }
            return None;
        }
        if let Some(peer) = path.strip_prefix("/api/chat/history/") {
            if method == "GET" {
                let peer = peer.trim_end_matches('/').to_string();
                match self.handle_chat_history(&mut session, &peer).await {
                    Ok(()) => {}
                    Err(err) => {
                        let _ = self.respond_api_error(&mut session, err).await;
                    }
                }
                return None;
            }
        }
        let _ = self.respond_api_error(&mut session, ApiError::NotFound).await;
        None
    }

    fn authorize_admin(&self, session: &ServerSession) -> bool {
        let Some(expected) = self.state.config.admin_token.as_deref() else {
            return false;
        };
        bearer_token(session)
            .map(|token| token == expected)
            .unwrap_or(false)
    }

    async fn authenticate_session(
        &self,
        session: &ServerSession,
    ) -> Result<UserProfile, ApiError> {
        let token = bearer_token(session).ok_or(ApiError::Unauthorized)?;
        self.resolve_token(token)
            .await
            .map(|(profile, _)| profile)
            .map_err(|_| ApiError::Unauthorized)
    }

    async fn resolve_token(&self, token: &str) -> Result<(UserProfile, String), ServerError> {
        if token.trim().is_empty() {
            return Err(ServerError::Unauthorized);
        }
        let session = self
            .state
            .storage
            .load_session_by_digest(&token_digest(token))
            .await
            .map_err(|_| ServerError::Unauthorized)?;
        let profile = self
            .state
            .storage
            .load_user(&session.user_id)
            .await
            .map_err(|_| ServerError::Unauthorized)?;
        if profile.status != UserStatus::Active {
            return Err(ServerError::Unauthorized);
        }
        Ok((profile, session.session_id))
    }

    async fn handle_call_history(&self, session: &mut ServerSession) -> Result<(), ApiError> {
        let profile = self.authenticate_session(session).await?;
        let calls = self
            .state
            .storage
            .list_calls_for_user(&profile.user_id, self.state.config.history_page_size)
            .await
            .map_err(|_| ApiError::Internal)?;
        let payload = Value::Array(calls.iter().map(call_payload).collect());
        self.respond_json(session, 200, payload).await
    }

    async fn handle_chat_history(
        &self,
        session: &mut ServerSession,
        peer: &str,
    ) -> Result<(), ApiError> {
        if peer.is_empty() {
            return Err(ApiError::BadRequest("missing peer user id".to_string()));
        }
        let profile = self.authenticate_session(session).await?;
        let messages = self
            .state
            .storage
            .list_messages_between(&profile.user_id, peer, self.state.config.history_page_size)
            .await
            .map_err(|_| ApiError::Internal)?;
        let payload = Value::Array(messages.iter().map(message_payload).collect());
        self.respond_json(session, 200, payload).await
    }

    /// Writes a complete response and closes out the exchange.
    async fn respond_bytes(
        &self,
        session: &mut ServerSession,
        status: u16,
        content_type: &'static str,
        body: Vec<u8>,
    ) -> Result<(), ServerError> {
        let mut response =
            ResponseHeader::build_no_case(status, None).map_err(|_| ServerError::Invalid)?;
        response
            .append_header("content-type", content_type)
            .map_err(|_| ServerError::Invalid)?;
        session
            .write_response_header(Box::new(response))
            .await
            .map_err(|_| ServerError::Io)?;
        session
            .write_response_body(body.into(), true)
            .await
            .map_err(|_| ServerError::Io)?;
        session.finish().await.map_err(|_| ServerError::Io)?;
        Ok(())
    }

    async fn respond_json(
        &self,
        session: &mut ServerSession,
        status: u16,
        payload: Value,
    ) -> Result<(), ApiError> {
        self.respond_bytes(
            session,
            status,
            "application/json",
            payload.to_string().into_bytes(),
        )
        .await
        .map_err(|_| ApiError::Internal)
    }

    async fn respond_api_error(
        &self,
        session: &mut ServerSession,
        error: ApiError,
    ) -> Result<(), ServerError> {
        let (status, title, detail) = match error {
            ApiError::Unauthorized => (401, "Unauthorized", None),
            ApiError::BadRequest(detail) => (400, "Bad Request", Some(detail)),
            ApiError::NotFound => (404, "Not Found", None),
            ApiError::Internal => (500, "Internal Server Error", None),
        };
        let mut body = json!({
            "type": "about:blank",
            "title": title,
            "status": status,
        });
        if let Some(detail) = detail {
            if let Some(map) = body.as_object_mut() {
                map.insert("detail".to_string(), json!(detail));
            }
        }
        self.respond_bytes(
            session,
            status,
            "application/problem+json",
            body.to_string().into_bytes(),
        )
        .await
    }

    async fn check_rate_limit(
        &self,
        session: &ServerSession,
        scope: RateScope,
    ) -> Option<StdDuration> {
        let identity = session
            .client_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let decision = self.state.rate_limits.check(scope, &identity).await;
        if decision.allowed {
            None
        } else {
            Some(
                decision
                    .retry_after
                    .unwrap_or_else(|| StdDuration::from_secs(1)),
            )
        }
    }

    async fn respond_rate_limited(
        &self,
        mut session: ServerSession,
        retry_after: StdDuration,
    ) -> Result<(), ServerError> {
        let mut response =
            ResponseHeader::build_no_case(429, None).map_err(|_| ServerError::Invalid)?;
        let seconds = retry_after.as_secs().max(1).to_string();
        let headers = [
            ("content-type", "application/problem+json"),
            ("retry-after", seconds.as_str()),
        ];
        for (name, value) in headers {
            response
                .append_header(name, value)
                .map_err(|_| ServerError::Invalid)?;
        }
        let body = json!({
            "type": "about:blank",
            "title": "Too Many Requests",
            "status": 429,
        });
        session
            .write_response_header(Box::new(response))
            .await
            .map_err(|_| ServerError::Io)?;
        session
            .write_response_body(body.to_string().into_bytes().into(), true)
            .await
            .map_err(|_| ServerError::Io)?;
        session.finish().await.map_err(|_| ServerError::Io)?;
        Ok(())
    }

    async fn write_frame(
        &self,
        channel: &mut ConnectChannel,
        frame: Frame,
    ) -> Result<(), ServerError> {
        let encoded = frame.encode()?;
        channel.send_payload(&frame, encoded).await?;
        self.state.metrics.mark_egress();
        Ok(())
    }

    async fn write_error_frame(
        &self,
        channel: &mut ConnectChannel,
        sequence: u64,
        properties: Value,
    ) -> Result<(), ServerError> {
        self.write_frame(
            channel,
            Frame {
                sequence,
                frame_type: FrameType::Error,
                payload: ControlEnvelope { properties },
            },
        )
        .await
    }

    async fn process_connect(
        self: &Arc<Self>,
        session: ServerSession,
        shutdown: &ShutdownWatch,
    ) -> Option<ReusedHttpStream> {
        if let Some(retry_after) = self.check_rate_limit(&session, RateScope::Connect).await {
            self.state.metrics.mark_connect_rate_limited();
            if let Err(err) = self.respond_rate_limited(session, retry_after).await {
                error!(error = %err, "connect rate limit response failed");
            }
            return None;
        }
        let mode = negotiate_mode(session.req_header());
        let mut channel = match ConnectChannel::open(session, mode).await {
            Ok(channel) => channel,
            Err(err) => {
                error!(mode = mode.as_str(), error = %err, "failed to initialise connect channel");
                return None;
            }
        };
        let keepalive_secs = keepalive_period(self.state.config.connection_keepalive);
        channel.set_keepalive_interval(StdDuration::from_secs(keepalive_secs));
        let peer = channel
            .remote_addr()
            .unwrap_or("unknown")
            .to_string();
        info!(peer = %peer, mode = mode.as_str(), "connect channel opened");

        let mut buffer = Vec::new();
        let mut server_sequence = 1u64;

        // The channel carries nothing but the hello until identity is known.
        let (profile, session_id) = loop {
            match channel.next_chunk().await {
                Ok(Some(chunk)) => buffer.extend_from_slice(&chunk),
                Ok(None) => {
                    debug!(peer = %peer, "client closed before hello");
                    return None;
                }
                Err(err) => {
                    error!(peer = %peer, error = %err, "hello read failed");
                    return None;
                }
            }
            match Frame::decode(&buffer) {
                Ok((frame, consumed)) => {
                    buffer.drain(0..consumed);
                    self.state.metrics.mark_ingress();
                    match self.process_hello_frame(&frame).await {
                        Ok(accepted) => break accepted,
                        Err(err) => {
                            warn!(peer = %peer, error = %err, "hello rejected");
                            let refusal = json!({
                                "error": "handshake",
                                "detail": err.to_string(),
                            });
                            let _ = self
                                .write_error_frame(&mut channel, server_sequence, refusal)
                                .await;
                            return None;
                        }
                    }
                }
                Err(CodecError::UnexpectedEof) => continue,
                Err(err) => {
                    error!(peer = %peer, error = %err, "hello decode failure");
                    let _ = self
                        .write_error_frame(
                            &mut channel,
                            server_sequence,
                            json!({ "error": "decode" }),
                        )
                        .await;
                    return None;
                }
            }
        };

        let user_id = profile.user_id.clone();
        info!(peer = %peer, user = %user_id, session = %session_id, "connect established");

        let (tx_out, mut rx_out) = mpsc::channel::<Frame>(128);
        {
            let mut connections = self.state.connections.write().await;
            connections.insert(
                user_id.clone(),
                ConnectionEntry::new(tx_out.clone(), session_id.clone()),
            );
        }
        self.state.metrics.incr_connections();
        let presence = PresenceSnapshot {
            entity: user_id.clone(),
            state: "online".to_string(),
            expires_at: Utc::now() + Duration::seconds(self.state.presence_ttl),
        };
        if let Err(err) = self.state.storage.publish_presence(&presence).await {
            warn!(user = %user_id, error = %err, "presence publish failed");
        }
        if let Err(err) = self
            .state
            .storage
            .register_route(&user_id, &session_id, self.state.presence_ttl)
            .await
        {
            warn!(user = %user_id, error = %err, "route register failed");
        }

        let ack_frame = Frame {
            sequence: server_sequence,
            frame_type: FrameType::Ack,
            payload: ControlEnvelope {
                properties: json!({
                    "handshake": "ok",
                    "session": session_id.clone(),
                    "user_id": user_id.clone(),
                    "keepalive_interval": keepalive_secs,
                }),
            },
        };
        server_sequence += 1;
        if let Err(err) = self.write_frame(&mut channel, ack_frame).await {
            error!(user = %user_id, error = %err, "handshake ack send failed");
            self.cleanup_connection(&user_id, &session_id).await;
            return None;
        }

        let read_timeout = StdDuration::from_millis(50);
        'session_loop: loop {
            if *shutdown.borrow() {
                break;
            }

            // Drain queued outbound frames before blocking on the next read.
            while let Ok(frame) = rx_out.try_recv() {
                if let Err(err) = self.write_frame(&mut channel, frame).await {
                    error!(user = %user_id, error = %err, "outbound send failed");
                    break 'session_loop;
                }
            }

            let chunk = match timeout(read_timeout, channel.next_chunk()).await {
                Ok(Ok(Some(chunk))) => chunk,
                Ok(Ok(None)) => break,
                Ok(Err(err)) => {
                    error!(user = %user_id, error = %err, "read failure");
                    break;
                }
                Err(_) => {
                    if rx_out.is_closed() && rx_out.is_empty() {
                        break;
                    }
                    if let Err(err) = channel.tick_keepalive().await {
                        error!(user = %user_id, error = %err, "keepalive send failed");
                        break;
                    }
                    continue;
                }
            };
            if chunk.is_empty() {
                continue;
            }
            buffer.extend_from_slice(&chunk);
            if let Err(err) = self
                .consume_established_frames(&user_id, &mut buffer, &tx_out, &mut server_sequence)
                .await
            {
                error!(user = %user_id, error = %err, "frame processing failure");
                break;
            }
        }

        self.cleanup_connection(&user_id, &session_id).await;
        if let Err(err) = channel.finish().await {
            debug!(error = %err, "connect channel finish failed");
        }
        None
    }

    async fn process_hello_frame(
        &self,
        frame: &Frame,
    ) -> Result<(UserProfile, String), ServerError> {
        if frame.frame_type != FrameType::Hello {
            return Err(ServerError::Invalid);
        }
        let hello = ConnectHello::try_from(&frame.payload)?;
        let (profile, session_id) = self.resolve_token(&hello.token).await?;
        if let Some(token) = hello.push_token.as_deref() {
            if !token.trim().is_empty() {
                if let Err(err) = self
                    .state
                    .storage
                    .set_push_token(&profile.user_id, token)
                    .await
                {
                    warn!(user = %profile.user_id, error = %err, "push token upsert failed");
                }
            }
        }
        Ok((profile, session_id))
    }

    async fn consume_established_frames(
        &self,
        user_id: &str,
        buffer: &mut Vec<u8>,
        tx_out: &mpsc::Sender<Frame>,
        server_sequence: &mut u64,
    ) -> Result<(), ServerError> {
        loop {
            match Frame::decode(buffer) {
                Ok((frame, consumed)) => {
                    buffer.drain(0..consumed);
                    self.state.metrics.mark_ingress();
                    self.handle_established_frame(user_id, frame, tx_out, server_sequence)
                        .await?;
                }
                Err(CodecError::UnexpectedEof) => return Ok(()),
                Err(err) => {
                    error!(user = %user_id, error = %err, "decode failure");
                    self.send_self_frame(
                        tx_out,
                        server_sequence,
                        FrameType::Error,
                        json!({
                            "error": "decode",
                        }),
                    )
                    .await;
                    return Err(ServerError::Codec);
                }
            }
        }
    }

    async fn handle_established_frame(
        &self,
        user_id: &str,
        frame: Frame,
        tx_out: &mpsc::Sender<Frame>,
        server_sequence: &mut u64,
    ) -> Result<(), ServerError> {
        match frame.frame_type {
            FrameType::CallRequest => {
                self.handle_call_request(user_id, &frame.payload, tx_out, server_sequence)
                    .await
            }
            FrameType::CallAccept => {
                self.handle_call_accept(user_id, &frame.payload, tx_out, server_sequence)
                    .await
            }
            FrameType::CallReject => {
                self.handle_call_reject(user_id, &frame.payload, tx_out, server_sequence)
                    .await
            }
            FrameType::CallEnd => {
                self.handle_call_end(user_id, &frame.payload, tx_out, server_sequence)
                    .await
            }
            FrameType::IceCandidate => {
                self.handle_ice_candidate(user_id, &frame.payload, tx_out, server_sequence)
                    .await
            }
            FrameType::ChatMessage => {
                self.handle_chat_send(user_id, &frame.payload, tx_out, server_sequence)
                    .await
            }
            FrameType::ChatTyping => {
                self.handle_typing(user_id, &frame.payload, false, tx_out, server_sequence)
                    .await
            }
            FrameType::ChatStopTyping => {
                self.handle_typing(user_id, &frame.payload, true, tx_out, server_sequence)
                    .await
            }
            FrameType::MessageRead => {
                self.handle_message_read(user_id, &frame.payload, tx_out, server_sequence)
                    .await
            }
            FrameType::Hello | FrameType::Ack => Ok(()),
            FrameType::Error => {
                warn!(user = %user_id, "client error frame");
                Ok(())
            }
            FrameType::CallBusy | FrameType::CallTimeout => {
                self.state.metrics.mark_validation_failure();
                self.send_event_error(
                    tx_out,
                    server_sequence,
                    frame_label(frame.frame_type),
                    "server-emitted event",
                )
                .await;
                Ok(())
            }
        }
    }

    /// Pushes a server-originated frame onto the connection's outbound queue.
    pub(crate) async fn send_self_frame(
        &self,
        tx_out: &mpsc::Sender<Frame>,
        server_sequence: &mut u64,
        frame_type: FrameType,
        properties: Value,
    ) {
        let frame = Frame {
            sequence: *server_sequence,
            frame_type,
            payload: ControlEnvelope { properties },
        };
        *server_sequence += 1;
        let _ = tx_out.send(frame).await;
    }

    pub(crate) async fn send_event_error(
        &self,
        tx_out: &mpsc::Sender<Frame>,
        server_sequence: &mut u64,
        event: &str,
        detail: &str,
    ) {
        self.send_self_frame(
            tx_out,
            server_sequence,
            FrameType::Error,
            json!({
                "error": detail,
                "event": event,
            }),
        )
        .await;
    }

    async fn cleanup_connection(&self, user_id: &str, session_id: &str) {
        {
            let mut connections = self.state.connections.write().await;
            let owned = connections
                .get(user_id)
                .map(|entry| entry.session_id == session_id)
                .unwrap_or(false);
            if owned {
                connections.remove(user_id);
            } else {
                // a newer connection has taken over the slot
                return;
            }
        }
        self.state.metrics.decr_connections();
        let presence = PresenceSnapshot {
            entity: user_id.to_string(),
            state: "offline".to_string(),
            expires_at: Utc::now() + Duration::seconds(self.state.presence_ttl),
        };
        if let Err(err) = self.state.storage.publish_presence(&presence).await {
            warn!(user = %user_id, error = %err, "presence publish failed");
        }
        if let Err(err) = self.state.storage.clear_route(user_id).await {
            warn!(user = %user_id, error = %err, "route clear failed");
        }
        info!(user = %user_id, "connection closed");
    }
}

fn bearer_token(session: &ServerSession) -> Option<&str> {
    session
        .req_header()
        .headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| {
            let trimmed = raw.trim();
            if trimmed.len() > 7 && trimmed[..7].eq_ignore_ascii_case("bearer ") {
                Some(trimmed[7..].trim())
            } else {
                None
            }
        })
}

fn call_payload(record: &CallRecord) -> Value {
    json!({
        "call_id": record.call_id,
        "caller": record.caller,
        "receiver": record.receiver,
        "type": record.call_type.as_str(),
        "status": record.status.as_str(),
        "started_at": record.started_at.to_rfc3339(),
        "ended_at": record.ended_at.map(|at| at.to_rfc3339()),
        "data_usage": record.data_usage,
    })
}

fn message_payload(record: &MessageRecord) -> Value {
    json!({
        "message_id": record.message_id,
        "sender": record.sender,
        "receiver": record.receiver,
        "content": record.content,
        "delivered": record.delivered,
        "read": record.read,
        "created_at": record.created_at.to_rfc3339(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_fragment_aliases() {
        assert_eq!(mode_from_str("stream"), Some(ConnectMode::Binary));
        assert_eq!(mode_from_str("SSe"), Some(ConnectMode::Sse));
        assert_eq!(mode_from_str("ws"), Some(ConnectMode::WebSocket));
        assert_eq!(mode_from_str("unknown"), None);
    }

    #[test]
    fn header_token_detection_is_case_insensitive() {
        let header = HeaderValue::from_static("Upgrade, keep-alive");
        assert!(header_has_token(&header, "upgrade"));
        assert!(header_has_token(&header, "KEEP-ALIVE"));
        assert!(!header_has_token(&header, "websocket"));
    }

    #[test]
    fn keepalive_interval_has_floor() {
        assert_eq!(keepalive_period(2), 5);
        assert_eq!(keepalive_period(0), 5);
    }

    #[test]
    fn keepalive_interval_halves_connection_keepalive() {
        assert_eq!(keepalive_period(120), 60);
        assert_eq!(keepalive_period(61), 30);
    }

    #[test]
    fn sse_keepalive_payload_format() {
        assert_eq!(SSE_KEEPALIVE, b":keepalive\n\n");
    }

    #[test]
    fn frame_labels_cover_event_surface() {
        assert_eq!(frame_label(FrameType::CallRequest), "call_request");
        assert_eq!(frame_label(FrameType::CallTimeout), "call_timeout");
        assert_eq!(frame_label(FrameType::ChatStopTyping), "chat_stop_typing");
        assert_eq!(frame_label(FrameType::MessageRead), "message_read");
    }

    #[test]
    fn call_payload_shape() {
        use chrono::Utc;
        use peal_storage::{CallStatus, CallType};
        let record = CallRecord {
            call_id: "call-1".to_string(),
            caller: "alice".to_string(),
            receiver: "bob".to_string(),
            call_type: CallType::Audio,
            status: CallStatus::Missed,
            started_at: Utc::now(),
            ended_at: Some(Utc::now()),
            data_usage: 0,
        };
        let payload = call_payload(&record);
        assert_eq!(payload["type"], json!("audio"));
        assert_eq!(payload["status"], json!("missed"));
        assert!(payload["ended_at"].is_string());
    }

    #[test]
    fn message_payload_shape() {
        use chrono::Utc;
        let record = MessageRecord {
            message_id: "msg-1".to_string(),
            sender: "alice".to_string(),
            receiver: "bob".to_string(),
            content: "hi".to_string(),
            delivered: true,
            read: false,
            created_at: Utc::now(),
        };
        let payload = message_payload(&record);
        assert_eq!(payload["delivered"], json!(true));
        assert_eq!(payload["read"], json!(false));
    }
}
