//! Backend connection handling.
//!
//! One `BackendConnection` owns one socket to one database server for its
//! whole life. The owning session task drives it through the
//! authentication state machine, writes client traffic through it and
//! pumps classified replies back out of it. Nothing here is shared
//! between tasks; the pool moves whole connections, never references.

pub mod pool;
pub mod tracker;

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::auth::SessionCredentials;
use crate::dns::DnsCache;
use crate::monitor::{Server, ServerAddr};
use crate::protocol::packet::capabilities;
use crate::protocol::response::{
    err_codes, parse_session_track, prepared_response_complete, text_result_complete, PreparedOk,
};
use crate::protocol::{
    build_change_user, compute_auth_response_from_stage1, handshake::auth_switch_response,
    is_auth_switch_payload, is_err_payload, is_ok_payload, is_result_set_header,
    AuthSwitchRequest, Buffer, BufferFlags, ErrPacket, HandshakeResponse, InitialHandshake,
    OkPacket, Packet, PacketCodec, ResponseTracker, DEFAULT_AUTH_PLUGIN, SCRAMBLE_LEN,
};

use tracker::CommandTracker;

/// Authentication progress of one backend connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Init,
    PendingConnect,
    Connected,
    ResponseSent,
    Complete,
    Failed,
    HandshakeFailed,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Lost connection to backend server: {0}")]
    Lost(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed handshake from backend: {0}")]
    Handshake(String),

    #[error("Backend authentication failed: {code} {message}")]
    Auth { code: u16, message: String },

    #[error("Re-authentication failed: {code} {message}")]
    ReAuth { code: u16, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection not writable in state {0:?}")]
    NotWritable(AuthState),
}

impl ConnectionError {
    /// Whether this failure calls for a credential reload
    pub fn requires_user_reload(&self) -> bool {
        match self {
            ConnectionError::Auth { code, .. } | ConnectionError::ReAuth { code, .. } => {
                matches!(
                    *code,
                    err_codes::ER_ACCESS_DENIED_ERROR
                        | err_codes::ER_DBACCESS_DENIED_ERROR
                        | err_codes::ER_ACCESS_DENIED_NO_PASSWORD_ERROR
                )
            }
            _ => false,
        }
    }
}

/// What happened to a write request
#[derive(Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Went out on the socket
    Sent,
    /// Parked until authentication or re-authentication completes
    Delayed,
    /// Deliberately not sent (COM_QUIT against a pooled server)
    Dropped,
}

/// A classified inbound event
#[derive(Debug)]
pub enum BackendEvent {
    /// Frames for the router. `last` marks the end of the exchange.
    Reply { buffer: Buffer, last: bool },
    /// A suppressed exchange finished; nothing goes to the client
    IgnoredComplete,
}

/// TCP or unix-socket transport to a backend
pub enum BackendStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl BackendStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            BackendStream::Tcp(s) => s.peer_addr().ok(),
            BackendStream::Unix(_) => None,
        }
    }
}

impl AsyncRead for BackendStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            BackendStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            BackendStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            BackendStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            BackendStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            BackendStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Render the PROXY protocol v1 line announcing the real client.
///
/// Mismatched address families are reconciled by writing the IPv4 side in
/// `::ffff:a.b.c.d` form; anything that is not an IP pair degrades to the
/// UNKNOWN variant.
pub fn proxy_protocol_header(client: Option<SocketAddr>, server: Option<SocketAddr>) -> String {
    let (client, server) = match (client, server) {
        (Some(c), Some(s)) => (c, s),
        _ => return "PROXY UNKNOWN\r\n".to_string(),
    };

    match (client.ip(), server.ip()) {
        (IpAddr::V4(c), IpAddr::V4(s)) => format!(
            "PROXY TCP4 {} {} {} {}\r\n",
            c,
            s,
            client.port(),
            server.port()
        ),
        (IpAddr::V6(c), IpAddr::V6(s)) => format!(
            "PROXY TCP6 {} {} {} {}\r\n",
            c,
            s,
            client.port(),
            server.port()
        ),
        (IpAddr::V4(c), IpAddr::V6(s)) => format!(
            "PROXY TCP6 ::ffff:{} {} {} {}\r\n",
            c,
            s,
            client.port(),
            server.port()
        ),
        (IpAddr::V6(c), IpAddr::V4(s)) => format!(
            "PROXY TCP6 {} ::ffff:{} {} {}\r\n",
            c,
            s,
            client.port(),
            server.port()
        ),
    }
}

/// Classify an authentication ERR and apply its side effect.
///
/// A blocked host puts the server into maintenance so the proxy stops
/// feeding the backend's failed-connect counter.
pub fn handle_auth_error(server: &Server, err: &ErrPacket) {
    error!(
        server = %server.name,
        code = err.error_code,
        message = %err.error_message,
        "invalid authentication message from backend"
    );
    if err.error_code == err_codes::ER_HOST_IS_BLOCKED {
        server.enter_maintenance_blocked();
    }
}

/// One connection to one backend server
pub struct BackendConnection<S = BackendStream> {
    server: Arc<Server>,
    creds: SessionCredentials,
    client_addr: Option<SocketAddr>,
    framed: Option<Framed<S, PacketCodec>>,
    state: AuthState,
    capabilities: u32,
    /// Charset byte the server chose in its handshake
    charset: u8,
    /// Nonce from the backend's handshake; re-auth proofs reuse it
    scramble: [u8; SCRAMBLE_LEN],
    pub tracker: CommandTracker,
    delay_queue: VecDeque<Buffer>,
    /// Just left the pool; the first write triggers re-identification
    was_persistent: bool,
    collect_buf: Buffer,
    stream_tracker: Option<ResponseTracker>,
}

impl BackendConnection<BackendStream> {
    /// A connection record in its initial state; nothing is dialled yet
    pub fn new(
        server: Arc<Server>,
        creds: SessionCredentials,
        client_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            server,
            creds,
            client_addr,
            framed: None,
            state: AuthState::Init,
            capabilities: 0,
            charset: 0x21,
            scramble: [0u8; SCRAMBLE_LEN],
            tracker: CommandTracker::new(),
            delay_queue: VecDeque::new(),
            was_persistent: false,
            collect_buf: Buffer::default(),
            stream_tracker: None,
        }
    }

    /// Drive the connection to the authenticated state, dialling first if
    /// necessary, then flush anything the router wrote early.
    pub async fn ready(&mut self, dns: &DnsCache) -> Result<(), ConnectionError> {
        if self.state == AuthState::Init {
            self.dial(dns).await?;
        }
        self.drive_ready().await
    }

    async fn dial(&mut self, dns: &DnsCache) -> Result<(), ConnectionError> {
        self.state = AuthState::PendingConnect;
        let addr = self.server.addr.clone();
        let dialled = match &addr {
            ServerAddr::Tcp { host, port } => match dns.resolve(host, *port).await {
                Ok(ip) => TcpStream::connect((ip, *port))
                    .await
                    .map(|s| {
                        s.set_nodelay(true).ok();
                        BackendStream::Tcp(s)
                    })
                    .map_err(|e| format!("[{}]:{}: {}", host, port, e)),
                Err(e) => Err(format!("[{}]:{}: {}", host, port, e)),
            },
            ServerAddr::Unix { path } => UnixStream::connect(path)
                .await
                .map(BackendStream::Unix)
                .map_err(|e| format!("{}: {}", path, e)),
        };
        let stream = match dialled {
            Ok(stream) => stream,
            Err(cause) => {
                self.state = AuthState::Failed;
                return Err(ConnectionError::Connect(cause));
            }
        };
        self.state = AuthState::Connected;
        debug!(server = %self.server.name, "established connection to backend");

        let peer = stream.peer_addr();
        self.framed = Some(Framed::new(stream, PacketCodec));

        if self.server.proxy_protocol {
            let header = proxy_protocol_header(self.client_addr, peer);
            info!(server = %self.server.name, header = %header.trim_end(), "sending proxy-protocol header");
            let framed = self.framed.as_mut().ok_or(ConnectionError::NotWritable(self.state))?;
            framed.send(header.as_bytes()).await?;
        }
        Ok(())
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> BackendConnection<S> {
    /// Progress the handshake until the connection is usable, then flush
    /// the delay queue.
    pub async fn drive_ready(&mut self) -> Result<(), ConnectionError> {
        loop {
            match self.state {
                AuthState::Complete => {
                    self.flush_delay_queue().await?;
                    return Ok(());
                }
                AuthState::Failed | AuthState::HandshakeFailed => {
                    return Err(ConnectionError::NotWritable(self.state));
                }
                AuthState::Init | AuthState::PendingConnect => {
                    return Err(ConnectionError::NotWritable(self.state));
                }
                AuthState::Connected => {
                    let packet = self.read_packet().await?;
                    if is_err_payload(&packet.payload) {
                        let err = parse_err(&packet.payload);
                        handle_auth_error(&self.server, &err);
                        self.state = AuthState::Failed;
                        return Err(ConnectionError::Auth {
                            code: err.error_code,
                            message: err.error_message,
                        });
                    }
                    let handshake = match InitialHandshake::parse(&packet.payload) {
                        Some(h) => h,
                        None => {
                            debug!(bytes = ?&packet.payload[..], "malformed backend handshake");
                            self.state = AuthState::HandshakeFailed;
                            return Err(ConnectionError::Handshake(
                                "unparseable initial handshake".to_string(),
                            ));
                        }
                    };
                    self.scramble = handshake.scramble();
                    self.charset = handshake.character_set;
                    self.capabilities =
                        capabilities::DEFAULT_CAPABILITIES & handshake.capability_flags;

                    let mut caps = self.capabilities;
                    if self.creds.database.is_some() {
                        caps |= capabilities::CLIENT_CONNECT_WITH_DB;
                    }
                    let auth_response = self.auth_token(&self.scramble.clone());
                    let response = HandshakeResponse {
                        capability_flags: caps,
                        max_packet_size: 16 * 1024 * 1024,
                        character_set: self.creds.charset,
                        username: self.creds.username.clone(),
                        auth_response,
                        database: self.creds.database.clone(),
                        auth_plugin_name: handshake.auth_plugin_name.clone(),
                    };
                    self.send_packet(response.encode(packet.sequence_id + 1)).await?;
                    self.state = AuthState::ResponseSent;
                }
                AuthState::ResponseSent => {
                    let packet = self.read_packet().await?;
                    if is_ok_payload(&packet.payload) {
                        self.state = AuthState::Complete;
                        debug!(server = %self.server.name, user = %self.creds.username,
                            "backend authentication successful");
                    } else if is_err_payload(&packet.payload) {
                        let err = parse_err(&packet.payload);
                        handle_auth_error(&self.server, &err);
                        self.state = AuthState::Failed;
                        return Err(ConnectionError::Auth {
                            code: err.error_code,
                            message: err.error_message,
                        });
                    } else if is_auth_switch_payload(&packet.payload) {
                        // The plug-in is dispatched and the state stays put
                        self.answer_auth_switch(&packet).await?;
                    } else {
                        debug!(bytes = ?&packet.payload[..], "unexpected authentication reply");
                        self.state = AuthState::Failed;
                        return Err(ConnectionError::Protocol(
                            "unexpected packet during authentication".to_string(),
                        ));
                    }
                }
            }
        }
    }

    /// Answer an auth-switch request targeting the default plug-in; any
    /// other target is fatal.
    async fn answer_auth_switch(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        let switch = AuthSwitchRequest::parse(&packet.payload).ok_or_else(|| {
            ConnectionError::Protocol("unparseable auth-switch request".to_string())
        })?;
        if switch.plugin_name != DEFAULT_AUTH_PLUGIN {
            error!(
                requested = %switch.plugin_name,
                expected = DEFAULT_AUTH_PLUGIN,
                "received AuthSwitchRequest to an unsupported plug-in"
            );
            self.state = AuthState::Failed;
            return Err(ConnectionError::Protocol(format!(
                "auth switch to unsupported plug-in '{}'",
                switch.plugin_name
            )));
        }
        if let Some(scramble) = switch.scramble() {
            // The server generated a fresh nonce for the re-challenge
            self.scramble = scramble;
        }
        let token = self.auth_token(&self.scramble.clone());
        self.send_packet(auth_switch_response(&token, packet.sequence_id + 1))
            .await
    }

    fn auth_token(&self, scramble: &[u8; SCRAMBLE_LEN]) -> Vec<u8> {
        match &self.creds.stage1 {
            Some(stage1) => compute_auth_response_from_stage1(stage1, scramble),
            None => Vec::new(),
        }
    }

    /// Write client traffic, honouring the connection's current phase.
    pub async fn write(&mut self, buffer: Buffer) -> Result<WriteOutcome, ConnectionError> {
        if self.was_persistent {
            self.was_persistent = false;
            self.tracker.reset_for_checkout();

            if self.state != AuthState::Complete {
                return Err(ConnectionError::NotWritable(self.state));
            }
            if buffer.is_com_quit() {
                // Closed before the first write; the socket goes straight
                // back to the pool on release.
                info!(server = %self.server.name,
                    "COM_QUIT received as the first write, ignoring and keeping the pooled connection");
                return Ok(WriteOutcome::Dropped);
            }

            let change_user = build_change_user(
                &self.creds.username,
                self.creds.stage1.as_ref(),
                self.creds.database.as_deref(),
                self.creds.charset,
                &self.scramble,
            );
            self.send_buffer(change_user).await?;
            info!(server = %self.server.name, user = %self.creds.username, "sent COM_CHANGE_USER");
            self.tracker.changing_user = true;
            self.tracker.expect_ignored_reply();
            self.tracker.store_query(buffer);
            self.stream_tracker = None;
            return Ok(WriteOutcome::Sent);
        }

        if self.tracker.ignoring() {
            if buffer.is_com_quit() {
                // Session is closing while the re-auth is still in flight;
                // nothing sane can be salvaged from this socket.
                info!("COM_QUIT received while COM_CHANGE_USER is in progress, closing pooled connection");
                self.state = AuthState::Failed;
                return Err(ConnectionError::Lost(
                    "session closed during re-authentication".to_string(),
                ));
            }
            // BLOB continuations or pipelined queries land behind the
            // deferred first query.
            debug!("COM_CHANGE_USER in progress, appending query to stored buffer");
            self.tracker.store_query(buffer);
            return Ok(WriteOutcome::Delayed);
        }

        match self.state {
            AuthState::Failed | AuthState::HandshakeFailed => {
                warn!(
                    server = %self.server.name,
                    state = ?self.state,
                    "unable to write to backend after authentication failure"
                );
                Err(ConnectionError::NotWritable(self.state))
            }
            AuthState::Complete => {
                if buffer.is_com_quit() && self.server.persistent_conns_enabled() {
                    // Pooled connections stay alive; the quit is dropped
                    return Ok(WriteOutcome::Dropped);
                }
                self.tracker.prepare_for_write(&buffer);
                self.stream_tracker = None;
                self.collect_buf = Buffer::default();
                self.send_buffer(buffer).await?;
                Ok(WriteOutcome::Sent)
            }
            _ => {
                // Authentication still in progress. A quit this early is
                // dropped outright; the socket is released on close.
                if buffer.is_com_quit() {
                    return Ok(WriteOutcome::Dropped);
                }
                debug!(server = %self.server.name, state = ?self.state, "delaying write");
                self.delay_queue.push_back(buffer);
                Ok(WriteOutcome::Delayed)
            }
        }
    }

    /// Send everything parked while authentication was running
    async fn flush_delay_queue(&mut self) -> Result<(), ConnectionError> {
        while let Some(mut buffer) = self.delay_queue.pop_front() {
            if buffer.is_com_change_user() {
                // Recreate the packet with the scramble this backend sent
                buffer = build_change_user(
                    &self.creds.username,
                    self.creds.stage1.as_ref(),
                    self.creds.database.as_deref(),
                    self.creds.charset,
                    &self.scramble,
                );
                self.tracker.changing_user = true;
            }
            if buffer.is_com_quit() && self.server.persistent_conns_enabled() {
                continue;
            }
            self.tracker.prepare_for_write(&buffer);
            self.send_buffer(buffer).await?;
        }
        Ok(())
    }

    /// Read and classify the next inbound event.
    ///
    /// Suppressed replies are consumed internally: the caller only ever
    /// sees frames meant for the router, or a notice that a suppressed
    /// exchange finished.
    pub async fn next_reply(&mut self) -> Result<BackendEvent, ConnectionError> {
        loop {
            let mut packet = self.read_packet().await?;

            if self.tracker.changing_user {
                if is_auth_switch_payload(&packet.payload) {
                    if self.answer_reauth_switch(&packet).await? {
                        continue;
                    }
                    // Unsupported target plug-in
                    let err = ErrPacket::new(
                        0,
                        "HY000",
                        "auth switch to unsupported plug-in during COM_CHANGE_USER",
                    );
                    return Err(ConnectionError::ReAuth {
                        code: err.error_code,
                        message: err.error_message,
                    });
                }
                // Connectors expect the final change-user response with
                // sequence 3 after the switch dance.
                packet.sequence_id = 0x03;
                self.tracker.changing_user = false;
            }

            if self.tracker.ignoring() {
                if is_ok_payload(&packet.payload) {
                    if let Some(mut stored) = self.tracker.ignored_reply_done() {
                        info!("response to COM_CHANGE_USER is OK, writing stored query");
                        stored.set_sequence_id(0x03);
                        self.tracker.prepare_for_write(&stored);
                        self.stream_tracker = None;
                        self.collect_buf = Buffer::default();
                        self.send_buffer(stored).await?;
                        continue;
                    }
                    if !self.tracker.ignoring() {
                        return Ok(BackendEvent::IgnoredComplete);
                    }
                    continue;
                }
                if is_auth_switch_payload(&packet.payload) {
                    if self.answer_reauth_switch(&packet).await? {
                        continue;
                    }
                    return Err(ConnectionError::ReAuth {
                        code: 0,
                        message: "auth switch to unsupported plug-in".to_string(),
                    });
                }
                if is_err_payload(&packet.payload) {
                    let err = parse_err(&packet.payload);
                    handle_auth_error(&self.server, &err);
                    self.state = AuthState::Failed;
                    return Err(ConnectionError::ReAuth {
                        code: err.error_code,
                        message: err.error_message,
                    });
                }
                debug!(bytes = ?&packet.payload[..], "unknown response to suppressed command, closing connection");
                self.state = AuthState::Failed;
                return Err(ConnectionError::Protocol(
                    "unknown response to suppressed command".to_string(),
                ));
            }

            if self.tracker.collect_result {
                let mut piece = BytesMut::new();
                packet.encode(&mut piece);
                self.collect_buf.data.extend_from_slice(&piece);

                if self.collected_response_complete() {
                    self.tracker.collect_result = false;
                    self.record_session_state(None);
                    let mut buffer = std::mem::take(&mut self.collect_buf);
                    buffer.flags.insert(BufferFlags::RESULT);
                    return Ok(BackendEvent::Reply { buffer, last: true });
                }
                continue;
            }

            // Streaming: each complete frame goes up as soon as it arrives
            let last = {
                let tracker = self
                    .stream_tracker
                    .get_or_insert_with(|| ResponseTracker::new(self.tracker.current_command));
                tracker.observe(&packet.payload)
            };
            if last {
                self.stream_tracker = None;
            }
            self.record_session_state(Some(&packet.payload));
            return Ok(BackendEvent::Reply {
                buffer: Buffer::from_packet(&packet),
                last,
            });
        }
    }

    /// Answer an auth-switch that arrived mid-re-auth. Returns false when
    /// the requested plug-in is not the default.
    async fn answer_reauth_switch(&mut self, packet: &Packet) -> Result<bool, ConnectionError> {
        let switch = match AuthSwitchRequest::parse(&packet.payload) {
            Some(s) => s,
            None => return Ok(false),
        };
        if switch.plugin_name != DEFAULT_AUTH_PLUGIN {
            error!(
                requested = %switch.plugin_name,
                expected = DEFAULT_AUTH_PLUGIN,
                "received AuthSwitchRequest to an unexpected plug-in during re-authentication"
            );
            return Ok(false);
        }
        if let Some(scramble) = switch.scramble() {
            self.scramble = scramble;
        }
        let token = self.auth_token(&self.scramble.clone());
        self.send_packet(auth_switch_response(&token, packet.sequence_id + 1))
            .await?;
        Ok(true)
    }

    fn collected_response_complete(&self) -> bool {
        if self.tracker.expecting_text_result() {
            let first = self.collect_buf.frames().next();
            match first {
                Some((_, payload)) if is_result_set_header(payload) => {
                    text_result_complete(&self.collect_buf)
                }
                _ => true,
            }
        } else if self.tracker.expecting_prepare_response() {
            match self.collect_buf.frames().next() {
                Some((_, payload)) if PreparedOk::parse(payload).is_some() => {
                    prepared_response_complete(&self.collect_buf)
                }
                _ => true,
            }
        } else {
            true
        }
    }

    /// Decode session-state deltas from OK payloads when the router asked
    /// for tracking. Prepare responses use a different OK layout and are
    /// skipped.
    fn record_session_state(&mut self, streamed: Option<&[u8]>) {
        if !self.tracker.track_state || self.tracker.expecting_prepare_response() {
            return;
        }
        let mut deltas = Vec::new();
        match streamed {
            Some(payload) => {
                if let Some(ok) = OkPacket::parse(payload) {
                    deltas = parse_session_track(&ok);
                }
            }
            None => {
                for (_, payload) in self.collect_buf.frames() {
                    if let Some(ok) = OkPacket::parse(payload) {
                        deltas.extend(parse_session_track(&ok));
                    }
                }
            }
        }
        if !deltas.is_empty() {
            self.tracker.record_deltas(deltas);
        }
    }

    async fn read_packet(&mut self) -> Result<Packet, ConnectionError> {
        let framed = match self.framed.as_mut() {
            Some(f) => f,
            None => return Err(ConnectionError::NotWritable(self.state)),
        };
        match framed.next().await {
            Some(Ok(packet)) => Ok(packet),
            Some(Err(e)) => {
                self.state = AuthState::Failed;
                Err(ConnectionError::Lost(e.to_string()))
            }
            None => {
                self.state = AuthState::Failed;
                Err(ConnectionError::Lost("connection closed by peer".to_string()))
            }
        }
    }

    async fn send_packet(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        let framed = match self.framed.as_mut() {
            Some(f) => f,
            None => return Err(ConnectionError::NotWritable(self.state)),
        };
        let result = framed.send(packet).await;
        if result.is_err() {
            self.state = AuthState::Failed;
        }
        result.map_err(|e| ConnectionError::Lost(e.to_string()))
    }

    async fn send_buffer(&mut self, buffer: Buffer) -> Result<(), ConnectionError> {
        let framed = match self.framed.as_mut() {
            Some(f) => f,
            None => return Err(ConnectionError::NotWritable(self.state)),
        };
        let result = framed.send(buffer).await;
        if result.is_err() {
            self.state = AuthState::Failed;
        }
        result.map_err(|e| ConnectionError::Lost(e.to_string()))
    }

    /// Send COM_QUIT and drop the socket
    pub async fn close(mut self) {
        if self.state == AuthState::Complete {
            let quit = Packet::new(0, vec![crate::protocol::Command::Quit as u8]);
            let _ = self.send_packet(quit).await;
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn credentials(&self) -> &SessionCredentials {
        &self.creds
    }

    pub fn authenticated_user(&self) -> &str {
        &self.creds.username
    }

    /// Bytes parked on this connection waiting to go out
    pub fn pending_bytes(&self) -> usize {
        let delayed: usize = self.delay_queue.iter().map(Buffer::len).sum();
        let stored = self
            .tracker
            .stored_query
            .as_ref()
            .map(Buffer::len)
            .unwrap_or(0);
        delayed + stored
    }

    /// Park-time invariant: authenticated, nothing suppressed, nothing
    /// queued, nothing half-collected
    pub fn is_poolable(&self) -> bool {
        self.state == AuthState::Complete
            && self.tracker.is_clean()
            && self.delay_queue.is_empty()
            && self.collect_buf.is_empty()
    }

    /// Mark as freshly checked out of the pool for a new identity; the
    /// first write will re-authenticate.
    pub fn begin_reauth(&mut self, creds: SessionCredentials) {
        self.creds = creds;
        self.was_persistent = true;
    }

    /// Hand over to the same identity without re-authentication
    pub fn adopt(&mut self, creds: SessionCredentials) {
        self.creds = creds;
        self.was_persistent = false;
    }

    /// Whether the next write will trigger a COM_CHANGE_USER
    pub fn is_pending_reauth(&self) -> bool {
        self.was_persistent
    }

    /// Re-identify this connection for a client-initiated change of user.
    ///
    /// Unlike the pooled re-auth, the backend's reply is routed to the
    /// client: connectors want to see the outcome of their own
    /// COM_CHANGE_USER.
    pub async fn change_identity(
        &mut self,
        creds: SessionCredentials,
    ) -> Result<WriteOutcome, ConnectionError> {
        self.creds = creds;
        if self.state != AuthState::Complete {
            // Still authenticating; a placeholder is parked and rebuilt
            // with the backend's scramble when the queue flushes.
            let placeholder = build_change_user(
                &self.creds.username,
                self.creds.stage1.as_ref(),
                self.creds.database.as_deref(),
                self.creds.charset,
                &[0u8; SCRAMBLE_LEN],
            );
            self.delay_queue.push_back(placeholder);
            return Ok(WriteOutcome::Delayed);
        }

        let change_user = build_change_user(
            &self.creds.username,
            self.creds.stage1.as_ref(),
            self.creds.database.as_deref(),
            self.creds.charset,
            &self.scramble,
        );
        self.tracker.prepare_for_write(&change_user);
        self.tracker.changing_user = true;
        self.stream_tracker = None;
        self.collect_buf = Buffer::default();
        self.send_buffer(change_user).await?;
        Ok(WriteOutcome::Sent)
    }

    #[cfg(test)]
    pub(crate) fn for_test(
        server: Arc<Server>,
        creds: SessionCredentials,
        framed: Framed<S, PacketCodec>,
        state: AuthState,
    ) -> Self {
        Self {
            server,
            creds,
            client_addr: None,
            framed: Some(framed),
            state,
            capabilities: capabilities::DEFAULT_CAPABILITIES,
            charset: 0x21,
            scramble: [0u8; SCRAMBLE_LEN],
            tracker: CommandTracker::new(),
            delay_queue: VecDeque::new(),
            was_persistent: false,
            collect_buf: Buffer::default(),
            stream_tracker: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn set_scramble(&mut self, scramble: [u8; SCRAMBLE_LEN]) {
        self.scramble = scramble;
    }
}

fn parse_err(payload: &[u8]) -> ErrPacket {
    ErrPacket::parse(payload)
        .unwrap_or_else(|| ErrPacket::new(2013, "HY000", "malformed error packet"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendDef;
    use crate::protocol::response::{EofPacket, OkPacket};
    use crate::protocol::sha1_digest;
    use tokio::io::DuplexStream;

    fn test_server(persistent: bool) -> Arc<Server> {
        Arc::new(Server::from_def(&BackendDef {
            name: "db1".to_string(),
            address: "10.0.0.9".to_string(),
            port: 3306,
            proxy_protocol: false,
            persistent_pool_max: if persistent { 4 } else { 0 },
        }))
    }

    fn creds(user: &str, password: &str, db: Option<&str>) -> SessionCredentials {
        SessionCredentials {
            username: user.to_string(),
            database: db.map(str::to_string),
            charset: 0x21,
            stage1: Some(sha1_digest(password.as_bytes())),
        }
    }

    fn pair(
        server: Arc<Server>,
        creds: SessionCredentials,
        state: AuthState,
    ) -> (
        BackendConnection<DuplexStream>,
        Framed<DuplexStream, PacketCodec>,
    ) {
        let (client, remote) = tokio::io::duplex(1 << 20);
        let conn = BackendConnection::for_test(
            server,
            creds,
            Framed::new(client, PacketCodec),
            state,
        );
        (conn, Framed::new(remote, PacketCodec))
    }

    fn query_buffer(sql: &str) -> Buffer {
        let mut payload = vec![crate::protocol::Command::Query as u8];
        payload.extend_from_slice(sql.as_bytes());
        Buffer::from_packet(&Packet::new(0, payload))
    }

    async fn recv(remote: &mut Framed<DuplexStream, PacketCodec>) -> Packet {
        remote.next().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_handshake_drive_to_complete() {
        let (mut conn, mut remote) =
            pair(test_server(true), creds("alice", "secret", None), AuthState::Connected);

        let backend = tokio::spawn(async move {
            let hs = InitialHandshake::new(99);
            let scramble = hs.scramble();
            remote.send(hs.encode()).await.unwrap();

            let auth = recv(&mut remote).await;
            let parsed = HandshakeResponse::parse(&auth.payload).unwrap();
            assert_eq!(parsed.username, "alice");
            let expected = compute_auth_response_from_stage1(
                &sha1_digest(b"secret"),
                &scramble,
            );
            assert_eq!(parsed.auth_response, expected);

            remote.send(OkPacket::new().encode(2)).await.unwrap();
            remote
        });

        conn.drive_ready().await.unwrap();
        assert_eq!(conn.state(), AuthState::Complete);
        backend.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_auth_switch_round_trip() {
        let (mut conn, mut remote) =
            pair(test_server(true), creds("alice", "secret", None), AuthState::Connected);

        let backend = tokio::spawn(async move {
            let hs = InitialHandshake::new(7);
            remote.send(hs.encode()).await.unwrap();
            let _auth = recv(&mut remote).await;

            // Re-challenge with a fresh scramble
            let fresh = [0x5Au8; SCRAMBLE_LEN];
            let mut payload = vec![0xFE];
            payload.extend_from_slice(DEFAULT_AUTH_PLUGIN.as_bytes());
            payload.push(0);
            payload.extend_from_slice(&fresh);
            payload.push(0);
            remote.send(Packet::new(2, payload)).await.unwrap();

            let reply = recv(&mut remote).await;
            assert_eq!(reply.sequence_id, 3);
            let expected =
                compute_auth_response_from_stage1(&sha1_digest(b"secret"), &fresh);
            assert_eq!(&reply.payload[..], &expected[..]);

            remote.send(OkPacket::new().encode(4)).await.unwrap();
        });

        conn.drive_ready().await.unwrap();
        assert_eq!(conn.state(), AuthState::Complete);
        backend.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_handshake_is_terminal() {
        let (mut conn, mut remote) =
            pair(test_server(true), creds("alice", "secret", None), AuthState::Connected);

        tokio::spawn(async move {
            remote.send(Packet::new(0, vec![0x0A, 0x00])).await.unwrap();
            remote
        });

        let err = conn.drive_ready().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Handshake(_)));
        assert_eq!(conn.state(), AuthState::HandshakeFailed);
    }

    #[tokio::test]
    async fn test_blocked_host_enters_maintenance() {
        // Scenario: authentication fails with ER_HOST_IS_BLOCKED; the
        // server is marked for maintenance and the connection dies.
        let server = test_server(true);
        let (mut conn, mut remote) =
            pair(server.clone(), creds("alice", "secret", None), AuthState::Connected);

        tokio::spawn(async move {
            let hs = InitialHandshake::new(1);
            remote.send(hs.encode()).await.unwrap();
            let _auth = recv(&mut remote).await;
            let err = ErrPacket::new(
                err_codes::ER_HOST_IS_BLOCKED,
                "HY000",
                "Host 'proxy' is blocked because of many connection errors",
            );
            remote.send(err.encode(2)).await.unwrap();
        });

        let err = conn.drive_ready().await.unwrap_err();
        match &err {
            ConnectionError::Auth { code, message } => {
                assert_eq!(*code, err_codes::ER_HOST_IS_BLOCKED);
                assert!(message.contains("blocked"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!err.requires_user_reload());
        assert!(server.is_in_maintenance());
        assert_eq!(conn.state(), AuthState::Failed);
    }

    #[tokio::test]
    async fn test_access_denied_requests_reload() {
        let server = test_server(true);
        let (mut conn, mut remote) =
            pair(server.clone(), creds("alice", "bad", None), AuthState::Connected);

        tokio::spawn(async move {
            let hs = InitialHandshake::new(1);
            remote.send(hs.encode()).await.unwrap();
            let _auth = recv(&mut remote).await;
            let err = ErrPacket::new(
                err_codes::ER_ACCESS_DENIED_ERROR,
                "28000",
                "Access denied for user 'alice'",
            );
            remote.send(err.encode(2)).await.unwrap();
        });

        let err = conn.drive_ready().await.unwrap_err();
        assert!(err.requires_user_reload());
        assert!(!server.is_in_maintenance());
    }

    #[tokio::test]
    async fn test_delay_queue_flushes_after_auth() {
        let (mut conn, mut remote) =
            pair(test_server(true), creds("alice", "secret", None), AuthState::Connected);

        // Routed before the backend finished authenticating
        let outcome = conn.write(query_buffer("SELECT 1")).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Delayed);
        assert!(conn.pending_bytes() > 0);

        let backend = tokio::spawn(async move {
            let hs = InitialHandshake::new(3);
            remote.send(hs.encode()).await.unwrap();
            let _auth = recv(&mut remote).await;
            remote.send(OkPacket::new().encode(2)).await.unwrap();

            // The parked query arrives only now
            let query = recv(&mut remote).await;
            assert_eq!(query.payload[0], crate::protocol::Command::Query as u8);
            assert_eq!(&query.payload[1..], b"SELECT 1");
        });

        conn.drive_ready().await.unwrap();
        assert_eq!(conn.pending_bytes(), 0);
        assert_eq!(conn.tracker.current_command, crate::protocol::Command::Query);
        backend.await.unwrap();
    }

    #[tokio::test]
    async fn test_streaming_reply_frames() {
        // Scenario: SELECT 1 streamed: the router sees four discrete
        // frames after the column-count header, in order.
        let (mut conn, mut remote) =
            pair(test_server(true), creds("alice", "secret", None), AuthState::Complete);

        conn.write(query_buffer("SELECT 1")).await.unwrap();

        let backend = tokio::spawn(async move {
            let query = recv(&mut remote).await;
            assert_eq!(&query.payload[1..], b"SELECT 1");

            remote.send(Packet::new(1, vec![0x01])).await.unwrap();
            remote
                .send(Packet::new(2, vec![0x03, b'd', b'e', b'f']))
                .await
                .unwrap();
            remote
                .send(EofPacket { warnings: 0, status_flags: 2 }.encode(3))
                .await
                .unwrap();
            remote.send(Packet::new(4, vec![0x01, b'1'])).await.unwrap();
            remote
                .send(EofPacket { warnings: 0, status_flags: 2 }.encode(5))
                .await
                .unwrap();
        });

        let mut frames = Vec::new();
        loop {
            match conn.next_reply().await.unwrap() {
                BackendEvent::Reply { buffer, last } => {
                    assert!(!buffer.flags.contains(BufferFlags::RESULT));
                    frames.push(buffer);
                    if last {
                        break;
                    }
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[0].frames().next().unwrap().1, &[0x01]);
        backend.await.unwrap();
    }

    #[tokio::test]
    async fn test_collected_result_is_contiguous() {
        // Scenario: same exchange with collect-result set delivers one
        // buffer whose bytes are the concatenation of all five frames.
        let (mut conn, mut remote) =
            pair(test_server(true), creds("alice", "secret", None), AuthState::Complete);

        let buf = query_buffer("SELECT 1").with_flags(BufferFlags::COLLECT_RESULT);
        conn.write(buf).await.unwrap();

        let backend = tokio::spawn(async move {
            let _query = recv(&mut remote).await;

            let mut expected = BytesMut::new();
            let packets = vec![
                Packet::new(1, vec![0x01]),
                Packet::new(2, vec![0x03, b'd', b'e', b'f']),
                EofPacket { warnings: 0, status_flags: 2 }.encode(3),
                Packet::new(4, vec![0x01, b'1']),
                EofPacket { warnings: 0, status_flags: 2 }.encode(5),
            ];
            for p in &packets {
                p.encode(&mut expected);
                remote.send(p.clone()).await.unwrap();
            }
            expected
        });

        let expected = backend.await.unwrap();
        match conn.next_reply().await.unwrap() {
            BackendEvent::Reply { buffer, last } => {
                assert!(last);
                assert!(buffer.flags.contains(BufferFlags::RESULT));
                assert_eq!(&buffer.data[..], &expected[..]);
                assert_eq!(buffer.frame_count(), 5);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_collected_prepare_response() {
        // Scenario: COM_STMT_PREPARE with collect-result: exactly six
        // frames in one buffer.
        let (mut conn, mut remote) =
            pair(test_server(true), creds("alice", "secret", None), AuthState::Complete);

        let mut payload = vec![crate::protocol::Command::StmtPrepare as u8];
        payload.extend_from_slice(b"SELECT ?");
        let buf = Buffer::from_packet(&Packet::new(0, payload))
            .with_flags(BufferFlags::COLLECT_RESULT);
        conn.write(buf).await.unwrap();

        let backend = tokio::spawn(async move {
            let _query = recv(&mut remote).await;

            // prepare-OK: statement_id=7, columns=1, parameters=1
            let mut ok = vec![0x00];
            ok.extend_from_slice(&7u32.to_le_bytes());
            ok.extend_from_slice(&1u16.to_le_bytes());
            ok.extend_from_slice(&1u16.to_le_bytes());
            ok.push(0);
            ok.extend_from_slice(&0u16.to_le_bytes());

            remote.send(Packet::new(1, ok)).await.unwrap();
            remote
                .send(Packet::new(2, vec![0x03, b'd', b'e', b'f'])) // param def
                .await
                .unwrap();
            remote
                .send(EofPacket { warnings: 0, status_flags: 0 }.encode(3))
                .await
                .unwrap();
            remote
                .send(Packet::new(4, vec![0x03, b'd', b'e', b'f'])) // column def
                .await
                .unwrap();
            remote
                .send(EofPacket { warnings: 0, status_flags: 0 }.encode(5))
                .await
                .unwrap();
        });

        match conn.next_reply().await.unwrap() {
            BackendEvent::Reply { buffer, last } => {
                assert!(last);
                assert!(buffer.flags.contains(BufferFlags::RESULT));
                assert_eq!(buffer.frame_count(), 5);
            }
            other => panic!("unexpected event {:?}", other),
        }
        backend.await.unwrap();
    }

    #[tokio::test]
    async fn test_pooled_reauth_with_stored_query() {
        // Scenario: a pooled connection authenticated as alice is handed
        // to bob. The backend sees COM_CHANGE_USER for bob, then the
        // deferred SELECT 2 with sequence 3; the client sees its response.
        let server = test_server(true);
        let (mut conn, mut remote) =
            pair(server, creds("alice", "oldpw", None), AuthState::Complete);
        let backend_scramble = [0x77u8; SCRAMBLE_LEN];
        conn.set_scramble(backend_scramble);

        conn.begin_reauth(creds("bob", "bobpw", Some("testdb")));

        // First client query triggers the re-identification
        conn.write(query_buffer("SELECT 2")).await.unwrap();
        assert!(conn.tracker.ignoring());
        assert!(conn.tracker.changing_user);

        let backend = tokio::spawn(async move {
            let change = recv(&mut remote).await;
            let parsed =
                crate::protocol::ChangeUserRequest::parse(&change.payload).unwrap();
            assert_eq!(parsed.username, "bob");
            assert_eq!(parsed.database.as_deref(), Some("testdb"));
            assert_eq!(parsed.charset, 0x21);
            let expected = compute_auth_response_from_stage1(
                &sha1_digest(b"bobpw"),
                &backend_scramble,
            );
            assert_eq!(parsed.auth_token, expected);

            remote.send(OkPacket::new().encode(1)).await.unwrap();

            // The stored query arrives re-stamped with sequence 3
            let stored = recv(&mut remote).await;
            assert_eq!(stored.sequence_id, 0x03);
            assert_eq!(&stored.payload[1..], b"SELECT 2");

            remote.send(OkPacket::new().encode(1)).await.unwrap();
        });

        match conn.next_reply().await.unwrap() {
            BackendEvent::Reply { buffer, last } => {
                assert!(last);
                let (_, payload) = buffer.frames().next().unwrap();
                assert!(is_ok_payload(payload));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!conn.tracker.ignoring());
        assert!(!conn.tracker.changing_user);
        backend.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_change_user_reply_has_sequence_three() {
        // Property: after a successful COM_CHANGE_USER exchange, the
        // first packet forwarded to the client carries sequence 0x03.
        let (mut conn, mut remote) =
            pair(test_server(true), creds("alice", "oldpw", None), AuthState::Complete);
        conn.set_scramble([0x44u8; SCRAMBLE_LEN]);

        let outcome = conn
            .change_identity(creds("bob", "bobpw", Some("testdb")))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Sent);

        let backend = tokio::spawn(async move {
            let change = recv(&mut remote).await;
            let parsed =
                crate::protocol::ChangeUserRequest::parse(&change.payload).unwrap();
            assert_eq!(parsed.username, "bob");
            remote.send(OkPacket::new().encode(1)).await.unwrap();
        });

        match conn.next_reply().await.unwrap() {
            BackendEvent::Reply { buffer, last } => {
                assert!(last);
                assert_eq!(buffer.sequence_id(), Some(0x03));
                let (_, payload) = buffer.frames().next().unwrap();
                assert!(is_ok_payload(payload));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!conn.tracker.changing_user);
        backend.await.unwrap();
    }

    #[tokio::test]
    async fn test_reauth_err_is_fatal() {
        let server = test_server(true);
        let (mut conn, mut remote) =
            pair(server, creds("alice", "oldpw", None), AuthState::Complete);
        conn.begin_reauth(creds("bob", "wrong", None));
        conn.write(query_buffer("SELECT 2")).await.unwrap();

        tokio::spawn(async move {
            let _change = recv(&mut remote).await;
            let err = ErrPacket::new(1045, "28000", "Access denied for user 'bob'");
            remote.send(err.encode(1)).await.unwrap();
        });

        let err = conn.next_reply().await.unwrap_err();
        assert!(matches!(err, ConnectionError::ReAuth { code: 1045, .. }));
        assert!(err.requires_user_reload());
        assert_eq!(conn.state(), AuthState::Failed);
        assert!(!conn.is_poolable());
    }

    #[tokio::test]
    async fn test_reauth_auth_switch_extra_round_trip() {
        let server = test_server(true);
        let (mut conn, mut remote) =
            pair(server, creds("alice", "oldpw", None), AuthState::Complete);
        conn.set_scramble([0x11u8; SCRAMBLE_LEN]);
        conn.begin_reauth(creds("bob", "bobpw", None));
        conn.write(query_buffer("SELECT 2")).await.unwrap();

        let backend = tokio::spawn(async move {
            let _change = recv(&mut remote).await;

            // Ask for the same plug-in again with a fresh nonce
            let fresh = [0x22u8; SCRAMBLE_LEN];
            let mut payload = vec![0xFE];
            payload.extend_from_slice(DEFAULT_AUTH_PLUGIN.as_bytes());
            payload.push(0);
            payload.extend_from_slice(&fresh);
            payload.push(0);
            remote.send(Packet::new(1, payload)).await.unwrap();

            let token = recv(&mut remote).await;
            let expected =
                compute_auth_response_from_stage1(&sha1_digest(b"bobpw"), &fresh);
            assert_eq!(&token.payload[..], &expected[..]);

            remote.send(OkPacket::new().encode(3)).await.unwrap();

            let stored = recv(&mut remote).await;
            assert_eq!(stored.sequence_id, 0x03);
            remote.send(OkPacket::new().encode(1)).await.unwrap();
        });

        match conn.next_reply().await.unwrap() {
            BackendEvent::Reply { last, .. } => assert!(last),
            other => panic!("unexpected event {:?}", other),
        }
        backend.await.unwrap();
    }

    #[tokio::test]
    async fn test_quit_on_fresh_checkout_is_dropped() {
        let (mut conn, _remote) =
            pair(test_server(true), creds("alice", "pw", None), AuthState::Complete);
        conn.begin_reauth(creds("bob", "pw", None));

        let quit = Buffer::from_packet(&Packet::new(0, vec![0x01]));
        let outcome = conn.write(quit).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Dropped);
        assert!(conn.is_poolable());
    }

    #[tokio::test]
    async fn test_quit_during_reauth_kills_connection() {
        let (mut conn, mut remote) =
            pair(test_server(true), creds("alice", "pw", None), AuthState::Complete);
        conn.begin_reauth(creds("bob", "pw", None));
        conn.write(query_buffer("SELECT 2")).await.unwrap();
        let _change = recv(&mut remote).await;

        let quit = Buffer::from_packet(&Packet::new(0, vec![0x01]));
        assert!(conn.write(quit).await.is_err());
        assert_eq!(conn.state(), AuthState::Failed);
    }

    #[tokio::test]
    async fn test_writes_during_reauth_append_to_stored_query() {
        let (mut conn, mut remote) =
            pair(test_server(true), creds("alice", "pw", None), AuthState::Complete);
        conn.begin_reauth(creds("bob", "pw", None));
        conn.write(query_buffer("SELECT 2")).await.unwrap();
        let _change = recv(&mut remote).await;

        let outcome = conn.write(query_buffer("SELECT 3")).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Delayed);

        let backend = tokio::spawn(async move {
            remote.send(OkPacket::new().encode(1)).await.unwrap();
            // Both stored frames flush together
            let first = recv(&mut remote).await;
            assert_eq!(first.sequence_id, 0x03);
            assert_eq!(&first.payload[1..], b"SELECT 2");
            let second = recv(&mut remote).await;
            assert_eq!(&second.payload[1..], b"SELECT 3");
            remote.send(OkPacket::new().encode(1)).await.unwrap();
        });

        match conn.next_reply().await.unwrap() {
            BackendEvent::Reply { last, .. } => assert!(last),
            other => panic!("unexpected event {:?}", other),
        }
        backend.await.unwrap();
    }

    #[tokio::test]
    async fn test_quit_against_pooled_server_is_dropped() {
        let (mut conn, _remote) =
            pair(test_server(true), creds("alice", "pw", None), AuthState::Complete);
        let quit = Buffer::from_packet(&Packet::new(0, vec![0x01]));
        assert_eq!(conn.write(quit).await.unwrap(), WriteOutcome::Dropped);

        // Without pooling the quit goes out
        let (mut conn, mut remote) =
            pair(test_server(false), creds("alice", "pw", None), AuthState::Complete);
        let quit = Buffer::from_packet(&Packet::new(0, vec![0x01]));
        assert_eq!(conn.write(quit).await.unwrap(), WriteOutcome::Sent);
        let packet = recv(&mut remote).await;
        assert_eq!(packet.payload[0], 0x01);
    }

    #[test]
    fn test_proxy_header_tcp4() {
        // Scenario: exact bytes for a plain IPv4 pair
        let header = proxy_protocol_header(
            Some("10.0.0.5:40000".parse().unwrap()),
            Some("10.0.0.9:3306".parse().unwrap()),
        );
        assert_eq!(header, "PROXY TCP4 10.0.0.5 10.0.0.9 40000 3306\r\n");
    }

    #[test]
    fn test_proxy_header_mixed_families() {
        let header = proxy_protocol_header(
            Some("10.0.0.5:40000".parse().unwrap()),
            Some("[2001:db8::9]:3306".parse().unwrap()),
        );
        assert_eq!(
            header,
            "PROXY TCP6 ::ffff:10.0.0.5 2001:db8::9 40000 3306\r\n"
        );
    }

    #[test]
    fn test_proxy_header_unknown() {
        assert_eq!(
            proxy_protocol_header(None, None),
            "PROXY UNKNOWN\r\n"
        );
        assert_eq!(
            proxy_protocol_header(Some("10.0.0.5:40000".parse().unwrap()), None),
            "PROXY UNKNOWN\r\n"
        );
    }
}
