//! Client session handling.
//!
//! One task per client connection owns everything the session touches:
//! the client socket, the router instance and every borrowed backend
//! connection. A hang-up anywhere cascades through this task's cleanup;
//! no other task ever sees these connections.

mod state;

pub use state::SessionState;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::auth::{AuthVerdict, Authenticator, SessionCredentials};
use crate::backend::pool::ConnectionPool;
use crate::backend::{
    BackendConnection, BackendEvent, ConnectionError, WriteOutcome,
};
use crate::config::{LimitsConfig, ServiceConfig};
use crate::dns::DnsCache;
use crate::metrics::metrics;
use crate::monitor::Server;
use crate::protocol::packet::MAX_PAYLOAD_SIZE;
use crate::protocol::{
    lost_connection_error, BufferFlags, ChangeUserRequest, ClientCommand, Command, ErrPacket,
    InitialHandshake, OkPacket, Packet, PacketCodec, SCRAMBLE_LEN,
};
use crate::protocol::Buffer;
use crate::router::{create_router, ClientAction, ErrorAction, Router, RouterCapabilities};
use crate::users::{UserRefresher, UserStore};

/// Everything a session borrows from the process
pub struct ProxyShared {
    pub service: ServiceConfig,
    pub service_servers: Vec<Arc<Server>>,
    pub pool: Arc<ConnectionPool>,
    pub users: Arc<UserStore>,
    pub refresher: Arc<UserRefresher>,
    pub dns: Arc<DnsCache>,
    pub authenticator: Arc<dyn Authenticator>,
    pub limits: LimitsConfig,
}

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Client disconnected")]
    ClientDisconnected,

    #[error("Unknown router module '{0}'")]
    UnknownRouter(String),

    #[error("Router error: {0}")]
    Router(#[from] crate::router::RouterError),

    #[error(transparent)]
    Backend(#[from] ConnectionError),
}

/// The backends one session has attached, addressed by attach order
pub struct SessionBackends {
    slots: Vec<Option<BackendConnection>>,
    servers: Vec<Arc<Server>>,
    pool: Arc<ConnectionPool>,
    dns: Arc<DnsCache>,
    creds: SessionCredentials,
    client_addr: Option<SocketAddr>,
    high_water: usize,
    low_water: usize,
}

impl SessionBackends {
    fn new(
        pool: Arc<ConnectionPool>,
        dns: Arc<DnsCache>,
        creds: SessionCredentials,
        client_addr: Option<SocketAddr>,
        limits: &LimitsConfig,
    ) -> Self {
        Self {
            slots: Vec::new(),
            servers: Vec::new(),
            pool,
            dns,
            creds,
            client_addr,
            high_water: limits.writeq_high_water,
            low_water: limits.writeq_low_water,
        }
    }

    /// Attach one more backend, reusing a pooled connection when one is
    /// parked for this server.
    fn attach(&mut self, server: Arc<Server>) -> usize {
        let conn = self
            .pool
            .acquire(&server.name, &self.creds)
            .unwrap_or_else(|| {
                BackendConnection::new(server.clone(), self.creds.clone(), self.client_addr)
            });
        self.slots.push(Some(conn));
        self.servers.push(server);
        self.slots.len() - 1
    }

    fn conn(&mut self, idx: usize) -> Result<&mut BackendConnection, ConnectionError> {
        self.slots
            .get_mut(idx)
            .and_then(Option::as_mut)
            .ok_or_else(|| ConnectionError::Protocol(format!("no backend at slot {}", idx)))
    }

    fn server_name(&self, idx: usize) -> &str {
        self.servers
            .get(idx)
            .map(|s| s.name.as_str())
            .unwrap_or("unknown")
    }

    /// Write a buffer, driving the connection to readiness first when it
    /// has not authenticated yet.
    async fn write(&mut self, idx: usize, buffer: Buffer) -> Result<WriteOutcome, ConnectionError> {
        let dns = self.dns.clone();
        let conn = self.conn(idx)?;
        let outcome = conn.write(buffer).await?;
        conn.ready(&dns).await?;
        Ok(outcome)
    }

    async fn next_reply(&mut self, idx: usize) -> Result<BackendEvent, ConnectionError> {
        self.conn(idx)?.next_reply().await
    }

    /// Pending bytes beyond the high-water mark: the client reader must
    /// not pull more until this backend drains below low water.
    fn over_high_water(&self, idx: usize) -> bool {
        self.slots
            .get(idx)
            .and_then(Option::as_ref)
            .map(|c| c.pending_bytes() > self.high_water)
            .unwrap_or(false)
    }

    fn below_low_water(&self, idx: usize) -> bool {
        self.slots
            .get(idx)
            .and_then(Option::as_ref)
            .map(|c| c.pending_bytes() < self.low_water)
            .unwrap_or(true)
    }

    /// Drop a dead backend from its slot
    fn discard(&mut self, idx: usize) {
        if let Some(slot) = self.slots.get_mut(idx) {
            *slot = None;
        }
    }

    /// Release every backend: clean ones park (no COM_QUIT), the rest are
    /// closed properly.
    async fn release_all(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Some(conn) = slot.take() {
                if let Some(rejected) = self.pool.release(conn) {
                    rejected.close().await;
                }
            }
        }
    }

    fn update_credentials(&mut self, creds: SessionCredentials) {
        self.creds = creds;
    }
}

/// Handle a single client session
pub struct Session {
    /// Unique session ID
    pub id: u32,
    /// Session state
    pub state: SessionState,
    shared: Arc<ProxyShared>,
    router: Box<dyn Router>,
    /// Nonce issued to this client in the initial handshake
    scramble: [u8; SCRAMBLE_LEN],
    peer_addr: Option<SocketAddr>,
}

impl Session {
    pub fn new(id: u32, shared: Arc<ProxyShared>) -> Result<Self, SessionError> {
        let router = create_router(&shared.service.router, shared.service.collect_results)
            .ok_or_else(|| SessionError::UnknownRouter(shared.service.router.clone()))?;
        Ok(Self {
            id,
            state: SessionState::new(),
            shared,
            router,
            scramble: [0u8; SCRAMBLE_LEN],
            peer_addr: None,
        })
    }

    /// Run the session - handle the client connection
    pub async fn run<S>(
        mut self,
        client_stream: S,
        peer_addr: Option<SocketAddr>,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut client = Framed::new(client_stream, PacketCodec);
        self.peer_addr = peer_addr;

        // Step 1: challenge the client
        let handshake = InitialHandshake::new(self.id);
        let scramble = handshake.scramble();
        self.scramble = scramble;
        client.send(handshake.encode()).await?;

        // Step 2: the client's credentials
        let response_packet = client
            .next()
            .await
            .ok_or(SessionError::ClientDisconnected)??;

        let creds = match self
            .authenticate_client(&response_packet.payload, peer_addr, &scramble)
            .await
        {
            Some(creds) => creds,
            None => {
                let message = self.access_denied_message(&response_packet.payload, peer_addr);
                warn!(session_id = self.id, "client authentication failed");
                let err = ErrPacket::new(1045, "28000", &message);
                client.send(err.encode(2)).await?;
                return Ok(());
            }
        };

        debug!(
            session_id = self.id,
            username = %creds.username,
            database = ?creds.database,
            "client authenticated"
        );
        self.state.set_authenticated(&creds, self.client_capabilities(&response_packet.payload));

        // Step 3: the router picks this session's backends
        let targets = match self.router.select_backends(&self.shared.service_servers) {
            Ok(targets) => targets,
            Err(e) => {
                warn!(session_id = self.id, error = %e, "no backend for new session");
                let err = ErrPacket::new(1040, "08004", &e.to_string());
                client.send(err.encode(2)).await?;
                return Err(e.into());
            }
        };
        let mut backends = SessionBackends::new(
            self.shared.pool.clone(),
            self.shared.dns.clone(),
            creds,
            peer_addr,
            &self.shared.limits,
        );
        for server in targets {
            backends.attach(server);
        }

        // Step 4: tell the client it is in
        let ok = OkPacket::new();
        client.send(ok.encode(2)).await?;

        info!(
            session_id = self.id,
            username = %self.state.username,
            "session established"
        );

        // Step 5: main command loop
        let result = self.command_loop(&mut client, &mut backends).await;

        // Cleanup cascades to every borrowed backend
        backends.release_all().await;
        self.router.close_session();

        result
    }

    async fn authenticate_client(
        &self,
        payload: &[u8],
        peer_addr: Option<SocketAddr>,
        scramble: &[u8; SCRAMBLE_LEN],
    ) -> Option<SessionCredentials> {
        let peer_ip = peer_addr
            .map(|a| a.ip())
            .unwrap_or_else(|| std::net::IpAddr::from([127, 0, 0, 1]));
        let request = self.shared.authenticator.extract(payload, peer_ip)?;

        if self
            .router
            .capabilities()
            .contains(RouterCapabilities::NO_AUTH)
        {
            return Some(SessionCredentials {
                username: request.username,
                database: request.database,
                charset: request.charset,
                stage1: None,
            });
        }

        let users = self.shared.users.snapshot();
        match self.shared.authenticator.authenticate(&request, scramble, &users) {
            AuthVerdict::Ok(creds) => Some(creds),
            AuthVerdict::Failed => {
                // The table may be stale; reload once and retry
                if self.shared.refresher.refresh().await {
                    let users = self.shared.users.snapshot();
                    match self.shared.authenticator.authenticate(&request, scramble, &users) {
                        AuthVerdict::Ok(creds) => Some(creds),
                        _ => None,
                    }
                } else {
                    None
                }
            }
            AuthVerdict::Incomplete | AuthVerdict::SslIncomplete => None,
        }
    }

    fn access_denied_message(&self, payload: &[u8], peer_addr: Option<SocketAddr>) -> String {
        let (user, has_password) = crate::protocol::HandshakeResponse::parse(payload)
            .map(|r| (r.username, !r.auth_response.is_empty()))
            .unwrap_or_else(|| ("?".to_string(), false));
        let host = peer_addr
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        format!(
            "Access denied for user '{}'@'{}' (using password: {})",
            user,
            host,
            if has_password { "YES" } else { "NO" }
        )
    }

    fn client_capabilities(&self, payload: &[u8]) -> u32 {
        crate::protocol::HandshakeResponse::parse(payload)
            .map(|r| r.capability_flags)
            .unwrap_or(0)
    }

    /// Main command processing loop
    async fn command_loop<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        backends: &mut SessionBackends,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            // Backpressure: a backend holding too many undelivered bytes
            // pauses the client reader until it drains below low water.
            if self.state.expect_continuation
                && backends.over_high_water(self.state.last_target)
            {
                let idx = self.state.last_target;
                while !backends.below_low_water(idx) {
                    match backends.next_reply(idx).await {
                        Ok(BackendEvent::Reply { buffer, .. }) => {
                            if let ClientAction::Forward(buf) =
                                self.router.client_reply(buffer, idx)
                            {
                                client.send(buf).await?;
                            }
                        }
                        Ok(BackendEvent::IgnoredComplete) => {}
                        Err(e) => {
                            self.fail_backend(client, backends, idx, e).await?;
                            break;
                        }
                    }
                }
            }

            let packet = match client.next().await {
                Some(Ok(p)) => p,
                Some(Err(e)) => {
                    warn!(session_id = self.id, error = %e, "client read error");
                    return Err(e.into());
                }
                None => {
                    info!(session_id = self.id, "client disconnected");
                    return Ok(());
                }
            };

            // A continuation of a multi-frame command bypasses routing and
            // command parsing entirely.
            if self.state.expect_continuation {
                self.state.expect_continuation = packet.payload.len() == MAX_PAYLOAD_SIZE;
                let idx = self.state.last_target;
                let buffer = Buffer::from_packet(&packet);
                match backends.write(idx, buffer).await {
                    Ok(_) => {
                        if !self.state.expect_continuation {
                            self.pump_exchange(client, backends, idx).await?;
                        }
                    }
                    Err(e) => self.fail_backend(client, backends, idx, e).await?,
                }
                continue;
            }

            let cmd = ClientCommand::parse(&packet.payload);
            debug!(session_id = self.id, command = ?cmd, "received command");

            match cmd {
                ClientCommand::Quit => {
                    // Backend shutdown happens in cleanup: parked
                    // connections skip COM_QUIT, closed ones send it.
                    info!(session_id = self.id, "client sent QUIT");
                    return Ok(());
                }
                ClientCommand::ChangeUser => {
                    self.handle_change_user(client, backends, &packet).await?;
                    continue;
                }
                _ => {}
            }

            let started = Instant::now();
            let mut buffer = Buffer::from_packet(&packet);
            self.apply_capability_flags(&mut buffer);

            let idx = match self.router.route_query(&cmd, &mut buffer) {
                Ok(idx) => idx,
                Err(e) => {
                    warn!(session_id = self.id, error = %e, "statement could not be routed");
                    let err = ErrPacket::new(1105, "HY000", &e.to_string());
                    client.send(err.encode(1)).await?;
                    continue;
                }
            };
            self.state.last_target = idx;
            self.state.expect_continuation = packet.payload.len() == MAX_PAYLOAD_SIZE;

            let command_byte = packet.payload.first().copied().unwrap_or(0);
            let command = Command::from(command_byte);

            if let Err(e) = backends.write(idx, buffer).await {
                self.fail_backend(client, backends, idx, e).await?;
                continue;
            }

            if self.state.expect_continuation || !command.expects_response() {
                continue;
            }

            if let Err(e) = self.pump_exchange(client, backends, idx).await {
                return Err(e);
            }

            metrics().record_command(
                command_name(command),
                backends.server_name(idx),
                started.elapsed().as_secs_f64(),
            );
        }
    }

    /// Forward one exchange's worth of replies to the client
    async fn pump_exchange<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        backends: &mut SessionBackends,
        idx: usize,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            match backends.next_reply(idx).await {
                Ok(BackendEvent::Reply { buffer, last }) => {
                    match self.router.client_reply(buffer, idx) {
                        ClientAction::Forward(buffer) => client.send(buffer).await?,
                        ClientAction::Suppress => {}
                    }
                    if last {
                        return Ok(());
                    }
                }
                Ok(BackendEvent::IgnoredComplete) => return Ok(()),
                Err(e) => {
                    self.fail_backend(client, backends, idx, e).await?;
                    return Ok(());
                }
            }
        }
    }

    /// A backend died mid-session: consult the router, then either keep
    /// going or end the session. Either way the client gets a terminating
    /// packet for the statement it was waiting on.
    async fn fail_backend<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        backends: &mut SessionBackends,
        idx: usize,
        error: ConnectionError,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        warn!(
            session_id = self.id,
            backend = backends.server_name(idx),
            error = %error,
            "backend failed"
        );
        metrics().record_backend_error(error_kind(&error));

        if error.requires_user_reload() {
            let refresher = self.shared.refresher.clone();
            tokio::spawn(async move {
                refresher.refresh().await;
            });
        }

        backends.discard(idx);

        let io_error = match &error {
            ConnectionError::Io(e) => Some(e),
            _ => None,
        };
        let err = lost_connection_error(&error.to_string(), io_error);
        client.send(err).await.ok();

        if self
            .router
            .handle_error(&error, idx, ErrorAction::NewConnection)
        {
            Ok(())
        } else {
            Err(SessionError::Backend(error))
        }
    }

    /// Client-initiated COM_CHANGE_USER: re-authenticate locally, then
    /// re-identify every attached backend.
    async fn handle_change_user<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        backends: &mut SessionBackends,
        packet: &Packet,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let request = match ChangeUserRequest::parse(&packet.payload) {
            Some(r) => r,
            None => {
                let err = ErrPacket::new(1047, "08S01", "Malformed COM_CHANGE_USER packet");
                client.send(err.encode(packet.sequence_id + 1)).await?;
                return Ok(());
            }
        };

        let scramble = self.client_scramble();
        let verdict = self.reauthenticate_with_reload(&request, &scramble).await;
        let creds = match verdict {
            Some(creds) => creds,
            None => {
                let message = format!(
                    "Access denied for user '{}'@'{}' (using password: {})",
                    request.username,
                    self.state.username,
                    if request.auth_token.is_empty() { "NO" } else { "YES" }
                );
                warn!(session_id = self.id, user = %request.username, "change-user authentication failed");
                let err = ErrPacket::new(1045, "28000", &message);
                client.send(err.encode(packet.sequence_id + 1)).await?;
                return Ok(());
            }
        };

        self.state.change_identity(&creds);
        backends.update_credentials(creds.clone());

        // Every attached backend swaps identity; only the primary's reply
        // goes to the client.
        let count = backends.slots.len();
        let mut replied = false;
        for idx in 0..count {
            let outcome = {
                let conn = match backends.conn(idx) {
                    Ok(c) => c,
                    Err(_) => continue,
                };
                conn.change_identity(creds.clone()).await
            };
            match outcome {
                Ok(WriteOutcome::Sent) => {
                    let forward = !replied;
                    match backends.next_reply(idx).await {
                        Ok(BackendEvent::Reply { buffer, .. }) => {
                            if forward {
                                client.send(buffer).await?;
                                replied = true;
                            }
                            metrics().record_reauth(true);
                        }
                        Ok(BackendEvent::IgnoredComplete) => {}
                        Err(e) => {
                            metrics().record_reauth(false);
                            self.fail_backend(client, backends, idx, e).await?;
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    metrics().record_reauth(false);
                    self.fail_backend(client, backends, idx, e).await?;
                }
            }
        }

        if !replied {
            // No backend produced a reply (all delayed); acknowledge the
            // change ourselves.
            let ok = OkPacket::new();
            client.send(ok.encode(packet.sequence_id + 1)).await?;
        }
        Ok(())
    }

    async fn reauthenticate_with_reload(
        &self,
        request: &ChangeUserRequest,
        scramble: &[u8; SCRAMBLE_LEN],
    ) -> Option<SessionCredentials> {
        let peer_ip = self
            .peer_addr
            .map(|a| a.ip())
            .unwrap_or_else(|| std::net::IpAddr::from([127, 0, 0, 1]));
        let attempt = |users: Arc<crate::users::UserTable>| {
            match self.shared.authenticator.reauthenticate(
                &request.username,
                &request.auth_token,
                request.database.as_deref(),
                request.charset,
                peer_ip,
                scramble,
                &users,
            ) {
                AuthVerdict::Ok(creds) => Some(creds),
                _ => None,
            }
        };

        if let Some(creds) = attempt(self.shared.users.snapshot()) {
            return Some(creds);
        }
        if self.shared.refresher.refresh().await {
            return attempt(self.shared.users.snapshot());
        }
        None
    }

    fn client_scramble(&self) -> [u8; SCRAMBLE_LEN] {
        // The scramble issued in the initial handshake; change-user proofs
        // are computed against it.
        self.scramble
    }

    /// Stamp capability-driven flags on an outbound statement
    fn apply_capability_flags(&self, buffer: &mut Buffer) {
        let caps = self.router.capabilities();
        if caps.contains(RouterCapabilities::RESULTSET_OUTPUT) {
            buffer.flags.insert(BufferFlags::COLLECT_RESULT);
        }
        if caps.contains(RouterCapabilities::SESSION_STATE_TRACKING) {
            buffer.flags.insert(BufferFlags::TRACK_STATE);
        }
    }
}

fn command_name(command: Command) -> &'static str {
    match command {
        Command::Query => "query",
        Command::StmtPrepare => "stmt_prepare",
        Command::StmtExecute => "stmt_execute",
        Command::StmtFetch => "stmt_fetch",
        Command::Ping => "ping",
        Command::InitDb => "init_db",
        Command::ChangeUser => "change_user",
        _ => "other",
    }
}

fn error_kind(error: &ConnectionError) -> &'static str {
    match error {
        ConnectionError::Lost(_) | ConnectionError::Io(_) => "lost",
        ConnectionError::Connect(_) => "connect",
        ConnectionError::Auth { .. } => "auth",
        ConnectionError::ReAuth { .. } => "reauth",
        ConnectionError::Handshake(_) => "handshake",
        _ => "protocol",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::default_authenticator;
    use crate::config::{BackendDef, LimitsConfig, ServiceConfig};
    use crate::monitor::{Server, ServerRegistry};
    use crate::protocol::response::EofPacket;
    use crate::protocol::{
        compute_auth_response, is_err_payload, is_ok_payload, HandshakeResponse,
        InitialHandshake, OkPacket,
    };
    use crate::users::{build_table, table_checksum, UserRow, UserStore};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// A scripted backend: handshake, authenticate, then answer every
    /// query with a one-row result until COM_QUIT.
    async fn scripted_backend() -> (std::net::SocketAddr, JoinHandle<Vec<Packet>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, PacketCodec);

            let hs = InitialHandshake::new(1);
            framed.send(hs.encode()).await.unwrap();
            let _auth = framed.next().await.unwrap().unwrap();
            framed.send(OkPacket::new().encode(2)).await.unwrap();

            let mut received = Vec::new();
            while let Some(Ok(packet)) = framed.next().await {
                let quit = packet.payload.first() == Some(&(Command::Quit as u8));
                received.push(packet);
                if quit {
                    break;
                }
                framed.send(Packet::new(1, vec![0x01])).await.unwrap();
                framed
                    .send(Packet::new(2, vec![0x03, b'd', b'e', b'f']))
                    .await
                    .unwrap();
                framed
                    .send(EofPacket { warnings: 0, status_flags: 2 }.encode(3))
                    .await
                    .unwrap();
                framed.send(Packet::new(4, vec![0x01, b'1'])).await.unwrap();
                framed
                    .send(EofPacket { warnings: 0, status_flags: 2 }.encode(5))
                    .await
                    .unwrap();
            }
            received
        });

        (addr, handle)
    }

    fn shared_for(addr: std::net::SocketAddr) -> Arc<ProxyShared> {
        let registry = ServerRegistry::new();
        let server = registry.insert(Server::from_def(&BackendDef {
            name: "db1".to_string(),
            address: addr.ip().to_string(),
            port: addr.port(),
            proxy_protocol: false,
            persistent_pool_max: 0,
        }));

        let store = Arc::new(UserStore::new());
        let rows = vec![UserRow {
            user: "alice".to_string(),
            host: "%".to_string(),
            password: {
                let stage2 =
                    crate::protocol::sha1_digest(&crate::protocol::sha1_digest(b"password"));
                format!(
                    "*{}",
                    stage2
                        .iter()
                        .map(|b| format!("{:02X}", b))
                        .collect::<String>()
                )
            },
            db: None,
            any_db: true,
        }];
        store.replace(build_table(&rows), table_checksum(&rows));

        let refresher = Arc::new(
            UserRefresher::new(store.clone(), Vec::new(), "svc", "")
                .with_min_interval(Duration::from_secs(3600)),
        );

        Arc::new(ProxyShared {
            service: ServiceConfig {
                name: "svc".to_string(),
                router: "readwritesplit".to_string(),
                collect_results: false,
                targets: vec!["db1".to_string()],
                user: "svc".to_string(),
                password: String::new(),
            },
            service_servers: vec![server],
            pool: Arc::new(ConnectionPool::new()),
            users: store,
            refresher,
            dns: Arc::new(DnsCache::new(Duration::from_secs(60))),
            authenticator: Arc::new(default_authenticator()),
            limits: LimitsConfig::default(),
        })
    }

    #[tokio::test]
    async fn test_full_session_select() {
        // Scenario: handshake, SELECT 1, quit. The client sees its result
        // frames unchanged; the backend sees the query and the final
        // COM_QUIT since pooling is off.
        let (addr, backend) = scripted_backend().await;
        let shared = shared_for(addr);

        let (client_side, session_side) = tokio::io::duplex(1 << 16);
        let session = Session::new(1, shared).unwrap();
        let session_task = tokio::spawn(async move {
            session
                .run(session_side, Some("10.0.0.5:40000".parse().unwrap()))
                .await
        });

        let mut client = Framed::new(client_side, PacketCodec);

        let hs_packet = client.next().await.unwrap().unwrap();
        let hs = InitialHandshake::parse(&hs_packet.payload).unwrap();
        let token = compute_auth_response("password", &hs.auth_plugin_data());
        let response = HandshakeResponse {
            capability_flags: crate::protocol::capabilities::DEFAULT_CAPABILITIES,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 0x21,
            username: "alice".to_string(),
            auth_response: token,
            database: None,
            auth_plugin_name: "mysql_native_password".to_string(),
        };
        client.send(response.encode(1)).await.unwrap();

        let ok = client.next().await.unwrap().unwrap();
        assert!(is_ok_payload(&ok.payload));
        assert_eq!(ok.sequence_id, 2);

        let mut query = vec![Command::Query as u8];
        query.extend_from_slice(b"SELECT 1");
        client.send(Packet::new(0, query)).await.unwrap();

        let mut frames = Vec::new();
        for _ in 0..5 {
            frames.push(client.next().await.unwrap().unwrap());
        }
        assert_eq!(&frames[0].payload[..], &[0x01]);
        assert_eq!(&frames[3].payload[..], &[0x01, b'1']);

        client
            .send(Packet::new(0, vec![Command::Quit as u8]))
            .await
            .unwrap();

        session_task.await.unwrap().unwrap();
        let received = backend.await.unwrap();
        assert_eq!(&received[0].payload[1..], b"SELECT 1");
        // Pooling is off, so the cleanup sent COM_QUIT to the backend
        assert_eq!(
            received.last().unwrap().payload.first(),
            Some(&(Command::Quit as u8))
        );
    }

    #[tokio::test]
    async fn test_wrong_password_rejected() {
        let (addr, backend) = scripted_backend().await;
        let shared = shared_for(addr);

        let (client_side, session_side) = tokio::io::duplex(1 << 16);
        let session = Session::new(2, shared).unwrap();
        let session_task = tokio::spawn(async move {
            session
                .run(session_side, Some("10.0.0.5:40001".parse().unwrap()))
                .await
        });

        let mut client = Framed::new(client_side, PacketCodec);
        let hs_packet = client.next().await.unwrap().unwrap();
        let hs = InitialHandshake::parse(&hs_packet.payload).unwrap();
        let token = compute_auth_response("not-the-password", &hs.auth_plugin_data());
        let response = HandshakeResponse {
            capability_flags: crate::protocol::capabilities::DEFAULT_CAPABILITIES,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 0x21,
            username: "alice".to_string(),
            auth_response: token,
            database: None,
            auth_plugin_name: "mysql_native_password".to_string(),
        };
        client.send(response.encode(1)).await.unwrap();

        let reply = client.next().await.unwrap().unwrap();
        assert!(is_err_payload(&reply.payload));
        let err = ErrPacket::parse(&reply.payload).unwrap();
        assert_eq!(err.error_code, 1045);
        assert!(err.error_message.contains("Access denied"));

        session_task.await.unwrap().unwrap();
        backend.abort();
    }

    #[tokio::test]
    async fn test_unknown_router_rejected() {
        let (addr, backend) = scripted_backend().await;
        let shared = shared_for(addr);
        let mut service = shared.service.clone();
        service.router = "no-such-router".to_string();
        let shared = Arc::new(ProxyShared {
            service,
            service_servers: shared.service_servers.clone(),
            pool: shared.pool.clone(),
            users: shared.users.clone(),
            refresher: shared.refresher.clone(),
            dns: shared.dns.clone(),
            authenticator: shared.authenticator.clone(),
            limits: shared.limits.clone(),
        });

        assert!(matches!(
            Session::new(3, shared),
            Err(SessionError::UnknownRouter(_))
        ));
        backend.abort();
    }
}
