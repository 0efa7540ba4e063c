//! Persistent backend connection pool.
//!
//! Idle authenticated connections are parked per server when their
//! session closes and handed to later sessions instead of paying for a
//! fresh dial and handshake. An entry keeps the identity it was
//! authenticated under; a session borrowing it under a different identity
//! gets it flagged for the lazy COM_CHANGE_USER dance on first write.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use super::{BackendConnection, BackendStream};
use crate::auth::SessionCredentials;
use crate::metrics::metrics;

struct PooledEntry<S> {
    conn: BackendConnection<S>,
    user: String,
}

/// Idle connections keyed by server name
pub struct ConnectionPool<S = BackendStream> {
    shelves: Mutex<HashMap<String, VecDeque<PooledEntry<S>>>>,
}

impl<S> Default for ConnectionPool<S> {
    fn default() -> Self {
        Self {
            shelves: Mutex::new(HashMap::new()),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> ConnectionPool<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take an idle connection to the named server, if one is parked.
    ///
    /// An entry already authenticated as the requesting user is handed
    /// over unchanged; any other entry is marked for re-identification,
    /// paid for on the first write.
    pub fn acquire(
        &self,
        server_name: &str,
        creds: &SessionCredentials,
    ) -> Option<BackendConnection<S>> {
        let entry = {
            let mut shelves = self.shelves.lock();
            shelves.get_mut(server_name)?.pop_front()
        };

        match entry {
            Some(PooledEntry { mut conn, user }) => {
                metrics().record_pool_hit(server_name);
                if user == creds.username {
                    debug!(server = %server_name, user = %user, "pool hit, identity matches");
                    conn.adopt(creds.clone());
                } else {
                    debug!(
                        server = %server_name,
                        pooled_user = %user,
                        user = %creds.username,
                        "pool hit, re-identification required"
                    );
                    conn.begin_reauth(creds.clone());
                }
                Some(conn)
            }
            None => {
                metrics().record_pool_miss(server_name);
                None
            }
        }
    }

    /// Park a connection its session no longer needs.
    ///
    /// Only clean connections are accepted: authenticated, no suppressed
    /// replies outstanding, no stored query, empty queues. Anything else
    /// comes back to the caller to be closed properly. The caller skips
    /// COM_QUIT for parked connections by construction.
    pub fn release(&self, conn: BackendConnection<S>) -> Option<BackendConnection<S>> {
        let server = conn.server().clone();
        if !server.persistent_conns_enabled() {
            return Some(conn);
        }
        if !conn.is_poolable() {
            debug!(
                server = %server.name,
                state = ?conn.state(),
                "connection does not qualify for pooling"
            );
            return Some(conn);
        }

        let mut shelves = self.shelves.lock();
        let shelf = shelves.entry(server.name.clone()).or_default();
        if shelf.len() >= server.persistent_pool_max {
            debug!(server = %server.name, "pool full, discarding connection");
            return Some(conn);
        }

        let user = conn.authenticated_user().to_string();
        info!(server = %server.name, user = %user, "connection parked in pool");
        shelf.push_back(PooledEntry { conn, user });
        metrics().set_pooled_connections(self.total_idle() as i64);
        None
    }

    pub fn idle_count(&self, server_name: &str) -> usize {
        self.shelves
            .lock()
            .get(server_name)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    fn total_idle(&self) -> usize {
        self.shelves.lock().values().map(VecDeque::len).sum()
    }

    /// Drop every parked connection (shutdown path)
    pub fn clear(&self) -> Vec<BackendConnection<S>> {
        let mut shelves = self.shelves.lock();
        shelves
            .drain()
            .flat_map(|(_, shelf)| shelf.into_iter().map(|e| e.conn))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::AuthState;
    use crate::config::BackendDef;
    use crate::monitor::Server;
    use crate::protocol::{sha1_digest, Buffer, Packet, PacketCodec};
    use std::sync::Arc;
    use tokio::io::DuplexStream;
    use tokio_util::codec::Framed;

    fn server(name: &str, pool_max: usize) -> Arc<Server> {
        Arc::new(Server::from_def(&BackendDef {
            name: name.to_string(),
            address: "10.0.0.9".to_string(),
            port: 3306,
            proxy_protocol: false,
            persistent_pool_max: pool_max,
        }))
    }

    fn creds(user: &str) -> SessionCredentials {
        SessionCredentials {
            username: user.to_string(),
            database: None,
            charset: 0x21,
            stage1: Some(sha1_digest(user.as_bytes())),
        }
    }

    fn complete_conn(
        server: Arc<Server>,
        user: &str,
    ) -> (BackendConnection<DuplexStream>, DuplexStream) {
        let (client, remote) = tokio::io::duplex(1 << 16);
        let conn = BackendConnection::for_test(
            server,
            creds(user),
            Framed::new(client, PacketCodec),
            AuthState::Complete,
        );
        (conn, remote)
    }

    #[tokio::test]
    async fn test_acquire_from_empty_pool() {
        let pool: ConnectionPool<DuplexStream> = ConnectionPool::new();
        assert!(pool.acquire("db1", &creds("alice")).is_none());
    }

    #[tokio::test]
    async fn test_park_and_acquire_same_user() {
        let pool: ConnectionPool<DuplexStream> = ConnectionPool::new();
        let srv = server("db1", 4);
        let (conn, _remote) = complete_conn(srv, "alice");

        assert!(pool.release(conn).is_none());
        assert_eq!(pool.idle_count("db1"), 1);

        let conn = pool.acquire("db1", &creds("alice")).unwrap();
        assert!(!conn.is_pending_reauth());
        assert_eq!(pool.idle_count("db1"), 0);
    }

    #[tokio::test]
    async fn test_acquire_different_user_flags_reauth() {
        let pool: ConnectionPool<DuplexStream> = ConnectionPool::new();
        let srv = server("db1", 4);
        let (conn, _remote) = complete_conn(srv, "alice");
        pool.release(conn);

        let conn = pool.acquire("db1", &creds("bob")).unwrap();
        assert!(conn.is_pending_reauth());
        assert_eq!(conn.credentials().username, "bob");
    }

    #[tokio::test]
    async fn test_pool_rejects_dirty_connection() {
        // Property: nothing in the pool has suppressed replies, a stored
        // query, or pending queues.
        let pool: ConnectionPool<DuplexStream> = ConnectionPool::new();
        let srv = server("db1", 4);
        let (mut conn, _remote) = complete_conn(srv, "alice");

        conn.tracker.expect_ignored_reply();
        conn.tracker
            .store_query(Buffer::from_packet(&Packet::new(0, vec![0x03, b'x'])));

        let rejected = pool.release(conn);
        assert!(rejected.is_some());
        assert_eq!(pool.idle_count("db1"), 0);
    }

    #[tokio::test]
    async fn test_pool_rejects_unauthenticated_connection() {
        let pool: ConnectionPool<DuplexStream> = ConnectionPool::new();
        let srv = server("db1", 4);
        let (client, _remote) = tokio::io::duplex(1 << 16);
        let conn = BackendConnection::for_test(
            srv,
            creds("alice"),
            Framed::new(client, PacketCodec),
            AuthState::Failed,
        );
        assert!(pool.release(conn).is_some());
    }

    #[tokio::test]
    async fn test_pool_capacity_limit() {
        let pool: ConnectionPool<DuplexStream> = ConnectionPool::new();
        let srv = server("db1", 2);
        let mut remotes = Vec::new();

        for _ in 0..2 {
            let (conn, remote) = complete_conn(srv.clone(), "alice");
            remotes.push(remote);
            assert!(pool.release(conn).is_none());
        }
        let (conn, _remote) = complete_conn(srv, "alice");
        assert!(pool.release(conn).is_some());
        assert_eq!(pool.idle_count("db1"), 2);
    }

    #[tokio::test]
    async fn test_pooling_disabled_rejects_everything() {
        let pool: ConnectionPool<DuplexStream> = ConnectionPool::new();
        let srv = server("db1", 0);
        let (conn, _remote) = complete_conn(srv, "alice");
        assert!(pool.release(conn).is_some());
    }

    #[tokio::test]
    async fn test_clear_drains_all_shelves() {
        let pool: ConnectionPool<DuplexStream> = ConnectionPool::new();
        let srv1 = server("db1", 4);
        let srv2 = server("db2", 4);
        let mut remotes = Vec::new();
        for srv in [srv1, srv2] {
            let (conn, remote) = complete_conn(srv, "alice");
            remotes.push(remote);
            pool.release(conn);
        }

        let drained = pool.clear();
        assert_eq!(drained.len(), 2);
        assert_eq!(pool.idle_count("db1"), 0);
        assert_eq!(pool.idle_count("db2"), 0);
    }
}
