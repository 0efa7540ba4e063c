use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::{ClientAction, ErrorAction, Router, RouterCapabilities, RouterError};
use crate::backend::ConnectionError;
use crate::monitor::Server;
use crate::protocol::{Buffer, ClientCommand};

/// Connection-level routing: every statement of a session goes to the one
/// backend picked at session start, chosen round-robin across sessions.
pub struct ReadConnRouter {
    selected: bool,
}

static NEXT_BACKEND: AtomicUsize = AtomicUsize::new(0);

impl ReadConnRouter {
    pub fn new() -> Self {
        Self { selected: false }
    }
}

impl Default for ReadConnRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl Router for ReadConnRouter {
    fn capabilities(&self) -> RouterCapabilities {
        RouterCapabilities::STMT_OUTPUT
    }

    fn select_backends(
        &mut self,
        candidates: &[Arc<Server>],
    ) -> Result<Vec<Arc<Server>>, RouterError> {
        let usable: Vec<&Arc<Server>> = candidates.iter().filter(|s| s.is_usable()).collect();
        if usable.is_empty() {
            return Err(RouterError::NoBackend);
        }
        let pick = NEXT_BACKEND.fetch_add(1, Ordering::Relaxed) % usable.len();
        self.selected = true;
        Ok(vec![usable[pick].clone()])
    }

    fn route_query(
        &mut self,
        _command: &ClientCommand,
        _buffer: &mut Buffer,
    ) -> Result<usize, RouterError> {
        if !self.selected {
            return Err(RouterError::NoBackend);
        }
        Ok(0)
    }

    fn client_reply(&mut self, buffer: Buffer, _origin: usize) -> ClientAction {
        ClientAction::Forward(buffer)
    }

    fn handle_error(
        &mut self,
        _error: &ConnectionError,
        _origin: usize,
        _action: ErrorAction,
    ) -> bool {
        // One backend per session; losing it ends the session
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendDef;

    fn server(name: &str) -> Arc<Server> {
        Arc::new(Server::from_def(&BackendDef {
            name: name.to_string(),
            address: "10.0.0.9".to_string(),
            port: 3306,
            proxy_protocol: false,
            persistent_pool_max: 0,
        }))
    }

    #[test]
    fn test_single_backend_per_session() {
        let mut router = ReadConnRouter::new();
        let selected = router
            .select_backends(&[server("db1"), server("db2")])
            .unwrap();
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn test_rotates_across_sessions() {
        let candidates = [server("db1"), server("db2")];
        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            let mut router = ReadConnRouter::new();
            let selected = router.select_backends(&candidates).unwrap();
            seen.insert(selected[0].name.clone());
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_streaming_only_capabilities() {
        let router = ReadConnRouter::new();
        let caps = router.capabilities();
        assert!(caps.contains(RouterCapabilities::STMT_OUTPUT));
        assert!(!caps.contains(RouterCapabilities::RESULTSET_OUTPUT));
    }
}
