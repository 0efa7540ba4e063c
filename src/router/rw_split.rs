use std::sync::Arc;

use tracing::{debug, warn};

use super::{ClientAction, ErrorAction, Router, RouterCapabilities, RouterError};
use crate::backend::ConnectionError;
use crate::monitor::Server;
use crate::protocol::{Buffer, ClientCommand};

/// Read/write splitting on command classification alone.
///
/// Reads outside a transaction go to a replica; everything else goes to
/// the writable backend. Statement classification stops at the command
/// byte and the leading keyword.
pub struct RwSplitRouter {
    collect_results: bool,
    in_transaction: bool,
    /// Attach-order index of the writable backend
    master: usize,
    /// Attach-order index of the replica, when one was attached
    slave: Option<usize>,
}

impl RwSplitRouter {
    pub fn new(collect_results: bool) -> Self {
        Self {
            collect_results,
            in_transaction: false,
            master: 0,
            slave: None,
        }
    }

    fn track_transaction(&mut self, command: &ClientCommand) {
        if let ClientCommand::Query(sql) = command {
            let sql_upper = sql.trim_start().to_uppercase();
            if sql_upper.starts_with("BEGIN") || sql_upper.starts_with("START TRANSACTION") {
                self.in_transaction = true;
            } else if sql_upper.starts_with("COMMIT") || sql_upper.starts_with("ROLLBACK") {
                self.in_transaction = false;
            }
        }
    }
}

impl Router for RwSplitRouter {
    fn capabilities(&self) -> RouterCapabilities {
        let caps = RouterCapabilities::STMT_INPUT
            .with(RouterCapabilities::STMT_OUTPUT)
            .with(RouterCapabilities::SESSION_STATE_TRACKING);
        if self.collect_results {
            caps.with(RouterCapabilities::RESULTSET_OUTPUT)
                .with(RouterCapabilities::CONTIGUOUS_OUTPUT)
        } else {
            caps
        }
    }

    fn select_backends(
        &mut self,
        candidates: &[Arc<Server>],
    ) -> Result<Vec<Arc<Server>>, RouterError> {
        let master = candidates
            .iter()
            .find(|s| s.is_usable() && s.is_master())
            .or_else(|| candidates.iter().find(|s| s.is_usable()))
            .ok_or(RouterError::NoBackend)?;

        let mut selected = vec![master.clone()];
        if let Some(slave) = candidates
            .iter()
            .find(|s| s.is_usable() && s.name != master.name)
        {
            self.slave = Some(selected.len());
            selected.push(slave.clone());
        }

        self.master = 0;
        debug!(
            master = %master.name,
            slave = ?self.slave.map(|i| selected[i].name.clone()),
            "read/write split session targets selected"
        );
        Ok(selected)
    }

    fn route_query(
        &mut self,
        command: &ClientCommand,
        _buffer: &mut Buffer,
    ) -> Result<usize, RouterError> {
        self.track_transaction(command);

        let target = match self.slave {
            Some(slave) if command.is_read_only() && !self.in_transaction => slave,
            _ => self.master,
        };
        Ok(target)
    }

    fn client_reply(&mut self, buffer: Buffer, _origin: usize) -> ClientAction {
        ClientAction::Forward(buffer)
    }

    fn handle_error(
        &mut self,
        error: &ConnectionError,
        origin: usize,
        action: ErrorAction,
    ) -> bool {
        match action {
            ErrorAction::NewConnection => {
                if Some(origin) == self.slave {
                    // Drop the replica; reads fall back to the master
                    warn!(error = %error, "replica failed, falling back to master");
                    self.slave = None;
                    true
                } else {
                    warn!(error = %error, "writable backend failed, closing session");
                    false
                }
            }
            ErrorAction::ReplyClient => Some(origin) == self.slave,
        }
    }
}
