//! The routing seam.
//!
//! Routing policy lives behind this trait; the core honours whatever the
//! router declares through its capability bitmask and delivers replies
//! the way the bitmask asks (streamed frames, contiguous buffers,
//! collected result sets).

mod readconn;
mod rw_split;

pub use readconn::ReadConnRouter;
pub use rw_split::RwSplitRouter;

use std::sync::Arc;

use thiserror::Error;

use crate::backend::ConnectionError;
use crate::monitor::Server;
use crate::protocol::{Buffer, ClientCommand};

/// Requirements a router declares at registration time. The core
/// satisfies these strictly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouterCapabilities(u32);

impl RouterCapabilities {
    /// Deliver only complete frames
    pub const PACKET_OUTPUT: RouterCapabilities = RouterCapabilities(0x01);
    /// Route whole statements, tracking the command per backend
    pub const STMT_INPUT: RouterCapabilities = RouterCapabilities(0x02);
    /// Deliver one statement's worth of frames at a time
    pub const STMT_OUTPUT: RouterCapabilities = RouterCapabilities(0x04);
    /// Delivered buffers must be contiguous
    pub const CONTIGUOUS_OUTPUT: RouterCapabilities = RouterCapabilities(0x08);
    /// Collect entire result sets before delivery
    pub const RESULTSET_OUTPUT: RouterCapabilities = RouterCapabilities(0x10);
    /// Decode session-state tracking blocks from OK packets
    pub const SESSION_STATE_TRACKING: RouterCapabilities = RouterCapabilities(0x20);
    /// Skip client authentication entirely
    pub const NO_AUTH: RouterCapabilities = RouterCapabilities(0x40);
    /// Replies may be routed without a live router session
    pub const NO_RSESSION: RouterCapabilities = RouterCapabilities(0x80);

    pub fn empty() -> Self {
        RouterCapabilities(0)
    }

    pub fn contains(self, other: RouterCapabilities) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn with(self, other: RouterCapabilities) -> Self {
        RouterCapabilities(self.0 | other.0)
    }
}

/// How the core asks a router to handle a backend failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// The backend died; the router may switch to another connection
    NewConnection,
    /// The error must reach the client
    ReplyClient,
}

/// What to do with a reply buffer
#[derive(Debug)]
pub enum ClientAction {
    /// Ship these bytes to the client socket
    Forward(Buffer),
    /// Swallow the reply
    Suppress,
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no usable backend available")]
    NoBackend,

    #[error("router rejected statement: {0}")]
    Rejected(String),
}

/// A routing module instance, one per client session.
///
/// Backends are addressed by their position in the list returned from
/// `select_backends`; the session attaches them in that order and keeps
/// the indices stable for the session's lifetime.
pub trait Router: Send + Sync {
    fn capabilities(&self) -> RouterCapabilities;

    /// Pick the backends this session should attach, in attach order
    fn select_backends(
        &mut self,
        candidates: &[Arc<Server>],
    ) -> Result<Vec<Arc<Server>>, RouterError>;

    /// Choose the attached backend for one client statement. The buffer
    /// may be tagged with routing flags before it goes out.
    fn route_query(
        &mut self,
        command: &ClientCommand,
        buffer: &mut Buffer,
    ) -> Result<usize, RouterError>;

    /// A classified reply arrived from an attached backend
    fn client_reply(&mut self, buffer: Buffer, origin: usize) -> ClientAction;

    /// A backend failed. Returning false ends the client session.
    fn handle_error(
        &mut self,
        error: &ConnectionError,
        origin: usize,
        action: ErrorAction,
    ) -> bool;

    fn close_session(&mut self) {}
}

/// Instantiate a router by its configured module name
pub fn create_router(name: &str, collect_results: bool) -> Option<Box<dyn Router>> {
    match name {
        "readwritesplit" => Some(Box::new(RwSplitRouter::new(collect_results))),
        "readconnroute" => Some(Box::new(ReadConnRouter::new())),
        _ => None,
    }
}
