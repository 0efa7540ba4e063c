use crate::auth::SessionCredentials;

/// Client-side session state
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    /// Client username
    pub username: String,
    /// Current database
    pub database: Option<String>,
    /// Client capability flags from the handshake response
    pub capability_flags: u32,
    /// Character set the client negotiated
    pub character_set: u8,
    /// A multi-frame command is being relayed; the next client packet is
    /// a continuation, not a new command
    pub expect_continuation: bool,
    /// Attach-order index the last statement was routed to
    pub last_target: usize,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update state after client authentication
    pub fn set_authenticated(&mut self, creds: &SessionCredentials, capabilities: u32) {
        self.username = creds.username.clone();
        self.database = creds.database.clone();
        self.character_set = creds.charset;
        self.capability_flags = capabilities;
    }

    /// Apply a mid-session identity change
    pub fn change_identity(&mut self, creds: &SessionCredentials) {
        self.username = creds.username.clone();
        self.database = creds.database.clone();
        self.character_set = creds.charset;
    }
}
