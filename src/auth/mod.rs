//! Pluggable client authentication.
//!
//! A plug-in pulls credentials out of the client's handshake response,
//! validates them against the replicated credential table, and
//! re-validates on COM_CHANGE_USER. The proxy never learns cleartext
//! passwords; a successful check recovers SHA1(password), which is all
//! the backend logins need.

mod native;

pub use native::NativePasswordAuth;

use std::net::IpAddr;

use crate::protocol::SCRAMBLE_LEN;
use crate::users::UserTable;

/// Result of an authentication step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Ok,
    Incomplete,
    SslIncomplete,
    Failed,
}

/// Credentials extracted from a client's handshake response
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub username: String,
    pub database: Option<String>,
    pub charset: u8,
    pub token: Vec<u8>,
    pub peer: IpAddr,
}

/// A successful check: what the session keeps for backend logins
#[derive(Debug, Clone)]
pub struct SessionCredentials {
    pub username: String,
    pub database: Option<String>,
    pub charset: u8,
    /// Recovered SHA1(password); absent for password-less accounts
    pub stage1: Option<[u8; SCRAMBLE_LEN]>,
}

/// Verdict of validating an extracted request
#[derive(Debug, Clone)]
pub enum AuthVerdict {
    Ok(SessionCredentials),
    Incomplete,
    SslIncomplete,
    Failed,
}

/// A client-side authentication plug-in.
///
/// The proxy speaks to the plug-in in three steps: extract the token from
/// the wire, validate it against a credential snapshot, and re-validate
/// mid-session for COM_CHANGE_USER.
pub trait Authenticator: Send + Sync {
    /// The plug-in name announced in handshakes
    fn plugin_name(&self) -> &'static str;

    /// Pull a credential request out of a handshake-response payload.
    /// Returns None when the payload is malformed.
    fn extract(&self, payload: &[u8], peer: IpAddr) -> Option<AuthRequest>;

    /// Validate a request against the credential table, using the scramble
    /// the proxy issued to this client.
    fn authenticate(
        &self,
        request: &AuthRequest,
        scramble: &[u8; SCRAMBLE_LEN],
        users: &UserTable,
    ) -> AuthVerdict;

    /// Re-validate for a mid-session identity change. Same contract as
    /// `authenticate`, with the token coming from a COM_CHANGE_USER body.
    fn reauthenticate(
        &self,
        username: &str,
        token: &[u8],
        database: Option<&str>,
        charset: u8,
        peer: IpAddr,
        scramble: &[u8; SCRAMBLE_LEN],
        users: &UserTable,
    ) -> AuthVerdict {
        let request = AuthRequest {
            username: username.to_string(),
            database: database.map(str::to_string),
            charset,
            token: token.to_vec(),
            peer,
        };
        self.authenticate(&request, scramble, users)
    }
}

/// The default plug-in, `mysql_native_password`
pub fn default_authenticator() -> NativePasswordAuth {
    NativePasswordAuth
}
