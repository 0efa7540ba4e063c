use std::net::IpAddr;

use sha1::{Digest, Sha1};

use super::{AuthRequest, AuthVerdict, Authenticator, SessionCredentials};
use crate::protocol::{HandshakeResponse, DEFAULT_AUTH_PLUGIN, SCRAMBLE_LEN};
use crate::users::{Grant, UserTable};

/// `mysql_native_password`: the SHA1 challenge/response scheme.
///
/// The client proves knowledge of SHA1(password) without sending it:
/// token = SHA1(pw) XOR SHA1(scramble || SHA1(SHA1(pw))). With only the
/// double hash stored, the check runs backwards: XOR the token with
/// SHA1(scramble || stored) to recover a stage-1 candidate, then compare
/// its hash against the stored value.
pub struct NativePasswordAuth;

impl Authenticator for NativePasswordAuth {
    fn plugin_name(&self) -> &'static str {
        DEFAULT_AUTH_PLUGIN
    }

    fn extract(&self, payload: &[u8], peer: IpAddr) -> Option<AuthRequest> {
        let response = HandshakeResponse::parse(payload)?;
        Some(AuthRequest {
            username: response.username,
            database: response.database,
            charset: response.character_set,
            token: response.auth_response,
            peer,
        })
    }

    fn authenticate(
        &self,
        request: &AuthRequest,
        scramble: &[u8; SCRAMBLE_LEN],
        users: &UserTable,
    ) -> AuthVerdict {
        let stored = match users.lookup(
            &request.username,
            request.peer,
            request.database.as_deref(),
        ) {
            Grant::Granted(hash) => hash,
            Grant::Denied => return AuthVerdict::Failed,
        };

        let stage1 = match verify_token(&request.token, scramble, &stored) {
            Some(stage1) => stage1,
            None => return AuthVerdict::Failed,
        };

        AuthVerdict::Ok(SessionCredentials {
            username: request.username.clone(),
            database: request.database.clone(),
            charset: request.charset,
            stage1,
        })
    }
}

/// Check a client token against a stored double hash, recovering
/// SHA1(password) on success.
fn verify_token(
    token: &[u8],
    scramble: &[u8; SCRAMBLE_LEN],
    stored: &[u8],
) -> Option<Option<[u8; SCRAMBLE_LEN]>> {
    if stored.is_empty() {
        // Password-less account: the token must be empty too
        return if token.is_empty() { Some(None) } else { None };
    }
    if token.len() != SCRAMBLE_LEN || stored.len() != SCRAMBLE_LEN {
        return None;
    }

    // SHA1(scramble || stored)
    let mut hasher = Sha1::new();
    hasher.update(scramble);
    hasher.update(stored);
    let mask: [u8; SCRAMBLE_LEN] = hasher.finalize().into();

    // Candidate SHA1(password)
    let mut stage1 = [0u8; SCRAMBLE_LEN];
    for i in 0..SCRAMBLE_LEN {
        stage1[i] = token[i] ^ mask[i];
    }

    // Its hash must equal what the backend has on file
    let mut hasher = Sha1::new();
    hasher.update(stage1);
    let check: [u8; SCRAMBLE_LEN] = hasher.finalize().into();
    if check != stored {
        return None;
    }

    Some(Some(stage1))
}
