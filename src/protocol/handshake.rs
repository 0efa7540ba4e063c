use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};

use super::packet::{capabilities::*, Buffer, BufferFlags, Command, Packet};

/// Length of the scramble nonce servers hand out in the initial handshake
pub const SCRAMBLE_LEN: usize = 20;

/// The authentication plug-in spoken by default
pub const DEFAULT_AUTH_PLUGIN: &str = "mysql_native_password";

/// MySQL initial handshake packet (server -> client)
#[derive(Debug, Clone)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub auth_plugin_data_part1: [u8; 8],
    pub capability_flags: u32,
    pub character_set: u8,
    pub status_flags: u16,
    pub auth_plugin_data_part2: Vec<u8>,
    pub auth_plugin_name: String,
}

impl InitialHandshake {
    /// Create a new handshake packet for the proxy's client side
    pub fn new(connection_id: u32) -> Self {
        let mut auth_data1 = [0u8; 8];
        let mut auth_data2 = vec![0u8; 12];

        // Generate random auth data
        use rand::RngCore;
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut auth_data1);
        rng.fill_bytes(&mut auth_data2);

        Self {
            protocol_version: 10,
            server_version: "8.0.0-portico".to_string(),
            connection_id,
            auth_plugin_data_part1: auth_data1,
            capability_flags: DEFAULT_CAPABILITIES,
            character_set: 0x21, // utf8_general_ci
            status_flags: 0x0002,
            auth_plugin_data_part2: auth_data2,
            auth_plugin_name: DEFAULT_AUTH_PLUGIN.to_string(),
        }
    }

    /// Get full auth plugin data (20 bytes)
    pub fn auth_plugin_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(SCRAMBLE_LEN);
        data.extend_from_slice(&self.auth_plugin_data_part1);
        data.extend_from_slice(&self.auth_plugin_data_part2);
        data
    }

    /// Full scramble as a fixed array, truncated/padded to 20 bytes
    pub fn scramble(&self) -> [u8; SCRAMBLE_LEN] {
        let mut out = [0u8; SCRAMBLE_LEN];
        let data = self.auth_plugin_data();
        let n = data.len().min(SCRAMBLE_LEN);
        out[..n].copy_from_slice(&data[..n]);
        out
    }

    /// Encode to packet
    pub fn encode(&self) -> Packet {
        let mut buf = BytesMut::new();

        // Protocol version
        buf.put_u8(self.protocol_version);

        // Server version (null-terminated)
        buf.extend_from_slice(self.server_version.as_bytes());
        buf.put_u8(0);

        // Connection ID
        buf.put_u32_le(self.connection_id);

        // Auth plugin data part 1 (8 bytes)
        buf.extend_from_slice(&self.auth_plugin_data_part1);

        // Filler
        buf.put_u8(0);

        // Capability flags (lower 2 bytes)
        buf.put_u16_le((self.capability_flags & 0xFFFF) as u16);

        // Character set
        buf.put_u8(self.character_set);

        // Status flags
        buf.put_u16_le(self.status_flags);

        // Capability flags (upper 2 bytes)
        buf.put_u16_le(((self.capability_flags >> 16) & 0xFFFF) as u16);

        // Auth plugin data length
        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.put_u8(
                (self.auth_plugin_data_part1.len() + self.auth_plugin_data_part2.len() + 1) as u8,
            );
        } else {
            buf.put_u8(0);
        }

        // Reserved (10 bytes)
        buf.extend_from_slice(&[0u8; 10]);

        // Auth plugin data part 2
        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.extend_from_slice(&self.auth_plugin_data_part2);
            buf.put_u8(0); // Null terminator
        }

        // Auth plugin name
        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        Packet::new(0, buf.freeze())
    }

    /// Parse from packet payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 32 {
            return None;
        }

        let mut buf = payload;

        let protocol_version = buf.get_u8();

        // Server version (null-terminated string)
        let null_pos = buf.iter().position(|&b| b == 0)?;
        let server_version = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf.advance(null_pos + 1);

        if buf.len() < 31 {
            return None;
        }

        let connection_id = buf.get_u32_le();

        let mut auth_plugin_data_part1 = [0u8; 8];
        auth_plugin_data_part1.copy_from_slice(&buf[..8]);
        buf.advance(8);

        // Filler
        buf.advance(1);

        let capability_flags_lower = buf.get_u16_le() as u32;
        let character_set = buf.get_u8();
        let status_flags = buf.get_u16_le();
        let capability_flags_upper = buf.get_u16_le() as u32;
        let capability_flags = capability_flags_lower | (capability_flags_upper << 16);

        let auth_plugin_data_len = buf.get_u8();

        // Reserved
        if buf.len() < 10 {
            return None;
        }
        buf.advance(10);

        // Auth plugin data part 2
        let mut auth_plugin_data_part2 = Vec::new();
        if capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            let len = std::cmp::max(13, auth_plugin_data_len as usize).saturating_sub(8);
            if buf.len() < len {
                return None;
            }
            let data_len = buf.iter().take(len).position(|&b| b == 0).unwrap_or(len);
            auth_plugin_data_part2.extend_from_slice(&buf[..data_len]);
            buf.advance(len);
        }

        // Auth plugin name
        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..null_pos]).to_string()
        } else {
            DEFAULT_AUTH_PLUGIN.to_string()
        };

        Some(Self {
            protocol_version,
            server_version,
            connection_id,
            auth_plugin_data_part1,
            capability_flags,
            character_set,
            status_flags,
            auth_plugin_data_part2,
            auth_plugin_name,
        })
    }
}

/// MySQL handshake response packet (client -> server)
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub capability_flags: u32,
    pub max_packet_size: u32,
    pub character_set: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: String,
}

impl HandshakeResponse {
    /// Parse from packet payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 32 {
            return None;
        }

        let mut buf = payload;

        let capability_flags = buf.get_u32_le();
        let max_packet_size = buf.get_u32_le();
        let character_set = buf.get_u8();

        // Reserved (23 bytes)
        buf.advance(23);

        // Username (null-terminated)
        let null_pos = buf.iter().position(|&b| b == 0)?;
        let username = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf.advance(null_pos + 1);

        // Auth response
        let auth_response = if capability_flags & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0
            || capability_flags & CLIENT_SECURE_CONNECTION != 0
        {
            if buf.is_empty() {
                return None;
            }
            let len = buf.get_u8() as usize;
            if buf.len() < len {
                return None;
            }
            let data = buf[..len].to_vec();
            buf.advance(len);
            data
        } else {
            // Null-terminated
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let data = buf[..null_pos].to_vec();
            buf.advance((null_pos + 1).min(buf.len()));
            data
        };

        // Database
        let database = if capability_flags & CLIENT_CONNECT_WITH_DB != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            let db = String::from_utf8_lossy(&buf[..null_pos]).to_string();
            buf.advance((null_pos + 1).min(buf.len()));
            if db.is_empty() {
                None
            } else {
                Some(db)
            }
        } else {
            None
        };

        // Auth plugin name
        let auth_plugin_name = if capability_flags & CLIENT_PLUGIN_AUTH != 0 && !buf.is_empty() {
            let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            String::from_utf8_lossy(&buf[..null_pos]).to_string()
        } else {
            DEFAULT_AUTH_PLUGIN.to_string()
        };

        Some(Self {
            capability_flags,
            max_packet_size,
            character_set,
            username,
            auth_response,
            database,
            auth_plugin_name,
        })
    }

    /// Encode to packet
    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u32_le(self.capability_flags);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.character_set);

        // Reserved (23 bytes)
        buf.extend_from_slice(&[0u8; 23]);

        // Username
        buf.extend_from_slice(self.username.as_bytes());
        buf.put_u8(0);

        // Auth response (length-prefixed)
        if self.capability_flags & CLIENT_SECURE_CONNECTION != 0 {
            buf.put_u8(self.auth_response.len() as u8);
            buf.extend_from_slice(&self.auth_response);
        } else {
            buf.extend_from_slice(&self.auth_response);
            buf.put_u8(0);
        }

        // Database
        if self.capability_flags & CLIENT_CONNECT_WITH_DB != 0 {
            if let Some(ref db) = self.database {
                buf.extend_from_slice(db.as_bytes());
            }
            buf.put_u8(0);
        }

        // Auth plugin name
        if self.capability_flags & CLIENT_PLUGIN_AUTH != 0 {
            buf.extend_from_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }

        Packet::new(sequence_id, buf.freeze())
    }
}

/// Auth-switch request sent by a server mid-authentication
///
/// Payload: 0xFE, plug-in name (null-terminated), fresh auth data.
#[derive(Debug, Clone)]
pub struct AuthSwitchRequest {
    pub plugin_name: String,
    pub auth_data: Vec<u8>,
}

impl AuthSwitchRequest {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.first() != Some(&0xFE) || payload.len() < 2 {
            return None;
        }
        let rest = &payload[1..];
        let null_pos = rest.iter().position(|&b| b == 0)?;
        let plugin_name = String::from_utf8_lossy(&rest[..null_pos]).to_string();
        let mut auth_data = rest[null_pos + 1..].to_vec();
        // Servers terminate the scramble with a trailing NUL
        if auth_data.last() == Some(&0) {
            auth_data.pop();
        }
        Some(Self {
            plugin_name,
            auth_data,
        })
    }

    /// Fresh 20-byte scramble from the request, when one was sent
    pub fn scramble(&self) -> Option<[u8; SCRAMBLE_LEN]> {
        if self.auth_data.len() < SCRAMBLE_LEN {
            return None;
        }
        let mut out = [0u8; SCRAMBLE_LEN];
        out.copy_from_slice(&self.auth_data[..SCRAMBLE_LEN]);
        Some(out)
    }
}

/// Compute the mysql_native_password proof from a cleartext password
pub fn compute_auth_response(password: &str, auth_data: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    // SHA1(password)
    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    let hash1 = hasher.finalize();

    // SHA1(SHA1(password))
    let mut hasher = Sha1::new();
    hasher.update(hash1);
    let hash2 = hasher.finalize();

    // SHA1(auth_data + SHA1(SHA1(password)))
    let mut hasher = Sha1::new();
    hasher.update(auth_data);
    hasher.update(hash2);
    let hash3 = hasher.finalize();

    // XOR SHA1(password) with SHA1(auth_data + SHA1(SHA1(password)))
    hash1.iter().zip(hash3.iter()).map(|(a, b)| a ^ b).collect()
}

/// Compute the proof from SHA1(password) rather than the cleartext.
///
/// The proxy never sees cleartext client passwords; it recovers
/// SHA1(password) during client authentication and reuses it for every
/// backend login and re-login.
pub fn compute_auth_response_from_stage1(stage1: &[u8; SCRAMBLE_LEN], auth_data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(stage1);
    let stage2 = hasher.finalize();

    let mut hasher = Sha1::new();
    hasher.update(auth_data);
    hasher.update(stage2);
    let proof = hasher.finalize();

    stage1.iter().zip(proof.iter()).map(|(a, b)| a ^ b).collect()
}

/// SHA1 of a byte slice as a fixed array
pub fn sha1_digest(data: &[u8]) -> [u8; SCRAMBLE_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Build a COM_CHANGE_USER packet re-identifying a backend connection.
///
/// Body: 0x11, user NUL, token length, 20-byte token, database NUL,
/// 2-byte charset, auth plug-in name NUL. The token is derived from the
/// recovered SHA1(password) and the nonce the backend issued in its own
/// handshake. The buffer is tagged collect-result: the reply is a session
/// command whose frames must arrive as one unit.
pub fn build_change_user(
    user: &str,
    stage1: Option<&[u8; SCRAMBLE_LEN]>,
    database: Option<&str>,
    charset: u8,
    scramble: &[u8; SCRAMBLE_LEN],
) -> Buffer {
    let mut body = BytesMut::new();
    body.put_u8(Command::ChangeUser as u8);
    body.extend_from_slice(user.as_bytes());
    body.put_u8(0);

    match stage1 {
        Some(stage1) => {
            let token = compute_auth_response_from_stage1(stage1, scramble);
            body.put_u8(token.len() as u8);
            body.extend_from_slice(&token);
        }
        None => body.put_u8(0),
    }

    if let Some(db) = database {
        body.extend_from_slice(db.as_bytes());
    }
    body.put_u8(0);

    // charset, 2 bytes
    body.put_u8(charset);
    body.put_u8(0);

    body.extend_from_slice(DEFAULT_AUTH_PLUGIN.as_bytes());
    body.put_u8(0);

    let packet = Packet::new(0, body.freeze());
    Buffer::from_packet(&packet).with_flags(BufferFlags::COLLECT_RESULT)
}

/// Parsed COM_CHANGE_USER body from a client
#[derive(Debug, Clone)]
pub struct ChangeUserRequest {
    pub username: String,
    pub auth_token: Vec<u8>,
    pub database: Option<String>,
    pub charset: u8,
}

impl ChangeUserRequest {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.first() != Some(&(Command::ChangeUser as u8)) {
            return None;
        }
        let mut buf = &payload[1..];

        let null_pos = buf.iter().position(|&b| b == 0)?;
        let username = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        buf = &buf[null_pos + 1..];

        if buf.is_empty() {
            return None;
        }
        let token_len = buf[0] as usize;
        buf = &buf[1..];
        if buf.len() < token_len {
            return None;
        }
        let auth_token = buf[..token_len].to_vec();
        buf = &buf[token_len..];

        let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        let db = String::from_utf8_lossy(&buf[..null_pos]).to_string();
        let database = if db.is_empty() { None } else { Some(db) };
        buf = &buf[(null_pos + 1).min(buf.len())..];

        let charset = buf.first().copied().unwrap_or(0x21);

        Some(Self {
            username,
            auth_token,
            database,
            charset,
        })
    }
}

/// The bare-token reply to an auth-switch request
pub fn auth_switch_response(token: &[u8], sequence_id: u8) -> Packet {
    Packet::new(sequence_id, Bytes::copy_from_slice(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_roundtrip() {
        let hs = InitialHandshake::new(42);
        let packet = hs.encode();
        let parsed = InitialHandshake::parse(&packet.payload).unwrap();

        assert_eq!(parsed.protocol_version, 10);
        assert_eq!(parsed.connection_id, 42);
        assert_eq!(parsed.server_version, hs.server_version);
        assert_eq!(parsed.auth_plugin_data_part1, hs.auth_plugin_data_part1);
        assert_eq!(parsed.auth_plugin_data_part2, hs.auth_plugin_data_part2);
        assert_eq!(parsed.auth_plugin_name, DEFAULT_AUTH_PLUGIN);
        assert_eq!(parsed.scramble(), hs.scramble());
    }

    #[test]
    fn test_handshake_response_roundtrip() {
        let resp = HandshakeResponse {
            capability_flags: DEFAULT_CAPABILITIES,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 0x21,
            username: "alice".to_string(),
            auth_response: vec![0xAA; 20],
            database: Some("testdb".to_string()),
            auth_plugin_name: DEFAULT_AUTH_PLUGIN.to_string(),
        };
        let packet = resp.encode(1);
        let parsed = HandshakeResponse::parse(&packet.payload).unwrap();

        assert_eq!(parsed.username, "alice");
        assert_eq!(parsed.auth_response, vec![0xAA; 20]);
        assert_eq!(parsed.database.as_deref(), Some("testdb"));
        assert_eq!(parsed.character_set, 0x21);
    }

    #[test]
    fn test_stage1_response_matches_cleartext_response() {
        let scramble = [7u8; 20];
        let from_cleartext = compute_auth_response("secret", &scramble);

        let stage1 = sha1_digest(b"secret");
        let from_stage1 = compute_auth_response_from_stage1(&stage1, &scramble);

        assert_eq!(from_cleartext, from_stage1);
    }

    #[test]
    fn test_change_user_body_layout() {
        let stage1 = sha1_digest(b"hunter2");
        let scramble = [3u8; 20];
        let buf = build_change_user("bob", Some(&stage1), Some("testdb"), 0x21, &scramble);

        assert!(buf.flags.contains(BufferFlags::COLLECT_RESULT));
        assert_eq!(buf.sequence_id(), Some(0));

        let (_, payload) = buf.frames().next().unwrap();
        assert_eq!(payload[0], 0x11);
        // user
        assert_eq!(&payload[1..4], b"bob");
        assert_eq!(payload[4], 0);
        // token length then 20-byte token
        assert_eq!(payload[5] as usize, SCRAMBLE_LEN);
        let expected = compute_auth_response_from_stage1(&stage1, &scramble);
        assert_eq!(&payload[6..26], &expected[..]);
        // database
        assert_eq!(&payload[26..32], b"testdb");
        assert_eq!(payload[32], 0);
        // charset (2 bytes)
        assert_eq!(payload[33], 0x21);
        assert_eq!(payload[34], 0);
        // plug-in name
        let name_end = 35 + DEFAULT_AUTH_PLUGIN.len();
        assert_eq!(&payload[35..name_end], DEFAULT_AUTH_PLUGIN.as_bytes());
        assert_eq!(payload[name_end], 0);
        assert_eq!(payload.len(), name_end + 1);
    }

    #[test]
    fn test_change_user_request_roundtrip() {
        let stage1 = sha1_digest(b"pw");
        let scramble = [9u8; 20];
        let buf = build_change_user("carol", Some(&stage1), None, 0x21, &scramble);
        let (_, payload) = buf.frames().next().unwrap();

        let parsed = ChangeUserRequest::parse(payload).unwrap();
        assert_eq!(parsed.username, "carol");
        assert_eq!(parsed.auth_token.len(), SCRAMBLE_LEN);
        assert_eq!(parsed.database, None);
        assert_eq!(parsed.charset, 0x21);
    }

    #[test]
    fn test_auth_switch_parse() {
        let mut payload = vec![0xFE];
        payload.extend_from_slice(b"mysql_native_password\0");
        payload.extend_from_slice(&[5u8; 20]);
        payload.push(0);

        let req = AuthSwitchRequest::parse(&payload).unwrap();
        assert_eq!(req.plugin_name, DEFAULT_AUTH_PLUGIN);
        assert_eq!(req.scramble(), Some([5u8; 20]));
    }
}
