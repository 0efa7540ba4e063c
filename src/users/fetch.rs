//! Batch credential fetch over the wire.
//!
//! A small, self-contained MySQL client: it dials the backend with the
//! service account, runs the privileged grant query and hands back raw
//! rows. It deliberately shares nothing with the pooled backend layer so
//! a reload can never deadlock against the connections that triggered it.

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::protocol::packet::capabilities;
use crate::protocol::response::{read_lenenc_int, read_lenenc_str};
use crate::protocol::{
    compute_auth_response, handshake::auth_switch_response, is_auth_switch_payload,
    is_eof_payload, is_err_payload, is_ok_payload, AuthSwitchRequest, Command, ErrPacket,
    HandshakeResponse, InitialHandshake, Packet, PacketCodec,
};

/// The privileged query replicating user grants.
///
/// One row per (account, db grant); accounts without db grants come back
/// with a NULL db. The final column says whether the account may touch
/// any database.
const USERS_QUERY: &str = "SELECT u.user, u.host, u.password, d.db, \
     IF(u.select_priv = 'Y', 1, 0) AS any_db \
     FROM mysql.user AS u \
     LEFT JOIN mysql.db AS d ON (u.user = d.user AND u.host = d.host)";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Backend disconnected during credential fetch")]
    Disconnected,

    #[error("Malformed packet during credential fetch")]
    Malformed,

    #[error("Backend refused credential fetch: {code} {message}")]
    Server { code: u16, message: String },
}

use super::UserRow;

/// Load all credential rows from one backend
pub async fn fetch_users(
    addr: &str,
    user: &str,
    password: &str,
) -> Result<Vec<UserRow>, FetchError> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true).ok();
    let mut framed = Framed::new(stream, PacketCodec);

    // Server handshake
    let packet = next_packet(&mut framed).await?;
    let handshake =
        InitialHandshake::parse(&packet.payload).ok_or(FetchError::Malformed)?;

    let caps = capabilities::DEFAULT_CAPABILITIES & handshake.capability_flags;
    let auth_response = compute_auth_response(password, &handshake.auth_plugin_data());
    let response = HandshakeResponse {
        capability_flags: caps,
        max_packet_size: 16 * 1024 * 1024,
        character_set: 0x21,
        username: user.to_string(),
        auth_response,
        database: None,
        auth_plugin_name: handshake.auth_plugin_name.clone(),
    };
    framed.send(response.encode(1)).await?;

    // OK, ERR, or an auth-switch round trip
    let mut reply = next_packet(&mut framed).await?;
    if is_auth_switch_payload(&reply.payload) {
        let switch =
            AuthSwitchRequest::parse(&reply.payload).ok_or(FetchError::Malformed)?;
        let token = compute_auth_response(password, &switch.auth_data);
        framed
            .send(auth_switch_response(&token, reply.sequence_id + 1))
            .await?;
        reply = next_packet(&mut framed).await?;
    }
    check_server_reply(&reply)?;

    // The privileged query itself
    let mut query = vec![Command::Query as u8];
    query.extend_from_slice(USERS_QUERY.as_bytes());
    framed.send(Packet::new(0, query)).await?;

    let rows = read_text_result(&mut framed).await?;
    debug!(rows = rows.len(), addr = %addr, "credential rows fetched");

    // Be polite about hanging up
    framed
        .send(Packet::new(0, vec![Command::Quit as u8]))
        .await
        .ok();

    Ok(rows
        .into_iter()
        .filter_map(|cols| {
            let mut cols = cols.into_iter();
            let user = cols.next()??;
            let host = cols.next()??;
            let password = cols.next()?.unwrap_or_default();
            let db = cols.next()?;
            let any_db = cols.next()?.map(|v| v == "1").unwrap_or(false);
            Some(UserRow {
                user,
                host,
                password,
                db,
                any_db,
            })
        })
        .collect())
}

async fn next_packet(
    framed: &mut Framed<TcpStream, PacketCodec>,
) -> Result<Packet, FetchError> {
    match framed.next().await {
        Some(Ok(packet)) => Ok(packet),
        Some(Err(e)) => Err(e.into()),
        None => Err(FetchError::Disconnected),
    }
}

fn check_server_reply(packet: &Packet) -> Result<(), FetchError> {
    if is_err_payload(&packet.payload) {
        let err = ErrPacket::parse(&packet.payload)
            .unwrap_or_else(|| ErrPacket::new(1045, "28000", "Access denied"));
        return Err(FetchError::Server {
            code: err.error_code,
            message: err.error_message,
        });
    }
    if !is_ok_payload(&packet.payload) {
        return Err(FetchError::Malformed);
    }
    Ok(())
}

/// Read a full text result set, returning each row as decoded columns
async fn read_text_result(
    framed: &mut Framed<TcpStream, PacketCodec>,
) -> Result<Vec<Vec<Option<String>>>, FetchError> {
    let first = next_packet(framed).await?;
    if is_err_payload(&first.payload) {
        check_server_reply(&first)?;
    }
    let (columns, _) =
        read_lenenc_int(&first.payload).ok_or(FetchError::Malformed)?;

    // Column definitions, then their EOF
    for _ in 0..columns {
        next_packet(framed).await?;
    }
    let eof = next_packet(framed).await?;
    if !is_eof_payload(&eof.payload) {
        return Err(FetchError::Malformed);
    }

    let mut rows = Vec::new();
    loop {
        let packet = next_packet(framed).await?;
        if is_eof_payload(&packet.payload) {
            break;
        }
        if is_err_payload(&packet.payload) {
            check_server_reply(&packet)?;
        }
        rows.push(parse_text_row(&packet.payload, columns as usize)?);
    }

    Ok(rows)
}

/// Decode one text-protocol row: lenenc strings with 0xFB meaning NULL
fn parse_text_row(payload: &[u8], columns: usize) -> Result<Vec<Option<String>>, FetchError> {
    let mut values = Vec::with_capacity(columns);
    let mut rest = payload;
    for _ in 0..columns {
        if rest.first() == Some(&0xFB) {
            values.push(None);
            rest = &rest[1..];
            continue;
        }
        let (value, n) = read_lenenc_str(rest).ok_or(FetchError::Malformed)?;
        values.push(Some(String::from_utf8_lossy(value).to_string()));
        rest = &rest[n..];
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_row() {
        // "alice", NULL, "1"
        let mut payload = vec![5u8];
        payload.extend_from_slice(b"alice");
        payload.push(0xFB);
        payload.push(1);
        payload.push(b'1');

        let row = parse_text_row(&payload, 3).unwrap();
        assert_eq!(row[0].as_deref(), Some("alice"));
        assert_eq!(row[1], None);
        assert_eq!(row[2].as_deref(), Some("1"));
    }

    #[test]
    fn test_parse_text_row_truncated() {
        let payload = vec![10u8, b'a'];
        assert!(parse_text_row(&payload, 1).is_err());
    }
}
